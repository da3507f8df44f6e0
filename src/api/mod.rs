pub mod logging;
pub mod media_api;
