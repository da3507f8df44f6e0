pub mod api;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod engine;
pub mod error;
pub mod server;
pub mod source;
pub mod surface;
