pub mod state;
pub mod traits;
