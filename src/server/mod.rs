// Local cache-proxy: resource handles and the axum delivery server.

pub mod delivery;
pub mod handler;
