// Media sources: the resolver contract and the HTTP endpoint implementation.

pub mod downloader;
pub mod http_resolver;
pub mod traits;
