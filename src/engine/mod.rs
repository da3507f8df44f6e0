// Engine orchestration: session lifecycle, retry backoff and lookahead preloading.

pub mod backoff;
pub mod preload;
pub mod readiness;
pub mod session;
pub mod stats;
