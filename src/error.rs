// Error taxonomy shared by the resolver, session engine and coordinator.

use thiserror::Error;

use crate::coordinator::registry::ContextId;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Resolver or network failure: unreachable endpoint, bad payload, timeout.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The surface rejected or failed to decode the bound source.
    #[error("playback error: {0}")]
    Playback(String),

    /// A completion arrived after the session epoch moved on. Never shown to users.
    #[error("stale result: captured epoch {captured}, live epoch {live}")]
    StaleResult { captured: u64, live: u64 },

    /// A cross-context request went unanswered; the remote is treated as absent.
    #[error("context {0} did not answer")]
    CoordinationTimeout(ContextId),

    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    /// Fold any infrastructure error into the upstream class, keeping its context chain.
    pub fn upstream(err: impl std::fmt::Display) -> Self {
        EngineError::Upstream(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("GET http://x/v");
        let folded = EngineError::upstream(err);
        let text = folded.to_string();
        assert!(text.contains("GET http://x/v"));
        assert!(text.contains("connection refused"));
    }
}
