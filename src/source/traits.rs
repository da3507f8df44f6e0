use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Image,
}

/// What the engine asks for: one more item of `kind` from `category`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub category: String,
    pub kind: MediaKind,
}

impl MediaRequest {
    pub fn new(category: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            category: category.into(),
            kind,
        }
    }
}

/// Secondary material for the proxy delivery path.
#[derive(Clone, PartialEq, Eq)]
pub enum Fallback {
    /// Bytes already downloaded (preloaded items).
    Payload { data: Bytes, content_type: Option<String> },
    /// Another URL for the same logical item.
    Url(String),
}

impl std::fmt::Debug for Fallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fallback::Payload { data, content_type } => f
                .debug_struct("Payload")
                .field("len", &data.len())
                .field("content_type", content_type)
                .finish(),
            Fallback::Url(url) => f.debug_tuple("Url").field(url).finish(),
        }
    }
}

/// A resolved media item. Moved into the engine and consumed by one bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaCandidate {
    pub primary_url: String,
    pub fallback: Option<Fallback>,
}

impl MediaCandidate {
    pub fn direct(primary_url: impl Into<String>) -> Self {
        Self {
            primary_url: primary_url.into(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Supplies raw candidates. Single attempt per call, no retries.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, request: &MediaRequest) -> Result<MediaCandidate>;

    /// Resolve an item for the lookahead queue. Implementations that can
    /// download ahead attach the bytes as a `Fallback::Payload`.
    async fn prefetch(&self, request: &MediaRequest) -> Result<MediaCandidate> {
        self.resolve(request).await
    }

    /// Whether `category` names something this resolver can serve for `kind`.
    fn supports_category(&self, _kind: MediaKind, _category: &str) -> bool {
        true
    }
}
