use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::EngineError;

/// Base delay before the first automatic retry.
pub const RETRY_BASE_MS: u64 = 500;

/// Upper bound on the retry delay; the attempt count itself is unbounded.
pub const RETRY_MAX_MS: u64 = 2000;

/// Growth factor applied per consecutive failure.
pub const RETRY_GROWTH: f64 = 1.5;

/// Interval between preload ticks while video is playing.
pub const PRELOAD_INTERVAL_MS: u64 = 5000;

/// Preload only when less than this many seconds are buffered ahead.
pub const PRELOAD_MIN_BUFFER_SECS: f64 = 10.0;

/// Capacity of the preload lookahead queue.
pub const MAX_PRELOAD: usize = 2;

/// How long a bound source may stay ambiguous before it counts as ready.
pub const READY_TIMEOUT_MS: u64 = 30_000;

/// Redirect hops followed when downloading a payload.
pub const MAX_REDIRECTS: usize = 5;

/// Largest video payload accepted (100 MB).
pub const MAX_VIDEO_BYTES: u64 = 100 * 1024 * 1024;

/// Largest image payload accepted (15 MB).
pub const MAX_IMAGE_BYTES: u64 = 15 * 1024 * 1024;

/// A cross-context request not answered within this window means "no surface there".
pub const COORDINATION_TIMEOUT_MS: u64 = 1500;

/// Pseudo-category that draws from every configured endpoint.
pub const RANDOM_CATEGORY: &str = "random";

/// A named upstream endpoint that answers with one media item per request.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
}

/// A category groups endpoints serving similar content.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CategoryConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Top-level configuration for the media session engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Readiness wait applied to every bind attempt, in milliseconds.
    pub ready_timeout_ms: u64,
    /// Preload tick interval in milliseconds.
    pub preload_interval_ms: u64,
    /// Buffered-ahead threshold in seconds below which a tick preloads.
    pub preload_min_buffer_secs: f64,
    /// Maximum number of pre-resolved candidates kept in the queue.
    pub preload_capacity: usize,
    /// Whole-request timeout for upstream HTTP calls, in seconds.
    pub request_timeout_secs: u64,
    /// Connect timeout for upstream HTTP calls, in seconds.
    pub connect_timeout_secs: u64,
    /// User agent sent to upstream endpoints.
    pub user_agent: String,
    /// Referer attached when the proxy relays an upstream URL.
    pub referer: Option<String>,
    /// Cross-context request timeout in milliseconds.
    pub coordination_timeout_ms: u64,
    /// Category selected at start for video.
    pub video_category: String,
    /// Category selected at start for images.
    pub image_category: String,
    pub video_categories: Vec<CategoryConfig>,
    pub image_categories: Vec<CategoryConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: READY_TIMEOUT_MS,
            preload_interval_ms: PRELOAD_INTERVAL_MS,
            preload_min_buffer_secs: PRELOAD_MIN_BUFFER_SECS,
            preload_capacity: MAX_PRELOAD,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0.0.0"
                .to_string(),
            referer: None,
            coordination_timeout_ms: COORDINATION_TIMEOUT_MS,
            video_category: RANDOM_CATEGORY.to_string(),
            image_category: RANDOM_CATEGORY.to_string(),
            video_categories: Vec::new(),
            image_categories: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing keys fall back to defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid engine config")?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.preload_capacity == 0 {
            return Err(EngineError::Config("preload_capacity must be at least 1".into()));
        }
        let selections = [
            ("video", &self.video_category, &self.video_categories),
            ("image", &self.image_category, &self.image_categories),
        ];
        for (kind, selected, categories) in selections {
            if selected != RANDOM_CATEGORY && !categories.iter().any(|c| &c.id == selected) {
                return Err(EngineError::Config(format!(
                    "unknown {} category {}",
                    kind, selected
                )));
            }
            if let Some(ep) = categories
                .iter()
                .flat_map(|c| &c.endpoints)
                .find(|ep| ep.url.trim().is_empty())
            {
                return Err(EngineError::Config(format!("endpoint {} has no url", ep.name)));
            }
        }
        Ok(())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn preload_interval(&self) -> Duration {
        Duration::from_millis(self.preload_interval_ms)
    }

    pub fn coordination_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination_timeout_ms)
    }
}
