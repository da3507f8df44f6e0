use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, LOCATION, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::downloader::{header_value_to_string, resolve_redirect_location, PayloadDownloader};
use super::traits::{Fallback, MediaCandidate, MediaKind, MediaRequest, Resolver};
use crate::config::{
    CategoryConfig, EndpointConfig, EngineConfig, MAX_IMAGE_BYTES, MAX_VIDEO_BYTES,
    RANDOM_CATEGORY,
};
use crate::error::{self, EngineError};

/// Categories of upstream endpoints for one media kind.
#[derive(Debug, Clone, Default)]
pub struct EndpointCatalog {
    categories: Vec<CategoryConfig>,
}

impl EndpointCatalog {
    pub fn new(categories: Vec<CategoryConfig>) -> Self {
        Self { categories }
    }

    pub fn contains(&self, category: &str) -> bool {
        category == RANDOM_CATEGORY || self.categories.iter().any(|c| c.id == category)
    }

    /// Endpoints eligible for `category`; the random pseudo-category spans all of them.
    pub fn endpoints(&self, category: &str) -> Vec<&EndpointConfig> {
        if category == RANDOM_CATEGORY {
            self.categories.iter().flat_map(|c| &c.endpoints).collect()
        } else {
            self.categories
                .iter()
                .find(|c| c.id == category)
                .map(|c| c.endpoints.iter().collect())
                .unwrap_or_default()
        }
    }

    pub fn pick(&self, category: &str) -> Option<String> {
        let endpoints = self.endpoints(category);
        let mut rng = rand::thread_rng();
        endpoints.choose(&mut rng).map(|ep| ep.url.clone())
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    code: i32,
    data: String,
}

/// Resolver backed by HTTP endpoints that answer with a redirect, a media
/// response, or a small JSON document naming the media URL.
pub struct HttpResolver {
    client: Client,
    downloader: PayloadDownloader,
    video: EndpointCatalog,
    image: EndpointCatalog,
}

impl HttpResolver {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("invalid user agent")?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        let client = Client::builder()
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            downloader: PayloadDownloader::new(config)?,
            video: EndpointCatalog::new(config.video_categories.clone()),
            image: EndpointCatalog::new(config.image_categories.clone()),
        })
    }

    pub fn catalog(&self, kind: MediaKind) -> &EndpointCatalog {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Image => &self.image,
        }
    }

    fn pick_endpoint(&self, request: &MediaRequest) -> error::Result<String> {
        self.catalog(request.kind)
            .pick(&request.category)
            .ok_or_else(|| {
                EngineError::Upstream(format!(
                    "no endpoints configured for category {}",
                    request.category
                ))
            })
    }

    async fn query_endpoint(&self, api_url: &str, kind: MediaKind) -> Result<String> {
        let resp = self
            .client
            .get(api_url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", api_url))?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        debug!("endpoint {} answered status={}", api_url, status.as_u16());

        if status.is_redirection() {
            return resp
                .headers()
                .get(LOCATION)
                .map(header_value_to_string)
                .and_then(|loc| resolve_redirect_location(resp.url(), &loc))
                .ok_or_else(|| anyhow!("redirect without Location header"));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if is_media_content_type(&content_type, kind) || has_media_extension(&final_url, kind) {
            return Ok(final_url);
        }

        if !status.is_success() {
            return Err(anyhow!("endpoint failed: HTTP {}", status.as_u16()));
        }

        let text = resp.text().await.context("reading endpoint response")?;
        interpret_body(&text, kind)
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self, request: &MediaRequest) -> error::Result<MediaCandidate> {
        let api_url = self.pick_endpoint(request)?;
        let url = self
            .query_endpoint(&api_url, request.kind)
            .await
            .map_err(|e| {
                warn!("resolve via {} failed: {:#}", api_url, e);
                EngineError::upstream(e)
            })?;
        debug!("resolved {:?} item {}", request.kind, url);
        Ok(MediaCandidate::direct(url))
    }

    async fn prefetch(&self, request: &MediaRequest) -> error::Result<MediaCandidate> {
        let candidate = self.resolve(request).await?;
        let max_bytes = match request.kind {
            MediaKind::Video => MAX_VIDEO_BYTES,
            MediaKind::Image => MAX_IMAGE_BYTES,
        };
        let payload = self
            .downloader
            .download(&candidate.primary_url, max_bytes)
            .await
            .map_err(EngineError::upstream)?;
        Ok(candidate.with_fallback(Fallback::Payload {
            data: payload.data,
            content_type: payload.content_type,
        }))
    }

    fn supports_category(&self, kind: MediaKind, category: &str) -> bool {
        self.catalog(kind).contains(category)
    }
}

fn is_media_content_type(content_type: &str, kind: MediaKind) -> bool {
    if content_type.starts_with("application/octet-stream") {
        return true;
    }
    match kind {
        MediaKind::Video => content_type.starts_with("video/"),
        MediaKind::Image => content_type.starts_with("image/"),
    }
}

fn has_media_extension(url: &str, kind: MediaKind) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    let extensions: &[&str] = match kind {
        MediaKind::Video => &[".mp4", ".webm", ".m3u8"],
        MediaKind::Image => &[".jpg", ".jpeg", ".png", ".webp", ".gif", ".bmp"],
    };
    extensions.iter().any(|ext| path.ends_with(ext))
}

/// Pull the media URL out of a textual endpoint response.
fn interpret_body(text: &str, kind: MediaKind) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return match kind {
            MediaKind::Video => {
                let api_resp: ApiResponse =
                    serde_json::from_str(trimmed).context("malformed endpoint JSON")?;
                if api_resp.code != 200 {
                    return Err(anyhow!("endpoint returned code {}", api_resp.code));
                }
                Ok(api_resp.data)
            }
            MediaKind::Image => {
                let value: Value =
                    serde_json::from_str(trimmed).context("malformed endpoint JSON")?;
                extract_image_url(&value).ok_or_else(|| anyhow!("no image url in JSON"))
            }
        };
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(trimmed.to_string());
    }

    Err(anyhow!("unrecognized endpoint response"))
}

fn extract_image_url(value: &Value) -> Option<String> {
    if let Value::String(url) = value {
        return Some(url.clone());
    }

    for key in ["data", "imgurl", "url", "image", "pic"] {
        if let Some(url) = value.get(key).and_then(|v| v.as_str()) {
            return Some(url.to_string());
        }
    }

    let nested = value.get("data")?;
    ["url", "imgurl", "image", "pic"]
        .iter()
        .find_map(|key| nested.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}
