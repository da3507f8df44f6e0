// Payload downloader: pulls a whole media item into memory for the lookahead queue.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, LOCATION, REFERER, USER_AGENT};
use reqwest::{Client, Url};
use tracing::{debug, info};

use crate::config::{EngineConfig, MAX_REDIRECTS};

/// Downloaded bytes plus the content type the upstream reported.
#[derive(Debug, Clone)]
pub struct Payload {
    pub data: Bytes,
    pub content_type: Option<String>,
}

pub struct PayloadDownloader {
    client: Client,
    max_redirects: usize,
}

impl PayloadDownloader {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("invalid user agent")?,
        );
        if let Some(referer) = &config.referer {
            headers.insert(
                REFERER,
                HeaderValue::from_str(referer).context("invalid referer")?,
            );
        }

        // Redirects are followed by hand so the hop count and each target get logged.
        let client = Client::builder()
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.request_timeout_secs * 2))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            max_redirects: MAX_REDIRECTS,
        })
    }

    /// Download `url` completely, rejecting anything larger than `max_bytes`.
    pub async fn download(&self, url: &str, max_bytes: u64) -> Result<Payload> {
        let mut current_url = url.to_string();
        let mut redirects = 0usize;

        let resp = loop {
            let resp = self
                .client
                .get(&current_url)
                .send()
                .await
                .with_context(|| format!("download of {} failed", current_url))?;

            if resp.status().is_redirection() {
                if redirects >= self.max_redirects {
                    return Err(anyhow!("too many redirects ({})", redirects));
                }
                let next = resp
                    .headers()
                    .get(LOCATION)
                    .map(header_value_to_string)
                    .and_then(|loc| resolve_redirect_location(resp.url(), &loc))
                    .ok_or_else(|| anyhow!("redirect without Location header"))?;
                debug!("download redirected {} -> {}", current_url, next);
                current_url = next;
                redirects += 1;
                continue;
            }

            if !resp.status().is_success() {
                return Err(anyhow!("download failed: HTTP {}", resp.status().as_u16()));
            }

            break resp;
        };

        if let Some(len) = resp.content_length() {
            if len > max_bytes {
                return Err(anyhow!("payload too large: {} > {} bytes", len, max_bytes));
            }
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let data = resp.bytes().await.context("reading payload body")?;
        if data.len() as u64 > max_bytes {
            return Err(anyhow!(
                "payload too large: {} > {} bytes",
                data.len(),
                max_bytes
            ));
        }

        info!("downloaded {} bytes from {}", data.len(), current_url);
        Ok(Payload { data, content_type })
    }
}

/// Resolve a `Location` header against the URL that produced it.
pub fn resolve_redirect_location(base: &Url, location: &str) -> Option<String> {
    let location = location.trim();
    if location.is_empty() {
        return None;
    }
    base.join(location)
        .map(|url| url.to_string())
        .ok()
        .or_else(|| Some(location.to_string()))
}

pub fn header_value_to_string(value: &HeaderValue) -> String {
    match value.to_str() {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(value.as_bytes()).to_string(),
    }
}
