// Axum request handler: serves proxied media items to the surface over loopback HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::delivery::{ProxyDelivery, ResourceHandle};
use crate::config::EngineConfig;
use crate::detect::container::sniff_content_type;
use crate::error::{self, EngineError};
use crate::source::traits::{Fallback, MediaCandidate};

/// What the proxy serves for one registered item.
#[derive(Clone)]
pub enum ProxyItem {
    /// Bytes held in memory, served with Range support.
    Payload { data: Bytes, content_type: String },
    /// An upstream URL relayed with the player's Range header forwarded.
    Upstream { url: String },
}

pub type ItemMap = Arc<RwLock<HashMap<String, ProxyItem>>>;

#[derive(Clone)]
struct ServerState {
    items: ItemMap,
    client: Client,
    referer: Option<String>,
}

pub struct ProxyServer {
    port: u16,
    items: ItemMap,
    shutdown_tx: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl ProxyServer {
    /// Start the proxy server on a random loopback port.
    pub async fn start(config: &EngineConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .context("building relay client")?;

        let items: ItemMap = Arc::new(RwLock::new(HashMap::new()));
        let state = ServerState {
            items: items.clone(),
            client,
            referer: config.referer.clone(),
        };

        let app = Router::new()
            .route("/stream/{item_id}", get(stream_handler).head(head_handler))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        info!("media proxy listening on 127.0.0.1:{}", port);

        Ok(Self {
            port,
            items,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url_for_item(&self, item_id: &str) -> String {
        format!("http://127.0.0.1:{}/stream/{}", self.port, item_id)
    }

    pub fn items(&self) -> &ItemMap {
        &self.items
    }

    /// Register an item; dropping or releasing the returned handle unregisters it.
    pub fn register(&self, item: ProxyItem) -> ResourceHandle {
        let item_id = Uuid::new_v4().to_string();
        self.items.write().insert(item_id.clone(), item);
        let items = Arc::downgrade(&self.items);
        ResourceHandle::new(item_id.clone(), self.url_for_item(&item_id), move |id| {
            if let Some(items) = items.upgrade() {
                items.write().remove(id);
            }
        })
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl ProxyDelivery for ProxyServer {
    fn open_proxy_stream(&self, item: &MediaCandidate) -> error::Result<ResourceHandle> {
        let proxied = match &item.fallback {
            Some(Fallback::Payload { data, content_type }) => {
                if data.is_empty() {
                    return Err(EngineError::Playback("empty payload".into()));
                }
                ProxyItem::Payload {
                    content_type: sniff_content_type(content_type.as_deref(), data),
                    data: data.clone(),
                }
            }
            Some(Fallback::Url(url)) => ProxyItem::Upstream { url: url.clone() },
            None => ProxyItem::Upstream {
                url: item.primary_url.clone(),
            },
        };
        let handle = self.register(proxied);
        debug!(
            "proxy stream {} opened for {}",
            handle.id(),
            item.primary_url
        );
        Ok(handle)
    }
}

/// One `bytes=` range as media elements send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    /// `bytes=a-b` or `bytes=a-`; `last` is inclusive.
    From { start: u64, last: Option<u64> },
    /// `bytes=-n`: the final `n` bytes.
    Tail(u64),
}

impl ByteRange {
    fn parse(raw: &str) -> Option<Self> {
        let (first, last) = raw.trim().strip_prefix("bytes=")?.split_once('-')?;
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            return match last.parse::<u64>().ok()? {
                0 => None,
                n => Some(ByteRange::Tail(n)),
            };
        }

        let start = first.parse().ok()?;
        let last = match last {
            "" => None,
            digits => Some(digits.parse().ok()?),
        };
        Some(ByteRange::From { start, last })
    }

    /// Half-open span inside a body of `total` bytes; `None` when unsatisfiable.
    fn span(self, total: u64) -> Option<(u64, u64)> {
        let (start, end) = match self {
            ByteRange::From { start, last } => {
                let end = last.map_or(total, |l| l.saturating_add(1).min(total));
                (start, end)
            }
            ByteRange::Tail(n) => (total.saturating_sub(n), total),
        };
        (start < end && start < total).then_some((start, end))
    }
}

fn content_range(start: u64, end: u64, total: u64) -> HeaderValue {
    header_value(format!("bytes {}-{}/{}", start, end - 1, total))
}

fn lookup(items: &ItemMap, item_id: &str) -> Option<ProxyItem> {
    items.read().get(item_id).cloned()
}

fn not_satisfiable(total: u64) -> Response {
    (
        StatusCode::RANGE_NOT_SATISFIABLE,
        [(header::CONTENT_RANGE, format!("bytes */{}", total))],
        "range not satisfiable",
    )
        .into_response()
}

fn header_value(value: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&value.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

/// GET /stream/{item_id}: serve content with Range support.
async fn stream_handler(
    State(state): State<ServerState>,
    Path(item_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let item = match lookup(&state.items, &item_id) {
        Some(item) => item,
        None => return (StatusCode::NOT_FOUND, "item not found").into_response(),
    };

    let range_raw = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match item {
        ProxyItem::Payload { data, content_type } => {
            serve_payload(&item_id, data, &content_type, range_raw.as_deref())
        }
        ProxyItem::Upstream { url } => {
            relay_upstream(&state, &item_id, &url, range_raw.as_deref()).await
        }
    }
}

fn serve_payload(item_id: &str, data: Bytes, content_type: &str, range: Option<&str>) -> Response {
    let total = data.len() as u64;

    let (start, end, is_partial) = match range.and_then(ByteRange::parse) {
        Some(requested) => match requested.span(total) {
            Some((start, end)) => (start, end, true),
            None => return not_satisfiable(total),
        },
        None => (0, total, false),
    };

    debug!(
        "payload request item={} range=[{}, {}) partial={}",
        item_id, start, end, is_partial
    );

    let body = data.slice(start as usize..end as usize);

    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(header::CONTENT_TYPE, header_value(content_type));
    resp_headers.insert(header::CONTENT_LENGTH, header_value(body.len()));
    resp_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let status = if is_partial {
        resp_headers.insert(header::CONTENT_RANGE, content_range(start, end, total));
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    (status, resp_headers, body).into_response()
}

async fn relay_upstream(
    state: &ServerState,
    item_id: &str,
    url: &str,
    range: Option<&str>,
) -> Response {
    let mut req = state.client.get(url);
    if let Some(referer) = &state.referer {
        req = req.header(reqwest::header::REFERER, referer);
    }
    if let Some(range) = range {
        req = req.header(reqwest::header::RANGE, range);
    }

    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!("relay request failed item={} url={}: {}", item_id, url, e);
            return (StatusCode::BAD_GATEWAY, format!("error: {}", e)).into_response();
        }
    };

    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("video/mp4")
        .to_string();
    let content_range = resp
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let content_length = resp.content_length();

    debug!(
        "relaying item={} status={} range={:?} length={:?}",
        item_id,
        status.as_u16(),
        content_range,
        content_length
    );

    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(header::CONTENT_TYPE, header_value(content_type));
    if let Some(length) = content_length {
        resp_headers.insert(header::CONTENT_LENGTH, header_value(length));
    }
    resp_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(range) = content_range {
        resp_headers.insert(header::CONTENT_RANGE, header_value(range));
    }

    // Forwarded chunk by chunk; nothing beyond one chunk is held in memory.
    let body = Body::from_stream(resp.bytes_stream());
    (status, resp_headers, body).into_response()
}

/// HEAD /stream/{item_id}: return headers only.
async fn head_handler(
    State(state): State<ServerState>,
    Path(item_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let item = match lookup(&state.items, &item_id) {
        Some(item) => item,
        None => return (StatusCode::NOT_FOUND, "item not found").into_response(),
    };

    let (data, content_type) = match item {
        ProxyItem::Payload { data, content_type } => (data, content_type),
        // Relayed items have no local length; let the player learn it from GET.
        ProxyItem::Upstream { .. } => {
            let mut resp_headers = HeaderMap::new();
            resp_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            return (StatusCode::OK, resp_headers).into_response();
        }
    };

    let total = data.len() as u64;
    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(header::CONTENT_TYPE, header_value(content_type));
    resp_headers.insert(header::CONTENT_LENGTH, header_value(total));
    resp_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some((start, end)) = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse)
        .and_then(|requested| requested.span(total))
    {
        resp_headers.insert(header::CONTENT_RANGE, content_range(start, end, total));
    }

    (StatusCode::OK, resp_headers).into_response()
}
