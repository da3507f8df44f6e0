// Loopback proxy: in-memory payloads, upstream relay and handle release.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use media_session_engine::config::EngineConfig;
use media_session_engine::server::delivery::ProxyDelivery;
use media_session_engine::server::handler::{ProxyItem, ProxyServer};
use media_session_engine::source::traits::{Fallback, MediaCandidate};

const CONTENT_SIZE: usize = 256 * 1024;

fn clip_bytes() -> Vec<u8> {
    (0..CONTENT_SIZE).map(|i| (i * 7 % 251) as u8).collect()
}

fn header_str<'a>(headers: &'a HeaderMap, name: HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Upstream clip host. Honours `bytes=a-b` / `bytes=a-` and reports the Referer it saw.
async fn upstream_clip(headers: HeaderMap) -> Response {
    let clip = clip_bytes();
    let last = clip.len() - 1;
    let seen = header_str(&headers, header::REFERER).unwrap_or_default().to_string();

    let requested = header_str(&headers, header::RANGE)
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.split_once('-'))
        .map(|(from, to)| {
            let from: usize = from.parse().unwrap_or(0);
            let to: usize = to.parse().map_or(last, |t: usize| t.min(last));
            (from, to)
        });

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, "video/mp4")
        .header("x-seen-referer", seen);
    let response = match requested {
        Some((from, to)) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", from, to, clip.len()))
            .body(Body::from(clip[from..=to].to_vec())),
        None => builder.body(Body::from(clip)),
    };
    response.unwrap()
}

async fn start_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/clip", get(upstream_clip));
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}/clip", addr)
}

type PendingBody = Arc<Mutex<Option<DuplexStream>>>;

/// Upstream whose body is whatever the test writes into the other end of a pipe.
async fn trickle(State(pending): State<PendingBody>) -> Response {
    let Some(reader) = pending.lock().take() else {
        return Response::builder()
            .status(StatusCode::GONE)
            .body(Body::empty())
            .unwrap();
    };
    Response::builder()
        .header(header::CONTENT_TYPE, "video/mp4")
        .body(Body::from_stream(ReaderStream::new(reader)))
        .unwrap()
}

async fn start_trickling_upstream() -> (String, DuplexStream) {
    let (writer, reader) = tokio::io::duplex(1024);
    let pending: PendingBody = Arc::new(Mutex::new(Some(reader)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/live", get(trickle)).with_state(pending);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("http://{}/live", addr), writer)
}

#[tokio::test]
async fn test_payload_served_with_ranges() {
    let server = ProxyServer::start(&EngineConfig::default()).await.unwrap();
    let handle = server.register(ProxyItem::Payload {
        data: Bytes::from(clip_bytes()),
        content_type: "video/mp4".to_string(),
    });
    let client = reqwest::Client::new();

    let resp = client
        .get(handle.url())
        .header("Range", "bytes=0-1023")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers()[header::CONTENT_RANGE],
        format!("bytes 0-1023/{}", CONTENT_SIZE)
    );
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &clip_bytes()[0..1024]);

    let resp = client
        .get(handle.url())
        .header("Range", "bytes=-100")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.bytes().await.unwrap().len(), 100);

    let resp = client
        .get(handle.url())
        .header("Range", format!("bytes={}-", CONTENT_SIZE))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);

    let resp = client.get(handle.url()).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(resp.bytes().await.unwrap().len(), CONTENT_SIZE);

    let head_resp = client.head(handle.url()).send().await.unwrap();
    assert_eq!(head_resp.status(), 200);
    assert!(head_resp.headers().contains_key("accept-ranges"));

    server.shutdown();
}

#[tokio::test]
async fn test_released_handle_unregisters_item() {
    let server = ProxyServer::start(&EngineConfig::default()).await.unwrap();
    let handle = server.register(ProxyItem::Payload {
        data: Bytes::from_static(b"abc"),
        content_type: "application/octet-stream".to_string(),
    });
    let url = handle.url().to_string();
    let client = reqwest::Client::new();

    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);
    assert_eq!(server.items().read().len(), 1);

    handle.release();
    assert!(server.items().read().is_empty());
    assert_eq!(client.get(&url).send().await.unwrap().status(), 404);

    let unknown = server.url_for_item("nonexistent");
    assert_eq!(client.get(&unknown).send().await.unwrap().status(), 404);

    server.shutdown();
}

#[tokio::test]
async fn test_upstream_relay_forwards_range_and_referer() {
    let upstream_url = start_upstream().await;
    let config = EngineConfig {
        referer: Some("https://player.example/".to_string()),
        ..EngineConfig::default()
    };
    let server = ProxyServer::start(&config).await.unwrap();
    let handle = server
        .open_proxy_stream(&MediaCandidate::direct(upstream_url.clone()))
        .unwrap();
    let client = reqwest::Client::new();

    let resp = client
        .get(handle.url())
        .header("Range", "bytes=100-199")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers()["x-seen-referer"], "https://player.example/");
    assert_eq!(
        resp.headers()[header::CONTENT_RANGE],
        format!("bytes 100-199/{}", CONTENT_SIZE)
    );
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &clip_bytes()[100..200]);

    server.shutdown();
}

#[tokio::test]
async fn test_payload_fallback_sniffs_content_type() {
    let server = ProxyServer::start(&EngineConfig::default()).await.unwrap();
    let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    png.extend_from_slice(&[0u8; 32]);
    let candidate = MediaCandidate::direct("https://img.example/x").with_fallback(
        Fallback::Payload {
            data: Bytes::from(png),
            content_type: None,
        },
    );

    let handle = server.open_proxy_stream(&candidate).unwrap();
    let resp = reqwest::get(handle.url()).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");

    let empty = MediaCandidate::direct("u").with_fallback(Fallback::Payload {
        data: Bytes::new(),
        content_type: None,
    });
    assert!(server.open_proxy_stream(&empty).is_err());

    server.shutdown();
}

#[tokio::test]
async fn test_relay_streams_before_upstream_finishes() {
    let (upstream_url, mut writer) = start_trickling_upstream().await;
    let server = ProxyServer::start(&EngineConfig::default()).await.unwrap();
    let handle = server
        .open_proxy_stream(&MediaCandidate::direct(upstream_url))
        .unwrap();

    writer.write_all(b"first-chunk").await.unwrap();
    writer.flush().await.unwrap();

    let mut resp = tokio::time::timeout(Duration::from_secs(5), reqwest::get(handle.url()))
        .await
        .expect("relay waited for the whole upstream body")
        .unwrap();
    assert_eq!(resp.status(), 200);
    let head = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
        .await
        .expect("no bytes relayed while upstream is still open")
        .unwrap()
        .unwrap();
    assert!(!head.is_empty());
    assert!(b"first-chunk".starts_with(&head));

    writer.write_all(b"-rest").await.unwrap();
    drop(writer);

    let mut received = head.to_vec();
    while let Some(chunk) = resp.chunk().await.unwrap() {
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"first-chunk-rest");

    server.shutdown();
}
