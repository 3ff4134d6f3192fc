//! Streaming behaviour of the reverse proxy.
//!
//! Served over a real listener so the client sees chunks exactly as hyper
//! writes them: SSE chunks must flow through as the upstream emits them
//! (no buffering), and a client that disconnects mid-stream must release
//! its in-flight slot.

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use futures_util::StreamExt;
use modelmux::{Config, ProcessManager};
use serde_json::json;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const CHUNKS: u32 = 5;
const CHUNK_INTERVAL: Duration = Duration::from_millis(150);

/// Upstream that emits one SSE chunk immediately, then one per interval.
async fn spawn_sse_upstream() -> u16 {
    async fn completions() -> Response {
        let stream = futures_util::stream::unfold(0u32, |i| async move {
            if i >= CHUNKS {
                return None;
            }
            if i > 0 {
                tokio::time::sleep(CHUNK_INTERVAL).await;
            }
            let chunk = format!("data: {{\"chunk\": {i}}}\n\n");
            Some((Ok::<_, std::convert::Infallible>(chunk), i + 1))
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(stream))
            .unwrap()
    }

    let app = Router::new().route("/v1/chat/completions", post(completions));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Build the app for one `sleep`-backed model proxying to the SSE upstream
/// and serve it on an ephemeral port.
async fn serve_app() -> (SocketAddr, ProcessManager) {
    let upstream_port = spawn_sse_upstream().await;
    let yaml = format!(
        r#"
models:
  streamy:
    cmd: sleep 999
    proxy: http://127.0.0.1:{upstream_port}
    checkEndpoint: none
"#
    );
    let mut config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.finalize().unwrap();

    let (app, manager) = modelmux::build_app(config).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, manager)
}

fn completion_request(addr: SocketAddr) -> reqwest::RequestBuilder {
    reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&json!({"model": "streamy", "stream": true, "messages": []}))
}

/// The first SSE chunk arrives promptly and the stream is spread over
/// the upstream's emission schedule, proving chunks are flushed as they
/// arrive rather than collected.
#[tokio::test]
async fn test_sse_chunks_stream_through_unbuffered() {
    let (addr, manager) = serve_app().await;

    // Warm the backend so the streaming request pays no startup cost.
    manager.swap("streamy").await.unwrap();

    let t0 = Instant::now();
    let response = completion_request(addr).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE.as_str()],
        "text/event-stream"
    );

    let mut stream = response.bytes_stream();
    let mut arrivals = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunk.unwrap();
        arrivals.push(t0.elapsed());
    }

    assert!(arrivals.len() >= 2, "expected several chunks, got {arrivals:?}");
    // First chunk well before the upstream has finished emitting.
    assert!(
        arrivals[0] < Duration::from_millis(200),
        "first chunk arrived late: {:?}",
        arrivals[0]
    );
    // Last chunk not before the upstream could have produced it.
    let full_schedule = CHUNK_INTERVAL * (CHUNKS - 1);
    assert!(
        *arrivals.last().unwrap() >= full_schedule - Duration::from_millis(50),
        "stream completed too fast to have been streamed: {arrivals:?}"
    );

    manager.shutdown_all().await;
}

/// A client that disconnects mid-stream still releases its in-flight slot,
/// so drains and the idle TTL are not wedged by dead connections.
#[tokio::test]
async fn test_client_disconnect_releases_in_flight() {
    let (addr, manager) = serve_app().await;
    manager.swap("streamy").await.unwrap();

    let response = completion_request(addr).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let mut stream = response.bytes_stream();
    // Read one chunk, then hang up with the stream unfinished.
    stream.next().await.unwrap().unwrap();
    let process = manager.find_process("streamy").unwrap();
    assert_eq!(process.in_flight(), 1);
    drop(stream);

    // The guard drops when hyper abandons the response body.
    let deadline = Instant::now() + Duration::from_secs(3);
    while process.in_flight() != 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(process.in_flight(), 0);

    manager.shutdown_all().await;
}

/// The in-flight counter gates stop-with-drain across a streamed response.
#[tokio::test]
async fn test_inflight_held_until_stream_end() {
    let (addr, manager) = serve_app().await;
    manager.swap("streamy").await.unwrap();

    let response = completion_request(addr).send().await.unwrap();
    let process = manager.find_process("streamy").unwrap();
    assert_eq!(process.in_flight(), 1);

    // Consume the full stream; the slot frees once the body completes.
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        chunk.unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    while process.in_flight() != 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(process.in_flight(), 0);

    manager.shutdown_all().await;
}
