//! Mock inference backend for exercising modelmux.
//!
//! Stands in for llama-server/vLLM in integration tests and local demos:
//! a `/health` endpoint with a configurable startup delay, an OpenAI-ish
//! `/v1/chat/completions` that can stream SSE chunks at a fixed interval,
//! and a `/stats` endpoint for test inspection.

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock inference backend for testing")]
struct Args {
    /// Port to listen on (0 = ephemeral)
    #[arg(short, long, default_value = "8001")]
    port: u16,

    /// Model name to report
    #[arg(short, long, default_value = "test-model")]
    model: String,

    /// /health answers 503 until this long after startup
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Artificial latency for completions (ms)
    #[arg(long, default_value = "10")]
    latency_ms: u64,

    /// Interval between SSE chunks when streaming (ms)
    #[arg(long, default_value = "100")]
    sse_interval_ms: u64,

    /// Number of SSE chunks per streamed completion
    #[arg(long, default_value = "5")]
    sse_chunks: u32,
}

struct MockState {
    model: String,
    started: Instant,
    startup_delay: Duration,
    latency: Duration,
    sse_interval: Duration,
    sse_chunks: u32,
    request_count: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_backend=debug")
        .init();

    let args = Args::parse();

    let state = Arc::new(MockState {
        model: args.model.clone(),
        started: Instant::now(),
        startup_delay: Duration::from_millis(args.startup_delay_ms),
        latency: Duration::from_millis(args.latency_ms),
        sse_interval: Duration::from_millis(args.sse_interval_ms),
        sse_chunks: args.sse_chunks,
        request_count: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/stats", get(stats))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;
    let actual_port = listener.local_addr()?.port();

    info!(model = %args.model, port = actual_port, "Mock backend listening");

    // Signal readiness to stdout for test harnesses: "READY <port>".
    println!("READY {}", actual_port);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if state.started.elapsed() < state.startup_delay {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

#[derive(Deserialize)]
struct ChatCompletionRequest {
    model: String,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    stream: bool,
}

#[derive(Deserialize, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: String,
    model: String,
    choices: Vec<Choice>,
}

#[derive(Serialize)]
struct Choice {
    index: u32,
    message: Message,
    finish_reason: String,
}

async fn chat_completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    tokio::time::sleep(state.latency).await;
    let count = state.request_count.fetch_add(1, Ordering::SeqCst) + 1;

    info!(
        model = %request.model,
        messages = request.messages.len(),
        stream = request.stream,
        request_num = count,
        "Processing chat completion"
    );

    if request.stream {
        return sse_completion(state, request.model, count);
    }

    let content = format!(
        "Mock response from {} (request #{}): you said {:?}",
        state.model,
        count,
        request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    );

    Json(ChatCompletionResponse {
        id: format!("chatcmpl-mock-{count}"),
        object: "chat.completion".to_string(),
        model: request.model,
        choices: vec![Choice {
            index: 0,
            message: Message {
                role: "assistant".to_string(),
                content,
            },
            finish_reason: "stop".to_string(),
        }],
    })
    .into_response()
}

/// Stream a completion as `text/event-stream`, one chunk per interval.
fn sse_completion(state: Arc<MockState>, model: String, count: u64) -> Response {
    let interval = state.sse_interval;
    let chunks = state.sse_chunks;

    let stream = futures_util::stream::unfold(0u32, move |i| {
        let model = model.clone();
        async move {
            if i > chunks {
                return None;
            }
            if i > 0 {
                tokio::time::sleep(interval).await;
            }
            let event = if i == chunks {
                "data: [DONE]\n\n".to_string()
            } else {
                let chunk = serde_json::json!({
                    "id": format!("chatcmpl-mock-{count}"),
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "delta": { "content": format!("token-{i} ") },
                        "finish_reason": serde_json::Value::Null
                    }]
                });
                format!("data: {chunk}\n\n")
            };
            Some((Ok::<_, std::convert::Infallible>(event), i + 1))
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Serialize)]
struct ModelsResponse {
    object: String,
    data: Vec<ModelInfo>,
}

#[derive(Serialize)]
struct ModelInfo {
    id: String,
    object: String,
    owned_by: String,
}

async fn list_models(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(ModelsResponse {
        object: "list".to_string(),
        data: vec![ModelInfo {
            id: state.model.clone(),
            object: "model".to_string(),
            owned_by: "mock-backend".to_string(),
        }],
    })
}

#[derive(Serialize)]
struct StatsResponse {
    model: String,
    request_count: u64,
}

async fn stats(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(StatsResponse {
        model: state.model.clone(),
        request_count: state.request_count.load(Ordering::SeqCst),
    })
}
