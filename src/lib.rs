//! # modelmux
//!
//! Reverse-proxying model multiplexer for local inference servers.
//!
//! Clients speak an OpenAI-compatible HTTP API naming a logical model; each
//! request is routed to a long-running child process (llama-server, vLLM,
//! ...) hosting that model. Backends are spawned on demand, held behind a
//! health gate until they serve, and stopped when group policy or the idle
//! TTL says so — only a bounded set of backends ever holds GPU memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       modelmux                          │
//! │  ┌───────────────────────────────────────────────────┐  │
//! │  │ Middleware (Tower Layer)                          │  │
//! │  │ - Extracts model from request                     │  │
//! │  │ - swap(): stop incompatible backends, start target│  │
//! │  │ - Acquires in-flight guard                        │  │
//! │  │ - Wraps response in GuardedBody for streaming     │  │
//! │  └───────────────────────────────────────────────────┘  │
//! │                          │                              │
//! │  ┌───────────────────────────────────────────────────┐  │
//! │  │ ProcessManager / ProcessGroup / Process           │  │
//! │  │ - swap / exclusive / persistent group policy      │  │
//! │  │ - Stopped→Starting→Ready→Stopping state machine   │  │
//! │  └───────────────────────────────────────────────────┘  │
//! │                          │                              │
//! │  ┌───────────────────────────────────────────────────┐  │
//! │  │ Reverse Proxy (streaming, SSE, WebSocket)         │  │
//! │  └───────────────────────────────────────────────────┘  │
//! │                          │                              │
//! │      ┌───────────────────┼───────────────────┐          │
//! │      ▼                   ▼                   ▼          │
//! │  [llama-server:5800] [llama-server:5801] [vllm:5802]    │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod config;
mod group;
mod manager;
mod middleware;
mod process;
mod proxy;
pub mod telemetry;
pub(crate) mod types;

pub use config::{Config, GroupConfig, ModelConfig};
pub use group::ProcessGroup;
pub use manager::{ProcessManager, ProcessSnapshot};
pub use middleware::{ModelDispatchLayer, ModelDispatchService};
pub use process::{Process, ProcessState, RequestGuard, StateChange};
pub use proxy::{ProxyState, proxy_handler};
pub use types::{StopStrategy, SwapError};

use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::{any, get};
use axum::{Json, Router};
use tracing::info;

/// Build the complete modelmux stack.
///
/// Returns:
/// - The main Axum router (dispatch middleware + proxy)
/// - The process manager (for shutdown, preload and observation)
pub async fn build_app(config: Config) -> Result<(Router, ProcessManager)> {
    info!(models = config.models.len(), "Building modelmux");

    let manager = ProcessManager::new(&config);
    let state = ProxyState::new(manager.clone());

    // Pre-compute the /v1/models response from config.
    let models_response = {
        let mut data: Vec<_> = config
            .models
            .iter()
            .filter(|(_, m)| !m.unlisted)
            .map(|(id, _)| {
                serde_json::json!({
                    "id": id,
                    "object": "model",
                    "created": 0,
                    "owned_by": "modelmux"
                })
            })
            .collect();
        data.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        serde_json::json!({
            "object": "list",
            "data": data
        })
    };

    let running_manager = manager.clone();

    let app = Router::new()
        .route(
            "/v1/models",
            get(move || {
                let resp = models_response.clone();
                async move { Json(resp) }
            }),
        )
        .route(
            "/running",
            get(move || {
                let manager = running_manager.clone();
                async move { Json(serde_json::json!({ "running": manager.each_process() })) }
            }),
        )
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/upstream/{model}", any(proxy::upstream_handler))
        .route("/upstream/{model}/{*path}", any(proxy::upstream_path_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .layer(ModelDispatchLayer::new(manager.clone()));

    Ok((app, manager))
}
