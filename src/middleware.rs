//! Dispatch middleware.
//!
//! Intercepts requests, extracts the model name from the JSON body, swaps
//! the backing process in (stopping whatever the group policies require),
//! acquires the in-flight guard, and wraps the response body so the guard
//! is held until streaming completes.

use crate::manager::ProcessManager;
use crate::process::{Process, ProcessState, RequestGuard};
use crate::proxy::{ProxyTarget, error_response};
use crate::types::SwapError;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body::Frame;
use http_body_util::BodyExt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, error, trace, warn};

/// Layer that adds model dispatch to a service.
#[derive(Clone)]
pub struct ModelDispatchLayer {
    manager: ProcessManager,
}

impl ModelDispatchLayer {
    pub fn new(manager: ProcessManager) -> Self {
        Self { manager }
    }
}

impl<S> Layer<S> for ModelDispatchLayer {
    type Service = ModelDispatchService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ModelDispatchService {
            manager: self.manager.clone(),
            inner,
        }
    }
}

/// Service that wraps requests with model dispatch.
#[derive(Clone)]
pub struct ModelDispatchService<S> {
    manager: ProcessManager,
    inner: S,
}

impl<S> Service<Request<Body>> for ModelDispatchService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let manager = self.manager.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let path = req.uri().path().to_string();

            // /upstream routes carry the model in the path and do their own
            // dispatch (their bodies stream through untouched).
            if path == "/upstream" || path.starts_with("/upstream/") {
                return inner.call(req).await;
            }

            // Aggregate views go to whichever backend started most recently.
            if path == "/slots" || path == "/props" {
                return match manager.most_recent_ready() {
                    Some(process) => {
                        let guard = process.begin_request();
                        let mut req = req;
                        req.extensions_mut().insert(ProxyTarget {
                            upstream: process.upstream().to_string(),
                        });
                        forward_guarded(&mut inner, req, guard).await
                    }
                    None => {
                        let synthetic = if path == "/slots" { "[]" } else { "{}" };
                        Ok(Response::builder()
                            .status(StatusCode::OK)
                            .header("Content-Type", "application/json")
                            .body(Body::from(synthetic))
                            .unwrap_or_else(|_| Response::new(Body::empty())))
                    }
                };
            }

            let (parts, body) = req.into_parts();

            // Buffer the body to find the model field. Model-scoped paths
            // are the only ones that pay this; /upstream streams.
            let body_bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    error!(error = %e, "Failed to read request body");
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        "Failed to read request body",
                    ));
                }
            };

            let Some(model) = extract_model(&body_bytes) else {
                // No model named: health checks, listings, static routes.
                trace!(%path, "No model in request, passing through");
                let req = Request::from_parts(parts, Body::from(body_bytes));
                return inner.call(req).await;
            };

            debug!(model = %model, %path, "Dispatching request");

            let (process, _resolved, guard) = match dispatch(&manager, &model).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(model = %model, error = %e, "Dispatch failed");
                    return Ok(swap_error_response(&e));
                }
            };

            let body_bytes = rewrite_body(body_bytes, &process);

            let mut parts = parts;
            parts.extensions.insert(ProxyTarget {
                upstream: process.upstream().to_string(),
            });
            let req = Request::from_parts(parts, Body::from(body_bytes));

            forward_guarded(&mut inner, req, guard).await
        })
    }
}

/// Resolve, swap in, verify readiness and register the request.
///
/// A backend can be evicted between the swap returning and the readiness
/// check (TTL firing, child dying); one more swap covers that race.
pub(crate) async fn dispatch(
    manager: &ProcessManager,
    name: &str,
) -> Result<(Process, String, RequestGuard), SwapError> {
    let (mut process, resolved) = manager.swap(name).await?;

    if process.state() != ProcessState::Ready {
        debug!(model = %resolved, "Backend lost readiness after swap, retrying once");
        (process, _) = manager.swap(name).await?;
        if process.state() != ProcessState::Ready {
            return Err(SwapError::UnexpectedExit { model: resolved });
        }
    }

    let guard = process.begin_request();
    Ok((process, resolved, guard))
}

/// Call the inner service and keep `guard` alive until the response body is
/// fully consumed, so streamed completions count as in-flight to the end.
async fn forward_guarded<S>(
    inner: &mut S,
    req: Request<Body>,
    guard: RequestGuard,
) -> Result<Response<Body>, S::Error>
where
    S: Service<Request<Body>, Response = Response<Body>>,
{
    let response = inner.call(req).await?;
    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(
        parts,
        Body::new(GuardedBody::new(body, guard)),
    ))
}

/// Extract the model name from the JSON request body.
fn extract_model(body: &Bytes) -> Option<String> {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(model) = json.get("model").and_then(|v| v.as_str())
    {
        return Some(model.to_string());
    }

    None
}

/// Apply the model's request rewrites: strip filtered params and substitute
/// the upstream model name. The body passes through untouched when neither
/// applies.
fn rewrite_body(body: Bytes, process: &Process) -> Bytes {
    let config = process.config();
    let strip = &config.filters.strip_params;
    let rename = config.use_model_name.as_deref();
    if strip.is_empty() && rename.is_none() {
        return body;
    }

    let Ok(mut json) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return body;
    };
    let Some(obj) = json.as_object_mut() else {
        return body;
    };

    for key in strip {
        obj.remove(key);
    }
    if let Some(name) = rename {
        obj.insert("model".to_string(), serde_json::Value::String(name.to_string()));
    }

    match serde_json::to_vec(&json) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body,
    }
}

/// Map a core error onto the HTTP surface.
pub(crate) fn swap_error_response(error: &SwapError) -> Response<Body> {
    let status = match error {
        SwapError::UnknownModel(_) => StatusCode::BAD_REQUEST,
        SwapError::GroupNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SwapError::SpawnFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SwapError::HealthTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SwapError::UnexpectedExit { .. } => StatusCode::BAD_GATEWAY,
        SwapError::ProxyUpstreamError(_) => StatusCode::BAD_GATEWAY,
        SwapError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, &error.to_string())
}

/// Response body wrapper that holds a [`RequestGuard`] until the body is
/// fully consumed. For streaming responses this keeps the in-flight count
/// accurate until the backend finishes generating.
pub(crate) struct GuardedBody {
    inner: Body,
    _guard: RequestGuard,
}

impl GuardedBody {
    pub(crate) fn new(inner: Body, guard: RequestGuard) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
