//! Streaming reverse proxy.
//!
//! Requests reach the fallback handler with a [`ProxyTarget`] extension set
//! by the dispatch middleware; `/upstream/{model}` routes dispatch here
//! directly. Bodies are streamed in both directions without buffering, so
//! `text/event-stream` completions flush chunk by chunk, and `Upgrade`
//! requests (WebSockets) are completed on both sides and spliced together.

use crate::manager::ProcessManager;
use crate::middleware::{GuardedBody, dispatch, swap_error_response};
use crate::types::SwapError;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, Response, StatusCode, Uri, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, error, warn};

pub type HttpClient = Client<HttpConnector, Body>;

/// Upstream base URL for a proxied request, set as a request extension by
/// the dispatch middleware.
#[derive(Clone)]
pub struct ProxyTarget {
    pub upstream: String,
}

/// Shared state for the proxy handlers.
#[derive(Clone)]
pub struct ProxyState {
    pub manager: ProcessManager,
    client: HttpClient,
}

impl ProxyState {
    pub fn new(manager: ProcessManager) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { manager, client }
    }
}

/// Axum fallback handler. Forwards to the upstream named by the
/// [`ProxyTarget`] extension; without one the request named no model and
/// matched no route.
pub async fn proxy_handler(State(state): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    let Some(target) = req.extensions().get::<ProxyTarget>().cloned() else {
        return error_response(StatusCode::NOT_FOUND, "No model specified in request");
    };

    match forward(state.client.clone(), req, &target.upstream, None).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(upstream = %target.upstream, error = %e, "Proxy error");
            swap_error_response(&e)
        }
    }
}

/// `/upstream/{model}` — proxy to the model's root path.
pub async fn upstream_handler(
    State(state): State<ProxyState>,
    Path(model): Path<String>,
    req: Request<Body>,
) -> Response<Body> {
    proxy_upstream(state, model, String::new(), req).await
}

/// `/upstream/{model}/{*path}` — the `/upstream/{model}` prefix is rewritten
/// to `/` before forwarding.
pub async fn upstream_path_handler(
    State(state): State<ProxyState>,
    Path((model, path)): Path<(String, String)>,
    req: Request<Body>,
) -> Response<Body> {
    proxy_upstream(state, model, path, req).await
}

/// Swap the named model in, then stream the request through. Unlike the
/// OpenAI surface the body is never inspected here, so uploads stream
/// straight to the backend.
async fn proxy_upstream(
    state: ProxyState,
    model: String,
    suffix: String,
    req: Request<Body>,
) -> Response<Body> {
    let (process, _resolved, guard) = match dispatch(&state.manager, &model).await {
        Ok(d) => d,
        Err(e) => return swap_error_response(&e),
    };

    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let rewritten = format!("/{}{}", suffix.trim_start_matches('/'), query);
    debug!(model = %process.id(), path = %rewritten, "Proxying upstream request");

    match forward(state.client.clone(), req, process.upstream(), Some(rewritten)).await {
        Ok(resp) => {
            let (parts, body) = resp.into_parts();
            Response::from_parts(parts, Body::new(GuardedBody::new(body, guard)))
        }
        Err(e) => {
            error!(model = %process.id(), error = %e, "Upstream proxy error");
            swap_error_response(&e)
        }
    }
}

/// Forward `req` to `{upstream}{path}` (original path + query when
/// `override_path` is None), streaming both directions.
pub async fn forward(
    client: HttpClient,
    mut req: Request<Body>,
    upstream: &str,
    override_path: Option<String>,
) -> Result<Response<Body>, SwapError> {
    let path_and_query = override_path.unwrap_or_else(|| {
        req.uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string())
    });

    let uri: Uri = format!("{upstream}{path_and_query}")
        .parse()
        .map_err(|e| SwapError::ProxyUpstreamError(format!("invalid upstream URI: {e}")))?;

    if req.headers().contains_key(header::UPGRADE) {
        return forward_upgrade(req, uri).await;
    }

    *req.uri_mut() = uri;
    // The client fills in the upstream authority.
    req.headers_mut().remove(header::HOST);

    let resp = client
        .request(req)
        .await
        .map_err(|e| SwapError::ProxyUpstreamError(e.to_string()))?;

    let (parts, body) = resp.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)))
}

/// Complete an `Upgrade` (WebSocket) handshake against the backend and
/// splice the two upgraded connections together.
async fn forward_upgrade(mut req: Request<Body>, uri: Uri) -> Result<Response<Body>, SwapError> {
    let host = uri
        .host()
        .ok_or_else(|| SwapError::ProxyUpstreamError("upstream URI has no host".into()))?
        .to_string();
    let port = uri.port_u16().unwrap_or(80);

    // The server side of the incoming connection; resolves once we answer 101.
    let downstream = hyper::upgrade::on(&mut req);

    let stream = tokio::net::TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| SwapError::ProxyUpstreamError(e.to_string()))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| SwapError::ProxyUpstreamError(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Upgrade connection closed");
        }
    });

    let mut outbound = Request::builder()
        .method(req.method().clone())
        .uri(
            uri.path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
                .to_string(),
        )
        .body(Body::empty())
        .map_err(|e| SwapError::ProxyUpstreamError(e.to_string()))?;
    for (name, value) in req.headers() {
        if name != header::HOST {
            outbound.headers_mut().append(name.clone(), value.clone());
        }
    }
    outbound.headers_mut().insert(
        header::HOST,
        format!("{host}:{port}")
            .parse()
            .map_err(|e| SwapError::ProxyUpstreamError(format!("bad host header: {e}")))?,
    );

    let mut response = sender
        .send_request(outbound)
        .await
        .map_err(|e| SwapError::ProxyUpstreamError(e.to_string()))?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        let (parts, body) = response.into_parts();
        return Ok(Response::from_parts(parts, Body::new(body)));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    tokio::spawn(async move {
        let upgraded = tokio::try_join!(downstream, upstream_upgrade);
        match upgraded {
            Ok((down, up)) => {
                let mut down = TokioIo::new(down);
                let mut up = TokioIo::new(up);
                if let Err(e) = tokio::io::copy_bidirectional(&mut down, &mut up).await {
                    debug!(error = %e, "WebSocket splice ended");
                }
            }
            Err(e) => warn!(error = %e, "Upgrade handshake failed"),
        }
    });

    let (parts, _) = response.into_parts();
    Ok(Response::from_parts(parts, Body::empty()))
}

pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "modelmux_error"
        }
    });

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
