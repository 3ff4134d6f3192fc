//! End-to-end tests for modelmux.
//!
//! Spins up in-process mock upstreams (simple axum echo servers), configures
//! models whose children are plain `sleep` processes with the health gate
//! disabled, and drives requests through the full stack:
//! middleware → manager → group → process → proxy.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use modelmux::{Config, ProcessState, StateChange};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower::ServiceExt;

// ── Helpers ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct UpstreamState {
    tag: &'static str,
    hits: Arc<AtomicUsize>,
    last_body: Arc<Mutex<Option<Value>>>,
}

/// Spawn a mock upstream that echoes its tag and records request bodies.
async fn spawn_upstream(tag: &'static str) -> (u16, UpstreamState) {
    let state = UpstreamState {
        tag,
        hits: Arc::new(AtomicUsize::new(0)),
        last_body: Arc::new(Mutex::new(None)),
    };

    async fn completions(
        State(state): State<UpstreamState>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        state.hits.fetch_add(1, Ordering::SeqCst);
        let model = body.get("model").cloned().unwrap_or(Value::Null);
        *state.last_body.lock().await = Some(body);
        Json(json!({
            "served_by": state.tag,
            "model": model,
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        }))
    }

    async fn info(State(state): State<UpstreamState>) -> String {
        format!("info-{}", state.tag)
    }

    async fn slots(State(state): State<UpstreamState>) -> Json<Value> {
        Json(json!([{"id": 0, "served_by": state.tag}]))
    }

    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .route("/info", get(info))
        .route("/slots", get(slots))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (port, state)
}

/// Four models: a, b in swap group g1 (exclusive); c alone in g2
/// (non-exclusive); d alone in a persistent group. Children are `sleep`
/// processes, so readiness comes from the settle delay alone.
fn test_config(pa: u16, pb: u16, pc: u16, pd: u16) -> Config {
    let yaml = format!(
        r#"
models:
  a:
    cmd: sleep 999
    proxy: http://127.0.0.1:{pa}
    checkEndpoint: none
    aliases: [alpha]
  b:
    cmd: sleep 999
    proxy: http://127.0.0.1:{pb}
    checkEndpoint: none
  c:
    cmd: sleep 999
    proxy: http://127.0.0.1:{pc}
    checkEndpoint: none
  d:
    cmd: sleep 999
    proxy: http://127.0.0.1:{pd}
    checkEndpoint: none
groups:
  g1:
    members: [a, b]
  g2:
    members: [c]
    exclusive: false
  keep:
    members: [d]
    persistent: true
    exclusive: false
"#
    );
    let mut config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.finalize().unwrap();
    config
}

async fn chat_request(app: &Router, model: &str) -> (StatusCode, Value) {
    chat_request_body(app, json!({"model": model, "messages": [{"role": "user", "content": "hi"}]}))
        .await
}

async fn chat_request_body(app: &Router, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap();

    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| json!({"raw": String::from_utf8_lossy(&bytes).to_string()}));

    (status, json)
}

async fn get_request(app: &Router, uri: &str) -> (StatusCode, String) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

// ── Basic dispatch ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_single_model_request() {
    let (pa, ua) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    let (status, body) = chat_request(&app, "a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["served_by"], "a");
    assert_eq!(ua.hits.load(Ordering::SeqCst), 1);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_alias_resolves_to_model() {
    let (pa, ua) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    let (status, body) = chat_request(&app, "alpha").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["served_by"], "a");
    assert_eq!(ua.hits.load(Ordering::SeqCst), 1);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_unknown_model_is_400() {
    let (pa, _) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    let (status, body) = chat_request(&app, "nonexistent").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("unknown model")
    );

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_concurrent_requests_same_model_spawn_once() {
    let (pa, ua) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    let mut events = manager.subscribe();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let app = app.clone();
        handles.push(tokio::spawn(async move { chat_request(&app, "a").await }));
    }
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["served_by"], "a");
    }
    assert_eq!(ua.hits.load(Ordering::SeqCst), 10);

    // All ten requests coalesced on a single Starting -> Ready cycle.
    let mut starts = 0;
    while let Ok(change) = events.try_recv() {
        if change.model == "a" && change.new == ProcessState::Starting {
            starts += 1;
        }
    }
    assert_eq!(starts, 1);

    manager.shutdown_all().await;
}

// ── Lifecycle scenarios ─────────────────────────────────────────────────────

/// A model with a 2s TTL is evicted after its idle window passes.
#[tokio::test]
async fn test_ttl_eviction_after_idle() {
    let (pa, _) = spawn_upstream("a").await;
    let yaml = format!(
        r#"
models:
  a:
    cmd: sleep 999
    proxy: http://127.0.0.1:{pa}
    checkEndpoint: none
    unloadAfter: 2
"#
    );
    let mut config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.finalize().unwrap();
    let (app, manager) = modelmux::build_app(config).await.unwrap();

    let (status, _) = chat_request(&app, "a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        manager.find_process("a").unwrap().state(),
        ProcessState::Ready
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        manager.find_process("a").unwrap().state(),
        ProcessState::Stopped
    );

    manager.shutdown_all().await;
}

/// Within a swap group the previous child has fully exited before the
/// next member starts.
#[tokio::test]
async fn test_swap_within_group_ordering() {
    let (pa, _) = spawn_upstream("a").await;
    let (pb, ub) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    let mut events = manager.subscribe();

    let (status, _) = chat_request(&app, "a").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = chat_request(&app, "b").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["served_by"], "b");
    assert_eq!(ub.hits.load(Ordering::SeqCst), 1);

    assert_eq!(
        manager.find_process("a").unwrap().state(),
        ProcessState::Stopped
    );
    assert_eq!(
        manager.find_process("b").unwrap().state(),
        ProcessState::Ready
    );

    // The broadcast preserves order: a reached Stopped before b left Stopped.
    let mut seen: Vec<StateChange> = Vec::new();
    while let Ok(change) = events.try_recv() {
        seen.push(change);
    }
    let a_stopped = seen
        .iter()
        .position(|c| c.model == "a" && c.old == ProcessState::Stopping && c.new == ProcessState::Stopped)
        .expect("a must stop");
    let b_starting = seen
        .iter()
        .position(|c| c.model == "b" && c.new == ProcessState::Starting)
        .expect("b must start");
    assert!(
        a_stopped < b_starting,
        "a exited at event {a_stopped}, b spawned at event {b_starting}"
    );

    manager.shutdown_all().await;
}

/// Activating a member of an exclusive group stops other non-persistent
/// groups first.
#[tokio::test]
async fn test_exclusive_stops_other_groups() {
    let (pa, _) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    let (status, _) = chat_request(&app, "c").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = chat_request(&app, "a").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        manager.find_process("c").unwrap().state(),
        ProcessState::Stopped
    );
    assert_eq!(
        manager.find_process("a").unwrap().state(),
        ProcessState::Ready
    );

    manager.shutdown_all().await;
}

/// A persistent group's member stays ready through activations elsewhere.
#[tokio::test]
async fn test_persistent_group_survives() {
    let (pa, _) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    let (status, _) = chat_request(&app, "d").await;
    assert_eq!(status, StatusCode::OK);

    let mut events = manager.subscribe();

    let (status, _) = chat_request(&app, "a").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        manager.find_process("d").unwrap().state(),
        ProcessState::Ready
    );
    // d saw no transitions at all while a was activated.
    while let Ok(change) = events.try_recv() {
        assert_ne!(change.model, "d", "persistent member was touched: {change:?}");
    }

    manager.shutdown_all().await;
}

/// A backend that never answers its health endpoint is killed when the
/// deadline passes and the request fails with 504.
#[tokio::test]
async fn test_health_timeout_returns_504() {
    let yaml = r#"
models:
  stuck:
    cmd: sleep 999
    proxy: http://127.0.0.1:1
    checkEndpoint: /health
"#;
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    config.finalize().unwrap();
    // Shortened gate; the loader floor applies to operator configs, not here.
    config.health_check_timeout = 2;
    let (app, manager) = modelmux::build_app(config).await.unwrap();

    let t0 = Instant::now();
    let (status, body) = chat_request(&app, "stuck").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("did not become healthy")
    );
    assert!(t0.elapsed() < Duration::from_secs(5));

    let process = manager.find_process("stuck").unwrap();
    process.wait_for_stopped().await;
    assert_eq!(process.state(), ProcessState::Stopped);

    manager.shutdown_all().await;
}

// ── Surface endpoints ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_models_listing_sorted_and_unlisted_hidden() {
    let (pa, _) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let yaml = format!(
        r#"
models:
  zeta:
    cmd: sleep 999
    proxy: http://127.0.0.1:{pa}
    checkEndpoint: none
  hidden:
    cmd: sleep 999
    proxy: http://127.0.0.1:{pb}
    checkEndpoint: none
    unlisted: true
"#
    );
    let mut config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.finalize().unwrap();
    let (app, manager) = modelmux::build_app(config).await.unwrap();

    let (status, body) = get_request(&app, "/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    let ids: Vec<&str> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["zeta"]);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_running_endpoint_reports_states() {
    let (pa, _) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    chat_request(&app, "a").await;

    let (status, body) = get_request(&app, "/running").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    let rows = json["running"].as_array().unwrap();
    assert_eq!(rows.len(), 4);
    let a = rows.iter().find(|r| r["model"] == "a").unwrap();
    assert_eq!(a["state"], "ready");
    assert_eq!(a["group"], "g1");
    assert_eq!(a["inFlight"], 0);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_upstream_path_rewrite() {
    let (pa, _) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    // /upstream/a/info lands on the backend's /info.
    let (status, body) = get_request(&app, "/upstream/a/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "info-a");

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_slots_dispatches_to_most_recent_ready() {
    let (pa, _) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    // Nothing ready: synthetic default.
    let (status, body) = get_request(&app, "/slots").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "[]");

    chat_request(&app, "c").await;
    let (status, body) = get_request(&app, "/slots").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json[0]["served_by"], "c");

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_request_rewrites_apply() {
    let (pa, ua) = spawn_upstream("a").await;
    let yaml = format!(
        r#"
models:
  friendly:
    cmd: sleep 999
    proxy: http://127.0.0.1:{pa}
    checkEndpoint: none
    useModelName: real/upstream-name
    filters:
      stripParams: [top_k, min_p]
"#
    );
    let mut config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.finalize().unwrap();
    let (app, manager) = modelmux::build_app(config).await.unwrap();

    let (status, _) = chat_request_body(
        &app,
        json!({"model": "friendly", "top_k": 5, "min_p": 0.2, "temperature": 0.7}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let seen = ua.last_body.lock().await.clone().unwrap();
    assert_eq!(seen["model"], "real/upstream-name");
    assert!(seen.get("top_k").is_none());
    assert!(seen.get("min_p").is_none());
    assert_eq!(seen["temperature"], 0.7);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_requests() {
    let (pa, _) = spawn_upstream("a").await;
    let (pb, _) = spawn_upstream("b").await;
    let (pc, _) = spawn_upstream("c").await;
    let (pd, _) = spawn_upstream("d").await;
    let (app, manager) = modelmux::build_app(test_config(pa, pb, pc, pd)).await.unwrap();

    chat_request(&app, "a").await;
    manager.shutdown_all().await;

    let (status, body) = chat_request(&app, "a").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("shutting down")
    );
}
