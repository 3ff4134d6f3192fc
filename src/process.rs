//! Backend process lifecycle.
//!
//! Each configured model owns one `Process`: a state machine around a child
//! OS process (llama-server, vLLM, ...). The process is spawned on demand,
//! held in `Starting` until its health endpoint answers, serves requests in
//! `Ready`, and is torn down through `Stopping` when a swap or the idle TTL
//! requires it. The state lives in a watch channel so waiters block on
//! transitions instead of polling; every transition is published on the
//! manager's broadcast channel.

use crate::config::ModelConfig;
use crate::types::{StopStrategy, SwapError};
use metrics::{counter, gauge};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tracing::{debug, error, info, warn};

/// Pause between spawning the child and the first health probe, giving the
/// backend a moment to bind its port.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Interval between health probes while starting.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stopped backend may linger after `cmdStop`/SIGTERM before the
/// whole process group gets SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// How long to wait for the exit after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No child process.
    Stopped,
    /// Child spawned, health gate not yet passed.
    Starting,
    /// Serving requests.
    Ready,
    /// Termination requested; the child may still be exiting.
    Stopping,
    /// Terminal: the server is exiting.
    Shutdown,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Stopping => "stopping",
            ProcessState::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state transition record, published for every transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub model: String,
    pub old: ProcessState,
    pub new: ProcessState,
    pub at: SystemTime,
}

/// Kill an entire process group by sending SIGKILL to -pgid.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: signalling a process group we spawned.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

#[cfg(unix)]
fn term_process_group(pid: u32) {
    // SAFETY: signalling a process group we spawned.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
    }
}

/// Strip ANSI escape sequences from a backend log line.
fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

struct ProcessInner {
    model_id: String,
    config: ModelConfig,
    health_check_timeout: Duration,
    state_tx: watch::Sender<ProcessState>,
    /// Serialises spawn attempts; concurrent `start` callers coalesce here.
    start_lock: Mutex<()>,
    /// PID of the running child, 0 when there is none.
    child_pid: AtomicU32,
    in_flight: AtomicUsize,
    in_flight_changed: Notify,
    /// Reference instant for the millisecond counters below.
    epoch: Instant,
    /// Milliseconds since `epoch` of the last request activity.
    last_used_ms: AtomicU64,
    /// Milliseconds since `epoch` of the last transition to Ready
    /// (`u64::MAX` = never started).
    started_at_ms: AtomicU64,
    failed_starts: AtomicU32,
    events: broadcast::Sender<StateChange>,
}

/// Handle to one backend's lifecycle. Cheap to clone.
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Clone for Process {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Process {
    pub fn new(
        model_id: String,
        config: ModelConfig,
        health_check_timeout: Duration,
        events: broadcast::Sender<StateChange>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::Stopped);
        Self {
            inner: Arc::new(ProcessInner {
                model_id,
                config,
                health_check_timeout,
                state_tx,
                start_lock: Mutex::new(()),
                child_pid: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                in_flight_changed: Notify::new(),
                epoch: Instant::now(),
                last_used_ms: AtomicU64::new(0),
                started_at_ms: AtomicU64::new(u64::MAX),
                failed_starts: AtomicU32::new(0),
                events,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.model_id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.inner.config
    }

    /// Upstream base URL requests for this model are proxied to.
    pub fn upstream(&self) -> &str {
        self.inner.config.upstream()
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state_tx.borrow()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn failed_starts(&self) -> u32 {
        self.inner.failed_starts.load(Ordering::Relaxed)
    }

    /// How long ago this backend last became Ready, if it ever did.
    pub fn started_since(&self) -> Option<Duration> {
        let ms = self.inner.started_at_ms.load(Ordering::Relaxed);
        if ms == u64::MAX {
            return None;
        }
        Some(
            self.inner
                .epoch
                .elapsed()
                .saturating_sub(Duration::from_millis(ms)),
        )
    }

    /// Time since the last request activity.
    fn idle_time(&self) -> Duration {
        let ms = self.inner.last_used_ms.load(Ordering::Relaxed);
        self.inner
            .epoch
            .elapsed()
            .saturating_sub(Duration::from_millis(ms))
    }

    fn stamp_used(&self) {
        self.inner
            .last_used_ms
            .store(self.inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Register a request against this backend. The returned guard must live
    /// until the last response byte is written; dropping it (on any path,
    /// including panics and client disconnects) releases the slot and resets
    /// the idle clock.
    pub fn begin_request(&self) -> RequestGuard {
        let count = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stamp_used();
        gauge!("modelmux_in_flight", "model" => self.inner.model_id.clone()).set(count as f64);
        RequestGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Apply `decide` to the current state under the watch lock. Returns
    /// `(old, new)`; `decide` returning None leaves the state untouched.
    fn update_state<F>(&self, decide: F) -> (ProcessState, ProcessState)
    where
        F: Fn(ProcessState) -> Option<ProcessState>,
    {
        let mut old = ProcessState::Stopped;
        let mut new = ProcessState::Stopped;
        self.inner.state_tx.send_modify(|s| {
            old = *s;
            if let Some(n) = decide(old) {
                *s = n;
            }
            new = *s;
        });
        if old != new {
            info!(model = %self.inner.model_id, from = %old, to = %new, "State changed");
            counter!(
                "modelmux_state_transitions_total",
                "model" => self.inner.model_id.clone(),
                "to" => new.as_str()
            )
            .increment(1);
            let _ = self.inner.events.send(StateChange {
                model: self.inner.model_id.clone(),
                old,
                new,
                at: SystemTime::now(),
            });
        }
        (old, new)
    }

    fn transition(&self, to: ProcessState) {
        self.update_state(|_| Some(to));
    }

    /// Transition to `to` only from one of `allowed`. True iff this call
    /// performed the transition.
    fn transition_from(&self, allowed: &[ProcessState], to: ProcessState) -> bool {
        let (old, new) = self.update_state(|old| allowed.contains(&old).then_some(to));
        new == to && old != to
    }

    /// Bring the backend to Ready. Idempotent; concurrent callers coalesce —
    /// exactly one child is spawned no matter how many requests race here.
    pub async fn start(&self) -> Result<(), SwapError> {
        match self.state() {
            ProcessState::Ready => return Ok(()),
            ProcessState::Shutdown => return Err(SwapError::ShuttingDown),
            ProcessState::Starting => return self.await_health_gate().await,
            ProcessState::Stopped | ProcessState::Stopping => {}
        }

        let _start = self.inner.start_lock.lock().await;

        // Re-check: another caller may have finished a start, or a stop may
        // have landed, while we waited for the lock.
        match self.state() {
            ProcessState::Ready => return Ok(()),
            ProcessState::Shutdown => return Err(SwapError::ShuttingDown),
            ProcessState::Starting => return self.await_health_gate().await,
            ProcessState::Stopping => {
                self.wait_for_stopped().await;
                if self.state() == ProcessState::Shutdown {
                    return Err(SwapError::ShuttingDown);
                }
            }
            ProcessState::Stopped => {}
        }

        self.spawn_and_gate().await
    }

    /// Wait for someone else's health gate to resolve.
    async fn await_health_gate(&self) -> Result<(), SwapError> {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ProcessState::Starting => {}
                ProcessState::Ready => return Ok(()),
                ProcessState::Shutdown => return Err(SwapError::ShuttingDown),
                ProcessState::Stopped | ProcessState::Stopping => {
                    return Err(SwapError::UnexpectedExit {
                        model: self.inner.model_id.clone(),
                    });
                }
            }
            if rx.changed().await.is_err() {
                return Err(SwapError::UnexpectedExit {
                    model: self.inner.model_id.clone(),
                });
            }
        }
    }

    /// Spawn the child and run the health gate. Caller holds `start_lock`.
    async fn spawn_and_gate(&self) -> Result<(), SwapError> {
        let inner = &self.inner;
        let argv = inner.config.argv();
        debug!(model = %inner.model_id, args = ?argv, "Spawning backend");

        self.transition(ProcessState::Starting);

        // Own process group so the whole tree can be signalled: inference
        // servers fork workers that hold GPU memory.
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for entry in &inner.config.env {
            if let Some((k, v)) = entry.split_once('=') {
                cmd.env(k, v);
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                inner.failed_starts.fetch_add(1, Ordering::Relaxed);
                self.transition(ProcessState::Stopped);
                return Err(SwapError::SpawnFailed {
                    model: inner.model_id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        inner.child_pid.store(pid, Ordering::SeqCst);
        counter!("modelmux_starts_total", "model" => inner.model_id.clone()).increment(1);
        info!(model = %inner.model_id, pid, "Backend spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, inner.model_id.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, inner.model_id.clone(), "stderr");
        }

        // The monitor owns the child handle from here; it performs the
        // Stopping -> Stopped transition when the exit is observed.
        let proc = self.clone();
        tokio::spawn(async move { proc.monitor_child(child).await });

        tokio::time::sleep(SETTLE_DELAY).await;

        if inner.config.no_health_check() {
            if self.transition_from(&[ProcessState::Starting], ProcessState::Ready) {
                self.mark_ready();
                return Ok(());
            }
            return Err(SwapError::UnexpectedExit {
                model: inner.model_id.clone(),
            });
        }

        self.health_gate().await
    }

    /// Probe the backend until it answers 200 or the deadline expires.
    async fn health_gate(&self) -> Result<(), SwapError> {
        let inner = &self.inner;
        let url = format!("{}{}", inner.config.upstream(), inner.config.check_endpoint);
        let deadline = Instant::now() + inner.health_check_timeout;
        let mut rx = inner.state_tx.subscribe();

        loop {
            if *rx.borrow_and_update() != ProcessState::Starting {
                debug!(model = %inner.model_id, "Health gate abandoned, state changed externally");
                return Err(SwapError::UnexpectedExit {
                    model: inner.model_id.clone(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    model = %inner.model_id,
                    timeout = ?inner.health_check_timeout,
                    "Health check deadline expired, killing backend"
                );
                inner.failed_starts.fetch_add(1, Ordering::Relaxed);
                counter!("modelmux_failed_starts_total", "model" => inner.model_id.clone())
                    .increment(1);
                let pid = inner.child_pid.load(Ordering::SeqCst);
                if pid != 0 {
                    kill_process_group(pid);
                }
                self.transition_from(&[ProcessState::Starting], ProcessState::Stopped);
                return Err(SwapError::HealthTimeout {
                    model: inner.model_id.clone(),
                });
            }

            let probe_timeout = PROBE_TIMEOUT.min(deadline - now);
            match probe(&url, probe_timeout).await {
                Ok(status) if status.is_success() => {
                    if self.transition_from(&[ProcessState::Starting], ProcessState::Ready) {
                        self.mark_ready();
                        return Ok(());
                    }
                    return Err(SwapError::UnexpectedExit {
                        model: inner.model_id.clone(),
                    });
                }
                Ok(status) => {
                    debug!(model = %inner.model_id, %status, "Health probe answered, not ready")
                }
                Err(e) => debug!(model = %inner.model_id, error = %e, "Health probe failed"),
            }

            let wait = PROBE_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = rx.changed() => {}
            }
        }
    }

    fn mark_ready(&self) {
        let inner = &self.inner;
        inner.failed_starts.store(0, Ordering::Relaxed);
        inner
            .started_at_ms
            .store(inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.stamp_used();
        info!(model = %inner.model_id, "Backend is ready");
        self.arm_ttl();
    }

    /// Observe the child's exit for the rest of its life.
    async fn monitor_child(&self, mut child: Child) {
        let status = child.wait().await;
        self.inner.child_pid.store(0, Ordering::SeqCst);

        let exit = match &status {
            Ok(s) => s.to_string(),
            Err(e) => format!("wait failed: {e}"),
        };

        let (old, _) = self.update_state(|old| match old {
            // Terminal; a late exit must not resurrect the state machine.
            ProcessState::Shutdown => None,
            ProcessState::Stopped => None,
            _ => Some(ProcessState::Stopped),
        });

        match old {
            ProcessState::Stopping => {
                info!(model = %self.id(), exit = %exit, "Backend exited");
            }
            ProcessState::Starting => {
                self.inner.failed_starts.fetch_add(1, Ordering::Relaxed);
                counter!("modelmux_failed_starts_total", "model" => self.id().to_string())
                    .increment(1);
                warn!(model = %self.id(), exit = %exit, "Backend exited during startup");
            }
            ProcessState::Ready => {
                warn!(model = %self.id(), exit = %exit, "Backend exited unexpectedly");
            }
            ProcessState::Stopped | ProcessState::Shutdown => {}
        }
    }

    /// Stop the backend. Returns once the child has exited (and the state is
    /// Stopped) when this call wins the Stopping transition; callers that
    /// lose the race should follow up with `wait_for_stopped`.
    pub async fn stop(&self, strategy: StopStrategy) {
        let (old, _) = self.update_state(|old| match old {
            ProcessState::Ready | ProcessState::Starting => Some(ProcessState::Stopping),
            _ => None,
        });
        if !matches!(old, ProcessState::Ready | ProcessState::Starting) {
            return;
        }

        info!(model = %self.id(), ?strategy, "Stopping backend");

        if strategy == StopStrategy::WaitForInflight {
            self.wait_for_inflight_drain().await;
        }

        let pid = self.inner.child_pid.load(Ordering::SeqCst);
        if pid == 0 {
            // Child already reaped (or never spawned); nothing to signal.
            self.transition_from(&[ProcessState::Stopping], ProcessState::Stopped);
            return;
        }

        self.terminate(pid).await;

        if tokio::time::timeout(STOP_GRACE, self.wait_for_stopped())
            .await
            .is_err()
        {
            warn!(model = %self.id(), pid, grace = ?STOP_GRACE, "Backend ignored stop request, sending SIGKILL");
            kill_process_group(pid);
            if tokio::time::timeout(KILL_GRACE, self.wait_for_stopped())
                .await
                .is_err()
            {
                error!(model = %self.id(), pid, "Backend survived SIGKILL");
                self.transition_from(&[ProcessState::Stopping], ProcessState::Stopped);
            }
        }
    }

    /// Run `cmdStop` with `${PID}` substituted, falling back to SIGTERM on
    /// the process group.
    async fn terminate(&self, pid: u32) {
        if let Some(template) = &self.inner.config.cmd_stop {
            let cmdline = template.replace("${PID}", &pid.to_string());
            debug!(model = %self.id(), cmd = %cmdline, "Running stop command");
            match Command::new("sh").arg("-c").arg(&cmdline).output().await {
                Ok(out) if out.status.success() => return,
                Ok(out) => warn!(
                    model = %self.id(),
                    code = ?out.status.code(),
                    "Stop command failed, falling back to SIGTERM"
                ),
                Err(e) => warn!(
                    model = %self.id(),
                    error = %e,
                    "Stop command did not run, falling back to SIGTERM"
                ),
            }
        }
        term_process_group(pid);
    }

    async fn wait_for_inflight_drain(&self) {
        loop {
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            // Register interest before re-checking to avoid a missed wakeup.
            let notified = self.inner.in_flight_changed.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Block until the state is Stopped (or Shutdown).
    pub async fn wait_for_stopped(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            if matches!(
                *rx.borrow_and_update(),
                ProcessState::Stopped | ProcessState::Shutdown
            ) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop immediately and pin the terminal Shutdown state.
    pub async fn shutdown(&self) {
        self.stop(StopStrategy::Immediately).await;
        self.wait_for_stopped().await;
        self.transition(ProcessState::Shutdown);
    }

    /// Spawn the 1s idle ticker. Runs until the state leaves Ready.
    fn arm_ttl(&self) {
        let ttl_secs = self.inner.config.unload_after;
        if ttl_secs == 0 {
            return;
        }
        let ttl = Duration::from_secs(ttl_secs);
        let proc = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tick.tick().await;
                if proc.state() != ProcessState::Ready {
                    return;
                }
                if proc.in_flight() > 0 {
                    continue;
                }
                let idle = proc.idle_time();
                if idle > ttl {
                    info!(model = %proc.id(), ?idle, "Idle TTL expired, stopping backend");
                    counter!("modelmux_ttl_evictions_total", "model" => proc.id().to_string())
                        .increment(1);
                    proc.stop(StopStrategy::Immediately).await;
                    return;
                }
            }
        });
    }
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        // Last handle gone; don't leave a child holding the GPU. Especially
        // important for tests.
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid != 0 {
            kill_process_group(pid);
        }
    }
}

/// Guard held for the lifetime of one proxied request.
pub struct RequestGuard {
    inner: Arc<ProcessInner>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let prev = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        let now = prev.saturating_sub(1);
        self.inner
            .last_used_ms
            .store(self.inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        gauge!("modelmux_in_flight", "model" => self.inner.model_id.clone()).set(now as f64);
        if now == 0 {
            self.inner.in_flight_changed.notify_waiters();
        }
    }
}

/// Forward a child stdio stream as tracing events under the `backend`
/// target, filterable via RUST_LOG (e.g. RUST_LOG=info,backend=debug).
fn forward_output<R>(reader: R, model: String, stream: &'static str)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let clean = strip_ansi(&line);
            if !clean.is_empty() {
                debug!(target: "backend", model = %model, stream = stream, "{}", clean);
            }
        }
    });
}

/// One GET against the backend's health endpoint.
async fn probe(url: &str, timeout: Duration) -> Result<hyper::StatusCode, String> {
    use http_body_util::Empty;

    let client: hyper_util::client::legacy::Client<_, Empty<bytes::Bytes>> =
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build_http();

    let uri: hyper::Uri = url.parse().map_err(|e| format!("invalid health URL: {e}"))?;
    let request = hyper::Request::builder()
        .method("GET")
        .uri(uri)
        .body(Empty::new())
        .map_err(|e| e.to_string())?;

    match tokio::time::timeout(timeout, client.request(request)).await {
        Ok(Ok(response)) => Ok(response.status()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("probe timeout".to_string()),
    }
}
