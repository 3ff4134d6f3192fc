//! Shared domain types used across the codebase.

/// Errors surfaced by the swap engine.
///
/// The endpoint layer maps these onto HTTP statuses (see
/// `middleware::swap_error_response`); the core itself never retries a
/// failed spawn or health gate — the next request starts over from Stopped.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model {0} is not a member of any group")]
    GroupNotFound(String),

    #[error("failed to spawn backend for {model}: {reason}")]
    SpawnFailed { model: String, reason: String },

    #[error("backend for {model} did not become healthy in time")]
    HealthTimeout { model: String },

    #[error("backend for {model} exited unexpectedly")]
    UnexpectedExit { model: String },

    #[error("upstream connection failed: {0}")]
    ProxyUpstreamError(String),

    #[error("server is shutting down")]
    ShuttingDown,
}

/// How a stop request treats requests that are still being proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
    /// Stop now; in-flight requests are abandoned to their fate.
    Immediately,
    /// Block until the in-flight counter reaches zero, then stop.
    WaitForInflight,
}
