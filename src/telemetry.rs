//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still works
/// — the macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!("modelmux_swaps_total", "Swap operations completed per model");
    describe_histogram!(
        "modelmux_swap_seconds",
        "Wall-clock swap duration (stops + health gate) per model"
    );
    describe_counter!(
        "modelmux_state_transitions_total",
        "Process state transitions, labelled by resulting state"
    );
    describe_counter!("modelmux_starts_total", "Backend children spawned");
    describe_counter!(
        "modelmux_failed_starts_total",
        "Starts that ended in a health timeout or an early exit"
    );
    describe_counter!(
        "modelmux_ttl_evictions_total",
        "Backends stopped by the idle TTL"
    );
    describe_gauge!("modelmux_in_flight", "Requests currently proxied per model");
}
