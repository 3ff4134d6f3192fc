//! Cross-group policy and the swap entry point.
//!
//! The `ProcessManager` owns every `ProcessGroup` (and therefore every
//! `Process`), resolves aliases, and serialises swaps so that the stops
//! required by the cross-group and exclusive policies have fully completed
//! before the target backend is spawned. That ordering is what keeps two
//! backends from contesting the GPU.

use crate::config::Config;
use crate::group::ProcessGroup;
use crate::process::{Process, ProcessState, StateChange};
use crate::types::{StopStrategy, SwapError};
use futures_util::future::join_all;
use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

/// Capacity of the state-change broadcast channel. Slow subscribers lag and
/// miss records rather than back-pressuring transitions.
const EVENT_CAPACITY: usize = 256;

/// Row returned by [`ProcessManager::each_process`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    pub group: String,
    pub model: String,
    pub state: &'static str,
    /// Seconds since the backend last became ready, if it is running.
    pub up_secs: Option<u64>,
    pub in_flight: usize,
}

struct ManagerInner {
    /// Groups in deterministic activation order, `(default)` last.
    groups: Vec<Arc<ProcessGroup>>,
    aliases: HashMap<String, String>,
    model_to_group: HashMap<String, usize>,
    /// Serialises swap operations across groups.
    swap_lock: Mutex<()>,
    /// Id of the most recently activated non-persistent group.
    last_active_group: Mutex<Option<String>>,
    shutting_down: AtomicBool,
    events: broadcast::Sender<StateChange>,
}

/// Handle to the whole process registry. Cheap to clone.
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

impl Clone for ProcessManager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ProcessManager {
    /// Build the registry from a finalized config: one `Process` per model,
    /// one `ProcessGroup` per (explicit or synthetic) group.
    pub fn new(config: &Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let health_timeout = config.health_check_timeout();

        let mut groups = Vec::new();
        let mut model_to_group = HashMap::new();
        for gid in config.group_ids() {
            let group_config = &config.groups[&gid];
            let processes: HashMap<String, Process> = group_config
                .members
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        Process::new(
                            id.clone(),
                            config.models[id].clone(),
                            health_timeout,
                            events.clone(),
                        ),
                    )
                })
                .collect();
            for id in &group_config.members {
                model_to_group.insert(id.clone(), groups.len());
            }
            groups.push(Arc::new(ProcessGroup::new(gid, group_config, processes)));
        }

        info!(
            groups = groups.len(),
            models = model_to_group.len(),
            "Process registry built"
        );

        Self {
            inner: Arc::new(ManagerInner {
                groups,
                aliases: config.aliases.clone(),
                model_to_group,
                swap_lock: Mutex::new(()),
                last_active_group: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Resolve a requested name through the alias table.
    pub fn resolve(&self, name: &str) -> Option<String> {
        if self.inner.model_to_group.contains_key(name) {
            return Some(name.to_string());
        }
        self.inner.aliases.get(name).cloned()
    }

    /// The group owning `model`, if any.
    pub fn find_group_by_model(&self, model: &str) -> Option<Arc<ProcessGroup>> {
        let idx = *self.inner.model_to_group.get(model)?;
        Some(Arc::clone(&self.inner.groups[idx]))
    }

    /// The process for a model id, if configured.
    pub fn find_process(&self, model: &str) -> Option<Process> {
        self.find_group_by_model(model)?.process(model).cloned()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Subscribe to state-change records for every process.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events.subscribe()
    }

    /// The dispatch entry point: make `name`'s backend the serving one.
    ///
    /// Stops whatever the group policies require (completing those stops
    /// before anything new is spawned), starts the target, and returns its
    /// process together with the alias-resolved model id.
    pub async fn swap(&self, name: &str) -> Result<(Process, String), SwapError> {
        if self.is_shutting_down() {
            return Err(SwapError::ShuttingDown);
        }

        let resolved = self
            .resolve(name)
            .ok_or_else(|| SwapError::UnknownModel(name.to_string()))?;
        let target_group = self
            .find_group_by_model(&resolved)
            .ok_or_else(|| SwapError::GroupNotFound(resolved.clone()))?;

        let swap_start = Instant::now();
        let _swap = self.inner.swap_lock.lock().await;

        // A shutdown may have begun while we waited for the lock.
        if self.is_shutting_down() {
            return Err(SwapError::ShuttingDown);
        }

        let mut last_active = self.inner.last_active_group.lock().await;

        // Cross-group policy: leaving a non-persistent group for another
        // non-persistent group stops everything the old group was running.
        if !target_group.persistent()
            && let Some(last_id) = last_active.clone()
            && last_id != target_group.id()
            && let Some(last_group) = self.group_by_id(&last_id)
            && !last_group.persistent()
        {
            debug!(from = %last_id, to = %target_group.id(), "Stopping last active group");
            last_group.stop_all(StopStrategy::WaitForInflight).await;
        }

        // Exclusive policy: the target group tolerates no other
        // non-persistent group running at all.
        if target_group.exclusive() {
            let others: Vec<_> = self
                .inner
                .groups
                .iter()
                .filter(|g| g.id() != target_group.id() && !g.persistent())
                .collect();
            join_all(
                others
                    .iter()
                    .map(|g| g.stop_all(StopStrategy::WaitForInflight)),
            )
            .await;
        }

        let process = target_group.activate(&resolved).await?;

        if !target_group.persistent() {
            *last_active = Some(target_group.id().to_string());
        }

        counter!("modelmux_swaps_total", "model" => resolved.clone()).increment(1);
        histogram!("modelmux_swap_seconds", "model" => resolved.clone())
            .record(swap_start.elapsed().as_secs_f64());

        Ok((process, resolved))
    }

    fn group_by_id(&self, id: &str) -> Option<Arc<ProcessGroup>> {
        self.inner
            .groups
            .iter()
            .find(|g| g.id() == id)
            .map(Arc::clone)
    }

    /// Snapshot every process for listing endpoints.
    pub fn each_process(&self) -> Vec<ProcessSnapshot> {
        let mut rows = Vec::new();
        for group in &self.inner.groups {
            for process in group.processes() {
                rows.push(ProcessSnapshot {
                    group: group.id().to_string(),
                    model: process.id().to_string(),
                    state: process.state().as_str(),
                    up_secs: match process.state() {
                        ProcessState::Ready => process.started_since().map(|d| d.as_secs()),
                        _ => None,
                    },
                    in_flight: process.in_flight(),
                });
            }
        }
        rows
    }

    /// The most recently started process that is currently Ready. Used for
    /// requests against paths that are not model-scoped.
    pub fn most_recent_ready(&self) -> Option<Process> {
        self.inner
            .groups
            .iter()
            .flat_map(|g| g.processes())
            .filter(|p| p.state() == ProcessState::Ready)
            .filter_map(|p| p.started_since().map(|d| (d, p)))
            .min_by_key(|(since, _)| *since)
            .map(|(_, p)| p.clone())
    }

    /// Stop everything and pin every process in Shutdown. Swaps arriving
    /// after this fail with `ShuttingDown`.
    pub async fn shutdown_all(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down all process groups");
        let _swap = self.inner.swap_lock.lock().await;
        join_all(self.inner.groups.iter().map(|g| g.shutdown())).await;
        *self.inner.last_active_group.lock().await = None;
        info!("All backends stopped");
    }
}
