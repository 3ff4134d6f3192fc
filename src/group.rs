//! Intra-group exclusivity.
//!
//! A `ProcessGroup` owns one `Process` per member and enforces the group's
//! `swap` policy: with `swap=true` only one member may be ready at a time,
//! and activating a different member stops the previous one (draining its
//! in-flight requests) before the new child is spawned.

use crate::config::GroupConfig;
use crate::process::{Process, ProcessState};
use crate::types::{StopStrategy, SwapError};
use futures_util::future::join_all;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct ProcessGroup {
    id: String,
    swap: bool,
    exclusive: bool,
    persistent: bool,
    /// Member ids in configuration order.
    members: Vec<String>,
    processes: HashMap<String, Process>,
    /// Most recently activated member. Guards intra-group activation so a
    /// swap's stop and start cannot interleave with another activation.
    last_used: Mutex<Option<String>>,
}

impl ProcessGroup {
    pub fn new(id: String, config: &GroupConfig, processes: HashMap<String, Process>) -> Self {
        Self {
            id,
            swap: config.swap,
            exclusive: config.exclusive,
            persistent: config.persistent,
            members: config.members.clone(),
            processes,
            last_used: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn process(&self, model: &str) -> Option<&Process> {
        self.processes.get(model)
    }

    /// Member processes in configuration order.
    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.members.iter().filter_map(|m| self.processes.get(m))
    }

    pub async fn last_used(&self) -> Option<String> {
        self.last_used.lock().await.clone()
    }

    /// Bring `model` up, first stopping the previously used member when this
    /// is a swap group. The previous child has fully exited before the new
    /// one is spawned.
    pub async fn activate(&self, model: &str) -> Result<Process, SwapError> {
        let target = self
            .processes
            .get(model)
            .ok_or_else(|| SwapError::UnknownModel(model.to_string()))?;

        let mut last_used = self.last_used.lock().await;

        if self.swap
            && let Some(previous) = last_used.as_deref()
            && previous != model
            && let Some(prev_proc) = self.processes.get(previous)
        {
            if prev_proc.state() == ProcessState::Ready {
                info!(
                    group = %self.id,
                    from = %previous,
                    to = %model,
                    "Swapping within group"
                );
                prev_proc.stop(StopStrategy::WaitForInflight).await;
            }
            prev_proc.wait_for_stopped().await;
        }

        target.start().await?;
        *last_used = Some(model.to_string());
        Ok(target.clone())
    }

    /// Stop every member in parallel and forget the last-used member.
    pub async fn stop_all(&self, strategy: StopStrategy) {
        debug!(group = %self.id, ?strategy, "Stopping all members");
        join_all(self.processes.values().map(|p| async move {
            p.stop(strategy).await;
            p.wait_for_stopped().await;
        }))
        .await;
        *self.last_used.lock().await = None;
    }

    /// Stop every member immediately and pin them in Shutdown.
    pub async fn shutdown(&self) {
        join_all(self.processes.values().map(|p| p.shutdown())).await;
        *self.last_used.lock().await = None;
    }
}
