//! Orchestrator - state task ownership and completion handoff

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, instrument};

use boreas_common::{QueueItem, ResultsQueue, ScanRestrictions, TargetList};

use crate::progress::ProgressTracker;
use crate::state::{AliveEventSender, HostStateStore, StateTask};

/// Orchestrator ties the shared pieces of one alive-detection run together:
/// the caller's targets, the scan restrictions, the state task and the
/// results queue the final state is handed to.
pub struct Orchestrator {
    targets: Arc<TargetList>,
    restrictions: Arc<ScanRestrictions>,
    progress: Arc<ProgressTracker>,
    queue: Arc<dyn ResultsQueue>,
}

impl Orchestrator {
    pub fn new(
        targets: Arc<TargetList>,
        restrictions: Arc<ScanRestrictions>,
        queue: Arc<dyn ResultsQueue>,
    ) -> Self {
        Self {
            targets,
            restrictions,
            progress: Arc::new(ProgressTracker::new()),
            queue,
        }
    }

    /// Spawn the task owning the host state store. Producers send alive events
    /// through the returned sender (and its clones).
    pub fn start_state_task(&self, buffer: usize) -> (AliveEventSender, StateTask) {
        let store = HostStateStore::new(self.targets.clone(), self.restrictions.clone());
        StateTask::spawn(store, buffer)
    }

    pub fn targets(&self) -> &Arc<TargetList> {
        &self.targets
    }

    pub fn restrictions(&self) -> &Arc<ScanRestrictions> {
        &self.restrictions
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// Drain the state task and publish every emitted host, followed by the
    /// finished sentinel. All event senders must have been dropped before.
    #[instrument(skip_all, fields(queue = self.queue.name()))]
    pub async fn complete(&self, task: StateTask) -> Result<HostStateStore> {
        let store = task.finish().await.context("state task panicked")?;
        let published = publish(&store, self.queue.as_ref()).await?;

        info!(
            targets = self.targets.len(),
            alive = published,
            capped = store.capped().len(),
            "alive detection finished"
        );
        Ok(store)
    }
}

/// Push the emitted hosts of `store` in confirmation order, then the sentinel.
pub async fn publish(store: &HostStateStore, queue: &dyn ResultsQueue) -> Result<usize> {
    for record in store.emitted() {
        queue
            .push(QueueItem::Alive(record.clone()))
            .await
            .with_context(|| format!("failed to publish {}", record.addr))?;
    }
    queue
        .push(QueueItem::Finished)
        .await
        .context("failed to publish finished sentinel")?;
    Ok(store.emitted().len())
}
