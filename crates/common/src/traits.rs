//! Core traits for Boreas components
//!
//! The results queue is the only outward surface of an alive-detection run.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{BoreasError, BoreasResult};
use crate::types::HostId;

/// Well-known name of the queue consumed by the main scan process.
pub const ALIVE_DETECTION_QUEUE: &str = "alive_detection";
/// Sentinel pushed once the run is complete.
pub const ALIVE_DETECTION_FINISHED: &str = "alive_detection_finished";

/// One alive host handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliveRecord {
    pub host: HostId,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueItem {
    Alive(AliveRecord),
    Finished,
}

impl QueueItem {
    /// Wire representation: the host address, or the finished sentinel.
    #[must_use]
    pub fn as_wire(&self) -> &str {
        match self {
            QueueItem::Alive(record) => &record.addr,
            QueueItem::Finished => ALIVE_DETECTION_FINISHED,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, QueueItem::Finished)
    }
}

/// FIFO channel to the consuming scan orchestrator.
#[async_trait]
pub trait ResultsQueue: Send + Sync {
    /// Push one item. Items must be observed by the consumer in push order.
    async fn push(&self, item: QueueItem) -> BoreasResult<()>;

    /// Queue name, for logging.
    fn name(&self) -> &str {
        ALIVE_DETECTION_QUEUE
    }
}

/// Queue backed by a tokio channel, for a consumer in the same process.
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl ChannelQueue {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueueItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ResultsQueue for ChannelQueue {
    async fn push(&self, item: QueueItem) -> BoreasResult<()> {
        self.tx.send(item).map_err(|_| BoreasError::QueueClosed)
    }
}

/// Queue that records every push in memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: Mutex<Vec<QueueItem>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn items(&self) -> Vec<QueueItem> {
        self.items.lock().clone()
    }

    /// Addresses pushed so far, without the sentinel.
    #[must_use]
    pub fn alive_addrs(&self) -> Vec<String> {
        self.items
            .lock()
            .iter()
            .filter_map(|item| match item {
                QueueItem::Alive(record) => Some(record.addr.clone()),
                QueueItem::Finished => None,
            })
            .collect()
    }
}

#[async_trait]
impl ResultsQueue for MemoryQueue {
    async fn push(&self, item: QueueItem) -> BoreasResult<()> {
        self.items.lock().push(item);
        Ok(())
    }
}
