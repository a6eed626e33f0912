//! Progress relay from a running engine call to the caller.
//!
//! The engine writes [`Progress`] events into a bounded channel; the
//! dispatcher drains the other end and forwards each event to a
//! [`ProgressSink`]. A single channel per call keeps events in emission
//! order. The receiving side also keeps the numbers monotonic, since MCP
//! clients require `progress` to increase between notifications.
//!
//! Closing the receiver (because the caller went away) makes every later
//! [`ProgressSender::report`] return `false`, which tells the engine to stop
//! relaying even though its underlying work cannot be aborted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Default capacity of a progress channel.
pub const DEFAULT_PROGRESS_BUFFER: usize = 32;

/// One progress update from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
    /// The sub-query the engine is working on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_query: Option<String>,
}

impl Progress {
    pub fn new(completed: u64, total: u64, current_query: Option<String>) -> Self {
        Self {
            completed,
            total,
            current_query,
        }
    }
}

/// Engine-side handle of a progress channel.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<Progress>,
}

impl ProgressSender {
    /// Queue an update. Returns `false` once the caller stopped listening.
    pub async fn report(&self, progress: Progress) -> bool {
        self.tx.send(progress).await.is_ok()
    }

    /// Whether the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Dispatcher-side handle of a progress channel.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::Receiver<Progress>,
    last_completed: u64,
    last_total: u64,
}

impl ProgressReceiver {
    /// Next update with monotonic numbers, or `None` once every sender is
    /// dropped and the buffer is empty.
    ///
    /// `completed` never decreases, and `total` never decreases nor drops
    /// below `completed`.
    pub async fn recv(&mut self) -> Option<Progress> {
        let mut progress = self.rx.recv().await?;
        progress.completed = progress.completed.max(self.last_completed);
        progress.total = progress.total.max(self.last_total).max(progress.completed);
        self.last_completed = progress.completed;
        self.last_total = progress.total;
        Some(progress)
    }

    /// Stop accepting updates. Buffered events are discarded.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Create a linked progress channel with the given buffer size.
pub fn progress_channel(buffer: usize) -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        ProgressSender { tx },
        ProgressReceiver {
            rx,
            last_completed: 0,
            last_total: 0,
        },
    )
}

/// Destination of relayed progress, typically a protocol notification channel.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Deliver one update. Returns `false` when the caller is gone.
    async fn emit(&self, progress: &Progress) -> bool;
}

/// Drain `rx` into `sink` until the engine side finishes. Returns the number
/// of events delivered.
///
/// If the sink reports the caller gone, the receiver is closed so the engine
/// stops relaying; the engine call itself keeps running.
pub async fn relay(mut rx: ProgressReceiver, sink: &dyn ProgressSink) -> usize {
    let mut delivered = 0;
    while let Some(progress) = rx.recv().await {
        if !sink.emit(&progress).await {
            debug!(delivered, "Progress sink closed, stopping relay");
            rx.close();
            break;
        }
        delivered += 1;
    }
    delivered
}
