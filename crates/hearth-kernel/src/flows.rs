//! Typed pub/sub for kernel events.
//!
//! Transfer progress and filesystem changes are published on a [`FlowBus`].
//! Subscribers pick events with dot-separated subject patterns:
//!
//! - `*` matches exactly one token: `transfer.*` matches `transfer.progress`
//! - `>` matches one or more trailing tokens: `fs.>` matches `fs.deleted`
//! - anything else must match literally
//!
//! ```ignore
//! let bus = FlowBus::<TransferFlow>::new(256);
//! let mut sub = bus.subscribe("transfer.finished");
//! while let Some(msg) = sub.recv().await {
//!     println!("{} {:?}", msg.subject, msg.payload);
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hearth_types::{JobId, LogicalPath, TransferJob, TransferProgress};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Check whether `subject` matches `pattern`.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let mut subject = subject.split('.');
    let mut pattern = pattern.split('.').peekable();

    while let Some(token) = pattern.next() {
        if token == ">" {
            return pattern.peek().is_none() && subject.next().is_some();
        }
        match subject.next() {
            Some(_) if token == "*" => {}
            Some(part) if part == token => {}
            _ => return false,
        }
    }
    subject.next().is_none()
}

/// An event payload. The subject is fixed by the variant, so it is static.
pub trait Flow: Clone + Send + 'static {
    fn subject(&self) -> &'static str;
}

/// A published event. `seq` increases by one per publish on a bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    pub seq: u64,
    pub subject: &'static str,
    pub payload: T,
}

/// Broadcast bus for one event domain.
#[derive(Debug)]
pub struct FlowBus<T: Flow> {
    tx: broadcast::Sender<FlowMessage<T>>,
    seq: AtomicU64,
}

impl<T: Flow> FlowBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event. Returns how many subscribers it reached; publishing
    /// with nobody listening is not an error.
    pub fn publish(&self, payload: T) -> usize {
        let msg = FlowMessage {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            subject: payload.subject(),
            payload,
        };
        self.tx.send(msg).unwrap_or(0)
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

/// Pattern-filtered receiver. Dropping it is how a caller unsubscribes.
pub struct Subscription<T: Flow> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Flow> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn accepts(&self, msg: &FlowMessage<T>) -> bool {
        matches_pattern(&self.pattern, msg.subject)
    }

    fn lagged(&self, skipped: u64) {
        tracing::warn!(pattern = %self.pattern, skipped, "flow subscriber fell behind");
    }

    /// Wait for the next matching event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<FlowMessage<T>> {
        use broadcast::error::RecvError;
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.accepts(&msg) => return Some(msg),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => self.lagged(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<FlowMessage<T>> {
        use broadcast::error::TryRecvError;
        loop {
            match self.rx.try_recv() {
                Ok(msg) if self.accepts(&msg) => return Some(msg),
                Ok(_) => {}
                Err(TryRecvError::Lagged(n)) => self.lagged(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl<T: Flow> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Transfer events
// ============================================================================

/// Lifecycle of a transfer job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TransferFlow {
    Started { job: TransferJob },
    Progress { id: JobId, progress: TransferProgress },
    /// Terminal: done, failed or cancelled. `job.state` says which.
    Finished { job: TransferJob },
}

impl TransferFlow {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Started { job } | Self::Finished { job } => job.id,
            Self::Progress { id, .. } => *id,
        }
    }
}

impl Flow for TransferFlow {
    fn subject(&self) -> &'static str {
        match self {
            Self::Started { .. } => "transfer.started",
            Self::Progress { .. } => "transfer.progress",
            Self::Finished { .. } => "transfer.finished",
        }
    }
}

// ============================================================================
// Filesystem change events
// ============================================================================

/// Kind of filesystem change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A change to a logical path. Physical paths never appear here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFlow {
    pub path: LogicalPath,
    pub kind: ChangeKind,
}

impl Flow for ChangeFlow {
    fn subject(&self) -> &'static str {
        match self.kind {
            ChangeKind::Created => "fs.created",
            ChangeKind::Modified => "fs.modified",
            ChangeKind::Deleted => "fs.deleted",
        }
    }
}

pub type SharedTransferFlowBus = Arc<FlowBus<TransferFlow>>;
pub type SharedChangeFlowBus = Arc<FlowBus<ChangeFlow>>;

pub fn shared_transfer_flow_bus(capacity: usize) -> SharedTransferFlowBus {
    Arc::new(FlowBus::new(capacity))
}

pub fn shared_change_flow_bus(capacity: usize) -> SharedChangeFlowBus {
    Arc::new(FlowBus::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn change(path: &str, kind: ChangeKind) -> ChangeFlow {
        ChangeFlow {
            path: LogicalPath::parse(path).unwrap(),
            kind,
        }
    }

    #[test]
    fn pattern_matching() {
        assert!(matches_pattern("fs.deleted", "fs.deleted"));
        assert!(!matches_pattern("fs.deleted", "fs.created"));
        assert!(!matches_pattern("fs.deleted", "fs.deleted.extra"));

        assert!(matches_pattern("transfer.*", "transfer.progress"));
        assert!(!matches_pattern("transfer.*", "transfer.progress.x"));
        assert!(!matches_pattern("transfer.*", "fs.created"));

        assert!(matches_pattern("fs.>", "fs.created"));
        assert!(matches_pattern("fs.>", "fs.a.b"));
        assert!(!matches_pattern("fs.>", "fs"));
        assert!(matches_pattern("*.finished", "transfer.finished"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let bus = shared_change_flow_bus(16);
        let mut sub = bus.subscribe("fs.created");

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(change("/Home/a", ChangeKind::Deleted));
            publisher.publish(change("/Home/b", ChangeKind::Created));
        });

        let msg = tokio::time::timeout(Duration::from_millis(500), sub.recv())
            .await
            .expect("timeout")
            .expect("closed");
        assert_eq!(msg.subject, "fs.created");
        assert_eq!(msg.payload.path.as_str(), "/Home/b");
    }

    #[test]
    fn try_recv_filters() {
        let bus = shared_change_flow_bus(8);
        let mut deleted = bus.subscribe("fs.deleted");
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(change("/Home/a", ChangeKind::Modified));
        bus.publish(change("/Home/b", ChangeKind::Deleted));

        let msg = deleted.try_recv().expect("deleted event");
        assert_eq!(msg.payload.path.as_str(), "/Home/b");
        assert_eq!(msg.seq, 1);
        assert!(deleted.try_recv().is_none());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = shared_transfer_flow_bus(4);
        let n = bus.publish(TransferFlow::Progress {
            id: JobId::new(),
            progress: TransferProgress::default(),
        });
        assert_eq!(n, 0);
    }
}
