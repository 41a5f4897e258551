//! Push channel for batch progress.
//!
//! Each WebSocket connection registers here and receives a bounded queue; its
//! socket task drains the queue. Emitters never see sockets, only the registry.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::orchestrator::TaskId;

pub const WELCOME_MESSAGE: &str = "Connected to YouGen progress channel";
pub const ACK_MESSAGE: &str = "Message received";

/// Process-unique subscriber id. Serialized as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub task_id: TaskId,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub percentage: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_video: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionSummary {
    pub task_id: TaskId,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub message: String,
}

/// Everything that travels over the push channel, as
/// `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    DownloadProgress(ProgressUpdate),
    DownloadComplete(CompletionSummary),
    DownloadError(TaskFailure),
    System {
        message: String,
        connection_id: ConnectionId,
    },
    Ack {
        message: String,
    },
}

impl PushEvent {
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::DownloadProgress(update) => Some(&update.task_id),
            Self::DownloadComplete(summary) => Some(&summary.task_id),
            Self::DownloadError(failure) => Some(&failure.task_id),
            Self::System { .. } | Self::Ack { .. } => None,
        }
    }

    /// Last event a task ever emits.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DownloadComplete(_) | Self::DownloadError(_))
    }
}

/// The only thing an emitter needs to know about the channel.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: PushEvent);
}

/// Handed to a connection when it registers.
pub struct Subscription {
    pub id: ConnectionId,
    pub events: mpsc::Receiver<PushEvent>,
}

/// Subscriber registry. Clones share the same registry.
#[derive(Clone)]
pub struct ProgressChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    subscribers: Mutex<HashMap<ConnectionId, mpsc::Sender<PushEvent>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ProgressChannel {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Registers a subscriber and queues its welcome event.
    pub fn connect(&self) -> Subscription {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let welcome = PushEvent::System {
            message: WELCOME_MESSAGE.to_string(),
            connection_id: id,
        };
        // Fresh queue with capacity >= 1, so this cannot fail.
        let _ = tx.try_send(welcome);
        let active = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        debug!(connection_id = %id, active, "subscriber connected");
        Subscription { id, events: rx }
    }

    /// Removing an id twice is fine.
    pub fn disconnect(&self, id: ConnectionId) {
        let removed = self.inner.subscribers.lock().remove(&id).is_some();
        if removed {
            debug!(connection_id = %id, "subscriber disconnected");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.inner.subscribers.lock().contains_key(&id)
    }

    /// Delivers to a single subscriber. Returns whether the event was queued.
    pub fn send_to(&self, id: ConnectionId, event: PushEvent) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let Some(tx) = subscribers.get(&id) else {
            warn!(connection_id = %id, "send to unknown subscriber");
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %id, "subscriber queue full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                subscribers.remove(&id);
                debug!(connection_id = %id, "subscriber gone, removed");
                false
            }
        }
    }

    /// Delivers to every subscriber not in `exclude` and returns how many
    /// accepted the event. Closed subscribers are pruned. A full queue loses
    /// a progress event and keeps the subscriber, but a terminal event that
    /// does not fit evicts it, and its socket closes once the queue drains.
    pub fn broadcast(&self, event: &PushEvent, exclude: &HashSet<ConnectionId>) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in subscribers.iter() {
            if exclude.contains(id) {
                continue;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) if event.is_terminal() => {
                    warn!(connection_id = %id, "subscriber queue full on terminal event, evicting");
                    gone.push(*id);
                }
                Err(TrySendError::Full(_)) => {
                    warn!(connection_id = %id, "subscriber queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            subscribers.remove(&id);
            debug!(connection_id = %id, "subscriber gone, removed");
        }
        delivered
    }
}

impl ProgressSink for ProgressChannel {
    fn emit(&self, event: PushEvent) {
        let delivered = self.broadcast(&event, &HashSet::new());
        if delivered == 0 {
            debug!(task_id = ?event.task_id(), "no subscribers for event");
        }
    }
}
