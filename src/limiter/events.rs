//! Limiter events.
//!
//! Limiters and the registry publish typed events on a broadcast channel.
//! Sending never blocks: a receiver that falls behind loses the oldest events
//! and a missing receiver is not an error, so listeners cannot stall the
//! admission path.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

/// Default number of events buffered per receiver.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Kind of a limiter event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ConfigAdded,
    ConfigRefreshed,
    RefreshFailed,
    NotifyUnknown,
    ConcurrentExceed,
    RateExceed,
    RequestExceed,
    CheckException,
    ReleaseFailure,
    CallFailed,
}

/// An event emitted by a limiter or the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterEvent {
    pub event_type: EventType,
    pub identity: String,
    pub args: Vec<String>,
    pub at: DateTime<Utc>,
}

/// Fan-out point for [`LimiterEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LimiterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a listener. Dropping the receiver unregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event_type: EventType, identity: &str, args: Vec<String>) {
        debug!(event = ?event_type, identity = %identity, args = ?args, "Receive event");

        // No receivers is fine
        let _ = self.sender.send(LimiterEvent {
            event_type,
            identity: identity.to_string(),
            args,
            at: Utc::now(),
        });
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
