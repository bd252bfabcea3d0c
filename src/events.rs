use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Kind of a session event, as observed by UI collaborators (route guards,
/// nav bars) to react to lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Login,
    Logout,
    TokenRefresh,
    SessionExpired,
    Error,
}

impl SessionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventKind::Login => "login",
            SessionEventKind::Logout => "logout",
            SessionEventKind::TokenRefresh => "token_refresh",
            SessionEventKind::SessionExpired => "session_expired",
            SessionEventKind::Error => "error",
        }
    }
}

/// An event emitted after a state transition has committed. Subscribers
/// never observe partial states: the event describes a state that is
/// already readable through the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: SessionEventKind,
    pub data: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Statistics about event bus activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Number of events delivered to at least one subscriber.
    pub events_published: u64,
    /// Number of events dropped for lack of subscribers.
    pub events_dropped: u64,
    /// Count of events by kind.
    pub kind_counts: HashMap<String, u64>,
}

/// Broadcast bus distributing committed session events to subscribers.
///
/// Subscribers register and unregister deterministically (subscribe /
/// drop the receiver); each receiver observes events in publication order.
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
    capacity: usize,
    stats: Arc<RwLock<EventBusStats>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(RwLock::new(EventBusStats::default())),
        }
    }

    /// Get a receiver to subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        trace!("new session event subscriber");
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers, returning the number of
    /// receivers it reached.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let kind = event.kind.as_str();
        trace!(kind, "publishing session event");

        match self.sender.send(event) {
            Ok(receivers) => {
                let mut stats = self.stats.write();
                stats.events_published += 1;
                *stats.kind_counts.entry(kind.to_string()).or_insert(0) += 1;
                receivers
            }
            Err(_) => {
                // No receivers; the event is dropped, not an error.
                self.stats.write().events_dropped += 1;
                warn!(kind, "no subscribers for session event, dropped");
                0
            }
        }
    }

    /// Get current event bus statistics.
    pub fn stats(&self) -> EventBusStats {
        self.stats.read().clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
            stats: Arc::clone(&self.stats),
        }
    }
}
