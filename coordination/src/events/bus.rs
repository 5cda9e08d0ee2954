//! Event bus for coordination notifications
//!
//! Provides pub/sub messaging using Tokio broadcast channels. Every published
//! event is also appended to a bounded [`EventHistory`].

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::history::EventHistory;
use super::types::CoordinationEvent;

/// Default channel capacity for broadcast
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged behind by {0} events")]
    Lagged(u64),
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with broadcast channel and bounded history
pub struct EventBus {
    sender: broadcast::Sender<CoordinationEvent>,
    history: EventHistory,
}

impl EventBus {
    /// Create a new event bus with default sizes
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an event bus with explicit channel and history sizes
    pub fn with_capacity(channel_capacity: usize, history_size: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            history: EventHistory::new(history_size),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers.
    ///
    /// Having no subscribers is not an error; the event still lands in the
    /// history.
    pub fn publish(&self, event: CoordinationEvent) {
        let event_type = event.event_type();
        self.history.record(event.clone());

        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            filter: None,
        }
    }

    /// Subscribe to a subset of event types
    pub fn subscribe_to(&self, event_types: &[&str]) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            filter: Some(event_types.iter().map(|t| t.to_string()).collect()),
        }
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Recent event history
    pub fn history(&self) -> &EventHistory {
        &self.history
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half handed to subscribers
pub struct EventReceiver {
    receiver: broadcast::Receiver<CoordinationEvent>,
    filter: Option<Vec<String>>,
}

impl EventReceiver {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> EventBusResult<CoordinationEvent> {
        loop {
            let event = match self.receiver.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed)
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(EventBusError::Lagged(n))
                }
            };
            match &self.filter {
                Some(types) if !types.iter().any(|t| t == event.event_type()) => continue,
                _ => return Ok(event),
            }
        }
    }

    /// Non-blocking receive; `None` when nothing matching is queued
    pub fn try_recv(&mut self) -> Option<CoordinationEvent> {
        while let Ok(event) = self.receiver.try_recv() {
            match &self.filter {
                Some(types) if !types.iter().any(|t| t == event.event_type()) => continue,
                _ => return Some(event),
            }
        }
        None
    }
}
