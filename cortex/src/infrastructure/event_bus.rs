// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Cortex Events
//
// In-memory event streaming over a tokio broadcast channel. Observers (the
// CLI `serve` loop, tests, embedding hosts) subscribe here; the durable
// record of pattern mutations is the `pattern_audit` table, not this bus.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::CortexEvent;
use crate::domain::pattern::PatternId;

/// Event bus for publishing and subscribing to cortex events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<CortexEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity.
    /// Slow receivers lose the oldest events once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: CortexEvent) {
        debug!(event_type = event.event_type(), "Publishing cortex event");

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = CortexEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Subscribe to all cortex events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of one pattern
    pub fn subscribe_pattern(&self, pattern_id: PatternId) -> PatternEventReceiver {
        PatternEventReceiver {
            receiver: self.sender.subscribe(),
            pattern_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all cortex events
pub struct EventReceiver {
    receiver: broadcast::Receiver<CortexEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<CortexEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<CortexEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to a single pattern
pub struct PatternEventReceiver {
    receiver: broadcast::Receiver<CortexEvent>,
    pattern_id: PatternId,
}

impl PatternEventReceiver {
    pub async fn recv(&mut self) -> Result<CortexEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    fn matches(&self, event: &CortexEvent) -> bool {
        match event {
            CortexEvent::PatternTransferred { source_pattern_id, copy_pattern_id, .. } => {
                *source_pattern_id == self.pattern_id || *copy_pattern_id == self.pattern_id
            }
            other => other.pattern_id() == Some(self.pattern_id),
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::qe_domain::QeDomain;
    use chrono::Utc;

    fn stored(pattern_id: PatternId) -> CortexEvent {
        CortexEvent::PatternStored {
            pattern_id,
            domain: QeDomain::TestGeneration,
            confidence: 0.5,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let pattern_id = PatternId::new();
        event_bus.publish(stored(pattern_id));

        match receiver.recv().await.unwrap() {
            CortexEvent::PatternStored { pattern_id: id, .. } => assert_eq!(id, pattern_id),
            _ => panic!("Wrong event type received"),
        }
    }

    #[tokio::test]
    async fn test_pattern_event_filtering() {
        let event_bus = EventBus::new(10);
        let pattern_id = PatternId::new();
        let mut receiver = event_bus.subscribe_pattern(pattern_id);

        event_bus.publish(stored(PatternId::new()));
        event_bus.publish(CortexEvent::IndexCompacted { removed: 1, remaining: 3, timestamp: Utc::now() });
        event_bus.publish(stored(pattern_id));

        assert_eq!(receiver.recv().await.unwrap().pattern_id(), Some(pattern_id));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish(stored(PatternId::new()));

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }
}
