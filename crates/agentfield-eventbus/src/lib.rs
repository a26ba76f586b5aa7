//! Execution event bus (spec.md §4.3): bridges the out-of-band agent
//! callback back to a synchronous HTTP waiter. Process-local, lossy under
//! subscriber backpressure, never a delivery guarantee by itself — callers
//! close the race by probing storage once after subscribing.
//!
//! One `tokio::sync::broadcast` channel is created lazily per
//! `execution_id` and dropped once its last subscriber goes away, mirroring
//! the per-job channel registries used for event fan-out elsewhere in the
//! pack's agent-orchestrator designs.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use agentfield_types::ExecutionStatus;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// `{type, execution_id, workflow_id, status, timestamp}` (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    /// Every non-terminal -> terminal edge emits exactly one of these
    /// (spec.md §4.1).
    pub fn completed(execution_id: Uuid, workflow_id: Uuid, status: ExecutionStatus) -> Self {
        Self {
            event_type: "execution.completed".to_string(),
            execution_id,
            workflow_id,
            status,
            timestamp: Utc::now(),
        }
    }
}

pub type EventReceiver = broadcast::Receiver<ExecutionEvent>;

/// Process-wide fan-out keyed by execution id.
pub struct EventBus {
    capacity: usize,
    channels: RwLock<HashMap<Uuid, broadcast::Sender<ExecutionEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent: repeated subscriptions for the same execution id each
    /// get an independent receiver off the same sender.
    pub fn subscribe(&self, execution_id: Uuid) -> EventReceiver {
        if let Some(sender) = self.channels.read().unwrap().get(&execution_id) {
            return sender.subscribe();
        }
        let mut channels = self.channels.write().unwrap();
        let sender = channels
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        sender.subscribe()
    }

    /// Drops the channel entry if no receivers remain. Idempotent: a
    /// no-op if already gone or still has live subscribers.
    pub fn unsubscribe(&self, execution_id: Uuid) {
        let mut channels = self.channels.write().unwrap();
        if let Some(sender) = channels.get(&execution_id) {
            if sender.receiver_count() == 0 {
                channels.remove(&execution_id);
            }
        }
    }

    /// Fans `event` out to every current subscriber of its execution id.
    /// Never blocks: a subscriber whose queue is full (set by
    /// `capacity`) silently drops the oldest unread events rather than
    /// stalling the publisher (spec.md §4.3, §9 "lossy event fan-out").
    pub fn publish(&self, event: ExecutionEvent) {
        let channels = self.channels.read().unwrap();
        if let Some(sender) = channels.get(&event.execution_id) {
            // A `SendError` here only means there are currently zero
            // receivers; that's a normal race, not a failure to log.
            let _ = sender.send(event);
        }
    }

    /// Garbage-collects channel entries whose last receiver has dropped.
    /// Intended to run periodically rather than on every publish, so a
    /// sender outliving a momentary zero-receiver gap isn't punished.
    pub fn sweep(&self) {
        let mut channels = self.channels.write().unwrap();
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_current_subscriber() {
        let bus = EventBus::new(16);
        let execution_id = Uuid::new_v4();
        let workflow_id = Uuid::new_v4();
        let mut rx = bus.subscribe(execution_id);

        bus.publish(ExecutionEvent::completed(
            execution_id,
            workflow_id,
            ExecutionStatus::Succeeded,
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "execution.completed");
        assert_eq!(event.execution_id, execution_id);
    }

    #[tokio::test]
    async fn publish_without_subscriber_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(ExecutionEvent::completed(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ExecutionStatus::Failed,
        ));
    }

    #[tokio::test]
    async fn sweep_drops_channels_with_no_receivers() {
        let bus = EventBus::new(16);
        let execution_id = Uuid::new_v4();
        {
            let _rx = bus.subscribe(execution_id);
            assert_eq!(bus.channels.read().unwrap().len(), 1);
        }
        bus.sweep();
        assert_eq!(bus.channels.read().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_the_event() {
        let bus = EventBus::new(16);
        let execution_id = Uuid::new_v4();
        let mut rx1 = bus.subscribe(execution_id);
        let mut rx2 = bus.subscribe(execution_id);

        bus.publish(ExecutionEvent::completed(
            execution_id,
            Uuid::new_v4(),
            ExecutionStatus::Timeout,
        ));

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
