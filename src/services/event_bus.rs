//! EventBus service for status-event streaming.
//!
//! Broadcast-based with sequence numbering. Publishing never blocks:
//! each subscriber gets a bounded buffer, and a subscriber that lags
//! past the buffer capacity observes `Lagged` and must resubscribe.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::config::EventBusConfig;
use crate::domain::models::{EventPayload, OrchestratorEvent, SequenceNumber};

/// Central event bus for broadcasting engine events.
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(config: &EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish an event. Sequence numbers are assigned here; send
    /// errors (no subscribers) are ignored.
    pub fn publish(&self, payload: EventPayload) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut event = OrchestratorEvent::new(payload);
        event.sequence = SequenceNumber(seq);
        let _ = self.sender.send(event);
    }

    /// Subscribe to the full event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            inner: self.sender.subscribe(),
            filter,
        }
    }

    pub fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventBusConfig::default())
    }
}

/// Subscription filter over the event stream.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events concerning this task.
    pub task_id: Option<Uuid>,
    /// Only events concerning this workflow run.
    pub run_id: Option<Uuid>,
}

impl EventFilter {
    pub fn for_task(task_id: Uuid) -> Self {
        Self {
            task_id: Some(task_id),
            run_id: None,
        }
    }

    pub fn for_run(run_id: Uuid) -> Self {
        Self {
            task_id: None,
            run_id: Some(run_id),
        }
    }

    pub fn matches(&self, event: &OrchestratorEvent) -> bool {
        if let Some(task_id) = self.task_id {
            if event.task_id() != Some(task_id) {
                return false;
            }
        }
        if let Some(run_id) = self.run_id {
            if event.run_id() != Some(run_id) {
                return false;
            }
        }
        true
    }
}

/// Receiver that yields only events matching its filter.
pub struct FilteredReceiver {
    inner: broadcast::Receiver<OrchestratorEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Receive the next matching event.
    ///
    /// Propagates `Lagged` so slow subscribers know they missed events
    /// and can resubscribe.
    pub async fn recv(&mut self) -> Result<OrchestratorEvent, broadcast::error::RecvError> {
        loop {
            let event = self.inner.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
