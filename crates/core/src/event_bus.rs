//! Lifecycle event sinks.
//!
//! The engine reports lead and sequence lifecycle edges (lead discovered,
//! step sent, sequence paused, ...) to an `Arc<dyn EventSink>`. Sinks must
//! not block: they are called from inside dispatch and poll ticks.

use crate::types::{AnalyticsEvent, EventType};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// Discards every event.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

impl AnalyticsEvent {
    pub fn new(event_type: EventType, lead_id: Option<Uuid>, sequence_id: Option<Uuid>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            lead_id,
            sequence_id,
            detail: None,
            node_id: "local".into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Keeps the most recent `capacity` events in memory, oldest evicted first.
pub struct MemorySink {
    capacity: usize,
    events: Mutex<VecDeque<AnalyticsEvent>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn with_events<R>(&self, f: impl FnOnce(&mut VecDeque<AnalyticsEvent>) -> R) -> R {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut events)
    }

    /// Events in emission order.
    pub fn snapshot(&self) -> Vec<AnalyticsEvent> {
        self.with_events(|events| events.iter().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.with_events(|events| events.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_of(&self, event_type: EventType) -> usize {
        self.with_events(|events| events.iter().filter(|e| e.event_type == event_type).count())
    }

    /// The retained history of one lead, oldest first.
    pub fn lead_history(&self, lead_id: Uuid) -> Vec<AnalyticsEvent> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.lead_id == Some(lead_id))
                .cloned()
                .collect()
        })
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: AnalyticsEvent) {
        self.with_events(|events| {
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        });
    }
}
