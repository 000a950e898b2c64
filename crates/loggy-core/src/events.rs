//! Captured analytics events and the bounded in-memory buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use uuid::Uuid;

/// Default number of events kept in memory before the oldest are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Capture metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Full URL of the request the event was extracted from
    pub url: String,
    /// When the proxy captured the request
    pub captured_at: DateTime<Utc>,
}

/// A normalized analytics event extracted from a proxied request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedEvent {
    /// Unique within one proxy run
    pub id: String,
    /// Event timestamp as reported by the client, or capture time
    pub timestamp: DateTime<Utc>,
    /// Event name; "unknown" when extraction found none
    pub event: String,
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source_id: String,
    pub source_name: String,
    /// The decoded request payload this event came from
    pub raw_payload: Value,
    pub metadata: EventMetadata,
}

impl CapturedEvent {
    /// Fresh event id, unique within this proxy run.
    pub fn new_id() -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Bounded FIFO buffer of captured events.
///
/// Appending beyond capacity drops the oldest event. Not internally
/// synchronized; the owner wraps it in a mutex.
pub struct EventBuffer {
    events: VecDeque<CapturedEvent>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }

    /// Append one event, evicting the oldest if the buffer is full.
    pub fn push(&mut self, event: CapturedEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Append a batch, preserving extraction order.
    pub fn extend(&mut self, events: impl IntoIterator<Item = CapturedEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Copy of the buffer contents, oldest first.
    pub fn snapshot(&self) -> Vec<CapturedEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
