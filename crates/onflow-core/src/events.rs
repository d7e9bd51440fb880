//! Domain events emitted by the engine for presentation and integration layers.

use crate::error::CoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Represents a domain event in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: Uuid,
    /// Event type (e.g., "step.completed", "integration.requested")
    pub event_type: String,
    /// Timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub payload: serde_json::Value,
    /// Metadata for the event
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Create a new event with the given type and payload.
    pub fn new<T: Serialize>(event_type: impl Into<String>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check if the event matches a given type pattern.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return self
                .event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'));
        }
        self.event_type == pattern
    }
}

/// Outbound event sink.
///
/// The engine never blocks on delivery; implementations hand events to a
/// queue, a bus, or a notification service.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: Event) -> CoreResult<()>;

    /// Publish a batch of events.
    async fn publish_batch(&self, events: Vec<Event>) -> CoreResult<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Publisher that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, event: Event) -> CoreResult<()> {
        tracing::trace!(event_type = %event.event_type, "Discarding event");
        Ok(())
    }
}

/// Publisher that keeps every event in memory, for tests and previews
#[derive(Debug, Default)]
pub struct InMemoryEventPublisher {
    events: RwLock<Vec<Event>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far, oldest first
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Events whose type matches `pattern` (see [`Event::matches`])
    pub fn events_matching(&self, pattern: &str) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.matches(pattern))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: Event) -> CoreResult<()> {
        self.events.write().push(event);
        Ok(())
    }
}
