//! Domain events written to the log

use async_trait::async_trait;
use onflow_core::{CoreResult, Event, EventPublisher};
use tracing::info;

/// Publishes every event as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventPublisher;

impl TracingEventPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: Event) -> CoreResult<()> {
        let instance_id = event
            .metadata
            .get("instance_id")
            .map(String::as_str)
            .unwrap_or("-");
        let payload = serde_json::to_string(&event.payload)?;

        info!(
            target: "onflow::events",
            event_id = %event.id,
            event_type = %event.event_type,
            instance_id,
            payload = %payload,
            "Workflow event"
        );
        Ok(())
    }
}
