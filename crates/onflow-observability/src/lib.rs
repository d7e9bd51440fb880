//! Observability for the onflow workflow engine
//!
//! - Structured logging setup (text or JSON) with env-driven filtering
//! - An event publisher that writes domain events to the log

pub mod publisher;
pub mod tracing_setup;

pub use publisher::TracingEventPublisher;
pub use tracing_setup::*;

use thiserror::Error;

/// Observability errors
#[derive(Error, Debug)]
pub enum ObservabilityError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, ObservabilityError>;
