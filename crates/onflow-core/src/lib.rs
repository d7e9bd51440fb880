//! Core types, configuration and event contracts shared by the onflow crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::*;
pub use error::*;
pub use events::{Event, EventPublisher, InMemoryEventPublisher, NoopEventPublisher};
pub use types::*;
