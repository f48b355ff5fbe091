//! Metrics for the coordinator.
//!
//! Run, step and component events. Storage request metrics are emitted by
//! `sleet_core` itself.

pub mod events;

pub use events::*;
