//! Metrics and observability infrastructure.
//!
//! - `events`: the `InternalEvent` trait and storage-level events
//! - `server`: Prometheus recorder and the `/metrics` + `/health` endpoint

pub mod events;
pub mod server;

pub use server::init;

/// Emit an [`events::InternalEvent`].
///
/// ```ignore
/// use sleet_core::metrics::events::{StorageRequest, StorageOperation, RequestStatus};
///
/// emit!(StorageRequest { operation: StorageOperation::Get, status: RequestStatus::Success });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
