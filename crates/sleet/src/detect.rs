//! Waiting for source objects to arrive.
//!
//! The detector lists the raw prefix on a fixed cadence until at least one
//! data object shows up or the detection timeout passes. A listing that is
//! still running at the deadline is abandoned. Detection is advisory: the
//! load reads whatever is under the prefix when it runs.

use sleet_core::{PollOutcome, PollSchedule, poll_until};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::DetectError;
use crate::metrics::DetectorPoll;
use crate::store::{ObjectMeta, ObjectStoreRef, is_data_object};

pub struct ArrivalDetector {
    store: ObjectStoreRef,
    schedule: PollSchedule,
    pipeline: String,
}

impl ArrivalDetector {
    pub fn new(store: ObjectStoreRef, schedule: PollSchedule, pipeline: impl Into<String>) -> Self {
        Self {
            store,
            schedule,
            pipeline: pipeline.into(),
        }
    }

    /// Wait until at least one data object exists under `prefix`.
    ///
    /// Returns the objects seen by the successful poll. Transient listing
    /// errors count as an empty poll; any other listing error ends the wait.
    pub async fn wait_for_arrival(
        &self,
        namespace: &str,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ObjectMeta>, DetectError> {
        let store = &self.store;
        let pipeline = self.pipeline.as_str();

        let outcome = poll_until(self.schedule, cancel, pipeline, move |poll| async move {
            let objects = match store.list(namespace, prefix).await {
                Ok(objects) => objects,
                Err(e) if e.is_transient() => {
                    warn!(
                        target = %pipeline,
                        poll,
                        error = %e,
                        "Listing failed, counting as an empty poll"
                    );
                    return Ok(None);
                }
                Err(source) => {
                    return Err(DetectError::List {
                        namespace: namespace.to_string(),
                        prefix: prefix.to_string(),
                        source,
                    });
                }
            };

            let objects: Vec<ObjectMeta> = objects
                .into_iter()
                .filter(|o| is_data_object(&o.key))
                .collect();

            sleet_core::emit!(DetectorPoll {
                pipeline: pipeline.to_string(),
                found: !objects.is_empty(),
            });
            Ok::<_, DetectError>((!objects.is_empty()).then_some(objects))
        })
        .await?;

        match outcome {
            PollOutcome::Ready { value, polls } => {
                info!(
                    target = %self.pipeline,
                    namespace,
                    prefix,
                    objects = value.len(),
                    polls,
                    "Source objects arrived"
                );
                Ok(value)
            }
            PollOutcome::TimedOut { polls, elapsed } => Err(DetectError::NoArrivalTimeout {
                namespace: namespace.to_string(),
                prefix: prefix.to_string(),
                polls,
                waited_secs: elapsed.as_secs(),
            }),
            PollOutcome::Cancelled { polls } => Err(DetectError::DetectCancelled { polls }),
        }
    }
}
