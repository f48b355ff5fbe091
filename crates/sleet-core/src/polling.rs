//! Bounded, cancellable polling.
//!
//! A probe is called on a fixed cadence until it reports a value, the
//! deadline passes, or the wait is cancelled. The number of probes is
//! `ceil(timeout / interval)`. Neither a sleep nor a slow probe runs past
//! the deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cadence and deadline of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSchedule {
    /// Build a schedule. A zero interval is raised to one millisecond and
    /// an interval longer than the timeout is clamped to it.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let interval = if timeout.is_zero() {
            interval
        } else {
            interval.min(timeout)
        };
        Self { interval, timeout }
    }

    /// Upper bound on the number of probes. Always at least one.
    pub fn max_polls(&self) -> u32 {
        let interval = self.interval.as_nanos().max(1);
        let polls = self.timeout.as_nanos().div_ceil(interval);
        polls.clamp(1, u32::MAX as u128) as u32
    }
}

/// How a bounded wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The probe produced a value on the given (1-based) poll.
    Ready { value: T, polls: u32 },
    /// The deadline passed without a value.
    TimedOut { polls: u32, elapsed: Duration },
    /// The wait was cancelled.
    Cancelled { polls: u32 },
}

/// Call `probe` on `schedule` until it returns `Some`.
///
/// Polls happen at `start + k * interval` for `k = 0..max_polls`. After the
/// last unsuccessful poll the wait ends at the deadline. A probe still running
/// at the deadline is dropped and counts as an empty final poll. With a zero
/// timeout the single probe is not bounded.
///
/// A probe error aborts the wait; callers that want to tolerate errors should
/// map them to `None`.
pub async fn poll_until<T, E, F, Fut>(
    schedule: PollSchedule,
    cancel: &CancellationToken,
    name: &str,
    mut probe: F,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let start = Instant::now();
    let deadline = start + schedule.timeout;
    let max_polls = schedule.max_polls();

    let probe_deadline = (!schedule.timeout.is_zero()).then_some(deadline);

    for poll in 1..=max_polls {
        let attempt = async {
            match probe_deadline {
                Some(at) => tokio::time::timeout_at(at, probe(poll)).await.ok(),
                None => Some(probe(poll).await),
            }
        };
        let Some(attempt) = cancel.run_until_cancelled(attempt).await else {
            return Ok(PollOutcome::Cancelled { polls: poll });
        };
        let Some(result) = attempt else {
            debug!(target = name, poll, max_polls, "Probe still running at the deadline");
            return Ok(PollOutcome::TimedOut {
                polls: poll,
                elapsed: start.elapsed(),
            });
        };
        if let Some(value) = result? {
            return Ok(PollOutcome::Ready { value, polls: poll });
        }

        let next = (start + schedule.interval * poll).min(deadline);
        debug!(
            target = name,
            poll,
            max_polls,
            wait_ms = next.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Nothing yet, waiting for next poll"
        );
        if cancel
            .run_until_cancelled(tokio::time::sleep_until(next))
            .await
            .is_none()
        {
            return Ok(PollOutcome::Cancelled { polls: poll });
        }
        if Instant::now() >= deadline {
            return Ok(PollOutcome::TimedOut {
                polls: poll,
                elapsed: start.elapsed(),
            });
        }
    }

    Ok(PollOutcome::TimedOut {
        polls: max_polls,
        elapsed: start.elapsed(),
    })
}
