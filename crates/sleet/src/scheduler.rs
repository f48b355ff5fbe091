//! Schedule slots and the long-running pipeline loop.
//!
//! A [`Scheduler`] holds one explicit [`Registration`] per pipeline. Slots
//! are aligned to the Unix epoch in UTC (weekly slots start on Monday); a
//! slot's start is its logical time and it becomes due once it has ended.
//! [`ScheduledPipeline`] executes due slots through a [`Coordinator`] and
//! sleeps until the next slot ends.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use indexmap::IndexMap;
use sleet_core::{Pipeline, PipelineContext};
use tracing::{debug, error, info, warn};

use crate::config::{Config, PipelineConfig, PipelineKey, ScheduleConfig, ScheduleInterval};
use crate::coordinator::Coordinator;
use crate::error::{ConfigError, PipelineError, RunError};

const SECS_PER_HOUR: i64 = 3_600;
const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_WEEK: i64 = 7 * SECS_PER_DAY;
/// 1970-01-01 was a Thursday; the first Monday is four days later.
const WEEK_ANCHOR_SECS: i64 = 4 * SECS_PER_DAY;

/// Length and alignment of schedule slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Hourly,
    Daily,
    Weekly,
    Every(Duration),
}

impl Interval {
    /// Resolve a schedule config; daily when nothing is set.
    pub fn from_config(schedule: &ScheduleConfig) -> Self {
        match (schedule.every_secs, schedule.interval) {
            (Some(secs), _) => Interval::Every(Duration::from_secs(secs.max(1))),
            (None, Some(ScheduleInterval::Hourly)) => Interval::Hourly,
            (None, Some(ScheduleInterval::Weekly)) => Interval::Weekly,
            (None, Some(ScheduleInterval::Daily) | None) => Interval::Daily,
        }
    }

    fn secs(&self) -> i64 {
        match self {
            Interval::Hourly => SECS_PER_HOUR,
            Interval::Daily => SECS_PER_DAY,
            Interval::Weekly => SECS_PER_WEEK,
            Interval::Every(every) => i64::try_from(every.as_secs()).unwrap_or(i64::MAX).max(1),
        }
    }

    fn anchor(&self) -> i64 {
        match self {
            Interval::Weekly => WEEK_ANCHOR_SECS,
            _ => 0,
        }
    }

    pub fn length(&self) -> TimeDelta {
        TimeDelta::seconds(self.secs())
    }

    /// Start of the slot containing `t`.
    pub fn floor(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.secs();
        let anchor = self.anchor();
        let start = (t.timestamp() - anchor).div_euclid(secs) * secs + anchor;
        DateTime::from_timestamp(start, 0).unwrap_or(t)
    }

    /// First slot starting at or after `t`.
    pub fn ceil(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let floor = self.floor(t);
        if floor == t { floor } else { floor + self.length() }
    }
}

/// One pipeline's schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub pipeline: PipelineKey,
    pub interval: Interval,
    pub start_date: Option<DateTime<Utc>>,
    pub catchup: bool,
}

impl Registration {
    /// The most recent slot that has ended by `now`, if it is not before
    /// `start_date`.
    pub fn latest_slot(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let latest = self.interval.floor(now) - self.interval.length();
        match self.start_date {
            Some(start) if latest < self.interval.ceil(start) => None,
            _ => Some(latest),
        }
    }

    /// Slots due at `now`, oldest first, excluding slots at or before
    /// `after`.
    ///
    /// Without catchup only the latest ended slot is due. With catchup every
    /// ended slot since `start_date` is.
    pub fn due_slots(
        &self,
        now: DateTime<Utc>,
        after: Option<DateTime<Utc>>,
    ) -> Vec<DateTime<Utc>> {
        let Some(latest) = self.latest_slot(now) else {
            return Vec::new();
        };

        let first = match (self.catchup, self.start_date) {
            (true, Some(start)) => self.interval.ceil(start),
            _ => latest,
        };
        let first = match after {
            Some(after) if after >= first => after + self.interval.length(),
            _ => first,
        };

        let mut slots = Vec::new();
        let mut slot = first;
        while slot <= latest {
            slots.push(slot);
            slot += self.interval.length();
        }
        slots
    }

    /// When the slot containing `now` ends, which is when the next one is due.
    pub fn next_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = self.interval.floor(now) + self.interval.length();
        match self.start_date {
            Some(start) => next.max(self.interval.ceil(start) + self.interval.length()),
            None => next,
        }
    }
}

/// Process-wide schedule registry.
#[derive(Debug, Default)]
pub struct Scheduler {
    registrations: IndexMap<PipelineKey, Registration>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every pipeline of a config.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut scheduler = Self::new();
        for (key, pipeline) in &config.pipelines {
            scheduler.register(key.clone(), &pipeline.schedule)?;
        }
        Ok(scheduler)
    }

    /// Register a pipeline. Each pipeline may be registered once.
    pub fn register(
        &mut self,
        pipeline: PipelineKey,
        schedule: &ScheduleConfig,
    ) -> Result<&Registration, ConfigError> {
        if self.registrations.contains_key(&pipeline) {
            return Err(ConfigError::InvalidSetting {
                pipeline: pipeline.id().to_string(),
                field: "schedule".to_string(),
                message: "pipeline is already registered".to_string(),
            });
        }

        let registration = Registration {
            pipeline: pipeline.clone(),
            interval: Interval::from_config(schedule),
            start_date: schedule.start_date,
            catchup: schedule.catchup,
        };
        Ok(self.registrations.entry(pipeline).or_insert(registration))
    }

    pub fn registration(&self, pipeline: &PipelineKey) -> Option<&Registration> {
        self.registrations.get(pipeline)
    }

    pub fn registrations(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.values()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

/// Parse a logical time given as RFC 3339 or as a `YYYY-MM-DD` date
/// (midnight UTC).
pub fn parse_logical_time(value: &str) -> Result<DateTime<Utc>, PipelineError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .ok_or_else(|| PipelineError::LogicalTime {
            value: value.to_string(),
        })
}

/// A pipeline executing its due slots until shutdown.
///
/// Backends are opened when the pipeline starts running, so a pipeline
/// whose storage is unreachable fails on its own without stopping others.
pub struct ScheduledPipeline {
    key: PipelineKey,
    config: PipelineConfig,
    registration: Registration,
    context: PipelineContext,
}

impl ScheduledPipeline {
    pub fn new(
        key: PipelineKey,
        config: PipelineConfig,
        registration: Registration,
        context: PipelineContext,
    ) -> Self {
        Self {
            key,
            config,
            registration,
            context,
        }
    }

    /// One scheduled pipeline per registered pipeline in `config`.
    pub fn from_config(
        config: &Config,
        scheduler: &Scheduler,
        context: PipelineContext,
    ) -> Vec<Self> {
        config
            .pipelines
            .iter()
            .filter_map(|(key, pipeline_config)| {
                let Some(registration) = scheduler.registration(key) else {
                    warn!(target = %key, "Pipeline has no schedule registration, skipping");
                    return None;
                };
                Some(Self::new(
                    key.clone(),
                    pipeline_config.clone(),
                    registration.clone(),
                    context.clone(),
                ))
            })
            .collect()
    }

    /// Execute one slot unless its run already reached a terminal state.
    ///
    /// Returns false when shutdown interrupted the slot.
    async fn run_slot(&self, coordinator: &Coordinator, slot: DateTime<Utc>) -> bool {
        match coordinator.status(slot).await {
            Ok(Some(run)) if run.is_terminal() => {
                debug!(target = %self.key, run_id = %run.id, state = %run.state, "Slot already handled");
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                error!(target = %self.key, error = %e, "Failed to read run state, skipping slot");
                return true;
            }
        }

        let _permit = match &self.context.global_semaphore {
            Some(semaphore) => {
                match self
                    .context
                    .shutdown
                    .run_until_cancelled(semaphore.acquire())
                    .await
                {
                    Some(Ok(permit)) => Some(permit),
                    Some(Err(_)) | None => return false,
                }
            }
            None => None,
        };

        match coordinator.execute(slot).await {
            Ok(run) => {
                info!(target = %self.key, run_id = %run.id, outcome = ?run.outcome, "Slot complete");
                true
            }
            Err(RunError::Cancelled { .. }) => false,
            Err(e) => {
                error!(target = %self.key, error = %e, "Run failed");
                !self.context.shutdown.is_cancelled()
            }
        }
    }
}

impl Pipeline for ScheduledPipeline {
    type Key = PipelineKey;
    type Error = PipelineError;

    fn key(&self) -> &PipelineKey {
        &self.key
    }

    async fn run(self) -> Result<(), PipelineError> {
        let coordinator =
            Coordinator::build(self.key.clone(), self.config.clone(), &self.context).await?;
        let shutdown = self.context.shutdown.clone();
        let mut last_slot: Option<DateTime<Utc>> = None;
        info!(
            target = %self.key,
            interval = ?self.registration.interval,
            catchup = self.registration.catchup,
            "Schedule started"
        );

        loop {
            let now = Utc::now();
            for slot in self.registration.due_slots(now, last_slot) {
                if shutdown.is_cancelled() || !self.run_slot(&coordinator, slot).await {
                    info!(target = %self.key, "Shutdown requested, stopping schedule");
                    return Ok(());
                }
                last_slot = Some(slot);
            }

            let now = Utc::now();
            let next = self.registration.next_fire(now);
            let wait = (next - now).to_std().unwrap_or_default();
            debug!(target = %self.key, next = %next, "Waiting for next slot");
            if shutdown
                .run_until_cancelled(tokio::time::sleep(wait))
                .await
                .is_none()
            {
                info!(target = %self.key, "Shutdown requested, stopping schedule");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn registration(schedule: ScheduleConfig) -> Registration {
        let mut scheduler = Scheduler::new();
        scheduler
            .register(PipelineKey::new("logistics"), &schedule)
            .unwrap()
            .clone()
    }

    fn daily() -> ScheduleConfig {
        ScheduleConfig::default()
    }

    #[test]
    fn test_interval_defaults_to_daily() {
        assert_eq!(Interval::from_config(&daily()), Interval::Daily);
        let every = ScheduleConfig {
            every_secs: Some(900),
            ..Default::default()
        };
        assert_eq!(
            Interval::from_config(&every),
            Interval::Every(Duration::from_secs(900))
        );
    }

    #[test]
    fn test_floor_alignment() {
        let t = at(2024, 1, 3, 13, 45);
        assert_eq!(Interval::Hourly.floor(t), at(2024, 1, 3, 13, 0));
        assert_eq!(Interval::Daily.floor(t), at(2024, 1, 3, 0, 0));
        // 2024-01-01 was a Monday.
        assert_eq!(Interval::Weekly.floor(t), at(2024, 1, 1, 0, 0));
        assert_eq!(
            Interval::Every(Duration::from_secs(900)).floor(t),
            at(2024, 1, 3, 13, 45)
        );
        assert_eq!(Interval::Daily.ceil(at(2024, 1, 3, 0, 0)), at(2024, 1, 3, 0, 0));
        assert_eq!(Interval::Daily.ceil(t), at(2024, 1, 4, 0, 0));
    }

    #[test]
    fn test_latest_slot_is_previous_day() {
        let registration = registration(daily());
        let slots = registration.due_slots(at(2024, 1, 2, 6, 0), None);
        assert_eq!(slots, vec![at(2024, 1, 1, 0, 0)]);
    }

    #[test]
    fn test_catchup_runs_every_missed_slot() {
        let registration = registration(ScheduleConfig {
            start_date: Some(at(2024, 1, 1, 0, 0)),
            catchup: true,
            ..Default::default()
        });

        let slots = registration.due_slots(at(2024, 1, 4, 1, 0), None);
        assert_eq!(
            slots,
            vec![at(2024, 1, 1, 0, 0), at(2024, 1, 2, 0, 0), at(2024, 1, 3, 0, 0)]
        );

        let rest = registration.due_slots(at(2024, 1, 4, 1, 0), Some(at(2024, 1, 2, 0, 0)));
        assert_eq!(rest, vec![at(2024, 1, 3, 0, 0)]);
    }

    #[test]
    fn test_without_catchup_only_latest_slot() {
        let registration = registration(ScheduleConfig {
            start_date: Some(at(2024, 1, 1, 0, 0)),
            ..Default::default()
        });
        let slots = registration.due_slots(at(2024, 1, 4, 1, 0), None);
        assert_eq!(slots, vec![at(2024, 1, 3, 0, 0)]);
    }

    #[test]
    fn test_nothing_due_before_start_date() {
        let registration = registration(ScheduleConfig {
            start_date: Some(at(2024, 1, 10, 0, 0)),
            catchup: true,
            ..Default::default()
        });
        assert!(registration.due_slots(at(2024, 1, 5, 0, 0), None).is_empty());
        assert_eq!(
            registration.next_fire(at(2024, 1, 5, 0, 0)),
            at(2024, 1, 11, 0, 0)
        );
    }

    #[test]
    fn test_already_fired_slot_is_not_due_again() {
        let registration = registration(daily());
        let now = at(2024, 1, 2, 6, 0);
        assert!(
            registration
                .due_slots(now, Some(at(2024, 1, 1, 0, 0)))
                .is_empty()
        );
        assert_eq!(registration.next_fire(now), at(2024, 1, 3, 0, 0));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut scheduler = Scheduler::new();
        scheduler
            .register(PipelineKey::new("logistics"), &daily())
            .unwrap();
        let err = scheduler
            .register(PipelineKey::new("logistics"), &daily())
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_parse_logical_time() {
        assert_eq!(
            parse_logical_time("2024-01-01").unwrap(),
            at(2024, 1, 1, 0, 0)
        );
        assert_eq!(
            parse_logical_time("2024-01-01T06:30:00+02:00").unwrap(),
            at(2024, 1, 1, 4, 30)
        );
        assert!(matches!(
            parse_logical_time("yesterday"),
            Err(PipelineError::LogicalTime { .. })
        ));
    }
}
