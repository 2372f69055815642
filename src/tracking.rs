//! The single-active-issue tracking core. [TrackingStateMachine] owns the
//! start/stop protocol over the persisted [TrackingStore], [TransitionGate]
//! keeps remote workflow checks down to one listing per issue per invocation.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, FixedOffset, Utc};
use tracing::{debug, info, warn};

use crate::{
    schedule::WorkSchedule,
    store::{StoreError, TrackingStore},
    tracker::{RemoteError, TrackerClient},
    utils::clock::Clock,
};

const WORK_LOG_COMMENT: &str = "Tracked automatically";

/// Caches which transitions the tracker currently offers per issue. Never
/// persisted: tracker-side workflow state can change between invocations.
pub struct TransitionGate<'a> {
    client: &'a dyn TrackerClient,
    cache: HashMap<String, HashSet<String>>,
}

impl<'a> TransitionGate<'a> {
    pub fn new(client: &'a dyn TrackerClient) -> Self {
        Self {
            client,
            cache: HashMap::new(),
        }
    }

    /// Whether the tracker offers `transition_name` on the issue right now.
    /// The first query per issue fetches the full transition set; later ones
    /// are answered from cache. Names match case-insensitively.
    pub async fn is_allowed(
        &mut self,
        issue_key: &str,
        transition_name: &str,
    ) -> Result<bool, RemoteError> {
        if !self.cache.contains_key(issue_key) {
            let names = self
                .client
                .list_transitions(issue_key)
                .await?
                .into_iter()
                .map(|transition| transition.name.to_lowercase())
                .collect::<HashSet<_>>();
            debug!("Transitions of {issue_key}: {names:?}");
            self.cache.insert(issue_key.to_string(), names);
        }

        Ok(self.cache[issue_key].contains(&transition_name.to_lowercase()))
    }
}

/// How a stop ended.
#[derive(Debug)]
pub enum StopOutcome {
    /// No record existed. Stopping twice is fine, nothing happens.
    NotTracking,
    /// Less working time than the threshold passed, nothing was submitted.
    BelowThreshold { elapsed: Duration },
    /// Work log submitted.
    Logged { elapsed: Duration },
    /// The record is gone locally but the submission failed. Reported once,
    /// never retried.
    LogFailed {
        elapsed: Duration,
        error: RemoteError,
    },
}

/// What happened to an issue that was still tracked when another one started.
#[derive(Debug)]
pub enum Displaced {
    /// The remote stop transition went through and the elapsed time was
    /// handled like a regular stop.
    Stopped {
        issue_key: String,
        outcome: StopOutcome,
    },
    /// The tracker wouldn't allow the stop transition. The local record is
    /// cleared anyway and the elapsed time is lost, which is worth a warning.
    Discarded {
        issue_key: String,
        elapsed: Duration,
    },
}

#[derive(Debug)]
pub struct StartReport {
    pub started_at: DateTime<Utc>,
    pub displaced: Vec<Displaced>,
}

/// Business time between two instants, evaluated in the configured offset.
pub fn working_time_between(
    schedule: &WorkSchedule,
    offset: FixedOffset,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Duration {
    if end <= start {
        return Duration::zero();
    }
    schedule.elapsed_working_time(
        start.with_timezone(&offset).naive_local(),
        end.with_timezone(&offset).naive_local(),
    )
}

/// Keeps the tracking set at zero or one entries across start/stop. Local
/// state is committed first; remote effects follow and their failures are
/// downgraded to warnings instead of rolling anything back.
pub struct TrackingStateMachine<'a> {
    store: &'a TrackingStore,
    schedule: &'a WorkSchedule,
    client: &'a dyn TrackerClient,
    clock: &'a dyn Clock,
    local_offset: FixedOffset,
    min_loggable: Duration,
    stop_transition: String,
}

impl<'a> TrackingStateMachine<'a> {
    pub fn new(
        store: &'a TrackingStore,
        schedule: &'a WorkSchedule,
        client: &'a dyn TrackerClient,
        clock: &'a dyn Clock,
        local_offset: FixedOffset,
        min_loggable: Duration,
        stop_transition: String,
    ) -> Self {
        Self {
            store,
            schedule,
            client,
            clock,
            local_offset,
            min_loggable,
            stop_transition,
        }
    }

    /// Starts tracking `issue_key`. Every other persisted record is forced
    /// closed first: stopped remotely where the tracker allows it, otherwise
    /// cleared with its time discarded. A crashed previous invocation may
    /// have left several records behind, so this sweeps all of them.
    ///
    /// The remote start transition is not executed here. That is the caller's
    /// move once the local state is committed.
    pub async fn start(
        &mut self,
        issue_key: &str,
        gate: &mut TransitionGate<'_>,
    ) -> Result<StartReport, StoreError> {
        let now = self.clock.time();

        let snapshot = self.store.load().await?;
        let mut stop_allowed = HashMap::new();
        for (other, _) in snapshot.iter().filter(|(key, _)| *key != issue_key) {
            let allowed = match gate.is_allowed(other, &self.stop_transition).await {
                Ok(allowed) => allowed,
                Err(e) => {
                    warn!("Couldn't list transitions of {other}, skipping its remote stop: {e}");
                    false
                }
            };
            stop_allowed.insert(other.to_string(), allowed);
        }

        // Single commit point: stale records leave and the new one lands in
        // one locked read-modify-write cycle, so the at-most-one invariant
        // holds no matter where a previous process died.
        let displaced = self
            .store
            .update(|set| {
                let displaced = set.take_others(issue_key);
                set.insert(issue_key, now);
                displaced
            })
            .await?;

        let mut report = Vec::new();
        for (other, started_at) in displaced {
            if stop_allowed.get(&other).copied().unwrap_or(false) {
                if let Err(e) = self
                    .client
                    .execute_transition(&other, &self.stop_transition)
                    .await
                {
                    warn!("Stop transition on {other} failed: {e}");
                }
                let outcome = self.log_elapsed(&other, started_at, now).await;
                report.push(Displaced::Stopped {
                    issue_key: other,
                    outcome,
                });
            } else {
                let elapsed = self.elapsed(started_at, now);
                warn!(
                    "Cleared {other} without stopping it remotely, {}m of tracked time were not logged",
                    elapsed.num_minutes()
                );
                report.push(Displaced::Discarded {
                    issue_key: other,
                    elapsed,
                });
            }
        }

        info!("Tracking {issue_key} since {now}");
        Ok(StartReport {
            started_at: now,
            displaced: report,
        })
    }

    /// Stops tracking `issue_key`. Removing the record is an atomic take
    /// under the file lock, so the work log can be submitted at most once.
    /// Without a record this is a no-op.
    pub async fn stop(&mut self, issue_key: &str) -> Result<StopOutcome, StoreError> {
        let now = self.clock.time();

        let Some(started_at) = self.store.update(|set| set.remove(issue_key)).await? else {
            debug!("Stop of {issue_key} without an active record, nothing to do");
            return Ok(StopOutcome::NotTracking);
        };

        Ok(self.log_elapsed(issue_key, started_at, now).await)
    }

    async fn log_elapsed(
        &self,
        issue_key: &str,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StopOutcome {
        let elapsed = self.elapsed(started_at, now);
        if elapsed < self.min_loggable {
            debug!(
                "Only {}s of working time on {issue_key}, not logging",
                elapsed.num_seconds()
            );
            return StopOutcome::BelowThreshold { elapsed };
        }

        let started_local = started_at.with_timezone(&self.local_offset);
        match self
            .client
            .submit_work_log(issue_key, elapsed, WORK_LOG_COMMENT, started_local)
            .await
        {
            Ok(()) => {
                info!("Logged {}m on {issue_key}", elapsed.num_minutes());
                StopOutcome::Logged { elapsed }
            }
            Err(error) => {
                warn!("Work log for {issue_key} failed, the record is already gone: {error}");
                StopOutcome::LogFailed { elapsed, error }
            }
        }
    }

    fn elapsed(&self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        working_time_between(self.schedule, self.local_offset, started_at, now)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
    use tempfile::{tempdir, TempDir};

    use super::{Displaced, StopOutcome, TrackingStateMachine, TransitionGate};
    use crate::{
        schedule::WorkSchedule,
        store::TrackingStore,
        tracker::{MockTrackerClient, RemoteError, Transition},
        utils::clock::Clock,
    };

    const STOP_TRANSITION: &str = "Stop progress";

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn time(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn schedule() -> WorkSchedule {
        WorkSchedule::new(
            NaiveTime::from_hms_opt(8, 47, 0).unwrap(),
            NaiveTime::from_hms_opt(12, 20, 0).unwrap(),
            NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 15, 0).unwrap(),
            [
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
        )
        .unwrap()
    }

    // Wednesday morning.
    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 8, 21, 9, 0, 0).unwrap()
    }

    fn harness(now: DateTime<Utc>) -> (TempDir, TrackingStore, WorkSchedule, FixedClock) {
        let dir = tempdir().unwrap();
        let store = TrackingStore::new(dir.path());
        (dir, store, schedule(), FixedClock(now))
    }

    fn machine<'a>(
        store: &'a TrackingStore,
        schedule: &'a WorkSchedule,
        client: &'a MockTrackerClient,
        clock: &'a FixedClock,
    ) -> TrackingStateMachine<'a> {
        TrackingStateMachine::new(
            store,
            schedule,
            client,
            clock,
            FixedOffset::east_opt(0).unwrap(),
            Duration::minutes(1),
            STOP_TRANSITION.to_string(),
        )
    }

    fn stoppable() -> Vec<Transition> {
        vec![Transition {
            id: "21".into(),
            name: STOP_TRANSITION.into(),
        }]
    }

    #[tokio::test]
    async fn test_stop_without_record_is_a_noop() -> Result<()> {
        let now = started() + Duration::hours(3);
        let (_dir, store, schedule, clock) = harness(now);
        let client = MockTrackerClient::new();

        let outcome = machine(&store, &schedule, &client, &clock)
            .stop("PROJ-1")
            .await?;

        assert!(matches!(outcome, StopOutcome::NotTracking));
        assert!(store.load().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_submits_work_log() -> Result<()> {
        let now = started() + Duration::hours(3);
        let (_dir, store, schedule, clock) = harness(now);
        store.update(|set| set.insert("PROJ-1", started())).await?;

        let mut client = MockTrackerClient::new();
        client
            .expect_submit_work_log()
            .withf(|key, elapsed, _comment, started_at| {
                key == "PROJ-1"
                    && *elapsed == Duration::minutes(180)
                    && started_at.to_utc() == started()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let outcome = machine(&store, &schedule, &client, &clock)
            .stop("PROJ-1")
            .await?;

        assert!(matches!(
            outcome,
            StopOutcome::Logged { elapsed } if elapsed == Duration::minutes(180)
        ));
        assert!(store.load().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_below_threshold_submits_nothing() -> Result<()> {
        let now = started() + Duration::seconds(30);
        let (_dir, store, schedule, clock) = harness(now);
        store.update(|set| set.insert("PROJ-1", started())).await?;

        let client = MockTrackerClient::new();
        let outcome = machine(&store, &schedule, &client, &clock)
            .stop("PROJ-1")
            .await?;

        assert!(matches!(outcome, StopOutcome::BelowThreshold { .. }));
        assert!(store.load().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_record_removed_even_when_submission_fails() -> Result<()> {
        let now = started() + Duration::hours(3);
        let (_dir, store, schedule, clock) = harness(now);
        store.update(|set| set.insert("PROJ-1", started())).await?;

        let mut client = MockTrackerClient::new();
        client.expect_submit_work_log().times(1).returning(|_, _, _, _| {
            Err(RemoteError::Rejected {
                operation: "work log",
                issue_key: "PROJ-1".into(),
                status: 500,
                message: "boom".into(),
            })
        });

        let outcome = machine(&store, &schedule, &client, &clock)
            .stop("PROJ-1")
            .await?;

        assert!(matches!(outcome, StopOutcome::LogFailed { .. }));
        assert!(store.load().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_start_stops_previous_issue() -> Result<()> {
        let now = started() + Duration::hours(3);
        let (_dir, store, schedule, clock) = harness(now);
        store.update(|set| set.insert("PROJ-1", started())).await?;

        let mut client = MockTrackerClient::new();
        client
            .expect_list_transitions()
            .withf(|key| key == "PROJ-1")
            .times(1)
            .returning(|_| Ok(stoppable()));
        client
            .expect_execute_transition()
            .withf(|key, name| key == "PROJ-1" && name == STOP_TRANSITION)
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_submit_work_log()
            .withf(|key, elapsed, _, _| key == "PROJ-1" && *elapsed == Duration::minutes(180))
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut gate = TransitionGate::new(&client);
        let report = machine(&store, &schedule, &client, &clock)
            .start("PROJ-2", &mut gate)
            .await?;

        assert!(matches!(
            report.displaced.as_slice(),
            [Displaced::Stopped { issue_key, outcome: StopOutcome::Logged { .. } }]
                if issue_key == "PROJ-1"
        ));
        let set = store.load().await?;
        assert_eq!(set.len(), 1);
        assert_eq!(set.started_at("PROJ-2"), Some(now));
        Ok(())
    }

    #[tokio::test]
    async fn test_start_clears_previous_issue_even_when_stop_disallowed() -> Result<()> {
        let now = started() + Duration::hours(3);
        let (_dir, store, schedule, clock) = harness(now);
        store.update(|set| set.insert("PROJ-1", started())).await?;

        let mut client = MockTrackerClient::new();
        client
            .expect_list_transitions()
            .times(1)
            .returning(|_| Ok(vec![]));

        let mut gate = TransitionGate::new(&client);
        let report = machine(&store, &schedule, &client, &clock)
            .start("PROJ-2", &mut gate)
            .await?;

        assert!(matches!(
            report.displaced.as_slice(),
            [Displaced::Discarded { issue_key, elapsed }]
                if issue_key == "PROJ-1" && *elapsed == Duration::minutes(180)
        ));
        let set = store.load().await?;
        assert_eq!(set.len(), 1);
        assert!(set.started_at("PROJ-2").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_start_sweeps_all_stale_records() -> Result<()> {
        // Two records can only appear if a previous invocation died halfway.
        let now = started() + Duration::hours(3);
        let (_dir, store, schedule, clock) = harness(now);
        store
            .update(|set| {
                set.insert("PROJ-1", started());
                set.insert("PROJ-3", started());
            })
            .await?;

        let mut client = MockTrackerClient::new();
        client
            .expect_list_transitions()
            .times(2)
            .returning(|_| Ok(vec![]));

        let mut gate = TransitionGate::new(&client);
        let report = machine(&store, &schedule, &client, &clock)
            .start("PROJ-2", &mut gate)
            .await?;

        assert_eq!(report.displaced.len(), 2);
        let set = store.load().await?;
        assert_eq!(set.len(), 1);
        assert!(set.started_at("PROJ-2").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_start_same_issue_resets_start_instant() -> Result<()> {
        let now = started() + Duration::hours(3);
        let (_dir, store, schedule, clock) = harness(now);
        store.update(|set| set.insert("PROJ-1", started())).await?;

        let client = MockTrackerClient::new();
        let mut gate = TransitionGate::new(&client);
        let report = machine(&store, &schedule, &client, &clock)
            .start("PROJ-1", &mut gate)
            .await?;

        assert!(report.displaced.is_empty());
        assert_eq!(store.load().await?.started_at("PROJ-1"), Some(now));
        Ok(())
    }

    #[tokio::test]
    async fn test_start_survives_gate_failure() -> Result<()> {
        let now = started() + Duration::hours(3);
        let (_dir, store, schedule, clock) = harness(now);
        store.update(|set| set.insert("PROJ-1", started())).await?;

        let mut client = MockTrackerClient::new();
        client.expect_list_transitions().times(1).returning(|_| {
            Err(RemoteError::Rejected {
                operation: "list transitions",
                issue_key: "PROJ-1".into(),
                status: 503,
                message: "down".into(),
            })
        });

        let mut gate = TransitionGate::new(&client);
        let report = machine(&store, &schedule, &client, &clock)
            .start("PROJ-2", &mut gate)
            .await?;

        assert!(matches!(
            report.displaced.as_slice(),
            [Displaced::Discarded { issue_key, .. }] if issue_key == "PROJ-1"
        ));
        assert!(store.load().await?.started_at("PROJ-2").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_gate_fetches_transitions_once_per_issue() -> Result<()> {
        let mut client = MockTrackerClient::new();
        client
            .expect_list_transitions()
            .times(1)
            .returning(|_| Ok(stoppable()));

        let mut gate = TransitionGate::new(&client);
        assert!(gate.is_allowed("PROJ-1", STOP_TRANSITION).await?);
        assert!(gate.is_allowed("PROJ-1", "stop progress").await?);
        assert!(!gate.is_allowed("PROJ-1", "Deselect").await?);
        Ok(())
    }
}
