//! Verification engine.
//!
//! One [`VerificationEngine::run`] call drives a full batch through
//! `Idle → Writing → Draining → Done`:
//!
//! - **Writing**: writes are issued one at a time, each starting
//!   `write_interval` after the previous one started. Every acknowledged
//!   write spawns an observation task with deadline
//!   `write_time + replica_deadline`. At most `max_concurrency` tasks poll
//!   at once. A write waits for a free slot before it is issued, so every
//!   observation polls on a grid anchored at its own write time and a
//!   write-ordered replica is never reported out of order.
//! - **Draining**: the engine joins every observation task. If the run
//!   deadline (end of writing + `replica_deadline` + `drain_slack`)
//!   passes first, everything still pending is timed out and the
//!   remaining tasks are cancelled and joined.
//! - **Done**: the report is built from the ledger snapshot.
//!
//! Cancelling the token stops further writes, makes every observation
//! give up at its next poll boundary, and still produces a report.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, RunConfig};
use crate::driver::WriteDriver;
use crate::identity::SampleId;
use crate::ledger::ConsistencyLedger;
use crate::metrics::VerifierMetrics;
use crate::observer::{Observation, ObserverConfig, ReplicaObserver};
use crate::payload::PayloadSource;
use crate::report::{RunContext, RunReport};
use crate::sample::TimeoutReason;
use crate::store::{PrimaryStore, ReplicaStore};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    /// No run has started yet.
    Idle,
    /// Issuing writes.
    Writing,
    /// Waiting for outstanding observations.
    Draining,
    /// Report produced.
    Done,
}

impl RunPhase {
    /// Returns the lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Writing => "writing",
            Self::Draining => "draining",
            Self::Done => "done",
        }
    }

    /// Whether `next` may follow `self`. A finished engine may start
    /// another run.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::Done, Self::Writing)
                | (Self::Writing, Self::Draining)
                | (Self::Draining, Self::Done)
        )
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs write/observe batches and judges the result.
pub struct VerificationEngine {
    config: RunConfig,
    primary: Arc<dyn PrimaryStore>,
    replica: Arc<dyn ReplicaStore>,
    payloads: Arc<dyn PayloadSource>,
    metrics: Option<VerifierMetrics>,
    phase: watch::Sender<RunPhase>,
}

impl VerificationEngine {
    /// Creates an engine for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `config` is out of range.
    pub fn new(
        config: RunConfig,
        primary: Arc<dyn PrimaryStore>,
        replica: Arc<dyn ReplicaStore>,
        payloads: Arc<dyn PayloadSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (phase, _) = watch::channel(RunPhase::Idle);
        Ok(Self {
            config,
            primary,
            replica,
            payloads,
            metrics: None,
            phase,
        })
    }

    /// Publishes run outcomes and poll counts on `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: VerifierMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run parameters.
    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    /// Receiver that sees every phase change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    fn advance(&self, next: RunPhase) {
        let current = self.phase();
        debug_assert!(
            current.can_advance_to(next),
            "illegal run phase transition {current} -> {next}"
        );
        info!(from = %current, to = %next, "run phase changed");
        self.phase.send_replace(next);
    }

    /// Executes one run and returns its report.
    ///
    /// Per-sample failures never end the run early; only `cancel` or the
    /// run deadline do.
    pub async fn run(&mut self, cancel: CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let config = self.config.clone();
        info!(
            run_id = %run_id,
            sample_count = config.sample_count,
            write_interval = ?config.write_interval,
            replica_deadline = ?config.replica_deadline,
            max_lag = ?config.max_lag,
            "verification run started"
        );

        let ledger = Arc::new(ConsistencyLedger::new());
        let driver = WriteDriver::new(Arc::clone(&self.primary), config.write_timeout);
        let mut observer =
            ReplicaObserver::new(Arc::clone(&self.replica), ObserverConfig::from(&config));
        if let Some(metrics) = &self.metrics {
            observer = observer.with_metrics(metrics.clone());
        }
        let observer = Arc::new(observer);
        let permits = Arc::new(Semaphore::new(config.max_concurrency));
        // Separate from `cancel` so the run deadline can stop observations
        // without marking the run as cancelled.
        let stop_observing = cancel.child_token();
        let mut tasks = JoinSet::new();

        self.advance(RunPhase::Writing);
        let mut next_write_at = Instant::now();
        for _ in 0..config.sample_count {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(run_id = %run_id, written = driver.issued(), "run cancelled during writes");
                    break;
                },
                () = tokio::time::sleep_until(next_write_at) => {},
            }
            // A write only goes out once its observation can start polling,
            // so every sample polls from its own write time.
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(run_id = %run_id, written = driver.issued(), "run cancelled while waiting for a polling slot");
                    break;
                },
                permit = Arc::clone(&permits).acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                warn!(run_id = %run_id, "polling slots closed; stopping writes");
                break;
            };
            next_write_at = Instant::now() + config.write_interval;

            let payload = self.payloads.next_payload().await;
            let sample = driver.write(payload).await;
            let identity = sample.identity().clone();
            let write_time = sample.write_time();
            ledger.record_write(sample);

            let Some(write_time) = write_time else {
                continue;
            };
            tasks.spawn(observe_sample(
                identity,
                write_time + config.replica_deadline,
                Arc::clone(&ledger),
                Arc::clone(&observer),
                permit,
                stop_observing.clone(),
            ));
        }

        self.advance(RunPhase::Draining);
        let run_deadline = Instant::now() + config.replica_deadline + config.drain_slack;
        let expiry = tokio::time::sleep_until(run_deadline);
        tokio::pin!(expiry);
        let mut deadline_expired = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(())) => {},
                    Some(Err(error)) => {
                        warn!(run_id = %run_id, error = %error, "observation task ended abnormally");
                    },
                },
                () = &mut expiry, if !deadline_expired => {
                    deadline_expired = true;
                    let expired = ledger.expire_pending(TimeoutReason::RunDeadline);
                    warn!(
                        run_id = %run_id,
                        expired,
                        outstanding = tasks.len(),
                        "run deadline expired; abandoning outstanding observations"
                    );
                    stop_observing.cancel();
                },
            }
        }

        let lost = ledger.expire_pending(TimeoutReason::TaskLost);
        if lost > 0 {
            warn!(run_id = %run_id, lost, "samples left pending by lost observation tasks");
        }

        let report = RunReport::build(
            RunContext {
                run_id,
                started_at,
                requested: config.sample_count,
                max_lag: config.max_lag,
                cancelled: cancel.is_cancelled(),
                deadline_expired,
            },
            &ledger.snapshot(),
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_report(&report);
        }
        self.advance(RunPhase::Done);
        info!(
            run_id = %run_id,
            passed = report.passed,
            observed = report.counts.observed,
            timed_out = report.counts.timed_out,
            write_failed = report.counts.write_failed,
            ordering_violations = report.ordering_violations,
            cancelled = report.cancelled,
            "verification run finished"
        );
        report
    }
}

impl std::fmt::Debug for VerificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationEngine")
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Body of one observation task: observe while holding a polling slot,
/// then record the outcome.
async fn observe_sample(
    identity: SampleId,
    deadline: Instant,
    ledger: Arc<ConsistencyLedger>,
    observer: Arc<ReplicaObserver>,
    _permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) {
    let outcome = observer.observe(&identity, deadline, &cancel).await;

    match outcome {
        Observation::Observed { at, polls, .. } => {
            if !ledger.record_observation(&identity, at) {
                debug!(identity = %identity, polls, "late observation ignored");
            }
        },
        Observation::TimedOut {
            reason,
            polls,
            last_error,
        } => {
            debug!(identity = %identity, polls, reason = reason.as_str(), "sample not observed");
            ledger.record_timeout(&identity, reason, last_error.map(|error| error.to_string()));
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::payload::FixedPayload;
    use crate::sample::SampleStatus;
    use crate::store::SimulatedCluster;

    fn engine(cluster: &SimulatedCluster, config: RunConfig) -> VerificationEngine {
        VerificationEngine::new(
            config,
            Arc::new(cluster.primary()),
            Arc::new(cluster.replica()),
            Arc::new(FixedPayload::default()),
        )
        .unwrap()
    }

    fn config(sample_count: u32) -> RunConfig {
        RunConfig::new(
            sample_count,
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_millis(500),
            Duration::from_millis(200),
            4,
        )
    }

    #[test]
    fn phase_transitions() {
        assert!(RunPhase::Idle.can_advance_to(RunPhase::Writing));
        assert!(RunPhase::Writing.can_advance_to(RunPhase::Draining));
        assert!(RunPhase::Draining.can_advance_to(RunPhase::Done));
        assert!(RunPhase::Done.can_advance_to(RunPhase::Writing));
        assert!(!RunPhase::Idle.can_advance_to(RunPhase::Done));
        assert!(!RunPhase::Draining.can_advance_to(RunPhase::Writing));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        let mut bad = config(3);
        bad.max_concurrency = 0;
        let result = VerificationEngine::new(
            bad,
            Arc::new(cluster.primary()),
            Arc::new(cluster.replica()),
            Arc::new(FixedPayload::default()),
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_run_passes_immediately() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        let mut engine = engine(&cluster, config(0));
        let start = Instant::now();

        let report = engine.run(CancellationToken::new()).await;

        assert!(report.passed);
        assert_eq!(report.attempted, 0);
        assert_eq!(cluster.write_count(), 0);
        assert!(start.elapsed() < Duration::from_millis(1));
        assert_eq!(engine.phase(), RunPhase::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_are_spaced_by_interval() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        let mut engine = engine(&cluster, config(3));
        let start = Instant::now();

        let report = engine.run(CancellationToken::new()).await;

        assert!(report.passed);
        // Writes at 0s, 1s, 2s; the last observation succeeds on its first poll.
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn phases_are_published() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        let mut engine = engine(&cluster, config(1));
        let mut phases = engine.subscribe();
        assert_eq!(*phases.borrow_and_update(), RunPhase::Idle);

        engine.run(CancellationToken::new()).await;

        assert!(phases.has_changed().unwrap());
        assert_eq!(*phases.borrow_and_update(), RunPhase::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn run_deadline_expires_stuck_samples() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        let mut cfg = config(2);
        cfg.max_concurrency = 2;
        cfg.write_interval = Duration::ZERO;
        cfg.drain_slack = Duration::ZERO;
        let mut engine = engine(&cluster, cfg);
        // Slow lookups straddle the run deadline at 2s, so only the engine's
        // timer can fire there.
        cluster.partition_replica(true);
        cluster.set_lookup_latency(Duration::from_millis(900));
        let start = Instant::now();

        let report = engine.run(CancellationToken::new()).await;

        assert!(!report.passed);
        assert!(report.deadline_expired);
        assert!(!report.cancelled);
        assert_eq!(report.counts.timed_out, 2);
        assert_eq!(report.counts.pending, 0);
        for record in &report.samples {
            assert_eq!(record.status, SampleStatus::TimedOut);
            assert_eq!(record.timeout_reason, Some(TimeoutReason::RunDeadline));
        }
        // The in-flight lookups issued at 1.8s are not interrupted.
        assert_eq!(start.elapsed(), Duration::from_millis(2_700));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_wait_for_a_polling_slot() {
        let cluster = SimulatedCluster::new(Duration::from_millis(300));
        let mut cfg = config(2);
        cfg.max_concurrency = 1;
        cfg.write_interval = Duration::ZERO;
        let mut engine = engine(&cluster, cfg);
        let start = Instant::now();

        let report = engine.run(CancellationToken::new()).await;

        assert!(report.passed, "{report}");
        // Sample 1 is written once sample 0 is seen at 400ms.
        for record in &report.samples {
            assert_eq!(record.lag, Some(Duration::from_millis(400)));
        }
        assert_eq!(start.elapsed(), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_waiting_for_a_slot_stops_writes() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        cluster.partition_replica(true);
        let mut cfg = config(3);
        cfg.max_concurrency = 1;
        cfg.write_interval = Duration::ZERO;
        let mut engine = engine(&cluster, cfg);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let report = engine.run(cancel).await;

        assert!(report.cancelled);
        assert_eq!(cluster.write_count(), 1);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.not_attempted, 2);
        assert_eq!(report.samples[0].timeout_reason, Some(TimeoutReason::Cancelled));
    }
}
