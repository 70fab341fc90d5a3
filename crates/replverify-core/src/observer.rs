//! Poll-based replica observer.
//!
//! For one identity, the observer issues point lookups against the
//! replica on a fixed interval until the record shows up, the deadline
//! passes, or the run is cancelled.
//!
//! - The first lookup is issued immediately; later ones follow the
//!   interval. The interval never adapts.
//! - Each lookup is bounded by its own `poll_timeout`, independent of the
//!   overall deadline.
//! - Transient lookup errors count as "not found yet". After
//!   `max_consecutive_errors` of them in a row the observation is
//!   abandoned. A non-transient error abandons it at once.
//! - Cancellation is checked at start and while waiting for the next
//!   tick. An in-flight lookup is never interrupted.
//! - A record that is only returned after the deadline counts as timed
//!   out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::identity::SampleId;
use crate::metrics::{PollOutcome, VerifierMetrics};
use crate::sample::TimeoutReason;
use crate::store::{ReplicaStore, StoreError};

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverConfig {
    /// Spacing between lookups.
    pub poll_interval: Duration,
    /// Bound on a single lookup.
    pub poll_timeout: Duration,
    /// Consecutive transient errors tolerated.
    pub max_consecutive_errors: u32,
    /// Trailing range searched by each lookup.
    pub lookup_window: Duration,
}

impl From<&RunConfig> for ObserverConfig {
    fn from(run: &RunConfig) -> Self {
        Self {
            poll_interval: run.poll_interval,
            poll_timeout: run.poll_timeout,
            max_consecutive_errors: run.max_consecutive_errors,
            lookup_window: run.lookup_window,
        }
    }
}

/// How an observation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The replica returned the record.
    Observed {
        /// Instant the lookup that found it completed.
        at: Instant,
        /// Timestamp the replica holds for the record.
        stored_at: DateTime<Utc>,
        /// Lookups issued.
        polls: u32,
    },
    /// The record was not seen.
    TimedOut {
        /// Why observation stopped.
        reason: TimeoutReason,
        /// Lookups issued.
        polls: u32,
        /// Most recent lookup error, if any.
        last_error: Option<StoreError>,
    },
}

impl Observation {
    /// Lookups issued during this observation.
    #[must_use]
    pub const fn polls(&self) -> u32 {
        match self {
            Self::Observed { polls, .. } | Self::TimedOut { polls, .. } => *polls,
        }
    }
}

/// Watches the replica for individual identities.
pub struct ReplicaObserver {
    replica: Arc<dyn ReplicaStore>,
    config: ObserverConfig,
    metrics: Option<VerifierMetrics>,
}

impl ReplicaObserver {
    /// Creates an observer polling `replica`.
    #[must_use]
    pub fn new(replica: Arc<dyn ReplicaStore>, config: ObserverConfig) -> Self {
        Self {
            replica,
            config,
            metrics: None,
        }
    }

    /// Records poll outcomes on `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: VerifierMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Polling parameters.
    #[must_use]
    pub const fn config(&self) -> &ObserverConfig {
        &self.config
    }

    fn count(&self, outcome: PollOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.poll_completed(outcome);
        }
    }

    /// Polls until `identity` appears, `deadline` passes, or `cancel`
    /// fires.
    pub async fn observe(
        &self,
        identity: &SampleId,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Observation {
        let mut polls: u32 = 0;
        let mut consecutive_errors: u32 = 0;
        let mut last_error: Option<StoreError> = None;

        if cancel.is_cancelled() {
            return Observation::TimedOut {
                reason: TimeoutReason::Cancelled,
                polls,
                last_error,
            };
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(identity = %identity, polls, "observation cancelled");
                    return Observation::TimedOut {
                        reason: TimeoutReason::Cancelled,
                        polls,
                        last_error,
                    };
                },
                _ = ticker.tick() => {},
                () = &mut expiry => {
                    return Observation::TimedOut {
                        reason: TimeoutReason::Deadline,
                        polls,
                        last_error,
                    };
                },
            }

            polls += 1;
            let result = tokio::time::timeout(
                self.config.poll_timeout,
                self.replica.lookup(identity, self.config.lookup_window),
            )
            .await
            .unwrap_or(Err(StoreError::Timeout(self.config.poll_timeout)));
            let answered_at = Instant::now();

            match result {
                Ok(Some(record)) => {
                    self.count(PollOutcome::Found);
                    if answered_at > deadline {
                        debug!(identity = %identity, polls, "record surfaced after deadline");
                        return Observation::TimedOut {
                            reason: TimeoutReason::Deadline,
                            polls,
                            last_error,
                        };
                    }
                    debug!(identity = %identity, polls, "record visible on replica");
                    return Observation::Observed {
                        at: answered_at,
                        stored_at: record.stored_at,
                        polls,
                    };
                },
                Ok(None) => {
                    self.count(PollOutcome::Missing);
                    consecutive_errors = 0;
                },
                Err(error) if error.is_transient() => {
                    self.count(PollOutcome::TransientError);
                    consecutive_errors += 1;
                    debug!(
                        identity = %identity,
                        consecutive_errors,
                        error = %error,
                        "transient replica lookup error"
                    );
                    last_error = Some(error);
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        warn!(
                            identity = %identity,
                            consecutive_errors,
                            "abandoning observation after repeated lookup errors"
                        );
                        return Observation::TimedOut {
                            reason: TimeoutReason::ErrorBudgetExhausted,
                            polls,
                            last_error,
                        };
                    }
                },
                Err(error) => {
                    self.count(PollOutcome::Rejected);
                    warn!(identity = %identity, error = %error, "replica rejected lookup");
                    return Observation::TimedOut {
                        reason: TimeoutReason::QueryRejected,
                        polls,
                        last_error: Some(error),
                    };
                },
            }
        }
    }
}

impl std::fmt::Debug for ReplicaObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaObserver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
