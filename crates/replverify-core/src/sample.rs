//! The unit of verification work.
//!
//! A [`Sample`] is created by the write driver and then only moves
//! forward: `Pending` becomes `Observed` or `TimedOut`, and a failed
//! write is born `WriteFailed`. The transition methods refuse anything
//! else, so the invariants hold no matter who holds the `&mut`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::identity::SampleId;

/// Metric fields written with a sample, keyed by field name.
///
/// A `BTreeMap` keeps field order stable on the wire.
pub type Payload = BTreeMap<String, f64>;

/// Lifecycle state of a [`Sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    /// Written to the primary, not yet seen on the replica.
    Pending,
    /// Seen on the replica.
    Observed,
    /// Not seen on the replica before the observation ended.
    TimedOut,
    /// The primary did not accept the write.
    WriteFailed,
}

impl SampleStatus {
    /// Every status, in report order.
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::Observed,
        Self::TimedOut,
        Self::WriteFailed,
    ];

    /// Returns the snake-case label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Observed => "observed",
            Self::TimedOut => "timed_out",
            Self::WriteFailed => "write_failed",
        }
    }

    /// Returns `true` if no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Why an observation ended without seeing the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    /// The per-sample replica deadline elapsed.
    Deadline,
    /// The run was cancelled.
    Cancelled,
    /// Too many consecutive transient query errors.
    ErrorBudgetExhausted,
    /// The replica rejected the query with a non-retryable error.
    QueryRejected,
    /// The run's global deadline expired while the sample was pending.
    RunDeadline,
    /// The observation task ended without reporting a result.
    TaskLost,
}

impl TimeoutReason {
    /// Returns the snake-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deadline => "deadline",
            Self::Cancelled => "cancelled",
            Self::ErrorBudgetExhausted => "error_budget_exhausted",
            Self::QueryRejected => "query_rejected",
            Self::RunDeadline => "run_deadline",
            Self::TaskLost => "task_lost",
        }
    }
}

/// One write and everything learned about its replication.
#[derive(Debug, Clone)]
pub struct Sample {
    identity: SampleId,
    payload: Payload,
    written_at: DateTime<Utc>,
    write_time: Option<Instant>,
    observed_time: Option<Instant>,
    status: SampleStatus,
    timeout_reason: Option<TimeoutReason>,
    failure: Option<String>,
}

impl Sample {
    /// A sample whose write the primary acknowledged at `write_time`.
    ///
    /// `written_at` is the wall-clock timestamp stamped on the stored
    /// record.
    #[must_use]
    pub const fn pending(
        identity: SampleId,
        payload: Payload,
        written_at: DateTime<Utc>,
        write_time: Instant,
    ) -> Self {
        Self {
            identity,
            payload,
            written_at,
            write_time: Some(write_time),
            observed_time: None,
            status: SampleStatus::Pending,
            timeout_reason: None,
            failure: None,
        }
    }

    /// A sample whose write did not succeed. Terminal from birth.
    #[must_use]
    pub fn write_failed(
        identity: SampleId,
        payload: Payload,
        written_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            payload,
            written_at,
            write_time: None,
            observed_time: None,
            status: SampleStatus::WriteFailed,
            timeout_reason: None,
            failure: Some(reason.into()),
        }
    }

    /// Records the first replica sighting.
    ///
    /// Returns `false` and leaves the sample untouched unless it is
    /// `Pending` and `at` is not earlier than the write completion.
    pub fn mark_observed(&mut self, at: Instant) -> bool {
        match (self.status, self.write_time) {
            (SampleStatus::Pending, Some(written)) if at >= written => {
                self.observed_time = Some(at);
                self.status = SampleStatus::Observed;
                true
            },
            _ => false,
        }
    }

    /// Ends observation without a sighting. Only valid from `Pending`.
    pub fn mark_timed_out(&mut self, reason: TimeoutReason, detail: Option<String>) -> bool {
        if self.status != SampleStatus::Pending {
            return false;
        }
        self.status = SampleStatus::TimedOut;
        self.timeout_reason = Some(reason);
        self.failure = detail;
        true
    }

    /// Identity of this sample.
    #[must_use]
    pub const fn identity(&self) -> &SampleId {
        &self.identity
    }

    /// Fields written with this sample.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Wall-clock timestamp of the stored record.
    #[must_use]
    pub const fn written_at(&self) -> DateTime<Utc> {
        self.written_at
    }

    /// Instant the primary acknowledged the write.
    #[must_use]
    pub const fn write_time(&self) -> Option<Instant> {
        self.write_time
    }

    /// Instant the replica first returned this sample.
    #[must_use]
    pub const fn observed_time(&self) -> Option<Instant> {
        self.observed_time
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> SampleStatus {
        self.status
    }

    /// Why observation ended, for `TimedOut` samples.
    #[must_use]
    pub const fn timeout_reason(&self) -> Option<TimeoutReason> {
        self.timeout_reason
    }

    /// Failure detail: the write error or the last query error.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Replication lag, for observed samples.
    #[must_use]
    pub fn lag(&self) -> Option<Duration> {
        Some(self.observed_time?.duration_since(self.write_time?))
    }
}
