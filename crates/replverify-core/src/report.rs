//! Run report.
//!
//! A [`RunReport`] is computed once from the final ledger snapshot and
//! never changes afterwards. It serializes to JSON for machines and
//! renders a fixed text summary through [`fmt::Display`] for people.
//!
//! Durations serialize as fractional milliseconds.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::identity::SampleId;
use crate::ledger::{OrderingViolation, scan_ordering};
use crate::sample::{Sample, SampleStatus, TimeoutReason};

pub(crate) fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

#[allow(clippy::ref_option)]
fn serialize_opt_millis<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(duration) => serialize_millis(duration, serializer),
        None => serializer.serialize_none(),
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Samples per terminal (or stuck) status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Still pending when the report was built. Always zero for a run that
    /// drained normally.
    pub pending: usize,
    /// Seen on the replica.
    pub observed: usize,
    /// Not seen on the replica.
    pub timed_out: usize,
    /// Refused by the primary.
    pub write_failed: usize,
}

impl StatusCounts {
    fn add(&mut self, status: SampleStatus) {
        match status {
            SampleStatus::Pending => self.pending += 1,
            SampleStatus::Observed => self.observed += 1,
            SampleStatus::TimedOut => self.timed_out += 1,
            SampleStatus::WriteFailed => self.write_failed += 1,
        }
    }

    /// Total samples counted.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.pending + self.observed + self.timed_out + self.write_failed
    }
}

/// Replication lag distribution over observed samples.
///
/// Percentiles use the nearest-rank method, so every value is one of the
/// measured lags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LagStats {
    /// Smallest lag.
    #[serde(serialize_with = "serialize_millis")]
    pub min: Duration,
    /// Largest lag.
    #[serde(serialize_with = "serialize_millis")]
    pub max: Duration,
    /// Arithmetic mean.
    #[serde(serialize_with = "serialize_millis")]
    pub mean: Duration,
    /// Median.
    #[serde(serialize_with = "serialize_millis")]
    pub p50: Duration,
    /// 90th percentile.
    #[serde(serialize_with = "serialize_millis")]
    pub p90: Duration,
    /// 99th percentile.
    #[serde(serialize_with = "serialize_millis")]
    pub p99: Duration,
}

impl LagStats {
    /// Summarizes `lags`. Returns `None` when there is nothing to summarize.
    #[must_use]
    pub fn from_lags(lags: &[Duration]) -> Option<Self> {
        let mut sorted = lags.to_vec();
        sorted.sort_unstable();
        let (&min, &max) = (sorted.first()?, sorted.last()?);

        let total: u128 = sorted.iter().map(Duration::as_nanos).sum();
        let mean_nanos = total / sorted.len() as u128;
        let mean = Duration::from_nanos(u64::try_from(mean_nanos).unwrap_or(u64::MAX));

        Some(Self {
            min,
            max,
            mean,
            p50: nearest_rank(&sorted, 50),
            p90: nearest_rank(&sorted, 90),
            p99: nearest_rank(&sorted, 99),
        })
    }
}

/// `sorted` must be non-empty and ascending.
fn nearest_rank(sorted: &[Duration], percentile: usize) -> Duration {
    let rank = (percentile * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

/// Outcome of one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord {
    /// Sample identity.
    pub identity: SampleId,
    /// Final status.
    pub status: SampleStatus,
    /// Wall-clock timestamp written with the record.
    pub written_at: DateTime<Utc>,
    /// Replication lag, for observed samples.
    #[serde(serialize_with = "serialize_opt_millis")]
    pub lag: Option<Duration>,
    /// Why observation ended, for timed-out samples.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_reason: Option<TimeoutReason>,
    /// Failure detail, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<&Sample> for SampleRecord {
    fn from(sample: &Sample) -> Self {
        Self {
            identity: sample.identity().clone(),
            status: sample.status(),
            written_at: sample.written_at(),
            lag: sample.lag(),
            timeout_reason: sample.timeout_reason(),
            failure: sample.failure().map(str::to_string),
        }
    }
}

/// Run-level facts the ledger does not know.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run identifier.
    pub run_id: Uuid,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// Samples the run was asked to write.
    pub requested: u32,
    /// Lag threshold applied to observed samples.
    pub max_lag: Duration,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Whether the global run deadline expired during draining.
    pub deadline_expired: bool,
}

/// Aggregate verdict over one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When the report was built.
    pub finished_at: DateTime<Utc>,
    /// Samples the run was asked to write.
    pub requested: u32,
    /// Samples whose write was issued.
    pub attempted: usize,
    /// Samples never written because the run stopped early.
    pub not_attempted: usize,
    /// Samples per status.
    pub counts: StatusCounts,
    /// Lag threshold applied to observed samples.
    #[serde(serialize_with = "serialize_millis")]
    pub max_lag: Duration,
    /// Observed samples whose lag exceeded `max_lag`.
    pub lag_exceeded: usize,
    /// Lag distribution; `None` if nothing was observed.
    pub lag: Option<LagStats>,
    /// Pairs of samples the replica exposed out of write order.
    pub ordering_violations: usize,
    /// A bounded selection of those pairs.
    pub violation_examples: Vec<OrderingViolation>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Whether the global run deadline cut draining short.
    pub deadline_expired: bool,
    /// Overall verdict.
    pub passed: bool,
    /// Per-sample outcomes in write order.
    pub samples: Vec<SampleRecord>,
}

impl RunReport {
    /// Builds the report from the final ledger snapshot.
    ///
    /// The run passes when every requested sample was observed, none
    /// lagged beyond `max_lag`, and the replica never exposed writes out
    /// of order. An empty run passes.
    #[must_use]
    pub fn build(context: RunContext, samples: &[Sample]) -> Self {
        let mut counts = StatusCounts::default();
        for sample in samples {
            counts.add(sample.status());
        }

        let lags: Vec<Duration> = samples.iter().filter_map(Sample::lag).collect();
        let lag_exceeded = lags.iter().filter(|&&lag| lag > context.max_lag).count();
        let ordering = scan_ordering(samples);

        let requested = usize::try_from(context.requested).unwrap_or(usize::MAX);
        let attempted = samples.len();
        let passed = counts.observed == requested && lag_exceeded == 0 && ordering.count == 0;

        Self {
            run_id: context.run_id,
            started_at: context.started_at,
            finished_at: Utc::now(),
            requested: context.requested,
            attempted,
            not_attempted: requested.saturating_sub(attempted),
            counts,
            max_lag: context.max_lag,
            lag_exceeded,
            lag: LagStats::from_lags(&lags),
            ordering_violations: ordering.count,
            violation_examples: ordering.examples,
            cancelled: context.cancelled,
            deadline_expired: context.deadline_expired,
            passed,
            samples: samples.iter().map(SampleRecord::from).collect(),
        }
    }

    /// Samples that did not end `Observed` within `max_lag`.
    pub fn failed_samples(&self) -> impl Iterator<Item = &SampleRecord> {
        self.samples.iter().filter(|record| {
            record.status != SampleStatus::Observed
                || record.lag.is_some_and(|lag| lag > self.max_lag)
        })
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "PASS" } else { "FAIL" };
        writeln!(f, "run {} {verdict}", self.run_id)?;
        writeln!(
            f,
            "  samples:    requested {} / attempted {} / not attempted {}",
            self.requested, self.attempted, self.not_attempted
        )?;
        writeln!(
            f,
            "  status:     observed {} / timed out {} / write failed {} / pending {}",
            self.counts.observed,
            self.counts.timed_out,
            self.counts.write_failed,
            self.counts.pending
        )?;
        match &self.lag {
            Some(lag) => writeln!(
                f,
                "  lag (ms):   min {:.1} / p50 {:.1} / p90 {:.1} / p99 {:.1} / max {:.1} / mean {:.1}",
                millis(lag.min),
                millis(lag.p50),
                millis(lag.p90),
                millis(lag.p99),
                millis(lag.max),
                millis(lag.mean)
            )?,
            None => writeln!(f, "  lag (ms):   n/a")?,
        }
        writeln!(
            f,
            "  over limit: {} above {:.1} ms",
            self.lag_exceeded,
            millis(self.max_lag)
        )?;
        writeln!(f, "  ordering:   {} violation(s)", self.ordering_violations)?;
        for violation in &self.violation_examples {
            writeln!(
                f,
                "    {} surfaced {:.1} ms after later write {}",
                violation.earlier,
                millis(violation.skew),
                violation.later
            )?;
        }
        if self.cancelled {
            writeln!(f, "  run was cancelled")?;
        }
        if self.deadline_expired {
            writeln!(f, "  run deadline expired before all samples settled")?;
        }

        for record in self.failed_samples() {
            write!(f, "  {} {}", record.identity, record.status.as_str())?;
            if let Some(reason) = record.timeout_reason {
                write!(f, " ({})", reason.as_str())?;
            }
            if let Some(lag) = record.lag {
                write!(f, " lag {:.1} ms", millis(lag))?;
            }
            if let Some(failure) = &record.failure {
                write!(f, ": {failure}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::identity::IdentityGenerator;
    use crate::sample::Payload;

    fn context(requested: u32, max_lag: Duration) -> RunContext {
        RunContext {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            requested,
            max_lag,
            cancelled: false,
            deadline_expired: false,
        }
    }

    /// Observed samples written 100ms apart with the given lags.
    fn observed_with_lags(ids: &IdentityGenerator, base: Instant, lags_ms: &[u64]) -> Vec<Sample> {
        lags_ms
            .iter()
            .enumerate()
            .map(|(i, &lag)| {
                let write_time = base + Duration::from_millis(i as u64 * 100);
                let mut sample = Sample::pending(ids.next(), Payload::new(), Utc::now(), write_time);
                assert!(sample.mark_observed(write_time + Duration::from_millis(lag)));
                sample
            })
            .collect()
    }

    #[test]
    fn empty_run_passes() {
        let report = RunReport::build(context(0, Duration::from_secs(1)), &[]);

        assert!(report.passed);
        assert_eq!(report.attempted, 0);
        assert_eq!(report.counts.total(), 0);
        assert!(report.lag.is_none());
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let lags: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        let stats = LagStats::from_lags(&lags).unwrap();

        assert_eq!(stats.min, Duration::from_millis(1));
        assert_eq!(stats.p50, Duration::from_millis(50));
        assert_eq!(stats.p90, Duration::from_millis(90));
        assert_eq!(stats.p99, Duration::from_millis(99));
        assert_eq!(stats.max, Duration::from_millis(100));
        assert_eq!(stats.mean, Duration::from_micros(50_500));
    }

    #[test]
    fn single_lag_is_every_percentile() {
        let stats = LagStats::from_lags(&[Duration::from_millis(7)]).unwrap();
        assert_eq!(stats.p50, stats.p99);
        assert_eq!(stats.min, Duration::from_millis(7));
    }

    #[test]
    fn all_observed_in_order_passes() {
        let ids = IdentityGenerator::new();
        let samples = observed_with_lags(&ids, Instant::now(), &[10, 20, 30]);
        let report = RunReport::build(context(3, Duration::from_millis(500)), &samples);

        assert!(report.passed);
        assert_eq!(report.counts.observed, 3);
        assert_eq!(report.ordering_violations, 0);
        assert!(report.to_string().contains("PASS"));
    }

    #[test]
    fn lag_above_limit_fails() {
        let ids = IdentityGenerator::new();
        let samples = observed_with_lags(&ids, Instant::now(), &[10, 700, 20]);
        let report = RunReport::build(context(3, Duration::from_millis(500)), &samples);

        assert!(!report.passed);
        assert_eq!(report.lag_exceeded, 1);
        assert_eq!(report.failed_samples().count(), 1);
    }

    #[test]
    fn write_failures_are_excluded_from_lag_and_ordering() {
        let ids = IdentityGenerator::new();
        let mut samples = observed_with_lags(&ids, Instant::now(), &[10, 20]);
        samples.push(Sample::write_failed(
            ids.next(),
            Payload::new(),
            Utc::now(),
            "store API error (503): primary unavailable",
        ));
        let report = RunReport::build(context(3, Duration::from_millis(500)), &samples);

        assert!(!report.passed);
        assert_eq!(report.counts.write_failed, 1);
        assert_eq!(report.lag.unwrap().max, Duration::from_millis(20));
        let text = report.to_string();
        assert!(text.contains("write_failed: store API error (503)"));
    }

    #[test]
    fn reordering_is_reported() {
        let ids = IdentityGenerator::new();
        // Written at 0 and 100ms, visible at 400 and 150ms.
        let samples = observed_with_lags(&ids, Instant::now(), &[400, 50]);
        let report = RunReport::build(context(2, Duration::from_secs(1)), &samples);

        assert!(!report.passed);
        assert_eq!(report.ordering_violations, 1);
        assert_eq!(report.violation_examples[0].skew, Duration::from_millis(250));
    }

    #[test]
    fn unattempted_samples_fail_the_run() {
        let ids = IdentityGenerator::new();
        let samples = observed_with_lags(&ids, Instant::now(), &[10]);
        let mut ctx = context(3, Duration::from_secs(1));
        ctx.cancelled = true;
        let report = RunReport::build(ctx, &samples);

        assert!(!report.passed);
        assert_eq!(report.not_attempted, 2);
        assert!(report.to_string().contains("cancelled"));
    }

    #[test]
    fn json_uses_milliseconds_and_text_ids() {
        let ids = IdentityGenerator::new();
        let samples = observed_with_lags(&ids, Instant::now(), &[250]);
        let report = RunReport::build(context(1, Duration::from_secs(1)), &samples);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["max_lag"], 1000.0);
        assert_eq!(json["lag"]["p50"], 250.0);
        assert_eq!(json["samples"][0]["status"], "observed");
        assert_eq!(
            json["samples"][0]["identity"],
            samples[0].identity().to_string()
        );
        assert!(json["samples"][0].get("failure").is_none());
    }
}
