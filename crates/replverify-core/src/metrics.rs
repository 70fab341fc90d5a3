//! Prometheus metrics for verification runs.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `replverify_samples_total` | Counter | `status` |
//! | `replverify_replication_lag_seconds` | Histogram | |
//! | `replverify_poll_requests_total` | Counter | `outcome` |
//! | `replverify_ordering_violations` | Gauge | |
//! | `replverify_run_passed` | Gauge | |
//!
//! The collectors are registered on a caller-owned [`Registry`] so a
//! process can expose them next to its own.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use thiserror::Error;

use crate::report::RunReport;
use crate::sample::SampleStatus;

/// Replication lag buckets, in seconds.
pub const LAG_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result of a single replica lookup, as counted by
/// `replverify_poll_requests_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollOutcome {
    /// The record was returned.
    Found,
    /// The replica answered without the record.
    Missing,
    /// The lookup failed in a way worth retrying.
    TransientError,
    /// The lookup failed permanently.
    Rejected,
}

impl PollOutcome {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::Missing => "missing",
            Self::TransientError => "transient_error",
            Self::Rejected => "rejected",
        }
    }
}

/// Verification metrics.
///
/// Cheap to clone; all clones update the same collectors.
#[derive(Clone)]
pub struct VerifierMetrics {
    registry: Registry,
    samples_total: IntCounterVec,
    replication_lag: Histogram,
    poll_requests_total: IntCounterVec,
    ordering_violations: IntGauge,
    run_passed: IntGauge,
}

impl VerifierMetrics {
    /// Creates the collectors and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate
    /// name).
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let samples_total = IntCounterVec::new(
            Opts::new(
                "replverify_samples_total",
                "Samples reaching a terminal status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(samples_total.clone()))?;

        let replication_lag = Histogram::with_opts(
            HistogramOpts::new(
                "replverify_replication_lag_seconds",
                "Time from primary acknowledgement to first replica sighting",
            )
            .buckets(LAG_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(replication_lag.clone()))?;

        let poll_requests_total = IntCounterVec::new(
            Opts::new(
                "replverify_poll_requests_total",
                "Replica lookups by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(poll_requests_total.clone()))?;

        let ordering_violations = IntGauge::new(
            "replverify_ordering_violations",
            "Ordering violations found by the last run",
        )?;
        registry.register(Box::new(ordering_violations.clone()))?;

        let run_passed = IntGauge::new(
            "replverify_run_passed",
            "1 if the last run passed, 0 otherwise",
        )?;
        registry.register(Box::new(run_passed.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            samples_total,
            replication_lag,
            poll_requests_total,
            ordering_violations,
            run_passed,
        })
    }

    /// Counts one replica lookup.
    pub fn poll_completed(&self, outcome: PollOutcome) {
        self.poll_requests_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Lookups counted for `outcome`, mostly for tests.
    #[must_use]
    pub fn poll_count(&self, outcome: PollOutcome) -> u64 {
        self.poll_requests_total
            .with_label_values(&[outcome.as_str()])
            .get()
    }

    /// Samples counted with `status`.
    #[must_use]
    pub fn sample_count(&self, status: SampleStatus) -> u64 {
        self.samples_total.with_label_values(&[status.as_str()]).get()
    }

    /// Publishes the outcome of a finished run.
    pub fn record_report(&self, report: &RunReport) {
        for record in &report.samples {
            self.samples_total
                .with_label_values(&[record.status.as_str()])
                .inc();
            if let Some(lag) = record.lag {
                self.replication_lag.observe(lag.as_secs_f64());
            }
        }
        self.ordering_violations
            .set(i64::try_from(report.ordering_violations).unwrap_or(i64::MAX));
        self.run_passed.set(i64::from(report.passed));
    }

    /// Encodes every collector in the registry in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

impl std::fmt::Debug for VerifierMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierMetrics").finish_non_exhaustive()
    }
}
