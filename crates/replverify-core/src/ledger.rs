//! Consistency ledger.
//!
//! The ledger correlates every written identity with its write time,
//! its first sighting on the replica, and its final status. It is shared
//! between the engine and its observation tasks for the length of one
//! run; each call is one critical section, so no caller ever sees a
//! half-updated sample.
//!
//! # Ordering violations
//!
//! Two observed samples A and B with `write_time(A) < write_time(B)`
//! form a violation when `observed_time(A) > observed_time(B)`: the
//! replica surfaced the later write first. [`scan_ordering`] counts every
//! such pair exactly once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::trace;

use crate::identity::SampleId;
use crate::sample::{Sample, SampleStatus, TimeoutReason};

/// Maximum number of violating pairs kept as examples.
pub const MAX_VIOLATION_EXAMPLES: usize = 32;

#[derive(Debug, Default)]
struct LedgerInner {
    samples: Vec<Sample>,
    index: HashMap<SampleId, usize>,
}

/// Thread-safe, insertion-ordered map from identity to [`Sample`].
#[derive(Debug, Default)]
pub struct ConsistencyLedger {
    inner: Mutex<LedgerInner>,
}

impl ConsistencyLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a freshly written sample.
    ///
    /// Returns `false` and ignores the sample if its identity is already
    /// present.
    pub fn record_write(&self, sample: Sample) -> bool {
        let mut inner = self.lock();
        if inner.index.contains_key(sample.identity()) {
            return false;
        }
        let position = inner.samples.len();
        inner.index.insert(sample.identity().clone(), position);
        inner.samples.push(sample);
        true
    }

    /// Records the first replica sighting of `identity` at `at`.
    ///
    /// A no-op returning `false` if the identity is unknown, no longer
    /// pending, or `at` precedes the write. Duplicate or late poll
    /// responses therefore never move an existing observation.
    pub fn record_observation(&self, identity: &SampleId, at: Instant) -> bool {
        let mut inner = self.lock();
        let Some(&position) = inner.index.get(identity) else {
            return false;
        };
        let changed = inner.samples[position].mark_observed(at);
        trace!(identity = %identity, changed, "observation recorded");
        changed
    }

    /// Ends observation of a pending sample without a sighting.
    pub fn record_timeout(
        &self,
        identity: &SampleId,
        reason: TimeoutReason,
        detail: Option<String>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(&position) = inner.index.get(identity) else {
            return false;
        };
        inner.samples[position].mark_timed_out(reason, detail)
    }

    /// Times out every sample still pending. Returns how many moved.
    pub fn expire_pending(&self, reason: TimeoutReason) -> usize {
        let mut inner = self.lock();
        inner
            .samples
            .iter_mut()
            .filter(|sample| sample.status() == SampleStatus::Pending)
            .map(|sample| sample.mark_timed_out(reason, None))
            .filter(|moved| *moved)
            .count()
    }

    /// Current status of `identity`.
    #[must_use]
    pub fn status_of(&self, identity: &SampleId) -> Option<SampleStatus> {
        let inner = self.lock();
        inner
            .index
            .get(identity)
            .map(|&position| inner.samples[position].status())
    }

    /// Copy of all samples in write-submission order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Sample> {
        self.lock().samples.clone()
    }

    /// Number of samples recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A pair of samples the replica exposed out of write order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderingViolation {
    /// The sample written first.
    pub earlier: SampleId,
    /// The sample written second but observed first.
    pub later: SampleId,
    /// How long after `later` the replica surfaced `earlier`.
    #[serde(serialize_with = "crate::report::serialize_millis")]
    pub skew: Duration,
}

/// Result of an ordering scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderingScan {
    /// Number of violating pairs.
    pub count: usize,
    /// Up to [`MAX_VIOLATION_EXAMPLES`] violating pairs, earliest writes
    /// first.
    pub examples: Vec<OrderingViolation>,
}

/// Finds ordering violations among the observed samples in `samples`.
///
/// Samples that were not observed (pending, timed out, failed writes)
/// take no part: they were never visible, so they cannot be out of
/// order.
#[must_use]
pub fn scan_ordering(samples: &[Sample]) -> OrderingScan {
    let mut observed: Vec<(Instant, Instant, &SampleId)> = samples
        .iter()
        .filter(|sample| sample.status() == SampleStatus::Observed)
        .filter_map(|sample| {
            Some((
                sample.write_time()?,
                sample.observed_time()?,
                sample.identity(),
            ))
        })
        .collect();
    // Equal write times sort by observation, so they never count.
    observed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut observed_in_write_order: Vec<Instant> = observed.iter().map(|o| o.1).collect();
    let count = count_inversions(&mut observed_in_write_order);

    let mut examples = Vec::new();
    if count > 0 {
        'outer: for (i, earlier) in observed.iter().enumerate() {
            for later in &observed[i + 1..] {
                if earlier.0 < later.0 && earlier.1 > later.1 {
                    examples.push(OrderingViolation {
                        earlier: earlier.2.clone(),
                        later: later.2.clone(),
                        skew: earlier.1.duration_since(later.1),
                    });
                    if examples.len() == MAX_VIOLATION_EXAMPLES {
                        break 'outer;
                    }
                }
            }
        }
    }

    OrderingScan { count, examples }
}

/// Counts pairs `i < j` with `values[i] > values[j]`, sorting `values`
/// in the process.
fn count_inversions<T: Ord + Copy>(values: &mut [T]) -> usize {
    let len = values.len();
    if len < 2 {
        return 0;
    }
    let mid = len / 2;
    let mut count = count_inversions(&mut values[..mid]) + count_inversions(&mut values[mid..]);

    let mut merged = Vec::with_capacity(len);
    let (mut i, mut j) = (0, mid);
    while i < mid && j < len {
        if values[j] < values[i] {
            count += mid - i;
            merged.push(values[j]);
            j += 1;
        } else {
            merged.push(values[i]);
            i += 1;
        }
    }
    merged.extend_from_slice(&values[i..mid]);
    merged.extend_from_slice(&values[j..]);
    values.copy_from_slice(&merged);
    count
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;

    use super::*;
    use crate::identity::IdentityGenerator;
    use crate::sample::Payload;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    /// Builds observed samples written at `base + i*100ms` and observed at
    /// `base + observed_ms[i]` (relative to base), in write order.
    fn observed_samples(base: Instant, observed_ms: &[u64]) -> Vec<Sample> {
        let ids = IdentityGenerator::new();
        observed_ms
            .iter()
            .enumerate()
            .map(|(i, &obs)| {
                let write_time = base + ms(i as u64 * 100);
                let mut sample = Sample::pending(ids.next(), Payload::new(), Utc::now(), write_time);
                assert!(sample.mark_observed((base + ms(obs)).max(write_time)));
                sample
            })
            .collect()
    }

    #[test]
    fn preserves_insertion_order() {
        let ids = IdentityGenerator::new();
        let ledger = ConsistencyLedger::new();
        let now = Instant::now();
        let written: Vec<_> = (0..5)
            .map(|_| Sample::pending(ids.next(), Payload::new(), Utc::now(), now))
            .collect();
        for sample in written.iter().rev() {
            assert!(ledger.record_write(sample.clone()));
        }

        let order: Vec<u64> = ledger.snapshot().iter().map(|s| s.identity().seq()).collect();
        assert_eq!(order, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn duplicate_identity_is_ignored() {
        let ids = IdentityGenerator::new();
        let ledger = ConsistencyLedger::new();
        let sample = Sample::pending(ids.next(), Payload::new(), Utc::now(), Instant::now());

        assert!(ledger.record_write(sample.clone()));
        assert!(!ledger.record_write(sample));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn observation_of_unknown_identity_is_noop() {
        let ids = IdentityGenerator::new();
        let ledger = ConsistencyLedger::new();
        assert!(!ledger.record_observation(&ids.next(), Instant::now()));
        assert!(ledger.is_empty());
    }

    #[test]
    fn second_observation_keeps_first() {
        let ids = IdentityGenerator::new();
        let ledger = ConsistencyLedger::new();
        let t0 = Instant::now();
        let id = ids.next();
        ledger.record_write(Sample::pending(id.clone(), Payload::new(), Utc::now(), t0));

        assert!(ledger.record_observation(&id, t0 + ms(50)));
        assert!(!ledger.record_observation(&id, t0 + ms(50)));
        assert!(!ledger.record_observation(&id, t0 + ms(80)));
        assert!(!ledger.record_timeout(&id, TimeoutReason::Deadline, None));

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot[0].observed_time(), Some(t0 + ms(50)));
        assert_eq!(ledger.status_of(&id), Some(SampleStatus::Observed));
    }

    #[test]
    fn expire_pending_only_touches_pending() {
        let ids = IdentityGenerator::new();
        let ledger = ConsistencyLedger::new();
        let t0 = Instant::now();
        let observed = ids.next();
        let pending = ids.next();
        ledger.record_write(Sample::pending(observed.clone(), Payload::new(), Utc::now(), t0));
        ledger.record_write(Sample::pending(pending.clone(), Payload::new(), Utc::now(), t0));
        ledger.record_write(Sample::write_failed(ids.next(), Payload::new(), Utc::now(), "x"));
        ledger.record_observation(&observed, t0);

        assert_eq!(ledger.expire_pending(TimeoutReason::RunDeadline), 1);
        assert_eq!(ledger.status_of(&pending), Some(SampleStatus::TimedOut));
        assert_eq!(ledger.expire_pending(TimeoutReason::RunDeadline), 0);
    }

    #[test]
    fn in_order_replication_has_no_violations() {
        let samples = observed_samples(Instant::now(), &[50, 150, 250, 350]);
        assert_eq!(scan_ordering(&samples), OrderingScan::default());
    }

    #[test]
    fn one_swap_is_one_violation() {
        // Sample 1 (written at 100ms) appears at 300ms, after sample 2
        // (written at 200ms, seen at 250ms).
        let samples = observed_samples(Instant::now(), &[50, 300, 250, 350]);
        let scan = scan_ordering(&samples);

        assert_eq!(scan.count, 1);
        assert_eq!(scan.examples.len(), 1);
        assert_eq!(scan.examples[0].earlier.seq(), 1);
        assert_eq!(scan.examples[0].later.seq(), 2);
        assert_eq!(scan.examples[0].skew, ms(50));
    }

    #[test]
    fn fully_reversed_counts_every_pair() {
        let samples = observed_samples(Instant::now(), &[900, 800, 700, 600, 500]);
        assert_eq!(scan_ordering(&samples).count, 10);
    }

    #[test]
    fn unobserved_samples_are_excluded() {
        let base = Instant::now();
        let mut samples = observed_samples(base, &[50, 400, 250]);
        let ids = IdentityGenerator::new();
        let mut timed_out = Sample::pending(ids.next(), Payload::new(), Utc::now(), base);
        timed_out.mark_timed_out(TimeoutReason::Deadline, None);
        samples.insert(0, timed_out);
        samples.push(Sample::write_failed(ids.next(), Payload::new(), Utc::now(), "x"));

        assert_eq!(scan_ordering(&samples).count, 1);
    }

    #[test]
    fn equal_write_times_never_violate() {
        let ids = IdentityGenerator::new();
        let t0 = Instant::now();
        let mut a = Sample::pending(ids.next(), Payload::new(), Utc::now(), t0);
        let mut b = Sample::pending(ids.next(), Payload::new(), Utc::now(), t0);
        a.mark_observed(t0 + ms(300));
        b.mark_observed(t0 + ms(100));

        assert_eq!(scan_ordering(&[a, b]).count, 0);
    }

    #[test]
    fn examples_are_capped() {
        let observed: Vec<u64> = (0..20).rev().map(|i| 5_000 + i * 10).collect();
        let scan = scan_ordering(&observed_samples(Instant::now(), &observed));

        assert_eq!(scan.count, 190);
        assert_eq!(scan.examples.len(), MAX_VIOLATION_EXAMPLES);
    }

    fn naive_inversions(values: &[u64]) -> usize {
        let mut count = 0;
        for i in 0..values.len() {
            for j in i + 1..values.len() {
                if values[i] > values[j] {
                    count += 1;
                }
            }
        }
        count
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: merge-based counting agrees with pairwise counting,
        /// duplicates included.
        #[test]
        fn prop_inversion_count_matches_pairwise(values in prop::collection::vec(0u64..50, 0..64)) {
            let expected = naive_inversions(&values);
            let mut sorted = values.clone();
            prop_assert_eq!(count_inversions(&mut sorted), expected);
            prop_assert!(sorted.windows(2).all(|w| w[0] <= w[1]));
        }

        /// Property: once observed, further observations never change the
        /// recorded instant.
        #[test]
        fn prop_observation_is_idempotent(
            first in 0u64..1_000,
            later in prop::collection::vec(0u64..2_000, 0..8),
        ) {
            let ids = IdentityGenerator::new();
            let ledger = ConsistencyLedger::new();
            let t0 = Instant::now();
            let id = ids.next();
            ledger.record_write(Sample::pending(id.clone(), Payload::new(), Utc::now(), t0));

            prop_assert!(ledger.record_observation(&id, t0 + ms(first)));
            for extra in later {
                prop_assert!(!ledger.record_observation(&id, t0 + ms(first + extra)));
            }
            prop_assert_eq!(ledger.snapshot()[0].observed_time(), Some(t0 + ms(first)));
        }

        /// Property: the scan never reports more violations than pairs and
        /// every example really is out of order.
        #[test]
        fn prop_scan_examples_are_real(observed in prop::collection::vec(0u64..3_000, 0..24)) {
            let samples = observed_samples(Instant::now(), &observed);
            let scan = scan_ordering(&samples);
            let n = samples.len();

            prop_assert!(scan.count <= n * n.saturating_sub(1) / 2);
            prop_assert!(scan.examples.len() <= scan.count);
            for violation in &scan.examples {
                prop_assert!(violation.earlier.seq() < violation.later.seq());
                prop_assert!(!violation.skew.is_zero());
            }
        }
    }
}
