//! In-process primary/replica pair.
//!
//! [`SimulatedCluster`] stands in for a managed primary with an
//! asynchronously replicated read replica. Writes land immediately on
//! the primary and become visible on the replica after a replication
//! lag. Lags can be overridden per sample sequence number so a test can
//! make the replica surface writes out of order.
//!
//! Faults can be injected on both sides. All timing uses
//! [`tokio::time::Instant`], so the simulation follows a paused test
//! clock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::trace;

use super::{PrimaryStore, ProbeRecord, ReplicaStore, StoreError, StoredRecord};
use crate::identity::SampleId;

#[derive(Debug)]
struct Replicated {
    visible_at: Instant,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ClusterState {
    records: HashMap<SampleId, Replicated>,
    default_lag: Duration,
    lag_by_seq: HashMap<u64, Duration>,
    replica_partitioned: bool,
    write_latency: Duration,
    lookup_latency: Duration,
    fail_next_writes: u32,
    fail_write_seqs: HashSet<u64>,
    fail_next_lookups: u32,
    lookup_error: Option<StoreError>,
    writes: u64,
    lookups: u64,
}

/// Shared handle to a simulated primary/replica pair.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl SimulatedCluster {
    /// Creates a cluster that replicates every write after `lag`.
    #[must_use]
    pub fn new(lag: Duration) -> Self {
        let cluster = Self::default();
        cluster.lock().default_lag = lag;
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write handle.
    #[must_use]
    pub fn primary(&self) -> SimulatedPrimary {
        SimulatedPrimary {
            cluster: self.clone(),
        }
    }

    /// Read handle.
    #[must_use]
    pub fn replica(&self) -> SimulatedReplica {
        SimulatedReplica {
            cluster: self.clone(),
        }
    }

    /// Replicates the write with sequence number `seq` after `lag`
    /// instead of the default.
    pub fn set_lag_for(&self, seq: u64, lag: Duration) {
        self.lock().lag_by_seq.insert(seq, lag);
    }

    /// When `true`, the replica never returns anything.
    pub fn partition_replica(&self, partitioned: bool) {
        self.lock().replica_partitioned = partitioned;
    }

    /// Delays every write acknowledgement by `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        self.lock().write_latency = latency;
    }

    /// Delays every lookup response by `latency`.
    pub fn set_lookup_latency(&self, latency: Duration) {
        self.lock().lookup_latency = latency;
    }

    /// Fails the next `count` writes with a 503.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().fail_next_writes = count;
    }

    /// Fails the write with sequence number `seq`.
    pub fn fail_write(&self, seq: u64) {
        self.lock().fail_write_seqs.insert(seq);
    }

    /// Fails the next `count` lookups with `error`.
    pub fn fail_next_lookups(&self, count: u32, error: StoreError) {
        let mut state = self.lock();
        state.fail_next_lookups = count;
        state.lookup_error = Some(error);
    }

    /// Writes acknowledged or refused so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// Lookups received so far.
    #[must_use]
    pub fn lookup_count(&self) -> u64 {
        self.lock().lookups
    }

    /// Records held by the primary.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }
}

/// Primary side of a [`SimulatedCluster`].
#[derive(Debug, Clone)]
pub struct SimulatedPrimary {
    cluster: SimulatedCluster,
}

#[async_trait]
impl PrimaryStore for SimulatedPrimary {
    async fn write(&self, record: &ProbeRecord) -> Result<(), StoreError> {
        let latency = self.cluster.lock().write_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.cluster.lock();
        state.writes += 1;
        let seq = record.identity.seq();
        if state.fail_next_writes > 0 || state.fail_write_seqs.contains(&seq) {
            state.fail_next_writes = state.fail_next_writes.saturating_sub(1);
            return Err(StoreError::Api {
                status: 503,
                message: "primary unavailable".to_string(),
            });
        }

        let lag = state
            .lag_by_seq
            .get(&seq)
            .copied()
            .unwrap_or(state.default_lag);
        trace!(identity = %record.identity, ?lag, "simulated write accepted");
        state.records.insert(
            record.identity.clone(),
            Replicated {
                visible_at: Instant::now() + lag,
                stored_at: record.timestamp,
            },
        );
        Ok(())
    }
}

/// Replica side of a [`SimulatedCluster`].
#[derive(Debug, Clone)]
pub struct SimulatedReplica {
    cluster: SimulatedCluster,
}

#[async_trait]
impl ReplicaStore for SimulatedReplica {
    async fn lookup(
        &self,
        identity: &SampleId,
        _window: Duration,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let latency = self.cluster.lock().lookup_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.cluster.lock();
        state.lookups += 1;
        if state.fail_next_lookups > 0 {
            state.fail_next_lookups -= 1;
            return Err(state
                .lookup_error
                .clone()
                .unwrap_or_else(|| StoreError::Transport("connection reset".to_string())));
        }
        if state.replica_partitioned {
            return Ok(None);
        }

        let now = Instant::now();
        Ok(state
            .records
            .get(identity)
            .filter(|replicated| replicated.visible_at <= now)
            .map(|replicated| StoredRecord {
                identity: identity.clone(),
                stored_at: replicated.stored_at,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityGenerator;
    use crate::sample::Payload;

    fn record(ids: &IdentityGenerator) -> ProbeRecord {
        ProbeRecord {
            identity: ids.next(),
            payload: Payload::from([("cpu_percent".to_string(), 12.5)]),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replica_sees_write_after_lag() {
        let cluster = SimulatedCluster::new(Duration::from_millis(300));
        let ids = IdentityGenerator::new();
        let rec = record(&ids);

        cluster.primary().write(&rec).await.unwrap();
        let window = Duration::from_secs(60);
        assert_eq!(cluster.replica().lookup(&rec.identity, window).await, Ok(None));

        tokio::time::advance(Duration::from_millis(300)).await;
        let found = cluster
            .replica()
            .lookup(&rec.identity, window)
            .await
            .unwrap()
            .expect("visible after lag");
        assert_eq!(found.identity, rec.identity);
        assert_eq!(found.stored_at, rec.timestamp);
        assert_eq!(cluster.lookup_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_faults_are_consumed() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        let ids = IdentityGenerator::new();
        cluster.fail_next_writes(1);
        cluster.fail_next_lookups(1, StoreError::Transport("reset".into()));

        let first = record(&ids);
        assert!(cluster.primary().write(&first).await.is_err());
        let second = record(&ids);
        cluster.primary().write(&second).await.unwrap();

        let window = Duration::from_secs(60);
        assert!(cluster.replica().lookup(&second.identity, window).await.is_err());
        assert!(
            cluster
                .replica()
                .lookup(&second.identity, window)
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(cluster.write_count(), 2);
        assert_eq!(cluster.record_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partitioned_replica_returns_nothing() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        cluster.partition_replica(true);
        let ids = IdentityGenerator::new();
        let rec = record(&ids);
        cluster.primary().write(&rec).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            cluster
                .replica()
                .lookup(&rec.identity, Duration::from_secs(60))
                .await,
            Ok(None)
        );
    }
}
