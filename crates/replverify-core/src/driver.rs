//! Write driver.
//!
//! Turns a payload into a [`Sample`] by writing it to the primary under a
//! fresh identity. A failed or slow write is recorded on the sample as
//! `WriteFailed`; the driver itself never retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::identity::IdentityGenerator;
use crate::sample::{Payload, Sample};
use crate::store::{PrimaryStore, ProbeRecord, StoreError};

/// Issues tagged writes to the primary.
pub struct WriteDriver {
    primary: Arc<dyn PrimaryStore>,
    ids: IdentityGenerator,
    write_timeout: Duration,
}

impl WriteDriver {
    /// Creates a driver writing to `primary`, bounding each write by
    /// `write_timeout`.
    #[must_use]
    pub fn new(primary: Arc<dyn PrimaryStore>, write_timeout: Duration) -> Self {
        Self {
            primary,
            ids: IdentityGenerator::new(),
            write_timeout,
        }
    }

    /// Writes `payload` and returns the resulting sample.
    ///
    /// On success the sample is `Pending` with `write_time` set to the
    /// instant the primary acknowledged. On error or timeout it is
    /// `WriteFailed` with the reason attached.
    pub async fn write(&self, payload: Payload) -> Sample {
        let identity = self.ids.next();
        let record = ProbeRecord {
            identity,
            payload,
            timestamp: Utc::now(),
        };

        let outcome = tokio::time::timeout(self.write_timeout, self.primary.write(&record))
            .await
            .unwrap_or(Err(StoreError::Timeout(self.write_timeout)));

        let ProbeRecord {
            identity,
            payload,
            timestamp,
        } = record;

        match outcome {
            Ok(()) => {
                let write_time = Instant::now();
                debug!(identity = %identity, "primary acknowledged write");
                Sample::pending(identity, payload, timestamp, write_time)
            },
            Err(error) => {
                warn!(identity = %identity, error = %error, "primary write failed");
                Sample::write_failed(identity, payload, timestamp, error.to_string())
            },
        }
    }

    /// Identities handed out so far, including failed writes.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.ids.issued()
    }
}

impl std::fmt::Debug for WriteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteDriver")
            .field("issued", &self.ids.issued())
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleStatus;
    use crate::store::SimulatedCluster;

    fn payload() -> Payload {
        Payload::from([("cpu_percent".to_string(), 3.0)])
    }

    #[tokio::test(start_paused = true)]
    async fn successful_write_is_pending() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        cluster.set_write_latency(Duration::from_millis(30));
        let driver = WriteDriver::new(Arc::new(cluster.primary()), Duration::from_secs(1));

        let before = Instant::now();
        let sample = driver.write(payload()).await;

        assert_eq!(sample.status(), SampleStatus::Pending);
        assert_eq!(sample.identity().seq(), 0);
        let acked_after = sample.write_time().unwrap().duration_since(before);
        assert!(acked_after >= Duration::from_millis(30));
        assert!(acked_after < Duration::from_millis(40));
        assert_eq!(cluster.record_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_write_is_terminal() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        cluster.fail_next_writes(1);
        let driver = WriteDriver::new(Arc::new(cluster.primary()), Duration::from_secs(1));

        let failed = driver.write(payload()).await;
        let ok = driver.write(payload()).await;

        assert_eq!(failed.status(), SampleStatus::WriteFailed);
        assert!(failed.failure().unwrap().contains("503"));
        assert_eq!(failed.write_time(), None);
        assert_eq!(ok.status(), SampleStatus::Pending);
        assert_eq!(driver.issued(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_write_times_out() {
        let cluster = SimulatedCluster::new(Duration::ZERO);
        cluster.set_write_latency(Duration::from_secs(10));
        let driver = WriteDriver::new(Arc::new(cluster.primary()), Duration::from_millis(500));

        let before = Instant::now();
        let sample = driver.write(payload()).await;

        assert_eq!(sample.status(), SampleStatus::WriteFailed);
        assert!(sample.failure().unwrap().contains("timed out"));
        assert!(before.elapsed() >= Duration::from_millis(500));
        assert!(before.elapsed() < Duration::from_secs(1));
    }
}
