//! Store endpoints.
//!
//! The primary and the replica are external collaborators. This module
//! defines the two narrow seams the verifier needs from them: a tagged
//! write on the primary and a point lookup on the replica.
//!
//! - [`influx`]: InfluxDB v2 HTTP adapter (both seams)
//! - [`memory`]: in-process simulated primary/replica pair with fault
//!   injection

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::identity::SampleId;
use crate::sample::Payload;

pub mod influx;
pub mod memory;

pub use influx::{InfluxEndpoint, RecentRow};
pub use memory::{SimulatedCluster, SimulatedPrimary, SimulatedReplica};

/// Errors raised by store adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The request never produced a response (connect/reset/DNS).
    #[error("transport error: {0}")]
    Transport(String),

    /// The request did not finish within its own timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint answered with a non-success status.
    #[error("store API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The endpoint answered but the body could not be understood.
    #[error("unparseable response: {0}")]
    Parse(String),

    /// The record was refused before being sent.
    #[error("record rejected: {0}")]
    Rejected(String),

    /// The adapter is misconfigured.
    #[error("store configuration error: {0}")]
    Configuration(String),
}

impl StoreError {
    /// Whether retrying the same request later may succeed.
    ///
    /// Transport failures, timeouts, 5xx and 429 are transient. Anything
    /// else will fail the same way again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Parse(_) | Self::Rejected(_) | Self::Configuration(_) => false,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return Self::Transport(format!("timeout: {value}"));
        }
        if let Some(status) = value.status() {
            return Self::Api {
                status: status.as_u16(),
                message: value.to_string(),
            };
        }
        if value.is_decode() {
            return Self::Parse(value.to_string());
        }
        Self::Transport(value.to_string())
    }
}

/// A record to write on the primary.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRecord {
    /// Identity, stored as the `probe_id` tag.
    pub identity: SampleId,
    /// Metric fields.
    pub payload: Payload,
    /// Record timestamp.
    pub timestamp: DateTime<Utc>,
}

/// A record returned by a replica lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Identity the record was written with.
    pub identity: SampleId,
    /// Timestamp the store holds for the record.
    pub stored_at: DateTime<Utc>,
}

/// Write side of the primary endpoint.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Writes `record`, returning once the primary acknowledged it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the primary is unreachable or refuses
    /// the write.
    async fn write(&self, record: &ProbeRecord) -> Result<(), StoreError>;
}

/// Read side of the replica endpoint.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Looks up the record tagged with `identity` written within the
    /// trailing `window`. Returns `Ok(None)` when it is not (yet) there.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query could not be answered.
    async fn lookup(
        &self,
        identity: &SampleId,
        window: Duration,
    ) -> Result<Option<StoredRecord>, StoreError>;
}
