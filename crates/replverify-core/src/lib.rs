//! # replverify-core
//!
//! Replication consistency verification for primary/replica time-series
//! stores.
//!
//! A run writes a batch of uniquely tagged records to the primary, watches
//! the replica until each one shows up, and judges the result:
//!
//! - every write must become visible on the replica,
//! - within `max_lag` of the primary acknowledging it,
//! - in the same order the primary accepted the writes.
//!
//! ## Components
//!
//! - [`IdentityGenerator`]: unique, creation-ordered [`SampleId`]s
//! - [`WriteDriver`]: one bounded, unretried write per sample
//! - [`ReplicaObserver`]: fixed-interval point lookups until seen,
//!   deadline, or cancellation
//! - [`ConsistencyLedger`]: shared record of every sample's fate, plus
//!   ordering-violation detection
//! - [`VerificationEngine`]: the `Idle → Writing → Draining → Done` run
//!   state machine producing a [`RunReport`]
//!
//! The stores themselves sit behind [`PrimaryStore`] and [`ReplicaStore`];
//! [`store::influx`] talks to InfluxDB v2 over HTTP and [`store::memory`]
//! simulates a lagging replica for tests and dry runs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use replverify_core::{
//!     FixedPayload, RunConfig, SimulatedCluster, VerificationEngine,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), replverify_core::ConfigError> {
//! let cluster = SimulatedCluster::new(Duration::from_millis(50));
//! let config = RunConfig::new(
//!     3,
//!     Duration::from_secs(1),
//!     Duration::from_secs(2),
//!     Duration::from_millis(500),
//!     Duration::from_millis(200),
//!     4,
//! );
//! let mut engine = VerificationEngine::new(
//!     config,
//!     Arc::new(cluster.primary()),
//!     Arc::new(cluster.replica()),
//!     Arc::new(FixedPayload::default()),
//! )?;
//! let report = engine.run(CancellationToken::new()).await;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod driver;
pub mod engine;
pub mod identity;
pub mod ledger;
pub mod metrics;
pub mod observer;
pub mod payload;
pub mod report;
pub mod sample;
pub mod store;

pub use config::{ConfigError, EndpointConfig, ProbeConfig, RunConfig, VerifierConfig};
pub use driver::WriteDriver;
pub use engine::{RunPhase, VerificationEngine};
pub use identity::{IdentityGenerator, SampleId};
pub use ledger::{ConsistencyLedger, OrderingScan, OrderingViolation, scan_ordering};
pub use metrics::{MetricsError, PollOutcome, VerifierMetrics};
pub use observer::{Observation, ObserverConfig, ReplicaObserver};
pub use payload::{FixedPayload, PayloadSource};
pub use report::{LagStats, RunContext, RunReport, SampleRecord, StatusCounts};
pub use sample::{Payload, Sample, SampleStatus, TimeoutReason};
pub use store::{
    InfluxEndpoint, PrimaryStore, ProbeRecord, ReplicaStore, SimulatedCluster, StoreError,
    StoredRecord,
};
