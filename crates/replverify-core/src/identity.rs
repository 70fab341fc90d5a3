//! Sample identities.
//!
//! Every write issued during a run carries a [`SampleId`] that is unique
//! within the run and orders by creation. The textual form is what gets
//! stored as the `probe_id` tag on the primary, so the replica can be
//! queried for exactly one record.
//!
//! The text layout is `<seq:010>-<unix_millis>-<nonce:08x>`. The
//! zero-padded counter comes first, so lexical order of the text equals
//! creation order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Unique, creation-ordered token for one sample.
///
/// Ordering compares the logical counter first; the wall-clock part and
/// the nonce exist to keep tokens distinct across runs that share a
/// store. Serializes as its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SampleId {
    seq: u64,
    unix_millis: i64,
    nonce: u32,
}

impl SampleId {
    /// Logical position of this sample within its run (0-based).
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Wall-clock milliseconds at creation.
    #[must_use]
    pub const fn unix_millis(&self) -> i64 {
        self.unix_millis
    }

    /// Parses the textual form produced by [`fmt::Display`].
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.splitn(3, '-');
        let seq = parts.next()?;
        let unix_millis = parts.next()?;
        let nonce = parts.next()?;
        if seq.len() != 10 || nonce.len() != 8 {
            return None;
        }
        Some(Self {
            seq: seq.parse().ok()?,
            unix_millis: unix_millis.parse().ok()?,
            nonce: u32::from_str_radix(nonce, 16).ok()?,
        })
    }
}

impl PartialOrd for SampleId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SampleId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq
            .cmp(&other.seq)
            .then(self.unix_millis.cmp(&other.unix_millis))
            .then(self.nonce.cmp(&other.nonce))
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:010}-{}-{:08x}",
            self.seq, self.unix_millis, self.nonce
        )
    }
}

impl From<SampleId> for String {
    fn from(value: SampleId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for SampleId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("malformed sample identity `{value}`"))
    }
}

/// Hands out [`SampleId`]s for one run.
///
/// Safe to share across tasks: the counter is a single atomic, so two
/// concurrent calls can never observe the same sequence number.
#[derive(Debug, Default)]
pub struct IdentityGenerator {
    next_seq: AtomicU64,
}

impl IdentityGenerator {
    /// Creates a generator starting at sequence 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(0),
        }
    }

    /// Returns a fresh identity.
    pub fn next(&self) -> SampleId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        SampleId {
            seq,
            unix_millis: Utc::now().timestamp_millis(),
            nonce: rand::random(),
        }
    }

    /// Number of identities issued so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }
}
