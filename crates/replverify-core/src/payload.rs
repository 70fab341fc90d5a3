//! Where sample payloads come from.
//!
//! Payload content does not affect verification; it only has to be a
//! realistic record for the store to accept. The CLI samples host
//! metrics, tests use [`FixedPayload`].

use async_trait::async_trait;

use crate::sample::Payload;

/// Produces the fields for the next write.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Returns the payload for the next sample.
    async fn next_payload(&self) -> Payload;
}

/// Returns the same payload every time.
#[derive(Debug, Clone)]
pub struct FixedPayload {
    payload: Payload,
}

impl FixedPayload {
    /// Wraps `payload`.
    #[must_use]
    pub const fn new(payload: Payload) -> Self {
        Self { payload }
    }
}

impl Default for FixedPayload {
    fn default() -> Self {
        Self::new(Payload::from([("probe".to_string(), 1.0)]))
    }
}

#[async_trait]
impl PayloadSource for FixedPayload {
    async fn next_payload(&self) -> Payload {
        self.payload.clone()
    }
}
