//! Storage seam between the decision engine and bucket state.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::bucket::{BucketConfig, Dimension};
use super::key::BucketKey;
use super::rules::RateLimiterConfig;

/// One bucket a request must draw a token from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRequest {
    pub key: BucketKey,
    pub config: BucketConfig,
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The bucket for this dimension had no token left.
    Exhausted(Dimension),
    /// Bucket state could not be reached and the policy is to fail closed.
    StoreUnavailable,
}

/// Admission outcome for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny {
        /// Milliseconds until a retry could succeed.
        retry_after_ms: u64,
        reason: DenyReason,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Retry hint, `None` when allowed.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Decision::Allow => None,
            Decision::Deny { retry_after_ms, .. } => Some(*retry_after_ms),
        }
    }

    /// The dimension whose bucket caused the denial, if any.
    pub fn limited_by(&self) -> Option<Dimension> {
        match self {
            Decision::Deny {
                reason: DenyReason::Exhausted(dimension),
                ..
            } => Some(*dimension),
            _ => None,
        }
    }
}

/// Failures of an externalized bucket store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("bucket store unavailable: {0}")]
    Unavailable(String),

    #[error("bucket store timed out after {0:?}")]
    Timeout(Duration),
}

/// Keyed bucket state with an atomic multi-bucket check-then-consume.
///
/// Implementations must treat one `try_acquire` call as a single transaction
/// over exactly the keys it names: either every bucket had a token and every
/// bucket is decremented, or nothing is written. Concurrent calls touching
/// overlapping keys must never both spend the same token.
#[async_trait]
pub trait BucketBackend: Send + Sync {
    /// Refill, check and (if all pass) consume one token from every bucket.
    ///
    /// A deny carries the smallest retry hint among the buckets that failed,
    /// attributed to the first failing dimension in visiting order when hints
    /// tie.
    async fn try_acquire(
        &self,
        requests: &[BucketRequest],
        now_ms: u64,
    ) -> Result<Decision, StoreError>;

    /// Drop every bucket idle longer than the expiry `config` currently gives
    /// it. Returns how many were removed.
    async fn sweep(&self, config: &RateLimiterConfig, now_ms: u64) -> Result<usize, StoreError>;
}
