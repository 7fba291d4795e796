//! Token bucket configuration, state and refill arithmetic.

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

/// An axis along which requests are limited.
///
/// The derived ordering is the fixed order in which buckets of one request are
/// visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Dimension {
    /// One shared bucket, no identifier.
    Global,
    /// Caller IP address.
    Ip,
    /// Submitted email address.
    Email,
    /// Okta user identifier.
    OktaIdentifier,
    /// Hash of the bearer access token.
    AccessToken,
}

impl Dimension {
    /// All dimensions in visiting order.
    pub const ALL: [Dimension; 5] = [
        Dimension::Global,
        Dimension::Ip,
        Dimension::Email,
        Dimension::OktaIdentifier,
        Dimension::AccessToken,
    ];

    /// Name used in logs and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Global => "global",
            Dimension::Ip => "ip",
            Dimension::Email => "email",
            Dimension::OktaIdentifier => "oktaIdentifier",
            Dimension::AccessToken => "accessToken",
        }
    }

    /// Key of this dimension's bucket in the configuration document.
    pub fn document_key(&self) -> &'static str {
        match self {
            Dimension::Global => "globalBucket",
            Dimension::Ip => "ipBucket",
            Dimension::Email => "emailBucket",
            Dimension::OktaIdentifier => "oktaIdentifierBucket",
            Dimension::AccessToken => "accessTokenBucket",
        }
    }

    /// Index into per-dimension arrays.
    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refill rule for one bucket.
///
/// Always complete and valid: both counts are non-zero by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketConfig {
    capacity: NonZeroU64,
    add_token_ms: NonZeroU64,
    maximum_time_before_token_expiry: Option<NonZeroU64>,
}

impl BucketConfig {
    /// Create a bucket rule with the default idle expiry.
    pub fn new(capacity: NonZeroU64, add_token_ms: NonZeroU64) -> Self {
        Self {
            capacity,
            add_token_ms,
            maximum_time_before_token_expiry: None,
        }
    }

    /// Create a bucket rule from plain integers, `None` if either is zero.
    pub fn try_new(capacity: u64, add_token_ms: u64) -> Option<Self> {
        Some(Self::new(
            NonZeroU64::new(capacity)?,
            NonZeroU64::new(add_token_ms)?,
        ))
    }

    /// Set an explicit idle expiry.
    pub fn with_expiry(mut self, expiry_ms: NonZeroU64) -> Self {
        self.maximum_time_before_token_expiry = Some(expiry_ms);
        self
    }

    /// Maximum number of tokens (burst size).
    pub fn capacity(&self) -> u64 {
        self.capacity.get()
    }

    /// Milliseconds needed to regenerate one token.
    pub fn add_token_ms(&self) -> u64 {
        self.add_token_ms.get()
    }

    /// The idle expiry as configured, if any.
    pub fn explicit_expiry_ms(&self) -> Option<u64> {
        self.maximum_time_before_token_expiry.map(NonZeroU64::get)
    }

    /// Time to refill completely from empty.
    pub fn full_refill_ms(&self) -> u64 {
        self.capacity().saturating_mul(self.add_token_ms())
    }

    /// Idle time after which the bucket's state is discarded.
    ///
    /// Defaults to the full refill time: a bucket idle that long would be
    /// full again anyway, so dropping it is unobservable.
    pub fn expiry_ms(&self) -> u64 {
        self.explicit_expiry_ms()
            .unwrap_or_else(|| self.full_refill_ms())
    }

    /// Whether idle eviction can reset this bucket before it has refilled.
    pub fn expires_before_full_refill(&self) -> bool {
        self.expiry_ms() < self.full_refill_ms()
    }
}

/// Runtime state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    tokens: u64,
    last_refill_at: u64,
}

impl BucketState {
    /// A full bucket as of `now_ms`.
    pub fn full(config: &BucketConfig, now_ms: u64) -> Self {
        Self {
            tokens: config.capacity(),
            last_refill_at: now_ms,
        }
    }

    /// Tokens currently held (as of the last refill).
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Timestamp the refill arithmetic is anchored to.
    pub fn last_refill_at(&self) -> u64 {
        self.last_refill_at
    }

    /// Whether this state has been idle longer than the bucket's expiry.
    pub fn is_expired(&self, config: &BucketConfig, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_refill_at) > config.expiry_ms()
    }

    /// Compute the refill as of `now_ms` without mutating anything.
    ///
    /// Only whole tokens are added and `last_refill_at` advances by exactly
    /// the time those tokens cost, so partial progress toward the next token
    /// carries over to the next call. A clock reading earlier than
    /// `last_refill_at` counts as zero elapsed time.
    pub fn refill(&self, config: &BucketConfig, now_ms: u64) -> Refill {
        let add_token_ms = config.add_token_ms();
        let elapsed = now_ms.saturating_sub(self.last_refill_at);
        let tokens_to_add = elapsed / add_token_ms;

        let tokens = self
            .tokens
            .saturating_add(tokens_to_add)
            .min(config.capacity());
        let last_refill_at = self.last_refill_at + tokens_to_add * add_token_ms;

        let since_refill = now_ms.saturating_sub(last_refill_at);
        let retry_after_ms = add_token_ms - since_refill % add_token_ms;

        Refill {
            tokens,
            last_refill_at,
            retry_after_ms,
        }
    }
}

/// Outcome of a lazy refill, not yet written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refill {
    tokens: u64,
    last_refill_at: u64,
    retry_after_ms: u64,
}

impl Refill {
    /// Tokens available after the refill.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Whether one request can be admitted.
    pub fn has_token(&self) -> bool {
        self.tokens >= 1
    }

    /// Time until the next token is generated, in `(0, add_token_ms]`.
    pub fn retry_after_ms(&self) -> u64 {
        self.retry_after_ms
    }

    /// State after consuming one token.
    pub fn consume(&self) -> BucketState {
        BucketState {
            tokens: self.tokens.saturating_sub(1),
            last_refill_at: self.last_refill_at,
        }
    }
}
