//! Token-bucket rate limiting: configuration, bucket state and admission decisions.

mod backend;
mod bucket;
mod clock;
mod identity;
mod key;
mod limiter;
mod rules;
mod store;

pub use backend::{BucketBackend, BucketRequest, Decision, DenyReason, StoreError};
pub use bucket::{BucketConfig, BucketState, Dimension, Refill};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use identity::{hash_access_token, normalize_email, Identifiers};
pub use key::BucketKey;
pub use limiter::{FailurePolicy, LimiterOptions, RateLimiter, DEFAULT_FAIL_OPEN_MAX_OUTAGE_MS};
pub use rules::{
    BucketScope, ConfigError, RateLimiterConfig, ResolvedBucket, ResolvedRoute, RouteBucketsConfig,
    RouteId, UnknownRoute, Violation,
};
pub use store::{BucketStore, DEFAULT_SHARD_COUNT};
