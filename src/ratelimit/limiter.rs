//! Decision engine: resolves a route's buckets and admits or denies requests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::backend::{BucketBackend, BucketRequest, Decision, DenyReason, StoreError};
use super::bucket::Dimension;
use super::clock::{Clock, MonotonicClock};
use super::identity::Identifiers;
use super::key::BucketKey;
use super::rules::{RateLimiterConfig, RouteId};
use super::store::BucketStore;

/// What to do when bucket state cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request and log the degradation.
    #[default]
    Open,
    /// Deny the request.
    Closed,
}

/// Default cap on how long a store outage is admitted through under
/// [`FailurePolicy::Open`].
pub const DEFAULT_FAIL_OPEN_MAX_OUTAGE_MS: u64 = 300_000;

/// Store failure handling for the decision engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterOptions {
    pub failure_policy: FailurePolicy,
    /// Under [`FailurePolicy::Open`], stop admitting once a continuous
    /// outage has lasted this long. `None` admits for as long as the outage
    /// lasts.
    pub fail_open_max_outage_ms: Option<u64>,
    /// Upper bound on one backend call.
    pub store_timeout: Option<Duration>,
    /// Retry hint given when a request is denied because of a store failure.
    pub store_retry_after_ms: u64,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Open,
            fail_open_max_outage_ms: Some(DEFAULT_FAIL_OPEN_MAX_OUTAGE_MS),
            store_timeout: None,
            store_retry_after_ms: 1000,
        }
    }
}

/// The currently published configuration.
struct Published {
    config: Arc<RateLimiterConfig>,
    generation: u64,
    loaded_at: DateTime<Utc>,
}

/// Multi-dimensional token-bucket rate limiter.
///
/// Thread-safe; share it behind an `Arc`. Configuration reloads replace the
/// whole tree at once, so a check sees either the old or the new config.
pub struct RateLimiter<B: BucketBackend = BucketStore> {
    backend: B,
    published: RwLock<Published>,
    clock: Arc<dyn Clock>,
    options: LimiterOptions,
    /// Start of the current run of store failures.
    outage_started_at: Mutex<Option<u64>>,
}

impl RateLimiter<BucketStore> {
    /// Create a limiter backed by an in-process [`BucketStore`].
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_backend(config, BucketStore::new())
    }
}

impl<B: BucketBackend> RateLimiter<B> {
    /// Create a limiter over any bucket backend.
    pub fn with_backend(config: RateLimiterConfig, backend: B) -> Self {
        Self {
            backend,
            published: RwLock::new(Published {
                config: Arc::new(config),
                generation: 1,
                loaded_at: Utc::now(),
            }),
            clock: Arc::new(MonotonicClock::new()),
            options: LimiterOptions::default(),
            outage_started_at: Mutex::new(None),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the store failure options.
    pub fn with_options(mut self, options: LimiterOptions) -> Self {
        self.options = options;
        self
    }

    /// The bucket backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Snapshot of the live configuration.
    pub fn config(&self) -> Arc<RateLimiterConfig> {
        Arc::clone(&self.published.read().config)
    }

    /// Number of configurations published so far, starting at 1.
    pub fn generation(&self) -> u64 {
        self.published.read().generation
    }

    /// Publish a new configuration. Live bucket state is kept.
    pub fn reload(&self, config: RateLimiterConfig) -> u64 {
        let mut published = self.published.write();
        published.config = Arc::new(config);
        published.generation += 1;
        published.loaded_at = Utc::now();

        info!(
            generation = published.generation,
            loaded_at = %published.loaded_at.to_rfc3339(),
            "Rate limiter configuration published"
        );
        published.generation
    }

    /// Decide whether a request to `route` may proceed.
    ///
    /// Every configured dimension the request carries an identifier for is
    /// checked, and `global` always is. The request is admitted only if every
    /// one of those buckets has a token; otherwise no bucket is charged.
    pub async fn check(&self, route: RouteId, identifiers: &Identifiers) -> Decision {
        let config = self.config();
        let resolved = config.resolve(route);

        if !resolved.enabled {
            trace!(route = %route, "Rate limiting disabled for route");
            return Decision::Allow;
        }

        let requests: Vec<BucketRequest> = resolved
            .buckets
            .iter()
            .filter_map(|bucket| {
                let identifier = match bucket.dimension {
                    Dimension::Global => "",
                    dimension => identifiers.get(dimension)?,
                };
                Some(BucketRequest {
                    key: BucketKey::new(bucket.dimension, identifier, bucket.scope),
                    config: bucket.config,
                })
            })
            .collect();

        let now_ms = self.clock.now_millis();

        trace!(
            route = %route,
            buckets = requests.len(),
            now_ms = now_ms,
            "Checking rate limit"
        );

        let decision = match self.acquire(&requests, now_ms).await {
            Ok(decision) => {
                self.end_outage();
                decision
            }
            Err(e) => self.on_store_failure(route, e, now_ms),
        };

        match decision {
            Decision::Allow => trace!(route = %route, "Request admitted"),
            Decision::Deny { retry_after_ms, reason } => debug!(
                route = %route,
                reason = ?reason,
                retry_after_ms = retry_after_ms,
                "Request denied"
            ),
        }

        decision
    }

    /// Remove idle buckets from the backend.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let config = self.config();
        let now_ms = self.clock.now_millis();
        self.backend.sweep(&config, now_ms).await
    }

    async fn acquire(&self, requests: &[BucketRequest], now_ms: u64) -> Result<Decision, StoreError> {
        match self.options.store_timeout {
            Some(limit) => tokio::time::timeout(limit, self.backend.try_acquire(requests, now_ms))
                .await
                .unwrap_or(Err(StoreError::Timeout(limit))),
            None => self.backend.try_acquire(requests, now_ms).await,
        }
    }

    fn end_outage(&self) {
        let mut outage = self.outage_started_at.lock();
        if let Some(started) = outage.take() {
            info!(
                outage_ms = self.clock.now_millis().saturating_sub(started),
                "Bucket store recovered"
            );
        }
    }

    fn on_store_failure(&self, route: RouteId, error: StoreError, now_ms: u64) -> Decision {
        let started = *self.outage_started_at.lock().get_or_insert(now_ms);
        let outage_ms = now_ms.saturating_sub(started);

        let deny = Decision::Deny {
            retry_after_ms: self.options.store_retry_after_ms,
            reason: DenyReason::StoreUnavailable,
        };

        match self.options.failure_policy {
            FailurePolicy::Closed => {
                warn!(route = %route, error = %error, "Bucket store failed, denying request");
                deny
            }
            FailurePolicy::Open => match self.options.fail_open_max_outage_ms {
                Some(max_ms) if outage_ms > max_ms => {
                    warn!(
                        route = %route,
                        error = %error,
                        outage_ms = outage_ms,
                        max_outage_ms = max_ms,
                        "Bucket store outage exceeded fail-open window, denying request"
                    );
                    deny
                }
                _ => {
                    warn!(
                        route = %route,
                        error = %error,
                        outage_ms = outage_ms,
                        "Bucket store failed, admitting request unchecked"
                    );
                    Decision::Allow
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{BucketConfig, BucketScope, ManualClock, RouteBucketsConfig};
    use async_trait::async_trait;
    use std::num::NonZeroU64;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn bucket(capacity: u64, add_token_ms: u64) -> BucketConfig {
        BucketConfig::try_new(capacity, add_token_ms).unwrap()
    }

    fn limiter(config: RateLimiterConfig) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let limiter = RateLimiter::new(config).with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    fn from_ip(ip: &str) -> Identifiers {
        Identifiers::new().with_ip(ip)
    }

    #[tokio::test]
    async fn test_burst_admission() {
        let (limiter, _clock) = limiter(RateLimiterConfig::new(bucket(5, 1000)));
        let ids = Identifiers::new();

        for _ in 0..5 {
            assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        }
        let denied = limiter.check(RouteId::SignIn, &ids).await;
        let retry = denied.retry_after_ms().unwrap();
        assert!(retry > 0 && retry <= 1000);
        assert_eq!(denied.limited_by(), Some(Dimension::Global));
    }

    #[tokio::test]
    async fn test_no_drift() {
        let (limiter, clock) = limiter(RateLimiterConfig::new(bucket(5, 1000)));
        let ids = Identifiers::new();
        let key = BucketKey::global(BucketScope::Default);

        for _ in 0..5 {
            limiter.check(RouteId::SignIn, &ids).await;
        }
        assert_eq!(limiter.backend().snapshot(&key).unwrap().tokens(), 0);

        clock.advance(2500);
        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());

        // Two tokens were added, one was spent.
        assert_eq!(limiter.backend().snapshot(&key).unwrap().tokens(), 1);
    }

    #[tokio::test]
    async fn test_all_dimensions_must_pass() {
        let config = RateLimiterConfig::new(bucket(1000, 10))
            .with_default_bucket(Dimension::Ip, bucket(1, 60_000));
        let (limiter, _clock) = limiter(config);
        let ids = from_ip("203.0.113.7");
        let global = BucketKey::global(BucketScope::Default);

        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        let before = limiter.backend().snapshot(&global).unwrap();

        let denied = limiter.check(RouteId::SignIn, &ids).await;
        assert_eq!(denied.limited_by(), Some(Dimension::Ip));
        assert_eq!(limiter.backend().snapshot(&global).unwrap(), before);

        // A different IP still gets through.
        assert!(limiter.check(RouteId::SignIn, &from_ip("203.0.113.8")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_dimension_without_identifier_is_skipped() {
        let config = RateLimiterConfig::new(bucket(100, 10))
            .with_default_bucket(Dimension::Email, bucket(1, 60_000));
        let (limiter, _clock) = limiter(config);

        for _ in 0..3 {
            assert!(limiter.check(RouteId::Register, &Identifiers::new()).await.is_allowed());
        }
        assert_eq!(limiter.backend().len(), 1);
    }

    #[tokio::test]
    async fn test_idle_eviction_restores_full_bucket() {
        let ip_bucket = bucket(3, 60_000).with_expiry(NonZeroU64::new(10_000).unwrap());
        let config = RateLimiterConfig::new(bucket(1000, 1))
            .with_default_bucket(Dimension::Ip, ip_bucket);
        let (limiter, clock) = limiter(config);
        let ids = from_ip("198.51.100.1");

        for _ in 0..3 {
            assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        }
        assert!(!limiter.check(RouteId::SignIn, &ids).await.is_allowed());

        clock.advance(10_001);
        for _ in 0..3 {
            assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        }
        assert!(!limiter.check(RouteId::SignIn, &ids).await.is_allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_admit_exactly_capacity() {
        let config = RateLimiterConfig::new(bucket(10_000, 1))
            .with_default_bucket(Dimension::Ip, bucket(17, 3_600_000));
        let (limiter, _clock) = limiter(config);
        let limiter = Arc::new(limiter);

        let tasks = (0..200).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .check(RouteId::SignIn, &Identifiers::new().with_ip("192.0.2.1"))
                    .await
            })
        });
        let results = futures::future::join_all(tasks).await;

        let allowed = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(Decision::is_allowed)
            .count();
        assert_eq!(allowed, 17);
    }

    #[tokio::test]
    async fn test_disabled_route_touches_nothing() {
        let config = RateLimiterConfig::new(bucket(1, 60_000))
            .with_route(RouteId::VerifyEmail, RouteBucketsConfig::new().with_enabled(false));
        let (limiter, _clock) = limiter(config);

        for _ in 0..10 {
            assert!(limiter.check(RouteId::VerifyEmail, &from_ip("10.1.1.1")).await.is_allowed());
        }
        assert!(limiter.backend().is_empty());
    }

    #[tokio::test]
    async fn test_globally_disabled() {
        let (limiter, _clock) = limiter(RateLimiterConfig::new(bucket(1, 60_000)).with_enabled(false));
        for _ in 0..5 {
            assert!(limiter.check(RouteId::SignIn, &Identifiers::new()).await.is_allowed());
        }
        assert!(limiter.backend().is_empty());
    }

    #[tokio::test]
    async fn test_inherited_bucket_shared_across_routes() {
        let config = RateLimiterConfig::new(bucket(1000, 1))
            .with_default_bucket(Dimension::Ip, bucket(2, 60_000))
            .with_route(
                RouteId::ResetPassword,
                RouteBucketsConfig::new().with_bucket(Dimension::Ip, bucket(1, 60_000)),
            );
        let (limiter, _clock) = limiter(config);
        let ids = from_ip("10.9.9.9");

        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        assert!(limiter.check(RouteId::Register, &ids).await.is_allowed());
        // The default IP bucket is shared and now empty.
        assert!(!limiter.check(RouteId::SignIn, &ids).await.is_allowed());

        // The override has its own namespace.
        assert!(limiter.check(RouteId::ResetPassword, &ids).await.is_allowed());
        assert!(!limiter.check(RouteId::ResetPassword, &ids).await.is_allowed());
    }

    #[tokio::test]
    async fn test_reload_swaps_config() {
        let (limiter, _clock) = limiter(RateLimiterConfig::new(bucket(1, 60_000)));
        let ids = Identifiers::new();
        assert_eq!(limiter.generation(), 1);

        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        assert!(!limiter.check(RouteId::SignIn, &ids).await.is_allowed());

        let generation = limiter.reload(RateLimiterConfig::new(bucket(1, 60_000)).with_enabled(false));
        assert_eq!(generation, 2);
        assert!(!limiter.config().enabled());
        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
    }

    #[tokio::test]
    async fn test_sweep_uses_engine_clock() {
        let config = RateLimiterConfig::new(bucket(1000, 1))
            .with_default_bucket(Dimension::Ip, bucket(2, 1000));
        let (limiter, clock) = limiter(config);

        limiter.check(RouteId::SignIn, &from_ip("10.0.0.1")).await;
        assert_eq!(limiter.backend().len(), 2);

        clock.advance(1001);
        assert_eq!(limiter.sweep().await, Ok(1));
        assert_eq!(limiter.backend().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_follows_reloaded_expiry() {
        let with_ip_expiry = |expiry_ms: u64| {
            RateLimiterConfig::new(bucket(1000, 60_000)).with_default_bucket(
                Dimension::Ip,
                bucket(2, 60_000).with_expiry(NonZeroU64::new(expiry_ms).unwrap()),
            )
        };
        let (limiter, clock) = limiter(with_ip_expiry(1000));
        let ids = from_ip("10.0.0.1");

        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        assert!(!limiter.check(RouteId::SignIn, &ids).await.is_allowed());

        limiter.reload(with_ip_expiry(3_600_000));
        clock.advance(1500);

        // The exhausted bucket is kept under the new expiry, by the sweep as
        // well as by the inline check.
        assert_eq!(limiter.sweep().await, Ok(0));
        assert!(!limiter.check(RouteId::SignIn, &ids).await.is_allowed());
    }

    /// Backend that can be switched into failure, or made to hang.
    #[derive(Default)]
    struct FlakyBackend {
        failing: AtomicBool,
        hanging: AtomicBool,
        inner: BucketStore,
    }

    #[async_trait]
    impl BucketBackend for FlakyBackend {
        async fn try_acquire(
            &self,
            requests: &[BucketRequest],
            now_ms: u64,
        ) -> Result<Decision, StoreError> {
            if self.hanging.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.try_acquire(requests, now_ms).await
        }

        async fn sweep(&self, config: &RateLimiterConfig, now_ms: u64) -> Result<usize, StoreError> {
            self.inner.sweep(config, now_ms).await
        }
    }

    fn flaky(options: LimiterOptions) -> (RateLimiter<FlakyBackend>, ManualClock) {
        let clock = ManualClock::new(0);
        let limiter = RateLimiter::with_backend(RateLimiterConfig::new(bucket(1, 60_000)), FlakyBackend::default())
            .with_clock(Arc::new(clock.clone()))
            .with_options(options);
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_fail_open() {
        let (limiter, _clock) = flaky(LimiterOptions::default());
        limiter.backend().failing.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            assert!(limiter.check(RouteId::SignIn, &Identifiers::new()).await.is_allowed());
        }
    }

    #[tokio::test]
    async fn test_fail_open_is_bounded_by_default() {
        let (limiter, clock) = flaky(LimiterOptions::default());
        let ids = Identifiers::new();
        limiter.backend().failing.store(true, Ordering::SeqCst);

        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        clock.advance(DEFAULT_FAIL_OPEN_MAX_OUTAGE_MS + 1);
        let decision = limiter.check(RouteId::SignIn, &ids).await;
        assert_eq!(
            decision,
            Decision::Deny {
                retry_after_ms: 1000,
                reason: DenyReason::StoreUnavailable
            }
        );
    }

    #[tokio::test]
    async fn test_fail_open_unbounded_window() {
        let (limiter, clock) = flaky(LimiterOptions {
            fail_open_max_outage_ms: None,
            ..LimiterOptions::default()
        });
        let ids = Identifiers::new();
        limiter.backend().failing.store(true, Ordering::SeqCst);

        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        clock.advance(24 * 3_600_000);
        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
    }

    #[tokio::test]
    async fn test_fail_closed() {
        let (limiter, _clock) = flaky(LimiterOptions {
            failure_policy: FailurePolicy::Closed,
            store_retry_after_ms: 2500,
            ..LimiterOptions::default()
        });
        limiter.backend().failing.store(true, Ordering::SeqCst);

        let decision = limiter.check(RouteId::SignIn, &Identifiers::new()).await;
        assert_eq!(
            decision,
            Decision::Deny {
                retry_after_ms: 2500,
                reason: DenyReason::StoreUnavailable
            }
        );
    }

    #[tokio::test]
    async fn test_fail_open_window_expires_and_resets() {
        let (limiter, clock) = flaky(LimiterOptions {
            fail_open_max_outage_ms: Some(30_000),
            ..LimiterOptions::default()
        });
        let ids = Identifiers::new();
        limiter.backend().failing.store(true, Ordering::SeqCst);

        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        clock.advance(30_000);
        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        clock.advance(1);
        assert!(!limiter.check(RouteId::SignIn, &ids).await.is_allowed());

        // Recovery ends the outage; the next failure starts a new window.
        limiter.backend().failing.store(false, Ordering::SeqCst);
        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
        limiter.backend().failing.store(true, Ordering::SeqCst);
        assert!(limiter.check(RouteId::SignIn, &ids).await.is_allowed());
    }

    #[tokio::test]
    async fn test_store_timeout_is_a_failure() {
        let (limiter, _clock) = flaky(LimiterOptions {
            failure_policy: FailurePolicy::Closed,
            store_timeout: Some(Duration::from_millis(20)),
            ..LimiterOptions::default()
        });
        limiter.backend().hanging.store(true, Ordering::SeqCst);

        let decision = limiter.check(RouteId::SignIn, &Identifiers::new()).await;
        assert!(!decision.is_allowed());
        assert_eq!(decision.limited_by(), None);
    }
}
