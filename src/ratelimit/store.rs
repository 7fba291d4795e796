//! In-process bucket storage with ordered shard locking and idle eviction.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::backend::{BucketBackend, BucketRequest, Decision, DenyReason, StoreError};
use super::bucket::{BucketConfig, BucketState, Dimension};
use super::key::BucketKey;
use super::rules::RateLimiterConfig;

/// Default number of lock shards.
pub const DEFAULT_SHARD_COUNT: usize = 64;

/// A stored bucket plus the expiry it was last written with. A sweep falls
/// back to it for keys the live configuration no longer has a rule for.
#[derive(Debug, Clone, Copy)]
struct Slot {
    state: BucketState,
    expiry_ms: u64,
}

impl Slot {
    fn fresh(config: &BucketConfig, now_ms: u64) -> Self {
        Self {
            state: BucketState::full(config, now_ms),
            expiry_ms: config.expiry_ms(),
        }
    }

    fn is_expired(&self, expiry_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.state.last_refill_at()) > expiry_ms
    }
}

type Shard = HashMap<BucketKey, Slot>;

/// Concurrency-safe map of live bucket state.
///
/// Keys are spread over a fixed number of mutex-guarded shards. A request that
/// touches several buckets locks every shard it needs in ascending shard
/// order before reading anything and holds them until it has committed, which
/// makes the check-then-consume atomic without risking lock-order deadlocks.
pub struct BucketStore {
    shards: Box<[Mutex<Shard>]>,
    hasher: RandomState,
}

impl BucketStore {
    /// Create a store with the default shard count.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT)
    }

    /// Create a store with `shard_count` shards (at least one).
    pub fn with_shards(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    /// Number of lock shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, key: &BucketKey) -> usize {
        (self.hasher.hash_one(key) % self.shards.len() as u64) as usize
    }

    /// Find the live state for `key`, creating a full bucket if there is none
    /// or the stored one has been idle past its expiry.
    fn get_or_create_in<'m>(
        shard: &'m mut Shard,
        key: &BucketKey,
        config: &BucketConfig,
        now_ms: u64,
    ) -> &'m mut Slot {
        let slot = shard.entry(key.clone()).or_insert_with(|| {
            trace!(key = %key, capacity = config.capacity(), "Creating bucket");
            Slot::fresh(config, now_ms)
        });
        if slot.state.is_expired(config, now_ms) {
            trace!(key = %key, "Replacing expired bucket");
            *slot = Slot::fresh(config, now_ms);
        }
        slot
    }

    /// Return the live state for `key`, creating it if needed.
    pub fn get_or_create(&self, key: &BucketKey, config: &BucketConfig, now_ms: u64) -> BucketState {
        let mut shard = self.shards[self.shard_index(key)].lock();
        Self::get_or_create_in(&mut shard, key, config, now_ms).state
    }

    /// Copy of the stored state for `key`, without refilling or creating it.
    pub fn snapshot(&self, key: &BucketKey) -> Option<BucketState> {
        let shard = self.shards[self.shard_index(key)].lock();
        shard.get(key).map(|slot| slot.state)
    }

    /// Atomically draw one token from every requested bucket, or from none.
    ///
    /// `requests` must name distinct keys.
    pub fn acquire(&self, requests: &[BucketRequest], now_ms: u64) -> Decision {
        let shard_ids: Vec<usize> = requests.iter().map(|r| self.shard_index(&r.key)).collect();

        let mut lock_order = shard_ids.clone();
        lock_order.sort_unstable();
        lock_order.dedup();

        let mut guards: Vec<MutexGuard<'_, Shard>> =
            lock_order.iter().map(|&i| self.shards[i].lock()).collect();
        let guard_of: Vec<usize> = shard_ids
            .iter()
            .map(|id| lock_order.partition_point(|locked| locked < id))
            .collect();

        // Peek: refill every bucket in memory, write nothing back yet.
        let mut refills = Vec::with_capacity(requests.len());
        let mut denial: Option<(u64, Dimension)> = None;
        for (request, &guard) in requests.iter().zip(&guard_of) {
            let slot = Self::get_or_create_in(&mut guards[guard], &request.key, &request.config, now_ms);
            let refill = slot.state.refill(&request.config, now_ms);

            if !refill.has_token() {
                let candidate = (refill.retry_after_ms(), request.key.dimension);
                denial = match denial {
                    Some(current) if current.0 <= candidate.0 => Some(current),
                    _ => Some(candidate),
                };
            }
            refills.push(refill);
        }

        if let Some((retry_after_ms, dimension)) = denial {
            debug!(
                dimension = %dimension,
                retry_after_ms = retry_after_ms,
                buckets = requests.len(),
                "Bucket exhausted, nothing consumed"
            );
            return Decision::Deny {
                retry_after_ms,
                reason: DenyReason::Exhausted(dimension),
            };
        }

        // Commit: every bucket passed, consume one token from each.
        for ((request, &guard), refill) in requests.iter().zip(&guard_of).zip(&refills) {
            if let Some(slot) = guards[guard].get_mut(&request.key) {
                slot.state = refill.consume();
                slot.expiry_ms = request.config.expiry_ms();
            }
        }

        Decision::Allow
    }

    /// Remove every bucket idle past its expiry. Returns how many were removed.
    ///
    /// `expiry_of` gives the current expiry for a key; keys it returns `None`
    /// for are judged by the expiry they were last written with.
    pub fn sweep_expired<F>(&self, now_ms: u64, expiry_of: F) -> usize
    where
        F: Fn(&BucketKey) -> Option<u64>,
    {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|key, slot| {
                let expiry_ms = expiry_of(key).unwrap_or(slot.expiry_ms);
                !slot.is_expired(expiry_ms, now_ms)
            });
            removed += before - shard.len();
        }
        if removed > 0 {
            debug!(removed = removed, "Swept idle buckets");
        }
        removed
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all bucket state.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }
}

impl Default for BucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStore")
            .field("shards", &self.shards.len())
            .finish()
    }
}

#[async_trait]
impl BucketBackend for BucketStore {
    async fn try_acquire(
        &self,
        requests: &[BucketRequest],
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        Ok(self.acquire(requests, now_ms))
    }

    async fn sweep(&self, config: &RateLimiterConfig, now_ms: u64) -> Result<usize, StoreError> {
        Ok(self.sweep_expired(now_ms, |key| {
            config
                .bucket_in_scope(key.scope, key.dimension)
                .map(BucketConfig::expiry_ms)
        }))
    }
}
