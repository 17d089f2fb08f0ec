//! Effective-Permission Cache: per-user memo of aggregator output.
//!
//! One `parking_lot::Mutex` guards an LRU map for the whole instance. The
//! lock is never held across a recompute: `get_or_compute` looks up under
//! the lock, computes unlocked, then re-locks to store. Two callers may
//! recompute the same user concurrently; the last write wins.
//!
//! Every invalidation bumps a generation counter. A result is only stored
//! if no invalidation happened while it was being computed, so a
//! computation that raced with a mutation is handed back to its caller but
//! never served to anyone else.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::types::{EffectivePermissionSet, UserId};

#[derive(Debug)]
struct CachedEntry {
    permissions: Arc<EffectivePermissionSet>,
    stored_at: Instant,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<UserId, CachedEntry>,
    generation: u64,
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[derive(Debug)]
pub struct PermissionCache {
    state: Mutex<CacheState>,
    enabled: bool,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl PermissionCache {
    /// Build a cache from config. A zero `max_entries` falls back to 1.
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                generation: 0,
            }),
            enabled: config.enabled,
            ttl: config.ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Return the cached set for `user`, or run `compute` and cache its
    /// result. Errors from `compute` are returned and nothing is cached.
    pub fn get_or_compute<E, F>(&self, user: &UserId, compute: F) -> Result<Arc<EffectivePermissionSet>, E>
    where
        F: FnOnce() -> Result<EffectivePermissionSet, E>,
    {
        if !self.enabled {
            return compute().map(Arc::new);
        }

        let generation = {
            let mut state = self.state.lock();
            let fresh = match state.entries.get(user) {
                Some(entry) if self.is_fresh(entry) => Some(Arc::clone(&entry.permissions)),
                _ => None,
            };
            if let Some(permissions) = fresh {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(user = %user, "permission cache hit");
                return Ok(permissions);
            }
            state.generation
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(user = %user, "permission cache miss");

        let permissions = Arc::new(compute()?);

        let mut state = self.state.lock();
        if state.generation == generation {
            state.entries.put(
                user.clone(),
                CachedEntry {
                    permissions: Arc::clone(&permissions),
                    stored_at: Instant::now(),
                },
            );
        } else {
            tracing::debug!(user = %user, "invalidated during recompute; result not cached");
        }
        Ok(permissions)
    }

    /// Drop the entry for `user`. No-op if absent.
    pub fn invalidate(&self, user: &UserId) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.entries.pop(user);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate_many<'a, I>(&self, users: I)
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        let mut state = self.state.lock();
        state.generation += 1;
        for user in users {
            state.entries.pop(user);
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate_all(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.entries.clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    fn is_fresh(&self, entry: &CachedEntry) -> bool {
        match self.ttl {
            Some(ttl) => entry.stored_at.elapsed() < ttl,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CapabilityId, CapabilityRecord};
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            enabled: true,
            max_entries,
            ttl_secs: None,
        }
    }

    fn set_with(capability: &str) -> EffectivePermissionSet {
        let mut set = EffectivePermissionSet::new();
        set.add_direct(&CapabilityRecord {
            id: CapabilityId::new(capability),
            name: capability.to_string(),
        });
        set
    }

    fn counting(calls: &AtomicUsize, capability: &str) -> Result<EffectivePermissionSet, Infallible> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(set_with(capability))
    }

    #[test]
    fn second_lookup_is_a_hit() {
        let cache = PermissionCache::new(&config(8));
        let user = UserId::new("u1");
        let calls = AtomicUsize::new(0);

        cache.get_or_compute(&user, || counting(&calls, "a")).unwrap();
        let again = cache.get_or_compute(&user, || counting(&calls, "b")).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(again.contains(&CapabilityId::new("a")));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn invalidate_forces_recompute() {
        let cache = PermissionCache::new(&config(8));
        let user = UserId::new("u1");
        let calls = AtomicUsize::new(0);

        cache.get_or_compute(&user, || counting(&calls, "a")).unwrap();
        cache.invalidate(&user);
        let fresh = cache.get_or_compute(&user, || counting(&calls, "b")).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(fresh.contains(&CapabilityId::new("b")));
    }

    #[test]
    fn invalidate_unknown_user_is_noop() {
        let cache = PermissionCache::new(&config(8));
        cache.invalidate(&UserId::new("nobody"));
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_all_clears_every_entry() {
        let cache = PermissionCache::new(&config(8));
        let calls = AtomicUsize::new(0);
        for id in ["u1", "u2", "u3"] {
            cache
                .get_or_compute(&UserId::new(id), || counting(&calls, id))
                .unwrap();
        }
        assert_eq!(cache.len(), 3);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_compute_is_not_cached() {
        let cache = PermissionCache::new(&config(8));
        let user = UserId::new("u1");

        let err = cache
            .get_or_compute(&user, || Err::<EffectivePermissionSet, &str>("store down"))
            .unwrap_err();
        assert_eq!(err, "store down");
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidation_during_compute_skips_store() {
        let cache = PermissionCache::new(&config(8));
        let user = UserId::new("u1");

        let result = cache
            .get_or_compute(&user, || {
                // A mutation lands while this (now stale) result is computed.
                cache.invalidate(&user);
                Ok::<_, Infallible>(set_with("stale"))
            })
            .unwrap();

        assert!(result.contains(&CapabilityId::new("stale")));
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_bounds_entries() {
        let cache = PermissionCache::new(&config(2));
        let calls = AtomicUsize::new(0);
        for id in ["u1", "u2", "u3"] {
            cache
                .get_or_compute(&UserId::new(id), || counting(&calls, id))
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
        // u1 was least recently used and got evicted.
        cache
            .get_or_compute(&UserId::new("u1"), || counting(&calls, "u1"))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn expired_entry_counts_as_miss() {
        let cache = PermissionCache::new(&CacheConfig {
            enabled: true,
            max_entries: 8,
            ttl_secs: Some(0),
        });
        let user = UserId::new("u1");
        let calls = AtomicUsize::new(0);

        cache.get_or_compute(&user, || counting(&calls, "a")).unwrap();
        cache.get_or_compute(&user, || counting(&calls, "a")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn disabled_cache_always_computes() {
        let cache = PermissionCache::new(&CacheConfig {
            enabled: false,
            ..config(8)
        });
        let user = UserId::new("u1");
        let calls = AtomicUsize::new(0);

        cache.get_or_compute(&user, || counting(&calls, "a")).unwrap();
        cache.get_or_compute(&user, || counting(&calls, "a")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_users_compute_independently() {
        let cache = PermissionCache::new(&config(64));
        let calls = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for i in 0..8 {
                let cache = &cache;
                let calls = &calls;
                s.spawn(move || {
                    let user = UserId::new(format!("u{}", i));
                    for _ in 0..10 {
                        let set = cache
                            .get_or_compute(&user, || counting(calls, &format!("cap{}", i)))
                            .unwrap();
                        assert!(set.contains(&CapabilityId::new(format!("cap{}", i))));
                    }
                });
            }
        });

        assert_eq!(cache.len(), 8);
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }
}
