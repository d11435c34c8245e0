//! In-memory caches owned by the engine.
//!
//! Both structures are sharded maps so that unrelated keys never contend on a
//! single lock. [`TtlCache`] holds listings with last-known-good fallback;
//! [`Slots`] hands out one async mutex per key for callers that must hold the
//! key across a remote call (coalescing, start serialisation).

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lookup<V> {
    /// Entry younger than the TTL.
    Fresh(V),
    /// Entry older than the TTL; usable only as last-known-good fallback.
    Expired(V),
    /// No entry.
    Missing,
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Token taken before a remote read; a refresh is only stored if no
/// invalidation of the same key happened after the token was taken.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Epoch(u64);

/// Key → value cache with per-entry age and invalidation fencing.
pub(crate) struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    /// Clock value at which each key was last invalidated.
    fences: DashMap<K, (u64, Instant)>,
    clock: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            fences: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    /// Returns a token to pass to [`TtlCache::store`] after the remote read.
    pub fn epoch(&self) -> Epoch {
        Epoch(self.clock.load(Ordering::SeqCst))
    }

    pub fn lookup(&self, key: &K, ttl: Duration) -> Lookup<V> {
        match self.entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < ttl => Lookup::Fresh(entry.value.clone()),
            Some(entry) => Lookup::Expired(entry.value.clone()),
            None => Lookup::Missing,
        }
    }

    /// Stores `value` unless `key` was invalidated after `epoch` was taken.
    ///
    /// Returns `false` when the write was fenced off.
    pub fn store(&self, key: K, value: V, epoch: Epoch) -> bool {
        if let Some(fence) = self.fences.get(&key) {
            if fence.0 > epoch.0 {
                return false;
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
        true
    }

    pub fn invalidate(&self, key: &K) {
        let stamp = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.remove(key);
        self.fences.insert(key.clone(), (stamp, Instant::now()));
    }

    pub fn invalidate_where(&self, mut pred: impl FnMut(&K) -> bool) {
        let keys: Vec<K> = self
            .entries
            .iter()
            .filter(|e| pred(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.invalidate(&key);
        }
    }

    /// Drops entries and fences older than `retention`. Returns the number of
    /// entries dropped.
    pub fn sweep(&self, retention: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.stored_at.elapsed() < retention);
        self.fences.retain(|_, f| f.1.elapsed() < retention);
        before - self.entries.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One async mutex per key, created on first use.
pub(crate) struct Slots<K, S> {
    slots: DashMap<K, Arc<Mutex<S>>>,
}

impl<K, S> Slots<K, S>
where
    K: Eq + Hash + Clone,
    S: Default,
{
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Returns the slot for `key`, creating an empty one if needed.
    pub fn slot(&self, key: &K) -> Arc<Mutex<S>> {
        self.slots.entry(key.clone()).or_default().clone()
    }

    /// Detaches every slot whose key matches. A caller already holding a
    /// detached slot finishes against it; later callers get a fresh slot.
    pub fn remove_where(&self, mut pred: impl FnMut(&K) -> bool) {
        self.slots.retain(|k, _| !pred(k));
    }

    /// Drops idle slots for which `expired` returns `true`. Slots that are
    /// locked right now are kept.
    pub fn sweep(&self, mut expired: impl FnMut(&S) -> bool) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot.try_lock() {
            Ok(state) => !expired(&*state),
            Err(_) => true,
        });
        before - self.slots.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn entries_expire_but_remain_as_fallback() {
        let cache = TtlCache::new();
        cache.store("a", 1, cache.epoch());
        assert_eq!(cache.lookup(&"a", TTL), Lookup::Fresh(1));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.lookup(&"a", TTL), Lookup::Expired(1));
        assert_eq!(cache.lookup(&"b", TTL), Lookup::Missing);
    }

    #[tokio::test]
    async fn refresh_started_before_invalidation_is_discarded() {
        let cache = TtlCache::new();
        let epoch = cache.epoch();
        cache.invalidate(&"views");
        assert!(!cache.store("views", vec!["deleted"], epoch));
        assert_eq!(cache.lookup(&"views", TTL), Lookup::Missing);

        assert!(cache.store("views", vec!["current"], cache.epoch()));
    }

    #[tokio::test]
    async fn invalidate_where_only_touches_matching_keys() {
        let cache = TtlCache::new();
        cache.store((1, "x"), 10, cache.epoch());
        cache.store((1, "y"), 11, cache.epoch());
        cache.store((2, "x"), 20, cache.epoch());

        cache.invalidate_where(|(node, _)| *node == 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&(2, "x"), TTL), Lookup::Fresh(20));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_entries_past_retention() {
        let cache = TtlCache::new();
        cache.store("old", 1, cache.epoch());
        tokio::time::advance(Duration::from_secs(60)).await;
        cache.store("new", 2, cache.epoch());

        assert_eq!(cache.sweep(Duration::from_secs(30)), 1);
        assert_eq!(cache.lookup(&"new", TTL), Lookup::Fresh(2));
    }

    #[tokio::test]
    async fn slots_are_shared_per_key_and_locked_slots_survive_sweep() {
        let slots: Slots<&str, u32> = Slots::new();
        let a = slots.slot(&"a");
        assert!(Arc::ptr_eq(&a, &slots.slot(&"a")));
        slots.slot(&"b");

        let held = a.lock().await;
        assert_eq!(slots.sweep(|_| true), 1);
        assert_eq!(slots.len(), 1);
        drop(held);

        slots.remove_where(|k| *k == "a");
        assert_eq!(slots.len(), 0);
    }
}
