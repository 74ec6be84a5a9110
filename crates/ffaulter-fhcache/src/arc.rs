//! Typed adaptive-replacement cache with per-entry TTL and eviction hook.
//!
//! Implements the ARC algorithm (Megiddo & Modha, FAST '03): two resident
//! lists (T1 recency, T2 frequency), two ghost lists of bare keys (B1,
//! B2), and an adaptive target `p` tuned by ghost hits. The cache is
//! parametric over `(K, V)`, so the loader and the eviction hook receive
//! typed references and no dynamic-cast failure path exists.
//!
//! Behavior specific to a file-handle cache:
//!
//! - The loader runs under the cache lock and must be cheap: it constructs
//!   an unopened value, it never performs I/O.
//! - Each resident entry carries a TTL **fixed at insert** (a hit does not
//!   refresh it). Expiry is detected lazily on the next lookup of the key
//!   and the entry is dropped without leaving a ghost.
//! - The eviction hook runs *after* the internal mutex is released, so a
//!   hook that blocks (waiting out an in-flight reader, say) stalls only
//!   the evicting caller, never the cache.
//!
//! # Concurrency
//!
//! All mutable state sits behind one [`parking_lot::Mutex`]; critical
//! sections cover metadata updates only.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use ffaulter_observability::CacheCounters;
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Slab-backed doubly-linked list
// ---------------------------------------------------------------------------

/// Index into the slab. Stable for the lifetime of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotIdx(u32);

#[derive(Debug)]
struct SlabNode<T> {
    value: T,
    prev: Option<SlotIdx>,
    next: Option<SlotIdx>,
}

/// Doubly-linked LRU list over a slab of slots: O(1) push/pop/remove/touch
/// with index links instead of pointers. Head is the LRU end, tail the
/// MRU end. Vacated slots are recycled through a free list.
#[derive(Debug)]
struct SlabList<T> {
    slots: Vec<Option<SlabNode<T>>>,
    free: Vec<u32>,
    head: Option<SlotIdx>,
    tail: Option<SlotIdx>,
    len: usize,
}

impl<T> SlabList<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append at the MRU end, returning the node's stable index.
    fn push_back(&mut self, value: T) -> SlotIdx {
        let idx = self.alloc(value);
        if let Some(old_tail) = self.tail {
            self.node_mut(old_tail).next = Some(idx);
            self.node_mut(idx).prev = Some(old_tail);
        } else {
            self.head = Some(idx);
        }
        self.tail = Some(idx);
        self.len += 1;
        idx
    }

    /// Detach and return the LRU value.
    fn pop_front(&mut self) -> Option<T> {
        let head = self.head?;
        Some(self.remove(head))
    }

    /// Unlink the node at `idx` and return its value.
    fn remove(&mut self, idx: SlotIdx) -> T {
        let node = self.slots[idx.0 as usize]
            .take()
            .expect("SlabList::remove on vacant slot");

        match (node.prev, node.next) {
            (Some(p), Some(n)) => {
                self.node_mut(p).next = Some(n);
                self.node_mut(n).prev = Some(p);
            }
            (None, Some(n)) => {
                self.node_mut(n).prev = None;
                self.head = Some(n);
            }
            (Some(p), None) => {
                self.node_mut(p).next = None;
                self.tail = Some(p);
            }
            (None, None) => {
                self.head = None;
                self.tail = None;
            }
        }

        self.free.push(idx.0);
        self.len -= 1;
        node.value
    }

    /// Move an existing node to the MRU end. Its index stays valid.
    fn touch(&mut self, idx: SlotIdx) {
        if self.tail == Some(idx) {
            return;
        }

        let (prev, next) = {
            let node = self.node_ref(idx);
            (node.prev, node.next)
        };
        match (prev, next) {
            (Some(p), Some(n)) => {
                self.node_mut(p).next = Some(n);
                self.node_mut(n).prev = Some(p);
            }
            (None, Some(n)) => {
                self.node_mut(n).prev = None;
                self.head = Some(n);
            }
            // Already the tail (or sole element); nothing to relink.
            _ => return,
        }

        let old_tail = self.tail;
        if let Some(t) = old_tail {
            self.node_mut(t).next = Some(idx);
        }
        let node = self.node_mut(idx);
        node.prev = old_tail;
        node.next = None;
        self.tail = Some(idx);
    }

    fn get(&self, idx: SlotIdx) -> Option<&T> {
        self.slots.get(idx.0 as usize)?.as_ref().map(|n| &n.value)
    }

    fn alloc(&mut self, value: T) -> SlotIdx {
        let node = SlabNode {
            value,
            prev: None,
            next: None,
        };
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(node);
            SlotIdx(slot)
        } else {
            let raw = u32::try_from(self.slots.len()).expect("slab overflow");
            self.slots.push(Some(node));
            SlotIdx(raw)
        }
    }

    #[inline]
    fn node_ref(&self, idx: SlotIdx) -> &SlabNode<T> {
        self.slots[idx.0 as usize].as_ref().expect("dangling SlotIdx")
    }

    #[inline]
    fn node_mut(&mut self, idx: SlotIdx) -> &mut SlabNode<T> {
        self.slots[idx.0 as usize].as_mut().expect("dangling SlotIdx")
    }
}

// ---------------------------------------------------------------------------
// ARC state
// ---------------------------------------------------------------------------

/// A resident cache entry with its insert-time expiry deadline.
#[derive(Debug)]
struct Resident<K, V> {
    key: K,
    value: V,
    expires_at: Instant,
}

/// Where a key currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    T1(SlotIdx),
    T2(SlotIdx),
    B1(SlotIdx),
    B2(SlotIdx),
}

/// Which resident list an eviction targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResidentList {
    T1,
    T2,
}

struct ArcState<K, V> {
    /// Recently admitted entries (recency-favoured).
    t1: SlabList<Resident<K, V>>,
    /// Re-referenced entries (frequency-favoured).
    t2: SlabList<Resident<K, V>>,
    /// Ghost keys evicted from T1.
    b1: SlabList<K>,
    /// Ghost keys evicted from T2.
    b2: SlabList<K>,
    /// Unified directory: key → location in one of the four lists.
    directory: HashMap<K, Location>,
    /// Adaptive target size for T1. Range `[0, capacity]`.
    p: usize,
    capacity: usize,
    ttl: Duration,

    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K, V> ArcState<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            t1: SlabList::new(),
            t2: SlabList::new(),
            b1: SlabList::new(),
            b2: SlabList::new(),
            directory: HashMap::with_capacity(capacity * 2),
            p: 0,
            capacity,
            ttl,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    #[inline]
    fn resident_len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    fn lookup_or_load<F>(
        &mut self,
        key: &K,
        loader: F,
        now: Instant,
        victims: &mut Vec<(K, V)>,
    ) -> V
    where
        F: FnOnce(&K) -> V,
    {
        match self.directory.get(key).copied() {
            Some(Location::T1(idx)) => {
                if self.is_expired(ResidentList::T1, idx, now) {
                    self.expire(ResidentList::T1, idx, victims);
                    self.load_on_miss(key, loader, now, victims)
                } else {
                    // Hit in T1: promote to T2 (recency → frequency).
                    let resident = self.t1.remove(idx);
                    let value = resident.value.clone();
                    let new_idx = self.t2.push_back(resident);
                    self.directory.insert(key.clone(), Location::T2(new_idx));
                    self.hits += 1;
                    value
                }
            }
            Some(Location::T2(idx)) => {
                if self.is_expired(ResidentList::T2, idx, now) {
                    self.expire(ResidentList::T2, idx, victims);
                    self.load_on_miss(key, loader, now, victims)
                } else {
                    // Hit in T2: refresh to the MRU position.
                    self.t2.touch(idx);
                    self.hits += 1;
                    self.t2
                        .get(idx)
                        .expect("touched node must be present")
                        .value
                        .clone()
                }
            }
            Some(Location::B1(idx)) => {
                // Ghost hit in B1: grow p (favour recency), re-admit to T2.
                let delta = std::cmp::max(self.b2.len() / std::cmp::max(self.b1.len(), 1), 1);
                self.p = std::cmp::min(self.capacity, self.p.saturating_add(delta));
                let ghost = self.b1.remove(idx);
                self.directory.remove(&ghost);
                self.admit_after_ghost(key, loader, now, false, victims)
            }
            Some(Location::B2(idx)) => {
                // Ghost hit in B2: shrink p (favour frequency), re-admit to T2.
                let delta = std::cmp::max(self.b1.len() / std::cmp::max(self.b2.len(), 1), 1);
                self.p = self.p.saturating_sub(delta);
                let ghost = self.b2.remove(idx);
                self.directory.remove(&ghost);
                self.admit_after_ghost(key, loader, now, true, victims)
            }
            None => self.load_on_miss(key, loader, now, victims),
        }
    }

    /// Complete miss: run the loader and admit into T1.
    fn load_on_miss<F>(&mut self, key: &K, loader: F, now: Instant, victims: &mut Vec<(K, V)>) -> V
    where
        F: FnOnce(&K) -> V,
    {
        self.misses += 1;
        let value = loader(key);
        self.make_room(false, victims);
        let idx = self.t1.push_back(Resident {
            key: key.clone(),
            value: value.clone(),
            expires_at: now + self.ttl,
        });
        self.directory.insert(key.clone(), Location::T1(idx));
        self.trim_ghosts();
        value
    }

    /// Ghost hit (the ghost is already removed): run the loader and admit
    /// into T2.
    fn admit_after_ghost<F>(
        &mut self,
        key: &K,
        loader: F,
        now: Instant,
        from_b2: bool,
        victims: &mut Vec<(K, V)>,
    ) -> V
    where
        F: FnOnce(&K) -> V,
    {
        self.misses += 1;
        let value = loader(key);
        self.make_room(from_b2, victims);
        let idx = self.t2.push_back(Resident {
            key: key.clone(),
            value: value.clone(),
            expires_at: now + self.ttl,
        });
        self.directory.insert(key.clone(), Location::T2(idx));
        self.trim_ghosts();
        value
    }

    /// ARC directory-room phase: bound |T1|+|B1| by capacity, the whole
    /// directory by 2·capacity, and evict one resident when the resident
    /// set is full.
    fn make_room(&mut self, from_b2: bool, victims: &mut Vec<(K, V)>) {
        let l1 = self.t1.len() + self.b1.len();
        if l1 >= self.capacity {
            if self.t1.len() < self.capacity {
                if let Some(ghost) = self.b1.pop_front() {
                    self.directory.remove(&ghost);
                }
                self.replace(from_b2, victims);
            } else {
                // T1 alone fills capacity: evict its LRU directly.
                self.evict_lru(ResidentList::T1, victims);
            }
        } else {
            let total = l1 + self.t2.len() + self.b2.len();
            if total >= self.capacity * 2 {
                if let Some(ghost) = self.b2.pop_front() {
                    self.directory.remove(&ghost);
                }
            }
            if self.resident_len() >= self.capacity {
                self.replace(from_b2, victims);
            }
        }
    }

    /// ARC REPLACE: pick the victim list by the adaptive target `p`.
    fn replace(&mut self, from_b2: bool, victims: &mut Vec<(K, V)>) {
        let t1_len = self.t1.len();
        let prefer_t1 = t1_len > 0 && (t1_len > self.p || (from_b2 && t1_len == self.p));
        if prefer_t1 {
            self.evict_lru(ResidentList::T1, victims);
        } else if !self.t2.is_empty() {
            self.evict_lru(ResidentList::T2, victims);
        } else if t1_len > 0 {
            self.evict_lru(ResidentList::T1, victims);
        }
    }

    /// Evict the LRU entry of one resident list, leaving a ghost behind.
    fn evict_lru(&mut self, list: ResidentList, victims: &mut Vec<(K, V)>) {
        let popped = match list {
            ResidentList::T1 => self.t1.pop_front(),
            ResidentList::T2 => self.t2.pop_front(),
        };
        let Some(resident) = popped else { return };

        self.directory.remove(&resident.key);
        let location = match list {
            ResidentList::T1 => Location::B1(self.b1.push_back(resident.key.clone())),
            ResidentList::T2 => Location::B2(self.b2.push_back(resident.key.clone())),
        };
        self.directory.insert(resident.key.clone(), location);
        self.evictions += 1;
        victims.push((resident.key, resident.value));
    }

    fn is_expired(&self, list: ResidentList, idx: SlotIdx, now: Instant) -> bool {
        let resident = match list {
            ResidentList::T1 => self.t1.get(idx),
            ResidentList::T2 => self.t2.get(idx),
        };
        resident
            .expect("directory points at vacant resident slot")
            .expires_at
            <= now
    }

    /// Drop an expired resident entry. Expired entries leave no ghost:
    /// their recency information is stale by definition.
    fn expire(&mut self, list: ResidentList, idx: SlotIdx, victims: &mut Vec<(K, V)>) {
        let resident = match list {
            ResidentList::T1 => self.t1.remove(idx),
            ResidentList::T2 => self.t2.remove(idx),
        };
        self.directory.remove(&resident.key);
        self.expirations += 1;
        victims.push((resident.key, resident.value));
    }

    fn trim_ghosts(&mut self) {
        while self.b1.len() > self.capacity {
            if let Some(ghost) = self.b1.pop_front() {
                self.directory.remove(&ghost);
            } else {
                break;
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(ghost) = self.b2.pop_front() {
                self.directory.remove(&ghost);
            } else {
                break;
            }
        }
    }

    /// Move every resident entry into `victims` and reset all lists.
    fn drain_all(&mut self, victims: &mut Vec<(K, V)>) {
        while let Some(resident) = self.t1.pop_front() {
            victims.push((resident.key, resident.value));
        }
        while let Some(resident) = self.t2.pop_front() {
            victims.push((resident.key, resident.value));
        }
        self.b1 = SlabList::new();
        self.b2 = SlabList::new();
        self.directory.clear();
        self.p = 0;
    }

    fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            size: self.resident_len(),
        }
    }
}

// ---------------------------------------------------------------------------
// ArcTtlCache — thread-safe wrapper
// ---------------------------------------------------------------------------

type EvictHook<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

/// Thread-safe ARC cache with TTL and an eviction hook.
///
/// See the module docs for policy details. `get_or_load` runs the loader
/// for a missing key while holding the cache lock, which is what makes
/// "at most one live value per key" hold without a separate in-flight
/// table; the hook for any entry displaced by the admission fires after
/// the lock is released.
pub struct ArcTtlCache<K, V> {
    state: Mutex<ArcState<K, V>>,
    evict_hook: EvictHook<K, V>,
}

impl<K, V> ArcTtlCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Create a cache bounded to `capacity` resident entries, each living
    /// at most `ttl` from its insert.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; the engine's config validation
    /// rejects that before construction.
    #[must_use]
    pub fn new(
        capacity: usize,
        ttl: Duration,
        evict_hook: impl Fn(&K, &V) + Send + Sync + 'static,
    ) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        Self {
            state: Mutex::new(ArcState::new(capacity, ttl)),
            evict_hook: Box::new(evict_hook),
        }
    }

    /// Return the resident value for `key`, running `loader` on a miss.
    ///
    /// The loader constructs the value only; it must not perform I/O.
    pub fn get_or_load(&self, key: &K, loader: impl FnOnce(&K) -> V) -> V {
        let mut victims = Vec::new();
        let value = {
            let mut state = self.state.lock();
            state.lookup_or_load(key, loader, Instant::now(), &mut victims)
        };
        for (victim_key, victim_value) in &victims {
            (self.evict_hook)(victim_key, victim_value);
        }
        value
    }

    /// Evict every resident entry, applying the eviction hook to each.
    pub fn purge(&self) {
        let mut victims = Vec::new();
        {
            let mut state = self.state.lock();
            state.drain_all(&mut victims);
        }
        for (victim_key, victim_value) in &victims {
            (self.evict_hook)(victim_key, victim_value);
        }
    }

    /// Number of resident entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().resident_len()
    }

    /// Returns `true` if no entries are resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of lookup and eviction counters.
    #[must_use]
    pub fn counters(&self) -> CacheCounters {
        self.state.lock().counters()
    }
}

impl<K, V> std::fmt::Debug for ArcTtlCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ArcTtlCache")
            .field("t1_len", &state.t1.len())
            .field("t2_len", &state.t2.len())
            .field("b1_len", &state.b1.len())
            .field("b2_len", &state.b2.len())
            .field("p", &state.p)
            .field("capacity", &state.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// A cache whose hook records evicted keys.
    fn recording_cache(
        capacity: usize,
        ttl: Duration,
    ) -> (ArcTtlCache<u32, u32>, Arc<Mutex<Vec<u32>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let hook_log = Arc::clone(&evicted);
        let cache = ArcTtlCache::new(capacity, ttl, move |key: &u32, _value: &u32| {
            hook_log.lock().push(*key);
        });
        (cache, evicted)
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn miss_then_hit_runs_loader_once() {
        let (cache, _evicted) = recording_cache(4, HOUR);
        let mut loads = 0;
        let v1 = cache.get_or_load(&7, |_| {
            loads += 1;
            70
        });
        let v2 = cache.get_or_load(&7, |_| {
            loads += 1;
            71
        });
        assert_eq!((v1, v2), (70, 70));
        assert_eq!(loads, 1);

        let counters = cache.counters();
        assert_eq!(counters.misses, 1);
        assert_eq!(counters.hits, 1);
        assert_eq!(counters.size, 1);
    }

    #[test]
    fn resident_count_never_exceeds_capacity() {
        let (cache, _evicted) = recording_cache(4, HOUR);
        for key in 0_u32..64 {
            cache.get_or_load(&key, |k| *k);
            assert!(cache.len() <= 4, "resident set exceeded capacity");
        }
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn eviction_fires_hook_with_displaced_key() {
        let (cache, evicted) = recording_cache(2, HOUR);
        cache.get_or_load(&1, |k| *k);
        cache.get_or_load(&2, |k| *k);
        assert!(evicted.lock().is_empty());

        cache.get_or_load(&3, |k| *k);
        // Both 1 and 2 sit in T1; its LRU end is the oldest admission.
        assert_eq!(evicted.lock().as_slice(), &[1]);
    }

    #[test]
    fn ghost_hit_readmits_to_frequency_list() {
        let (cache, _evicted) = recording_cache(2, HOUR);
        cache.get_or_load(&1, |k| *k);
        cache.get_or_load(&2, |k| *k);
        cache.get_or_load(&3, |k| *k); // evicts 1 into the B1 ghost list

        assert_eq!(cache.counters().evictions, 1);
        let mut loads = 0;
        cache.get_or_load(&1, |k| {
            loads += 1;
            *k
        });
        // The ghost hit still needs a reload; it is counted as a miss.
        assert_eq!(loads, 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn repeated_hits_prefer_frequent_keys() {
        let (cache, evicted) = recording_cache(2, HOUR);
        cache.get_or_load(&1, |k| *k);
        cache.get_or_load(&1, |k| *k); // promote 1 to T2
        cache.get_or_load(&2, |k| *k);
        cache.get_or_load(&3, |k| *k); // T1 victim should be 2, not 1

        assert_eq!(evicted.lock().as_slice(), &[2]);
        let mut loads = 0;
        cache.get_or_load(&1, |_| {
            loads += 1;
            0
        });
        assert_eq!(loads, 0, "frequent key was evicted");
    }

    #[test]
    fn expired_entry_reloads_and_counts_expiration() {
        let (cache, evicted) = recording_cache(4, Duration::from_millis(20));
        let mut loads = 0;
        cache.get_or_load(&9, |k| {
            loads += 1;
            *k
        });
        std::thread::sleep(Duration::from_millis(40));
        cache.get_or_load(&9, |k| {
            loads += 1;
            *k
        });

        assert_eq!(loads, 2);
        let counters = cache.counters();
        assert_eq!(counters.expirations, 1);
        assert_eq!(counters.misses, 2);
        // The expired entry went through the hook like any other eviction.
        assert_eq!(evicted.lock().as_slice(), &[9]);
    }

    #[test]
    fn untouched_entries_survive_within_ttl() {
        let (cache, _evicted) = recording_cache(4, HOUR);
        cache.get_or_load(&1, |k| *k);
        let mut loads = 0;
        cache.get_or_load(&1, |_| {
            loads += 1;
            0
        });
        assert_eq!(loads, 0);
    }

    #[test]
    fn purge_drains_everything_through_the_hook() {
        let (cache, evicted) = recording_cache(8, HOUR);
        for key in 0_u32..5 {
            cache.get_or_load(&key, |k| *k);
        }
        cache.purge();

        assert!(cache.is_empty());
        let mut log = evicted.lock().clone();
        log.sort_unstable();
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reload_after_purge_is_a_fresh_miss() {
        let (cache, _evicted) = recording_cache(4, HOUR);
        cache.get_or_load(&1, |k| *k);
        cache.purge();

        let mut loads = 0;
        cache.get_or_load(&1, |k| {
            loads += 1;
            *k
        });
        assert_eq!(loads, 1);
        assert_eq!(cache.counters().misses, 2);
    }

    #[test]
    fn capacity_one_thrash_is_bounded() {
        let (cache, evicted) = recording_cache(1, HOUR);
        for key in 0_u32..10 {
            cache.get_or_load(&key, |k| *k);
            assert_eq!(cache.len(), 1);
        }
        assert_eq!(evicted.lock().len(), 9);
    }
}
