use crate::dedup::KillStatus;
use crate::registry::{TrackedCharacter, TrackedSystem};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Well-known key namespaces.
///
/// Everything that is shared between components lives in the cache under one
/// of these, so the naming is centralised here rather than scattered through
/// format! calls.
pub mod keys {
    pub const SYSTEMS: &str = "map:systems";
    pub const CHARACTERS: &str = "map:characters";

    pub fn system(id: u32) -> String {
        format!("map:system:{id}")
    }

    pub fn character(id: u64) -> String {
        format!("map:character:{id}")
    }

    pub fn tracked_system(id: u32) -> String {
        format!("tracked:system:{id}")
    }

    pub fn tracked_character(id: u64) -> String {
        format!("tracked:character:{id}")
    }

    pub fn dedup(kind: &str, id: u64) -> String {
        format!("dedup:{kind}:{id}")
    }

    pub fn esi(resource: &str, id: &str) -> String {
        format!("esi:{resource}:{id}")
    }
}

/// Tagged value type for cache entries.
///
/// Downstream code only ever sees typed values; raw JSON is confined to the
/// ESI memoisation namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Systems(Vec<TrackedSystem>),
    Characters(Vec<TrackedCharacter>),
    System(TrackedSystem),
    Character(TrackedCharacter),
    Flag(bool),
    KillStatus(KillStatus),
    Json(serde_json::Value),
}

#[derive(Debug, Clone)]
struct Entry {
    value: CacheValue,
    inserted_at: Instant,
    ttl: Option<Duration>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.inserted_at) > ttl,
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub evictions: AtomicU64,
}

/// In-memory TTL key/value store shared by every component.
///
/// Keys are sharded over a fixed set of mutexes; `get_and_update` runs its
/// closure under the shard lock, which serialises concurrent writers for the
/// same key. Readers never observe a torn entry. TTLs are measured against a
/// monotonic clock; expired entries behave as absent and are evicted lazily
/// on read or in bulk by `prune`.
#[derive(Debug)]
pub struct Cache {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
    stats: CacheStats,
}

const DEFAULT_SHARDS: usize = 16;

impl Default for Cache {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl Cache {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self {
            shards,
            stats: CacheStats::default(),
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        &self.shards[self.shard_index(key)]
    }

    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let now = Instant::now();
        let mut shard = self.shard(key).lock().unwrap_or_else(|e| e.into_inner());
        match shard.get(key) {
            Some(entry) if entry.expired(now) => {
                shard.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: &str, value: CacheValue, ttl: Option<Duration>) {
        let mut shard = self.shard(key).lock().unwrap_or_else(|e| e.into_inner());
        shard.insert(
            key.to_string(),
            Entry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(&self, key: &str, value: CacheValue, ttl: Duration) {
        self.put(key, value, Some(ttl));
    }

    #[allow(dead_code)]
    pub fn delete(&self, key: &str) -> bool {
        let mut shard = self.shard(key).lock().unwrap_or_else(|e| e.into_inner());
        shard.remove(key).is_some()
    }

    /// Atomic read-modify-write for a single key.
    ///
    /// The closure sees the current live value (expired entries appear as
    /// `None`) and returns the replacement plus a result passed back to the
    /// caller. Returning `None` deletes the key. An entry created by the
    /// closure gets `insert_ttl`; an entry that already existed keeps its
    /// original `inserted_at` and TTL, so updates do not stretch the window.
    ///
    /// Mutations that span several keys go through `get_and_update_many`
    /// instead.
    pub fn get_and_update<R>(
        &self,
        key: &str,
        insert_ttl: Option<Duration>,
        f: impl FnOnce(Option<CacheValue>) -> (Option<CacheValue>, R),
    ) -> R {
        let now = Instant::now();
        let mut shard = self.shard(key).lock().unwrap_or_else(|e| e.into_inner());

        let previous = match shard.get(key) {
            Some(entry) if entry.expired(now) => {
                shard.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => Some((entry.value.clone(), entry.inserted_at, entry.ttl)),
            None => None,
        };

        let (current, kept_at, kept_ttl) = match previous {
            Some((v, at, ttl)) => (Some(v), Some(at), ttl),
            None => (None, None, insert_ttl),
        };

        let (next, result) = f(current);
        match next {
            Some(value) => {
                shard.insert(
                    key.to_string(),
                    Entry {
                        value,
                        inserted_at: kept_at.unwrap_or(now),
                        ttl: kept_ttl,
                    },
                );
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                shard.remove(key);
            }
        }
        result
    }

    /// Atomic read-modify-write across a fixed set of keys.
    ///
    /// Every shard any of the keys hashes to stays locked for the duration
    /// of the closure; shards are acquired in index order, so concurrent
    /// multi-key updates cannot deadlock against each other or against the
    /// single-key operations. The closure sees the current live values
    /// positionally and edits them in place: `Some` writes, `None` deletes.
    /// Existing entries keep their `inserted_at` and TTL; entries created
    /// here are persistent.
    ///
    /// This is the sole safe primitive for dual-index maintenance: the
    /// registry's collection, per-entity and presence keys change together
    /// or not at all.
    pub fn get_and_update_many<R>(
        &self,
        keys: &[&str],
        f: impl FnOnce(&mut Vec<Option<CacheValue>>) -> R,
    ) -> R {
        let now = Instant::now();
        let indices: Vec<usize> = keys.iter().map(|k| self.shard_index(k)).collect();
        let mut order = indices.clone();
        order.sort_unstable();
        order.dedup();

        let mut guards: HashMap<usize, std::sync::MutexGuard<'_, HashMap<String, Entry>>> =
            HashMap::with_capacity(order.len());
        for idx in order {
            guards.insert(
                idx,
                self.shards[idx].lock().unwrap_or_else(|e| e.into_inner()),
            );
        }

        let mut meta: Vec<Option<(Instant, Option<Duration>)>> = vec![None; keys.len()];
        let mut values: Vec<Option<CacheValue>> = Vec::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            let shard = guards
                .get_mut(&indices[i])
                .expect("shard locked for every key");
            let value = match shard.get(*key) {
                Some(entry) if entry.expired(now) => {
                    shard.remove(*key);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Some(entry) => {
                    meta[i] = Some((entry.inserted_at, entry.ttl));
                    Some(entry.value.clone())
                }
                None => None,
            };
            values.push(value);
        }

        let result = f(&mut values);

        for (i, key) in keys.iter().enumerate() {
            let shard = guards
                .get_mut(&indices[i])
                .expect("shard locked for every key");
            match values[i].take() {
                Some(value) => {
                    let (inserted_at, ttl) = meta[i].unwrap_or((now, None));
                    shard.insert(
                        key.to_string(),
                        Entry {
                            value,
                            inserted_at,
                            ttl,
                        },
                    );
                    self.stats.writes.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    shard.remove(*key);
                }
            }
        }
        result
    }

    /// Drop every expired entry. Returns how many were evicted.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0usize;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            let before = shard.len();
            shard.retain(|_, entry| !entry.expired(now));
            evicted += before - shard.len();
        }
        if evicted > 0 {
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
