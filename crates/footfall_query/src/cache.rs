//! Shared TTL cache for query results, bounded by LRU eviction.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;

/// blake3 digest of a method name and its canonical arguments.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn new<S: AsRef<str>>(method: &str, parts: &[S]) -> Self {
        let mut hasher = blake3::Hasher::new();
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        for part in std::iter::once(method).chain(parts.iter().map(AsRef::as_ref)) {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", blake3::Hash::from(self.0).to_hex())
    }
}

struct Entry {
    value: Value,
    inserted_at: Instant,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

pub struct QueryCache {
    ttl: Duration,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl QueryCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&self, key: CacheKey, value: Value) {
        self.insert_at(key, value, Instant::now())
    }

    fn get_at(&self, key: &CacheKey, now: Instant) -> Option<Value> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = match state.entries.get(key) {
            None => return None,
            Some(entry) => now.saturating_duration_since(entry.inserted_at) >= self.ttl,
        };
        if expired {
            state.entries.remove(key);
            return None;
        }
        let tick = state.tick();
        let entry = state.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    fn insert_at(&self, key: CacheKey, value: Value, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.entries.contains_key(&key) && state.entries.len() >= self.capacity {
            let ttl = self.ttl;
            state
                .entries
                .retain(|_, e| now.saturating_duration_since(e.inserted_at) < ttl);
            if state.entries.len() >= self.capacity {
                let oldest = state
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| *k);
                if let Some(oldest) = oldest {
                    state.entries.remove(&oldest);
                }
            }
        }
        let last_used = state.tick();
        state.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                last_used,
            },
        );
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = state.entries.len();
        state.entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(name: &str) -> CacheKey {
        CacheKey::new("metrics", &[name])
    }

    #[test]
    fn keys_depend_on_every_part() {
        assert_eq!(
            CacheKey::new("trend", &["day", "2024-01-10"]),
            CacheKey::new("trend", &["day", "2024-01-10"])
        );
        assert_ne!(
            CacheKey::new("trend", &["day", "2024-01-10"]),
            CacheKey::new("metrics", &["day", "2024-01-10"])
        );
        assert_ne!(
            CacheKey::new("trend", &["ab", "c"]),
            CacheKey::new("trend", &["a", "bc"])
        );
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = QueryCache::new(Duration::from_secs(1800), 8);
        let start = Instant::now();
        cache.insert_at(key("a"), json!(1), start);

        assert_eq!(
            cache.get_at(&key("a"), start + Duration::from_secs(1799)),
            Some(json!(1))
        );
        assert_eq!(cache.get_at(&key("a"), start + Duration::from_secs(1800)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = QueryCache::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        cache.insert_at(key("a"), json!("a"), now);
        cache.insert_at(key("b"), json!("b"), now);
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get_at(&key("a"), now).is_some());
        cache.insert_at(key("c"), json!("c"), now);

        assert_eq!(cache.len(), 2);
        assert!(cache.get_at(&key("a"), now).is_some());
        assert!(cache.get_at(&key("b"), now).is_none());
        assert!(cache.get_at(&key("c"), now).is_some());
    }

    #[test]
    fn overwrite_does_not_evict() {
        let cache = QueryCache::new(Duration::from_secs(60), 2);
        cache.insert(key("a"), json!(1));
        cache.insert(key("b"), json!(2));
        cache.insert(key("a"), json!(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("a")), Some(json!(3)));
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = QueryCache::new(Duration::from_secs(60), 4);
        cache.insert(key("a"), json!(1));
        cache.insert(key("b"), json!(2));
        assert_eq!(cache.clear(), 2);
        assert!(cache.get(&key("a")).is_none());
    }
}
