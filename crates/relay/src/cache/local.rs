// In-process L1 cache: bounded, per-entry TTL, least-recently-used eviction.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::Instant;

pub const DEFAULT_LOCAL_CAPACITY: usize = 10_000;
pub const DEFAULT_LOCAL_TTL: Duration = Duration::from_secs(5 * 60);

pub type LocalValue = Arc<dyn Any + Send + Sync>;

struct Entry {
    value: LocalValue,
    expires_at: Instant,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    // tick -> key; the smallest tick is the least recently used entry.
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.to_owned());
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
        }
    }
}

/// Opaque-value LRU shared by the redis-backed caches.
///
/// Values are stored type-erased; [`LocalCache::get`] downcasts and treats a
/// slot of the wrong concrete type as a miss.
pub struct LocalCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl LocalCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = if capacity == 0 { DEFAULT_LOCAL_CAPACITY } else { capacity };
        let ttl = if ttl.is_zero() { DEFAULT_LOCAL_TTL } else { ttl };
        Self { capacity, ttl, inner: Mutex::new(Inner::default()) }
    }

    pub fn get_raw(&self, key: &str) -> Option<LocalValue> {
        let mut inner = self.lock();
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => entry.expires_at <= Instant::now(),
        };
        if expired {
            inner.remove(key);
            return None;
        }

        inner.touch(key);
        inner.entries.get(key).map(|entry| Arc::clone(&entry.value))
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.get_raw(key)?.downcast_ref::<T>().cloned()
    }

    pub fn set<T>(&self, key: &str, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.set_raw(key, Arc::new(value));
    }

    /// Insert or refresh `key`, resetting its expiry and recency.
    pub fn set_raw(&self, key: &str, value: LocalValue) {
        if key.is_empty() {
            return;
        }

        let mut inner = self.lock();
        let expires_at = Instant::now() + self.ttl;
        let tick = inner.next_tick;
        inner.next_tick += 1;

        if let Some(previous) =
            inner.entries.insert(key.to_owned(), Entry { value, expires_at, tick })
        {
            inner.recency.remove(&previous.tick);
        }
        inner.recency.insert(tick, key.to_owned());

        while inner.entries.len() > self.capacity {
            let Some((_, oldest)) = inner.recency.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::LocalCache;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = LocalCache::new(10, Duration::from_secs(5));
        cache.set("k", String::from("v"));
        assert_eq!(cache.get::<String>("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get::<String>("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_refreshes_expiry() {
        let cache = LocalCache::new(10, Duration::from_secs(5));
        cache.set("k", 1_u32);
        tokio::time::advance(Duration::from_secs(4)).await;
        cache.set("k", 2_u32);
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(cache.get::<u32>("k"), Some(2));
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = LocalCache::new(2, Duration::from_secs(60));
        cache.set("a", 1_u32);
        cache.set("b", 2_u32);
        assert_eq!(cache.get::<u32>("a"), Some(1));

        cache.set("c", 3_u32);
        assert_eq!(cache.get::<u32>("b"), None);
        assert_eq!(cache.get::<u32>("a"), Some(1));
        assert_eq!(cache.get::<u32>("c"), Some(3));
    }

    #[test]
    fn wrong_type_is_a_miss_and_slot_stays_usable() {
        let cache = LocalCache::new(4, Duration::from_secs(60));
        cache.set("k", 42_u64);
        assert_eq!(cache.get::<String>("k"), None);

        cache.set("k", String::from("fixed"));
        assert_eq!(cache.get::<String>("k").as_deref(), Some("fixed"));
    }

    #[test]
    fn delete_and_empty_key() {
        let cache = LocalCache::new(4, Duration::from_secs(60));
        cache.set("", 1_u8);
        cache.set("k", 1_u8);
        cache.delete("k");
        assert_eq!(cache.len(), 0);
    }
}
