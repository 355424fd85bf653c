//! TTL cache shared by every action's cached-request steps.
//!
//! The cache is injected into the [`crate::destination::Destination`]s at
//! start-up; tests swap the clock for a [`ManualClock`] to step past a TTL
//! without sleeping.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A keyed store whose entries expire.
pub trait Cache: Send + Sync {
    /// The live value for `key`. Expired entries read as absent.
    fn get(&self, key: &str) -> Option<Value>;

    /// Store `value` for `ttl`, replacing any previous entry.
    fn set(&self, key: &str, value: Value, ttl: Duration);
}

/// Source of monotonic time for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

/// In-process cache backed by a concurrent map. Last write wins.
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of stored entries, including ones that expired but were not
    /// read since.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        // Expired: remove unless someone rewrote it meanwhile.
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }
}

/// Qualify a step key with its destination, action and target field so two
/// actions sharing a business key never collide.
pub fn qualified_key(destination: &str, action: &str, field: &str, key: &str) -> String {
    format!("{}:{}:{}:{}", destination, action, field, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_set() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("a"), None);

        cache.set("a", json!(1), Duration::from_secs(60));
        assert_eq!(cache.get("a"), Some(json!(1)));

        cache.set("a", json!(2), Duration::from_secs(60));
        assert_eq!(cache.get("a"), Some(json!(2)));
    }

    #[test]
    fn test_expiry() {
        let clock = Arc::new(ManualClock::new());
        let cache = MemoryCache::with_clock(clock.clone());

        cache.set("person", json!(42), Duration::from_secs(60));
        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get("person"), Some(json!(42)));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("person"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let clock = Arc::new(ManualClock::new());
        let cache = MemoryCache::with_clock(clock.clone());

        cache.set("short", json!(1), Duration::from_secs(1));
        cache.set("long", json!(2), Duration::from_secs(100));
        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.purge_expired(), 1);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("long"), Some(json!(2)));
    }

    #[test]
    fn test_qualified_key() {
        assert_eq!(
            qualified_key("pipedrive", "createUpdatePerson", "personId", "ada@example.com"),
            "pipedrive:createUpdatePerson:personId:ada@example.com"
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let cache = Arc::new(MemoryCache::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache.set(&format!("k{}", i % 4), json!(i), Duration::from_secs(60));
                    cache.get(&format!("k{}", i % 4))
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }
        assert_eq!(cache.len(), 4);
    }
}
