use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shared key-value cache tier with per-entry TTL. Sits between the
/// in-process LRU and the durable store; callers must tolerate misses.
pub struct TtlCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TtlCache {
    pub fn new() -> Self {
        TtlCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let live = entries
            .get(key)
            .map(|entry| (entry.expires_at > Instant::now()).then(|| entry.value.clone()));
        match live {
            Some(Some(value)) => Some(value),
            Some(None) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        // Opportunistic sweep so dead entries don't pile up.
        if entries.len() % 256 == 0 {
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
        }
    }

    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let cache = TtlCache::new();
        cache.set("k", "v", Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        cache.remove("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = TtlCache::new();
        cache.set("k", "v", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overwrite_refreshes_value() {
        let cache = TtlCache::new();
        cache.set("k", "v1", Duration::from_secs(60));
        cache.set("k", "v2", Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("v2"));
    }
}
