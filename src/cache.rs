//! Memoization cache shared across pipeline runs.
//!
//! The [`Cache`] trait is the boundary; [`InMemoryCache`] is the in-process
//! backend (bounded, optional per-entry expiry, lock-sharded via `DashMap`).
//! Individual operations are atomic. Two callers racing on a check-then-set
//! may both compute and both `set`; the last write wins and the entry is
//! never torn.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// Default capacity of [`InMemoryCache`] and of the process-wide cache.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Cache key: an opaque string, usually a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Structured fingerprint: `namespace:model:sha256(content)`.
    ///
    /// Including the model id keeps entries from being served for a
    /// different embedding model.
    pub fn fingerprint(namespace: &str, model_id: &str, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        Self(format!("{}:{}:{:x}", namespace, model_id, hasher.finalize()))
    }

    /// Fingerprint for an embedding of `content` under `model_id`.
    pub fn embedding(model_id: &str, content: &str) -> Self {
        Self::fingerprint("emb", model_id, content)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheValue {
    /// An embedding vector.
    Embedding(Vec<f32>),
    /// Any other serializable payload.
    Json(Value),
}

impl CacheValue {
    pub fn as_embedding(&self) -> Option<&[f32]> {
        match self {
            CacheValue::Embedding(v) => Some(v),
            CacheValue::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            CacheValue::Json(v) => Some(v),
            CacheValue::Embedding(_) => None,
        }
    }
}

/// Key/value memoization store.
///
/// A `None` from [`get`](Self::get) is a normal miss. Implementations must be
/// safe to share across concurrent runs (`Arc<dyn Cache>`).
pub trait Cache: Send + Sync {
    /// Whether a live (non-expired) entry exists for `key`.
    fn exists(&self, key: &CacheKey) -> bool;

    /// Fetch a live entry.
    fn get(&self, key: &CacheKey) -> Option<Arc<CacheValue>>;

    /// Store a value, optionally expiring after `ttl`.
    fn set(&self, key: CacheKey, value: CacheValue, ttl: Option<Duration>);

    /// Drop an entry. Returns whether one was present.
    fn invalidate(&self, key: &CacheKey) -> bool;

    /// Drop every entry.
    fn clear(&self);
}

#[derive(Debug)]
struct Entry {
    value: Arc<CacheValue>,
    seq: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Hit/miss counters for [`InMemoryCache`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

/// Bounded in-process cache with optional expiry.
///
/// When full, expired entries are purged first; if none expired, the oldest
/// insertion is evicted. An overwrite counts as a new insertion. Under
/// concurrent inserts the size can briefly overshoot `max_entries` by the
/// number of racing writers.
#[derive(Debug)]
pub struct InMemoryCache {
    map: DashMap<CacheKey, Entry>,
    /// Insertion order as `(key, seq)`. Pairs whose seq no longer matches the
    /// map are stale and skipped. Always locked before touching `map`.
    order: Mutex<VecDeque<(CacheKey, u64)>>,
    next_seq: AtomicU64,
    max_entries: usize,
    default_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryCache {
    /// Create a cache holding at most `max_entries` (minimum 1).
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            map: DashMap::with_capacity(max_entries.min(1024)),
            order: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            max_entries,
            default_ttl: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Expiry applied when `set` is called without a ttl.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            entries: self.len(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.map.len())
    }

    fn make_room(&self) {
        if self.map.len() < self.max_entries {
            return;
        }
        if self.purge_expired() > 0 && self.map.len() < self.max_entries {
            return;
        }
        let mut order = self.order();
        while let Some((key, seq)) = order.pop_front() {
            if self.map.remove_if(&key, |_, e| e.seq == seq).is_some() {
                return;
            }
        }
    }

    fn order(&self) -> MutexGuard<'_, VecDeque<(CacheKey, u64)>> {
        self.order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_insertion(&self, key: CacheKey, seq: u64) {
        let mut order = self.order();
        order.push_back((key, seq));
        // Overwrites and invalidations leave stale pairs behind.
        if order.len() > 2 * self.max_entries + 16 {
            order.retain(|(k, s)| self.map.get(k).is_some_and(|e| e.seq == *s));
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl Cache for InMemoryCache {
    fn exists(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.map.get(key).is_some_and(|e| !e.is_expired(now))
    }

    fn get(&self, key: &CacheKey) -> Option<Arc<CacheValue>> {
        let now = Instant::now();
        let found = self
            .map
            .get(key)
            .and_then(|e| (!e.is_expired(now)).then(|| Arc::clone(&e.value)));
        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.map.remove_if(key, |_, e| e.is_expired(now));
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn set(&self, key: CacheKey, value: CacheValue, ttl: Option<Duration>) {
        if !self.map.contains_key(&key) {
            self.make_room();
        }
        let now = Instant::now();
        let ttl = ttl.or(self.default_ttl);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.map.insert(
            key.clone(),
            Entry {
                value: Arc::new(value),
                seq,
                expires_at: ttl.map(|t| now + t),
            },
        );
        self.record_insertion(key, seq);
    }

    fn invalidate(&self, key: &CacheKey) -> bool {
        self.map.remove(key).is_some()
    }

    fn clear(&self) {
        let mut order = self.order();
        order.clear();
        self.map.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

static SHARED: OnceLock<Arc<InMemoryCache>> = OnceLock::new();

/// The process-wide cache, created on first use.
///
/// Reset it with [`Cache::clear`]; it lives until process exit.
pub fn shared_cache() -> Arc<InMemoryCache> {
    Arc::clone(SHARED.get_or_init(|| Arc::new(InMemoryCache::default())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_roundtrip() {
        let cache = InMemoryCache::new(8);
        let key = CacheKey::from("k");
        cache.set(key.clone(), CacheValue::Embedding(vec![0.1, 0.2]), None);
        assert!(cache.exists(&key));
        let got = cache.get(&key).unwrap();
        assert_eq!(got.as_embedding(), Some(&[0.1f32, 0.2][..]));
    }

    #[test]
    fn test_miss_is_none() {
        let cache = InMemoryCache::new(8);
        assert!(cache.get(&CacheKey::from("absent")).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_invalidate() {
        let cache = InMemoryCache::new(8);
        let key = CacheKey::from("k");
        cache.set(key.clone(), CacheValue::Json(json!({"a": 1})), None);
        assert!(cache.invalidate(&key));
        assert!(!cache.exists(&key));
        assert!(!cache.invalidate(&key));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = InMemoryCache::new(8);
        let key = CacheKey::from("short");
        cache.set(key.clone(), CacheValue::Json(json!(1)), Some(Duration::from_millis(10)));
        assert!(cache.exists(&key));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!cache.exists(&key));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_default_ttl_applies() {
        let cache = InMemoryCache::new(8).with_default_ttl(Duration::from_millis(10));
        let key = CacheKey::from("k");
        cache.set(key.clone(), CacheValue::Json(json!(1)), None);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!cache.exists(&key));
    }

    #[test]
    fn test_bounded_evicts_oldest() {
        let cache = InMemoryCache::new(2);
        cache.set("a".into(), CacheValue::Json(json!(1)), None);
        cache.set("b".into(), CacheValue::Json(json!(2)), None);
        cache.set("c".into(), CacheValue::Json(json!(3)), None);
        assert_eq!(cache.len(), 2);
        assert!(!cache.exists(&"a".into()));
        assert!(cache.exists(&"b".into()));
        assert!(cache.exists(&"c".into()));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = InMemoryCache::new(2);
        cache.set("a".into(), CacheValue::Json(json!(1)), None);
        cache.set("b".into(), CacheValue::Json(json!(2)), None);
        cache.set("a".into(), CacheValue::Json(json!(10)), None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a".into()).unwrap().as_json(), Some(&json!(10)));
    }

    #[test]
    fn test_eviction_skips_overwritten_and_invalidated() {
        let cache = InMemoryCache::new(3);
        for key in ["a", "b", "c"] {
            cache.set(key.into(), CacheValue::Json(json!(key)), None);
        }
        // refreshes "a", so "b" is now the oldest
        cache.set("a".into(), CacheValue::Json(json!("a2")), None);
        cache.set("d".into(), CacheValue::Json(json!("d")), None);
        assert!(!cache.exists(&"b".into()));

        assert!(cache.invalidate(&"c".into()));
        cache.set("e".into(), CacheValue::Json(json!("e")), None);
        assert_eq!(cache.len(), 3);
        cache.set("f".into(), CacheValue::Json(json!("f")), None);

        let mut live: Vec<_> = ["a", "b", "c", "d", "e", "f"]
            .into_iter()
            .filter(|k| cache.exists(&(*k).into()))
            .collect();
        live.sort_unstable();
        assert_eq!(live, vec!["d", "e", "f"]);
    }

    #[test]
    fn test_order_queue_stays_bounded() {
        let cache = InMemoryCache::new(2);
        for i in 0..500 {
            cache.set("hot".into(), CacheValue::Json(json!(i)), None);
        }
        assert!(cache.order().len() <= 2 * 2 + 16);
        cache.clear();
        assert!(cache.order().is_empty());
    }

    #[test]
    fn test_fingerprint_depends_on_model() {
        let a = CacheKey::embedding("model-a", "hello");
        let b = CacheKey::embedding("model-b", "hello");
        let a2 = CacheKey::embedding("model-a", "hello");
        assert_ne!(a, b);
        assert_eq!(a, a2);
        assert!(a.as_str().starts_with("emb:model-a:"));
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = InMemoryCache::new(4);
        cache.set("k".into(), CacheValue::Json(json!(1)), None);
        cache.get(&"k".into());
        cache.get(&"missing".into());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_concurrent_writers_same_key() {
        let cache = Arc::new(InMemoryCache::new(16));
        let key = CacheKey::embedding("m", "same text");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let key = key.clone();
                std::thread::spawn(move || {
                    if !cache.exists(&key) {
                        cache.set(key, CacheValue::Embedding(vec![1.0, 2.0, 3.0]), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get(&key).unwrap().as_embedding(),
            Some(&[1.0f32, 2.0, 3.0][..])
        );
    }

    #[test]
    fn test_shared_cache_is_singleton() {
        let a = shared_cache();
        let b = shared_cache();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
