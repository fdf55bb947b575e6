//! Per-transaction random cache.
//!
//! Template helpers memoize their generated values per transaction so that
//! every rendering within one transaction (the inbound response plus any
//! fan-out bodies, including late fan-out arriving on another listener with
//! the propagated `X-Transaction-ID`) observes identical randoms.
//!
//! Entries live for the request plus a bounded grace window, then a timer
//! task evicts them. Late readers after eviction fall back to fresh
//! generation.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Grace window before a transaction's cache is evicted.
const EVICTION_GRACE: Duration = Duration::from_secs(5 * 60);

/// Registry of per-transaction caches, keyed by transaction id.
pub struct RandomCaches {
    inner: RwLock<HashMap<String, Arc<TransactionCache>>>,
    grace: Duration,
}

impl RandomCaches {
    pub fn new() -> Arc<Self> {
        Self::with_grace(EVICTION_GRACE)
    }

    /// Registry with a custom grace window (tests use short windows).
    pub fn with_grace(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            grace,
        })
    }

    /// Fetch the cache for a transaction, creating it (and scheduling its
    /// eviction) on first access. Must be called from a tokio context.
    pub fn get_or_create(self: &Arc<Self>, transaction_id: &str) -> Arc<TransactionCache> {
        if let Some(cache) = self.inner.read().get(transaction_id) {
            return Arc::clone(cache);
        }

        let mut inner = self.inner.write();
        // A concurrent request for the same transaction may have won the race.
        if let Some(cache) = inner.get(transaction_id) {
            return Arc::clone(cache);
        }

        let cache = Arc::new(TransactionCache::default());
        inner.insert(transaction_id.to_string(), Arc::clone(&cache));
        drop(inner);

        let registry = Arc::clone(self);
        let id = transaction_id.to_string();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.inner.write().remove(&id);
        });

        cache
    }

    /// Number of live transaction caches.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Memoized values for one transaction.
///
/// `values` holds helper outputs keyed by generator + parameters
/// (e.g. `randInt_1_100`); `raw_bytes` holds deliberately malformed byte
/// sequences that cannot live in a `String` and are spliced into rendered
/// bodies after templating.
#[derive(Default)]
pub struct TransactionCache {
    values: RwLock<HashMap<String, Value>>,
    raw_bytes: RwLock<HashMap<String, Vec<u8>>>,
}

impl TransactionCache {
    /// Return the cached value for `key`, generating and storing it with
    /// `generate` on first use.
    pub fn get_or_insert_with<F>(&self, key: &str, generate: F) -> Value
    where
        F: FnOnce() -> Value,
    {
        if let Some(value) = self.values.read().get(key) {
            return value.clone();
        }
        let mut values = self.values.write();
        values
            .entry(key.to_string())
            .or_insert_with(generate)
            .clone()
    }

    /// Snapshot of all cached values, bound as `Random` in template contexts.
    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Store a raw byte sequence under a placeholder token.
    pub fn put_raw_bytes(&self, token: &str, bytes: Vec<u8>) {
        self.raw_bytes.write().insert(token.to_string(), bytes);
    }

    /// Fetch a raw byte sequence previously stored under `token`.
    pub fn raw_bytes(&self, token: &str) -> Option<Vec<u8>> {
        self.raw_bytes.read().get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_same_key_returns_cached_value() {
        let caches = RandomCaches::new();
        let cache = caches.get_or_create("txn-1");

        let first = cache.get_or_insert_with("randInt_1_100", || json!(42));
        let second = cache.get_or_insert_with("randInt_1_100", || json!(99));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_distinct_transactions_are_isolated() {
        let caches = RandomCaches::new();
        let a = caches.get_or_create("txn-a");
        let b = caches.get_or_create("txn-b");

        a.get_or_insert_with("randName", || json!("Kathryn Schmitt"));
        let fresh = b.get_or_insert_with("randName", || json!("John Smith"));
        assert_eq!(fresh, json!("John Smith"));
    }

    #[tokio::test]
    async fn test_same_transaction_shares_cache() {
        let caches = RandomCaches::new();
        let first = caches.get_or_create("txn-shared");
        first.get_or_insert_with("k", || json!(1));

        let second = caches.get_or_create("txn-shared");
        assert_eq!(second.get_or_insert_with("k", || json!(2)), json!(1));
    }

    #[tokio::test]
    async fn test_eviction_after_grace_window() {
        let caches = RandomCaches::with_grace(Duration::from_millis(20));
        caches.get_or_create("txn-short");
        assert_eq!(caches.len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(caches.is_empty());
    }

    #[tokio::test]
    async fn test_raw_bytes_round_trip() {
        let caches = RandomCaches::new();
        let cache = caches.get_or_create("txn-bytes");
        cache.put_raw_bytes("tok", vec![0xC0, 0x80]);
        assert_eq!(cache.raw_bytes("tok"), Some(vec![0xC0, 0x80]));
        assert_eq!(cache.raw_bytes("missing"), None);
    }
}
