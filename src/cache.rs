//! In-memory result cache with per-entry expiry.
//!
//! One mutex guards the map structure only. Computation runs with the lock
//! released, so two concurrent misses on the same key may both compute; the
//! later insert replaces the earlier one whole.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::errors::AppResult;

struct CacheEntry<V> {
    value: V,
    /// `None` when the ttl reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

pub struct ResultCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> ResultCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries.lock().insert(key.into(), entry);
    }

    pub fn get_or_compute<F>(&self, key: &str, ttl: Duration, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(hit) = self.get(key) {
            trace!(target: "result_cache", key, "cache hit");
            return hit;
        }
        trace!(target: "result_cache", key, "cache miss");
        let value = compute();
        self.insert(key, value.clone(), ttl);
        value
    }

    /// Like [`Self::get_or_compute`] but failed computations are not stored.
    pub fn try_get_or_compute<F, E>(&self, key: &str, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(hit) = self.get(key) {
            trace!(target: "result_cache", key, "cache hit");
            return Ok(hit);
        }
        trace!(target: "result_cache", key, "cache miss");
        let value = compute()?;
        self.insert(key, value.clone(), ttl);
        Ok(value)
    }

    pub async fn get_or_compute_async<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> AppResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<V>>,
    {
        if let Some(hit) = self.get(key) {
            trace!(target: "result_cache", key, "cache hit");
            return Ok(hit);
        }
        trace!(target: "result_cache", key, "cache miss");
        let value = compute().await?;
        self.insert(key, value.clone(), ttl);
        Ok(value)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drops expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds cache keys from an operation name and its full argument list.
///
/// Arguments are JSON-encoded in order and digested, so two calls share a
/// key only when the operation and every argument match.
pub struct CacheKey {
    operation: &'static str,
    hasher: Sha256,
}

impl CacheKey {
    pub fn new(operation: &'static str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        Self { operation, hasher }
    }

    pub fn arg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Self {
        let encoded = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        self.hasher.update(b"|");
        self.hasher.update(name.as_bytes());
        self.hasher.update(b"=");
        self.hasher.update((encoded.len() as u64).to_be_bytes());
        self.hasher.update(&encoded);
        self
    }

    pub fn finish(self) -> String {
        let digest = URL_SAFE_NO_PAD.encode(self.hasher.finalize());
        format!("{}:{}", self.operation, digest)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::errors::AppError;

    #[test]
    fn computes_once_within_ttl() {
        let cache = ResultCache::new();
        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            42
        };
        assert_eq!(cache.get_or_compute("k", Duration::from_secs(60), compute), 42);
        assert_eq!(cache.get_or_compute("k", Duration::from_secs(60), compute), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recomputes_after_expiry() {
        let cache = ResultCache::new();
        let calls = AtomicUsize::new(0);
        let compute = || calls.fetch_add(1, Ordering::SeqCst);
        cache.get_or_compute("k", Duration::from_millis(20), compute);
        thread::sleep(Duration::from_millis(40));
        let second = cache.get_or_compute("k", Duration::from_millis(20), compute);
        assert_eq!(second, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_ttl_never_serves_stale_values() {
        let cache = ResultCache::new();
        cache.insert("k", 1, Duration::ZERO);
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.get_or_compute("k", Duration::ZERO, || 2), 2);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn oversized_ttl_never_expires() {
        let cache = ResultCache::new();
        let calls = AtomicUsize::new(0);
        let compute = || calls.fetch_add(1, Ordering::SeqCst);
        cache.get_or_compute("k", Duration::from_secs(u64::MAX), compute);
        cache.get_or_compute("k", Duration::MAX, compute);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.get("k"), Some(0));
    }

    #[test]
    fn errors_are_not_cached() {
        let cache: ResultCache<u32> = ResultCache::new();
        let failed: Result<u32, AppError> =
            cache.try_get_or_compute("k", Duration::from_secs(60), || {
                Err(AppError::invalid("boom"))
            });
        assert!(failed.is_err());
        assert!(cache.is_empty());
        let ok: Result<u32, AppError> =
            cache.try_get_or_compute("k", Duration::from_secs(60), || Ok(5));
        assert_eq!(ok.unwrap(), 5);
    }

    #[test]
    fn clear_removes_everything() {
        let cache = ResultCache::new();
        cache.insert("a", 1, Duration::from_secs(60));
        cache.insert("b", 2, Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_separate_operations_and_arguments() {
        let base = CacheKey::new("nearest").arg("k", &5).arg("lon", &1.0).finish();
        let same = CacheKey::new("nearest").arg("k", &5).arg("lon", &1.0).finish();
        let other_arg = CacheKey::new("nearest").arg("k", &6).arg("lon", &1.0).finish();
        let other_op = CacheKey::new("radius").arg("k", &5).arg("lon", &1.0).finish();
        let shifted = CacheKey::new("nearest").arg("k", "5|lon=1.0").finish();
        assert_eq!(base, same);
        assert_ne!(base, other_arg);
        assert_ne!(base, other_op);
        assert_ne!(base, shifted);
        assert!(base.starts_with("nearest:"));
    }

    #[test]
    fn concurrent_misses_leave_one_complete_value() {
        let cache = Arc::new(ResultCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    cache.get_or_compute("shared", Duration::from_secs(60), || vec![i; 16])
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stored = cache.get("shared").unwrap();
        assert_eq!(stored.len(), 16);
        assert!(stored.iter().all(|v| *v == stored[0]));
    }

    #[tokio::test]
    async fn async_compute_is_memoized() {
        let cache = ResultCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = cache
                .get_or_compute_async("k", Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, AppError>("computed".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
