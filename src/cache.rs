//! Process-wide raw payload cache, one per source.
//!
//! Explicitly owned and injected into adapters at construction, so tests can
//! pre-warm a cache with a fixture payload and exercise extraction without
//! any network. Readers always get a deep copy: region filtering over a
//! snapshot can never race with a concurrent reload.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

struct Slot<T> {
    payload: T,
    installed_at: Instant,
}

/// Shared cache handle; clones refer to the same slot.
pub struct SourceCache<T> {
    inner: Arc<RwLock<Option<Slot<T>>>>,
    ttl: Option<Duration>,
}

impl<T> Clone for SourceCache<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), ttl: self.ttl }
    }
}

impl<T> Default for SourceCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SourceCache<T> {
    /// Cache that stays warm for the whole process lifetime (refreshed only
    /// by the system-wide timer or an explicit reload).
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(None)), ttl: None }
    }

    /// Cache whose payload counts as expired after `ttl`, making the next
    /// refresh refetch instead of reusing it.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { inner: Arc::new(RwLock::new(None)), ttl: Some(ttl) }
    }

    /// True when a refresh should attempt a fetch first: nothing cached yet,
    /// or the cached payload outlived the TTL. An expired payload is *not*
    /// discarded; if the refetch fails it still serves as stale data.
    pub fn needs_reload(&self) -> bool {
        let slot = self.inner.read().expect("source cache lock poisoned");
        match slot.as_ref() {
            None => true,
            Some(s) => match self.ttl {
                Some(ttl) => s.installed_at.elapsed() > ttl,
                None => false,
            },
        }
    }

    pub fn is_warm(&self) -> bool {
        self.inner
            .read()
            .expect("source cache lock poisoned")
            .is_some()
    }

    pub fn install(&self, payload: T) {
        let mut slot = self.inner.write().expect("source cache lock poisoned");
        *slot = Some(Slot { payload, installed_at: Instant::now() });
    }

    pub fn clear(&self) {
        let mut slot = self.inner.write().expect("source cache lock poisoned");
        *slot = None;
    }
}

impl<T: Clone> SourceCache<T> {
    /// Deep copy of the cached payload, stale or not. `None` only when the
    /// cache has never been filled (or was cleared).
    pub fn snapshot(&self) -> Option<T> {
        let slot = self.inner.read().expect("source cache lock poisoned");
        slot.as_ref().map(|s| s.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_needs_reload() {
        let cache: SourceCache<Vec<u32>> = SourceCache::new();
        assert!(cache.needs_reload());
        assert!(!cache.is_warm());
        assert_eq!(cache.snapshot(), None);
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let cache = SourceCache::new();
        cache.install(vec![1, 2, 3]);
        let mut copy = cache.snapshot().unwrap();
        copy.push(4);
        assert_eq!(cache.snapshot().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn warm_cache_without_ttl_never_reloads() {
        let cache = SourceCache::new();
        cache.install(7u32);
        assert!(!cache.needs_reload());
    }

    #[test]
    fn expired_payload_requests_reload_but_stays_readable() {
        let cache = SourceCache::with_ttl(Duration::from_millis(5));
        cache.install(7u32);
        assert!(!cache.needs_reload());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.needs_reload());
        // Stale beats empty: the payload is still there for extraction.
        assert_eq!(cache.snapshot(), Some(7));
    }

    #[test]
    fn clones_share_the_slot() {
        let a = SourceCache::new();
        let b = a.clone();
        a.install("payload".to_string());
        assert_eq!(b.snapshot().as_deref(), Some("payload"));
        b.clear();
        assert!(!a.is_warm());
    }
}
