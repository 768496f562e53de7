use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use orderflow_core::{Order, OrderId};

use super::{CacheError, OrderCache, cache_key, decode_snapshot, encode_snapshot};

/// Counters for cache traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
}

#[derive(Debug)]
struct Entry {
    snapshot: String,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(snapshot: String, ttl: Duration) -> Self {
        Self {
            snapshot,
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory order cache for tests/dev.
///
/// Keeps serialized snapshots (same shape as Redis) with per-entry expiry.
/// `set_available(false)` makes every call fail with `CacheError::Unavailable`.
#[derive(Debug)]
pub struct InMemoryOrderCache {
    entries: RwLock<HashMap<String, Entry>>,
    available: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

impl InMemoryOrderCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether a live (unexpired) entry exists, without touching the counters.
    pub fn contains(&self, id: OrderId) -> bool {
        self.entries
            .read()
            .map(|m| {
                m.get(&cache_key(id))
                    .is_some_and(|e| e.is_live(Instant::now()))
            })
            .unwrap_or(false)
    }

    /// Place a raw snapshot (used to simulate stale entries).
    pub fn put_raw(&self, id: OrderId, snapshot: impl Into<String>, ttl: Duration) {
        if let Ok(mut map) = self.entries.write() {
            map.insert(cache_key(id), Entry::new(snapshot.into(), ttl));
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("in-memory cache offline".to_string()))
        }
    }
}

impl Default for InMemoryOrderCache {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> CacheError {
    CacheError::Unavailable("order cache lock poisoned".to_string())
}

impl OrderCache for InMemoryOrderCache {
    fn read(&self, id: OrderId) -> Result<Option<Order>, CacheError> {
        self.check_available()?;
        let key = cache_key(id);

        let snapshot = {
            let map = self.entries.read().map_err(|_| poisoned())?;
            map.get(&key)
                .filter(|e| e.is_live(Instant::now()))
                .map(|e| e.snapshot.clone())
        };

        match snapshot {
            Some(raw) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                decode_snapshot(&raw).map(Some)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                // Drop an expired entry lazily.
                if let Ok(mut map) = self.entries.write() {
                    let now = Instant::now();
                    map.retain(|k, e| k != &key || e.is_live(now));
                }
                Ok(None)
            }
        }
    }

    fn write(&self, order: &Order, ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;
        let snapshot = encode_snapshot(order)?;

        let mut map = self.entries.write().map_err(|_| poisoned())?;
        map.insert(cache_key(order.id), Entry::new(snapshot, ttl));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn invalidate(&self, id: OrderId) -> Result<(), CacheError> {
        self.check_available()?;
        let mut map = self.entries.write().map_err(|_| poisoned())?;
        map.remove(&cache_key(id));
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
