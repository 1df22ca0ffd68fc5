//! Time-bounded existence cache.
//!
//! Remembers whether an entity exists so that records referencing the same
//! handful of ids do not hit the directory over and over. Entries expire a
//! fixed TTL after they were set; expired entries are evicted lazily on read.
//!
//! Concurrent misses on the same key are not coalesced: both callers look the
//! entity up and both populate the entry.

use crate::directory::EntityKind;
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;

/// TTL applied by [`ExistenceCache::insert`] unless configured otherwise.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Copy, Debug)]
struct Entry {
    exists: bool,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug)]
pub struct ExistenceCache {
    ttl: Duration,
    entries: Mutex<HashMap<(EntityKind, i32), Entry>>,
}

impl Default for ExistenceCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ExistenceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached answer, or `None` on a miss or an expired entry.
    pub fn get(&self, kind: EntityKind, id: i32) -> Option<bool> {
        let mut entries = self.entries.lock();
        match entries.get(&(kind, id)) {
            Some(entry) if entry.is_live(Instant::now()) => Some(entry.exists),
            Some(_) => {
                entries.remove(&(kind, id));
                None
            }
            None => None,
        }
    }

    /// Stores `exists` for `ttl`. A TTL too large to represent never expires.
    pub fn set(&self, kind: EntityKind, id: i32, exists: bool, ttl: Duration) {
        let entry = Entry {
            exists,
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries.lock().insert((kind, id), entry);
    }

    /// [`set`](Self::set) with the cache's own TTL.
    pub fn insert(&self, kind: EntityKind, id: i32, exists: bool) {
        self.set(kind, id, exists, self.ttl);
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
