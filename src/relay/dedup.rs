//! Duplicate event suppression
//!
//! The same request arrives once per relay it was published to. The cache
//! remembers event ids for a TTL, bounded by LRU capacity.

use lru::LruCache;
use nostr_sdk::prelude::EventId;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

pub struct DedupCache {
    seen: Mutex<LruCache<EventId, Instant>>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Record `id`; true if it was not seen within the TTL
    pub fn insert_if_absent(&self, id: EventId) -> bool {
        self.insert_at(id, Instant::now())
    }

    fn insert_at(&self, id: EventId, now: Instant) -> bool {
        let mut seen = self.seen.lock();
        if let Some(first_seen) = seen.get(&id) {
            if now.saturating_duration_since(*first_seen) < self.ttl {
                return false;
            }
        }
        seen.put(id, now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
