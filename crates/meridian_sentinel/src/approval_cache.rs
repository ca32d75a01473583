//! Approval memoization for scheduled tasks.
//!
//! A scheduled job that re-runs an already-approved plan shape should not
//! re-prompt the user every tick. Entries expire after a TTL and the cache
//! is capacity-bounded (oldest evicted first).

use meridian_protocol::Verdict;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    verdict: Verdict,
    inserted_at: Instant,
}

pub struct ApprovalCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ApprovalCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Verdict> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.verdict),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: impl Into<String>, verdict: Verdict) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() >= self.max_entries {
            // Evict the oldest entry.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key.into(),
            CacheEntry {
                verdict,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
