// In-process cache tier with per-entry TTL and least-recently-accessed
// eviction under a memory budget.
use crate::metrics as m;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
    last_access: Instant,
    size: usize,
}

/// Local tier. Entry sizes are estimated from serialized length.
pub struct LocalCache {
    entries: DashMap<String, Entry>,
    max_memory_bytes: usize,
    used_bytes: AtomicUsize,
}

impl LocalCache {
    pub fn new(max_memory_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_memory_bytes,
            used_bytes: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.expires_at <= now {
                    true
                } else {
                    entry.last_access = now;
                    return Some(entry.value.clone());
                }
            }
            None => return None,
        };
        if expired {
            self.remove(key);
        }
        None
    }

    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        let size = estimate_size(key, &value);
        let now = Instant::now();
        let entry = Entry {
            value,
            expires_at: now + ttl,
            last_access: now,
            size,
        };
        if let Some(previous) = self.entries.insert(key.to_string(), entry) {
            self.used_bytes.fetch_sub(previous.size, Ordering::Relaxed);
        }
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        if self.used_bytes.load(Ordering::Relaxed) > self.max_memory_bytes {
            self.enforce_budget();
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.used_bytes.fetch_sub(entry.size, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Evict every key matching a glob-style pattern (`*` wildcard).
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    /// Drop expired entries, then least-recently-accessed entries until the
    /// memory budget holds.
    pub fn enforce_budget(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }

        let mut used = self.used_bytes.load(Ordering::Relaxed);
        if used <= self.max_memory_bytes {
            return;
        }

        let mut by_access: Vec<(String, Instant, usize)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.last_access, entry.size))
            .collect();
        by_access.sort_by_key(|(_, last_access, _)| *last_access);

        let mut evicted = 0usize;
        for (key, _, size) in by_access {
            if used <= self.max_memory_bytes {
                break;
            }
            if self.remove(&key) {
                used = used.saturating_sub(size);
                evicted += 1;
            }
        }
        if evicted > 0 {
            metrics::counter!(m::CACHE_EVICTIONS).increment(evicted as u64);
            debug!("evicted {evicted} least-recently-accessed cache entries");
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn memory_used(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }
}

fn estimate_size(key: &str, value: &Value) -> usize {
    key.len() + serde_json::to_string(value).map(|s| s.len()).unwrap_or(64)
}

/// Minimal glob matcher supporting `*` wildcards.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], text) || (!text.is_empty() && inner(pattern, &text[1..]))
            }
            (Some(p), Some(t)) if p == t => inner(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}
