// Two-tier cache: in-process local tier in front of a shared redis tier,
// with per-category TTL/policy and distributed invalidation.
mod local;
mod shared;

pub use local::{glob_match, LocalCache};
pub use shared::{InvalidationMessage, SharedCache};

use crate::config::{CacheConfig, CachePolicy};
use crate::metrics as m;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct CacheStats {
    pub local_hits: AtomicU64,
    pub shared_hits: AtomicU64,
    pub misses: AtomicU64,
    pub write_behind_flushed: AtomicU64,
    pub write_behind_dropped: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
    pub write_behind_flushed: u64,
    pub write_behind_dropped: u64,
    pub local_entries: usize,
    pub local_memory_bytes: usize,
}

struct PendingWrite {
    key: String,
    value: Value,
    ttl: Duration,
}

/// Category-aware two-tier cache manager. Keys are fully qualified as
/// `<prefix>:<category>:<user key>`.
pub struct CacheManager {
    config: CacheConfig,
    local: LocalCache,
    shared: Option<Arc<SharedCache>>,
    write_behind: Mutex<Vec<PendingWrite>>,
    stats: CacheStats,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> anyhow::Result<Self> {
        let shared = if config.redis_url.is_empty() {
            info!("shared cache tier disabled, running local-only");
            None
        } else {
            Some(Arc::new(SharedCache::new(&config.redis_url)?))
        };
        Ok(Self {
            local: LocalCache::new(config.max_memory_bytes),
            shared,
            write_behind: Mutex::new(Vec::new()),
            stats: CacheStats::default(),
            config,
        })
    }

    pub fn full_key(&self, category: &str, key: &str) -> String {
        format!("{}:{}:{}", self.config.prefix, category, key)
    }

    fn invalidation_channel(&self) -> String {
        format!("{}invalidate", self.config.prefix)
    }

    fn category(&self, category: &str) -> (Duration, CachePolicy) {
        self.config
            .categories
            .get(category)
            .map(|c| (Duration::from_secs(c.ttl_secs), c.policy))
            .unwrap_or((Duration::from_secs(60), CachePolicy::CacheAside))
    }

    /// Local tier first; on a local miss the shared tier is consulted and a
    /// shared hit is promoted into the local tier.
    pub async fn get(&self, category: &str, key: &str) -> Option<Value> {
        let full = self.full_key(category, key);
        if let Some(value) = self.local.get(&full) {
            self.stats.local_hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::CACHE_HITS, "tier" => "local").increment(1);
            return Some(value);
        }
        if let Some(shared) = &self.shared {
            if let Some(value) = shared.get(&full).await {
                let (ttl, _) = self.category(category);
                self.local.set(&full, value.clone(), ttl);
                self.stats.shared_hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::CACHE_HITS, "tier" => "shared").increment(1);
                return Some(value);
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::CACHE_MISSES).increment(1);
        None
    }

    /// Always writes the local tier; the shared tier is written per the
    /// category policy.
    pub async fn set(&self, category: &str, key: &str, value: Value) {
        let full = self.full_key(category, key);
        let (ttl, policy) = self.category(category);
        self.local.set(&full, value.clone(), ttl);

        match policy {
            CachePolicy::WriteThrough => {
                if let Some(shared) = &self.shared {
                    // One retry for write-through; then the write is dropped.
                    if !shared.set(&full, &value, ttl).await && !shared.set(&full, &value, ttl).await {
                        warn!("write-through to shared tier dropped for {full}");
                    }
                }
            }
            CachePolicy::WriteBehind => {
                let mut pending = self.write_behind.lock();
                pending.push(PendingWrite { key: full, value, ttl });
            }
            CachePolicy::CacheAside => {
                if let Some(shared) = &self.shared {
                    shared.set(&full, &value, ttl).await;
                }
            }
        }
    }

    /// Remove from both tiers and broadcast an invalidation for the key.
    pub async fn delete(&self, category: &str, key: &str) {
        let full = self.full_key(category, key);
        self.local.remove(&full);
        if let Some(shared) = &self.shared {
            shared.delete(&full).await;
            shared
                .publish_invalidation(
                    &self.invalidation_channel(),
                    &InvalidationMessage { key: Some(full), pattern: None },
                )
                .await;
        }
    }

    /// Evict matching local keys everywhere via a pattern invalidation.
    pub async fn invalidate_pattern(&self, pattern: &str) {
        let full_pattern = format!("{}:{}", self.config.prefix, pattern);
        self.local.remove_matching(&full_pattern);
        if let Some(shared) = &self.shared {
            shared
                .publish_invalidation(
                    &self.invalidation_channel(),
                    &InvalidationMessage { key: None, pattern: Some(full_pattern) },
                )
                .await;
        }
    }

    pub async fn clear_local(&self) {
        self.local.clear();
        info!("local cache tier cleared");
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            local_hits: self.stats.local_hits.load(Ordering::Relaxed),
            shared_hits: self.stats.shared_hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            write_behind_flushed: self.stats.write_behind_flushed.load(Ordering::Relaxed),
            write_behind_dropped: self.stats.write_behind_dropped.load(Ordering::Relaxed),
            local_entries: self.local.len(),
            local_memory_bytes: self.local.memory_used(),
        }
    }

    /// Background workers: write-behind flush, expiry/budget sweep, and the
    /// invalidation listener.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Write-behind flush, batched once per flush interval.
        {
            let manager = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(manager.config.write_behind_flush_ms));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.flush_write_behind().await,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                // Final flush on the way out.
                                manager.flush_write_behind().await;
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Expiry sweep and memory budget enforcement.
        {
            let manager = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(manager.config.cleanup_interval_ms));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.local.enforce_budget(),
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Remote invalidations evict matching local keys.
        if let Some(shared) = self.shared.clone() {
            let manager = Arc::clone(self);
            let channel = self.invalidation_channel();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let (tx, mut rx) = mpsc::channel::<InvalidationMessage>(256);
                let subscriber = {
                    let shared = Arc::clone(&shared);
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        loop {
                            if let Err(err) = shared.subscribe_invalidations(&channel, tx.clone()).await {
                                debug!("invalidation subscription lost: {err}");
                            }
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    })
                };
                loop {
                    tokio::select! {
                        message = rx.recv() => {
                            match message {
                                Some(invalidation) => manager.apply_invalidation(invalidation),
                                None => break,
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                subscriber.abort();
                                break;
                            }
                        }
                    }
                }
            }));
        }

        handles
    }

    fn apply_invalidation(&self, message: InvalidationMessage) {
        if let Some(key) = message.key {
            if self.local.remove(&key) {
                debug!("evicted {key} on remote invalidation");
            }
        }
        if let Some(pattern) = message.pattern {
            let evicted = self.local.remove_matching(&pattern);
            if evicted > 0 {
                debug!("evicted {evicted} keys matching {pattern} on remote invalidation");
            }
        }
    }

    async fn flush_write_behind(&self) {
        let pending: Vec<PendingWrite> = {
            let mut queue = self.write_behind.lock();
            std::mem::take(&mut *queue)
        };
        if pending.is_empty() {
            return;
        }
        let Some(shared) = &self.shared else {
            // No shared tier configured; the batch is dropped.
            self.stats
                .write_behind_dropped
                .fetch_add(pending.len() as u64, Ordering::Relaxed);
            return;
        };
        let mut flushed = 0u64;
        let mut dropped = 0u64;
        for write in pending {
            // Disconnected shared tier drops write-behind batches.
            if shared.set(&write.key, &write.value, write.ttl).await {
                flushed += 1;
            } else {
                dropped += 1;
            }
        }
        self.stats.write_behind_flushed.fetch_add(flushed, Ordering::Relaxed);
        self.stats.write_behind_dropped.fetch_add(dropped, Ordering::Relaxed);
        if dropped > 0 {
            debug!("write-behind flush dropped {dropped} writes (shared tier unavailable)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_only() -> Arc<CacheManager> {
        Arc::new(CacheManager::new(CacheConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_key_qualification() {
        let cache = local_only();
        assert_eq!(cache.full_key("prices", "WETH/USDC"), "arbflow:prices:WETH/USDC");
    }

    #[tokio::test]
    async fn test_local_roundtrip_and_miss() {
        let cache = local_only();
        cache.set("prices", "WETH", json!({"p": 2000})).await;
        assert_eq!(cache.get("prices", "WETH").await.unwrap()["p"], 2000);
        assert!(cache.get("prices", "WBTC").await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_locally() {
        let cache = local_only();
        cache.set("tokens", "WETH", json!("0xabc")).await;
        cache.delete("tokens", "WETH").await;
        assert!(cache.get("tokens", "WETH").await.is_none());
    }

    #[tokio::test]
    async fn test_pattern_invalidation_evicts_local() {
        let cache = local_only();
        cache.set("prices", "WETH", json!(1)).await;
        cache.set("prices", "WBTC", json!(2)).await;
        cache.set("pools", "WETH", json!(3)).await;
        cache.invalidate_pattern("prices:*").await;
        assert!(cache.get("prices", "WETH").await.is_none());
        assert!(cache.get("prices", "WBTC").await.is_none());
        assert!(cache.get("pools", "WETH").await.is_some());
    }

    #[tokio::test]
    async fn test_write_behind_dropped_without_shared_tier() {
        let cache = local_only();
        cache.set("opportunities", "opp-1", json!({"id": "opp-1"})).await;
        cache.flush_write_behind().await;
        let stats = cache.stats();
        assert_eq!(stats.write_behind_dropped, 1);
        // The local tier still serves the value.
        assert!(cache.get("opportunities", "opp-1").await.is_some());
    }

    #[tokio::test]
    async fn test_remote_invalidation_applies() {
        let cache = local_only();
        cache.set("prices", "WETH", json!(1)).await;
        let full = cache.full_key("prices", "WETH");
        cache.apply_invalidation(InvalidationMessage { key: Some(full), pattern: None });
        assert!(cache.get("prices", "WETH").await.is_none());
    }
}
