// Price-source fan-in: pluggable sources feeding per-symbol per-source
// points into the aggregator, with per-source reliability tracking, failover
// backoff, and peer-deviation anomaly detection.
mod chain_oracle;
mod http_api;
mod exchange_stream;

pub use chain_oracle::ChainOracleSource;
pub use exchange_stream::ExchangeStreamSource;
pub use http_api::HttpApiSource;

use crate::aggregator::PriceAggregator;
use crate::config::FeedsConfig;
use crate::metrics as m;
use crate::types::{
    now_ms, AnomalyPayload, Opportunity, OpportunityKind, OpportunityPayload, PricePoint, Urgency,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ChainOracle,
    HttpApi,
    ExchangeStream,
}

/// Capability set every price source implements. Sources must only deliver
/// points with `price > 0`.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> SourceKind;
    /// Venue this source quotes (used for cross-venue detection).
    fn venue(&self) -> &str;
    fn weight(&self) -> f64 {
        1.0
    }
    fn supports_streaming(&self) -> bool {
        false
    }

    async fn fetch(&self, symbol: &str) -> anyhow::Result<PricePoint>;

    /// Streaming delivery; the default is fetch-only.
    async fn subscribe(
        &self,
        _symbols: &[String],
        _tx: mpsc::Sender<PricePoint>,
    ) -> anyhow::Result<()> {
        anyhow::bail!("source {} does not support streaming", self.id())
    }

    async fn close(&self) {}
}

/// Exponentially-smoothed per-source health record.
#[derive(Debug, Clone)]
pub struct SourceReliability {
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
    pub last_success_ms: u64,
    pub failed: bool,
    retry_at: Option<Instant>,
    retry_delay_ms: u64,
}

impl SourceReliability {
    fn new(base_delay_ms: u64) -> Self {
        Self {
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            consecutive_failures: 0,
            last_success_ms: 0,
            failed: false,
            retry_at: None,
            retry_delay_ms: base_delay_ms,
        }
    }

    fn record_success(&mut self, latency_ms: f64, base_delay_ms: u64) {
        self.success_rate = (self.success_rate * 0.99 + 0.01).min(1.0);
        self.avg_latency_ms = if self.avg_latency_ms == 0.0 {
            latency_ms
        } else {
            self.avg_latency_ms * 0.9 + latency_ms * 0.1
        };
        self.consecutive_failures = 0;
        self.last_success_ms = now_ms();
        self.failed = false;
        self.retry_at = None;
        self.retry_delay_ms = base_delay_ms;
    }

    fn record_failure(&mut self, failover_threshold: u32, max_delay_ms: u64) {
        self.success_rate = (self.success_rate * 0.95).max(0.1);
        self.consecutive_failures += 1;
        if self.consecutive_failures >= failover_threshold {
            self.failed = true;
            self.retry_at = Some(Instant::now() + Duration::from_millis(self.retry_delay_ms));
            self.retry_delay_ms = (self.retry_delay_ms * 2).min(max_delay_ms);
        }
    }

    /// A failed source is skipped until its scheduled retry arrives.
    fn should_query(&self) -> bool {
        if !self.failed {
            return true;
        }
        match self.retry_at {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceHealth {
    pub id: String,
    pub kind: SourceKind,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
    pub failed: bool,
}

/// Owns the registered sources, drives polling/subscriptions, and forwards
/// every accepted point into the aggregator.
pub struct PriceOracleManager {
    config: FeedsConfig,
    sources: Vec<Arc<dyn PriceSource>>,
    reliability: DashMap<String, SourceReliability>,
    /// success-rate index shared with the aggregator's confidence formula.
    reliability_index: Arc<DashMap<String, f64>>,
    aggregator: Arc<PriceAggregator>,
    opportunity_tx: mpsc::Sender<Opportunity>,
}

impl PriceOracleManager {
    pub fn new(
        config: FeedsConfig,
        aggregator: Arc<PriceAggregator>,
        reliability_index: Arc<DashMap<String, f64>>,
        opportunity_tx: mpsc::Sender<Opportunity>,
    ) -> Self {
        Self {
            config,
            sources: Vec::new(),
            reliability: DashMap::new(),
            reliability_index,
            aggregator,
            opportunity_tx,
        }
    }

    pub fn register(&mut self, source: Arc<dyn PriceSource>) {
        info!("registered price source {} ({:?})", source.id(), source.kind());
        self.reliability.insert(
            source.id().to_string(),
            SourceReliability::new(self.config.retry_base_delay_ms),
        );
        self.reliability_index.insert(source.id().to_string(), 1.0);
        self.sources.push(source);
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Spawn one worker per source: a polling loop for fetch sources, a
    /// resubscribing reader for streaming sources.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for source in &self.sources {
            let handle = if source.supports_streaming() {
                self.spawn_stream_worker(Arc::clone(source), shutdown.clone())
            } else {
                self.spawn_poll_worker(Arc::clone(source), shutdown.clone())
            };
            handles.push(handle);
        }
        info!("price feed fan-in started with {} sources", self.sources.len());
        handles
    }

    fn spawn_poll_worker(
        self: &Arc<Self>,
        source: Arc<dyn PriceSource>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(manager.config.poll_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !manager.source_should_query(source.id()) {
                            continue;
                        }
                        for symbol in manager.config.symbols.clone() {
                            let started = Instant::now();
                            match source.fetch(&symbol).await {
                                Ok(point) => {
                                    let latency = started.elapsed().as_secs_f64() * 1000.0;
                                    manager.note_success(source.id(), latency);
                                    manager.accept_point(point);
                                }
                                Err(err) => {
                                    debug!("fetch from {} failed for {symbol}: {err}", source.id());
                                    manager.note_failure(source.id());
                                    break;
                                }
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            source.close().await;
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_stream_worker(
        self: &Arc<Self>,
        source: Arc<dyn PriceSource>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay_ms = manager.config.retry_base_delay_ms;
            loop {
                if *shutdown.borrow() {
                    source.close().await;
                    break;
                }
                let (tx, mut rx) = mpsc::channel::<PricePoint>(512);
                let subscription = {
                    let source = Arc::clone(&source);
                    let symbols = manager.config.symbols.clone();
                    tokio::spawn(async move { source.subscribe(&symbols, tx).await })
                };

                loop {
                    tokio::select! {
                        point = rx.recv() => {
                            match point {
                                Some(point) => {
                                    manager.note_success(source.id(), 0.0);
                                    manager.accept_point(point);
                                }
                                None => break,
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                subscription.abort();
                                source.close().await;
                                return;
                            }
                        }
                    }
                }

                manager.note_failure(source.id());
                warn!("stream from {} ended, retrying in {delay_ms}ms", source.id());
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(manager.config.retry_max_delay_ms);
            }
        })
    }

    /// Validate, anomaly-check, and hand one point to the aggregator.
    pub fn accept_point(&self, point: PricePoint) {
        if !point.is_valid() {
            warn!("source {} delivered a non-positive price, dropping", point.source_id);
            self.note_failure(&point.source_id);
            return;
        }
        self.detect_anomaly(&point);
        self.aggregator.ingest(point);
    }

    /// A quote deviating hard from its peers' trailing mean re-enters the
    /// pipeline as a critical opportunity instead of silently skewing the
    /// consensus.
    fn detect_anomaly(&self, point: &PricePoint) {
        let now = now_ms();
        let Some(peer_mean) =
            self.aggregator
                .peer_mean_excluding(&point.symbol, &point.source_id, now)
        else {
            return;
        };
        if peer_mean <= 0.0 {
            return;
        }
        let deviation = (point.price - peer_mean).abs() / peer_mean;
        if deviation > self.config.anomaly_threshold {
            metrics::counter!(m::PRICE_ANOMALIES).increment(1);
            warn!(
                "price anomaly on {} from {}: {} vs peer mean {peer_mean:.6}",
                point.symbol, point.source_id, point.price
            );
            let opportunity = Opportunity::new(
                OpportunityKind::PriceAnomaly,
                point.symbol.clone(),
                point.source_id.clone(),
                Urgency::Critical,
                OpportunityPayload::Anomaly(AnomalyPayload {
                    observed: point.price,
                    reference: peer_mean,
                    deviation_pct: deviation * 100.0,
                }),
            );
            if let Err(err) = self.opportunity_tx.try_send(opportunity) {
                debug!("anomaly opportunity dropped: {err}");
            }
        }
    }

    fn source_should_query(&self, source_id: &str) -> bool {
        self.reliability
            .get(source_id)
            .map(|r| r.should_query())
            .unwrap_or(true)
    }

    fn note_success(&self, source_id: &str, latency_ms: f64) {
        if let Some(mut record) = self.reliability.get_mut(source_id) {
            record.record_success(latency_ms, self.config.retry_base_delay_ms);
            self.reliability_index
                .insert(source_id.to_string(), record.success_rate);
        }
    }

    fn note_failure(&self, source_id: &str) {
        if let Some(mut record) = self.reliability.get_mut(source_id) {
            record.record_failure(
                self.config.failover_threshold,
                self.config.retry_max_delay_ms,
            );
            self.reliability_index
                .insert(source_id.to_string(), record.success_rate);
            if record.failed {
                warn!(
                    "source {source_id} marked failed after {} consecutive failures",
                    record.consecutive_failures
                );
            }
        }
    }

    pub fn snapshot(&self) -> Vec<SourceHealth> {
        self.sources
            .iter()
            .map(|source| {
                let record = self.reliability.get(source.id());
                let (success_rate, avg_latency_ms, consecutive_failures, failed) = record
                    .map(|r| (r.success_rate, r.avg_latency_ms, r.consecutive_failures, r.failed))
                    .unwrap_or((1.0, 0.0, 0, false));
                SourceHealth {
                    id: source.id().to_string(),
                    kind: source.kind(),
                    success_rate,
                    avg_latency_ms,
                    consecutive_failures,
                    failed,
                }
            })
            .collect()
    }
}
