// Engine orchestrator: owns construction order, lifecycle, and the wiring
// between the price plane, the event plane, the pipeline, and the safety
// plane. All cross-component communication is typed channels.
use crate::aggregator::PriceAggregator;
use crate::cache::CacheManager;
use crate::config::{BreakerThresholds, EngineConfig};
use crate::feeds::{PriceOracleManager, PriceSource, SourceHealth};
use crate::handlers::{ChainEventHandler, LiquidityEventHandler, PoolStateHandler};
use crate::mempool::EventListenerManager;
use crate::pipeline::{Executor, OpportunityPipeline, PipelineStats, RiskAssessor, SubmitOutcome};
use crate::router::{DataRouter, Route, RoutePattern};
use crate::safety::{AlertSink, EmergencyLevel, LogAlertSink, SafetyPlane};
use crate::transport::{EndpointHealth, WebSocketManager};
use crate::types::{
    now_ms, ConditionLevel, LiquidityTier, MarketCondition, Opportunity, TelemetrySample,
    TradeResult, TradingGate, Urgency,
};
use anyhow::{Context, Result};
use ethers::providers::{Provider, Ws};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Created,
    Initialized,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub uptime_s: u64,
    pub trading_allowed: bool,
    pub gate_reasons: Vec<String>,
    pub endpoints: Vec<EndpointHealth>,
    pub sources: Vec<SourceHealth>,
    pub pipeline: PipelineStats,
    pub active_incidents: usize,
    pub cache_entries: usize,
    pub router_pending: usize,
}

/// The engine. Construction wires components in dependency order:
/// transport, cache, feeds, aggregator, router, listener, pipeline, safety.
pub struct Engine {
    config: EngineConfig,
    state: RwLock<EngineState>,
    started_at: RwLock<Option<Instant>>,
    paused: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,

    transport: Arc<WebSocketManager>,
    cache: Arc<CacheManager>,
    aggregator: Arc<PriceAggregator>,
    feeds: Mutex<Option<PriceOracleManager>>,
    feeds_running: RwLock<Option<Arc<PriceOracleManager>>>,
    router: Arc<DataRouter>,
    listener: Option<Arc<EventListenerManager>>,
    pipeline: Arc<OpportunityPipeline>,
    safety: Arc<SafetyPlane>,

    opportunity_tx: mpsc::Sender<Opportunity>,
    opportunity_rx: Mutex<Option<mpsc::Receiver<Opportunity>>>,
    telemetry_tx: mpsc::Sender<TelemetrySample>,
    telemetry_rx: Mutex<Option<mpsc::Receiver<TelemetrySample>>>,
    trade_tx: mpsc::Sender<TradeResult>,
    trade_rx: Mutex<Option<mpsc::Receiver<TradeResult>>>,
    in_flight_tx: watch::Sender<usize>,

    executor: RwLock<Option<Arc<dyn Executor>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_alert_sink(config, Arc::new(LogAlertSink))
    }

    pub fn with_alert_sink(config: EngineConfig, alert: Arc<dyn AlertSink>) -> Result<Self> {
        config.validate().context("engine configuration invalid")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (opportunity_tx, opportunity_rx) = mpsc::channel::<Opportunity>(1024);
        let (telemetry_tx, telemetry_rx) = mpsc::channel::<TelemetrySample>(64);
        let (trade_tx, trade_rx) = mpsc::channel::<TradeResult>(256);
        let (in_flight_tx, in_flight_rx) = watch::channel(0usize);

        let transport = Arc::new(WebSocketManager::new(config.transport.clone(), shutdown_rx));
        let cache = Arc::new(CacheManager::new(config.cache.clone())?);

        let reliability_index = Arc::new(dashmap::DashMap::new());
        let aggregator = Arc::new(PriceAggregator::new(
            config.aggregator.clone(),
            Arc::clone(&reliability_index),
            opportunity_tx.clone(),
        ));
        let feeds = PriceOracleManager::new(
            config.feeds.clone(),
            Arc::clone(&aggregator),
            reliability_index,
            opportunity_tx.clone(),
        );

        let router = Arc::new(DataRouter::new(config.router.clone(), Some(Arc::clone(&cache))));
        Self::wire_default_routes(&router, &cache, &opportunity_tx)?;
        let listener = if config.mempool.enabled {
            Some(Arc::new(EventListenerManager::new(
                config.mempool.clone(),
                Arc::clone(&aggregator),
                Arc::clone(&router),
                opportunity_tx.clone(),
            )?))
        } else {
            None
        };

        let safety = Arc::new(SafetyPlane::new(config.safety.clone(), alert));
        let pipeline = Arc::new(OpportunityPipeline::new(
            config.pipeline.clone(),
            safety.gate(),
        ));

        // Emergency drain watches the pipeline's in-flight count.
        safety.emergency.set_in_flight_probe(in_flight_rx);

        // Incident response steps that touch engine components.
        {
            let cache = Arc::clone(&cache);
            safety.incidents.register_step(
                "clear_caches",
                Arc::new(move || {
                    let cache = Arc::clone(&cache);
                    Box::pin(async move {
                        cache.clear_local().await;
                        Ok(())
                    })
                }),
            );
        }

        info!("engine constructed");
        Ok(Self {
            config,
            state: RwLock::new(EngineState::Created),
            started_at: RwLock::new(None),
            paused: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            transport,
            cache,
            aggregator,
            feeds: Mutex::new(Some(feeds)),
            feeds_running: RwLock::new(None),
            router,
            listener,
            pipeline,
            safety,
            opportunity_tx,
            opportunity_rx: Mutex::new(Some(opportunity_rx)),
            telemetry_tx,
            telemetry_rx: Mutex::new(Some(telemetry_rx)),
            trade_tx,
            trade_rx: Mutex::new(Some(trade_rx)),
            in_flight_tx,
            executor: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Default event wiring: decoded chain events reach the pipeline, sync
    /// reserves land in the pools cache, liquidity events are recorded.
    fn wire_default_routes(
        router: &Arc<DataRouter>,
        cache: &Arc<CacheManager>,
        opportunity_tx: &mpsc::Sender<Opportunity>,
    ) -> Result<()> {
        router.register_handler(
            "chain-events",
            Arc::new(ChainEventHandler::new(opportunity_tx.clone())),
        );
        router.register_handler("pool-state", Arc::new(PoolStateHandler::new(Arc::clone(cache))));
        router.register_handler("liquidity", Arc::new(LiquidityEventHandler));

        router.register_route(Route {
            name: "pool-swaps".into(),
            pattern: RoutePattern::regex("^swap$")?,
            handler: "chain-events".into(),
            priority: Urgency::High,
            cache: true,
            transform: false,
        });
        router.register_route(Route {
            name: "pool-sync".into(),
            pattern: RoutePattern::regex("^sync$")?,
            handler: "pool-state".into(),
            priority: Urgency::Medium,
            cache: false,
            transform: false,
        });
        router.register_route(Route {
            name: "liquidity-events".into(),
            pattern: RoutePattern::regex("^(mint|burn)$")?,
            handler: "liquidity".into(),
            priority: Urgency::Low,
            cache: false,
            transform: false,
        });
        Ok(())
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self.executor.write() = Some(executor);
    }

    pub fn set_risk_assessor(&self, assessor: Arc<dyn RiskAssessor>) {
        self.pipeline.set_risk_assessor(assessor);
    }

    /// Register a price source; only valid before `start`.
    pub fn register_price_source(&self, source: Arc<dyn PriceSource>) -> Result<()> {
        let mut feeds = self.feeds.lock();
        match feeds.as_mut() {
            Some(manager) => {
                manager.register(source);
                Ok(())
            }
            None => anyhow::bail!("price sources must be registered before start"),
        }
    }

    pub fn pipeline(&self) -> Arc<OpportunityPipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn safety(&self) -> Arc<SafetyPlane> {
        Arc::clone(&self.safety)
    }

    pub fn cache(&self) -> Arc<CacheManager> {
        Arc::clone(&self.cache)
    }

    pub fn gate(&self) -> watch::Receiver<TradingGate> {
        self.safety.gate()
    }

    /// Bring up background infrastructure: cache workers, transport health
    /// monitoring, the safety monitor, and the trade-result loop.
    pub async fn initialize(&self) -> Result<()> {
        {
            let state = *self.state.read();
            if state != EngineState::Created {
                anyhow::bail!("initialize called in state {state:?}");
            }
        }
        let shutdown = self.shutdown_tx.subscribe();
        let mut workers = self.workers.lock();

        workers.extend(self.cache.spawn_workers(shutdown.clone()));
        workers.push(self.transport.spawn_health_monitor());

        let telemetry_rx = self
            .telemetry_rx
            .lock()
            .take()
            .context("telemetry channel already taken")?;
        workers.push(self.safety.spawn_monitor(telemetry_rx, shutdown.clone()));

        let trade_rx = self
            .trade_rx
            .lock()
            .take()
            .context("trade channel already taken")?;
        workers.push(self.safety.spawn_trade_listener(trade_rx, shutdown.clone()));

        self.safety.recompute_gate();
        *self.state.write() = EngineState::Initialized;
        info!("engine initialized");
        Ok(())
    }

    /// Start processing: feeds, router dispatch, opportunity intake, the
    /// telemetry collector, the executor loop, and the chain listener.
    pub async fn start(&self) -> Result<()> {
        {
            let state = *self.state.read();
            if state != EngineState::Initialized {
                anyhow::bail!("start called in state {state:?}");
            }
        }
        let shutdown = self.shutdown_tx.subscribe();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Price feed fan-in.
        let feeds = self
            .feeds
            .lock()
            .take()
            .context("feeds already started")?;
        let feeds = Arc::new(feeds);
        handles.extend(feeds.start(shutdown.clone()));
        *self.feeds_running.write() = Some(Arc::clone(&feeds));

        // Event router dispatcher.
        handles.push(self.router.spawn_dispatcher(shutdown.clone()));

        // Opportunity intake worker.
        handles.push(self.spawn_opportunity_worker(shutdown.clone())?);

        // Telemetry collector.
        handles.push(self.spawn_telemetry_collector(shutdown.clone()));

        // Executor release loop.
        if let Some(executor) = self.executor.read().clone() {
            handles.push(self.pipeline.run_executor(
                executor,
                self.trade_tx.clone(),
                shutdown.clone(),
            ));
        } else {
            warn!("no executor registered; queued opportunities will accumulate");
        }

        // Chain listener wants a live pubsub endpoint.
        if let Some(listener) = &self.listener {
            if let Some(primary) = self.transport.primary() {
                let ws_url = self
                    .config
                    .transport
                    .endpoints
                    .iter()
                    .find(|e| e.id == primary)
                    .map(|e| e.ws_url.clone());
                if let Some(ws_url) = ws_url {
                    match Provider::<Ws>::connect(&ws_url).await {
                        Ok(provider) => {
                            handles.extend(
                                listener.start(Arc::new(provider), shutdown.clone()),
                            );
                        }
                        Err(err) => {
                            warn!("chain listener disabled, connect failed: {err}");
                        }
                    }
                }
            } else {
                warn!("chain listener disabled: no healthy endpoint");
            }
        }

        self.workers.lock().extend(handles);
        *self.started_at.write() = Some(Instant::now());
        *self.state.write() = EngineState::Running;
        info!("engine running");
        Ok(())
    }

    fn spawn_opportunity_worker(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        let mut opportunity_rx = self
            .opportunity_rx
            .lock()
            .take()
            .context("opportunity channel already taken")?;
        let pipeline = Arc::clone(&self.pipeline);
        let in_flight_tx = self.in_flight_tx.clone();
        let paused = Arc::clone(&self.paused);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    opportunity = opportunity_rx.recv() => {
                        let Some(opportunity) = opportunity else { break };
                        if paused.load(Ordering::Relaxed) {
                            continue;
                        }
                        let outcome = pipeline.submit(opportunity).await;
                        if let SubmitOutcome::Finished(terminal) = outcome {
                            tracing::debug!("opportunity finished: {terminal:?}");
                        }
                        let _ = in_flight_tx.send(pipeline.in_flight());
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }))
    }

    fn spawn_telemetry_collector(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval_ms = self.config.safety.monitoring_interval_ms;
        let thresholds = self.config.safety.breakers.clone();
        let telemetry_tx = self.telemetry_tx.clone();
        let transport = Arc::clone(&self.transport);
        let aggregator = Arc::clone(&self.aggregator);
        let router = Arc::clone(&self.router);
        let pipeline = Arc::clone(&self.pipeline);
        let in_flight_tx = self.in_flight_tx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let endpoints = transport.snapshot();
                        let rpc_failure_rate = if endpoints.is_empty() {
                            0.0
                        } else {
                            1.0 - endpoints.iter().map(|e| e.success_rate).sum::<f64>()
                                / endpoints.len() as f64
                        };
                        let avg_latency_ms = if endpoints.is_empty() {
                            0.0
                        } else {
                            endpoints.iter().map(|e| e.avg_latency_ms).sum::<f64>()
                                / endpoints.len() as f64
                        };
                        let router_stats = router.stats();
                        let error_rate = if router_stats.dispatched > 0 {
                            router_stats.handler_errors as f64 / router_stats.dispatched as f64
                        } else {
                            0.0
                        };
                        let sample = TelemetrySample {
                            timestamp_ms: now_ms(),
                            error_rate,
                            avg_latency_ms,
                            rpc_failure_rate,
                            volatility_pct: aggregator.max_recent_volatility_pct(),
                            price_drop_pct: aggregator.max_recent_drop_pct(),
                            spread_pct: aggregator.widest_spread_pct(),
                            liquidity_usd: aggregator.total_recent_liquidity_usd(),
                            pending_queue_depth: router.pending() + pipeline.queue_depth(),
                            ..TelemetrySample::default()
                        };
                        pipeline.set_market_condition(derive_market_condition(&sample, &thresholds));
                        let _ = in_flight_tx.send(pipeline.in_flight());
                        if telemetry_tx.send(sample).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Inject an externally-built telemetry sample (host resource metrics
    /// come from outside the engine).
    pub async fn inject_telemetry(&self, sample: TelemetrySample) {
        let _ = self.telemetry_tx.send(sample).await;
    }

    /// Submit an opportunity from outside the internal detectors. Refused
    /// while the safety plane gates trading.
    pub async fn submit_opportunity(&self, opportunity: Opportunity) -> Result<()> {
        if !self.safety.is_trading_allowed() {
            let reasons = self.safety.gate().borrow().reasons.join(", ");
            anyhow::bail!("safety_gated: {reasons}");
        }
        self.opportunity_tx
            .send(opportunity)
            .await
            .map_err(|_| anyhow::anyhow!("engine is shutting down"))
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        *self.state.write() = EngineState::Paused;
        info!("engine paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        *self.state.write() = EngineState::Running;
        info!("engine resumed");
    }

    /// Graceful stop: runs the emergency-stop procedure, then shuts every
    /// worker down. Bounded by the configured stop timeouts.
    pub async fn stop(&self) -> Result<()> {
        info!("engine stopping");
        let emergency = &self.config.safety.emergency;
        let budget = Duration::from_millis(
            emergency.trade_completion_timeout_ms
                + emergency.position_liquidation_timeout_ms
                + emergency.system_shutdown_timeout_ms,
        );

        let stop = self
            .safety
            .emergency_stop("engine stop requested", EmergencyLevel::Warning, "engine");
        if tokio::time::timeout(budget, stop).await.is_err() {
            warn!("graceful stop procedure exceeded its budget");
        }

        let _ = self.shutdown_tx.send(true);
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock();
            guard.drain(..).collect()
        };
        let join_all = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(
            Duration::from_millis(emergency.system_shutdown_timeout_ms),
            join_all,
        )
        .await
        .is_err()
        {
            warn!("some workers did not drain before the shutdown deadline");
        }

        *self.state.write() = EngineState::Stopped;
        info!("engine stopped");
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn status(&self) -> EngineStatus {
        let gate = self.safety.gate().borrow().clone();
        EngineStatus {
            state: self.state(),
            uptime_s: self
                .started_at
                .read()
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            trading_allowed: gate.allowed,
            gate_reasons: gate.reasons,
            endpoints: self.transport.snapshot(),
            sources: self
                .feeds_running
                .read()
                .as_ref()
                .map(|f| f.snapshot())
                .unwrap_or_default(),
            pipeline: self.pipeline.stats(),
            active_incidents: self.safety.incidents.active_count(),
            cache_entries: self.cache.stats().local_entries,
            router_pending: self.router.pending(),
        }
    }

}

/// Coarse market tags for the pipeline's market sub-score, derived from the
/// same thresholds the breakers use.
fn derive_market_condition(
    sample: &TelemetrySample,
    thresholds: &BreakerThresholds,
) -> MarketCondition {
    let volatility = if sample.volatility_pct > thresholds.max_volatility_pct {
        ConditionLevel::Extreme
    } else if sample.volatility_pct > thresholds.max_volatility_pct / 2.0 {
        ConditionLevel::High
    } else if sample.volatility_pct < thresholds.max_volatility_pct / 10.0 {
        ConditionLevel::Low
    } else {
        ConditionLevel::Normal
    };
    let gas = if sample.gas_price_gwei > thresholds.max_gas_price_gwei {
        ConditionLevel::Extreme
    } else if sample.gas_price_gwei > thresholds.max_gas_price_gwei / 2.0 {
        ConditionLevel::High
    } else {
        ConditionLevel::Normal
    };
    let liquidity = if sample.liquidity_usd <= 0.0 {
        // Unknown depth is treated as neutral.
        LiquidityTier::Medium
    } else if sample.liquidity_usd < thresholds.min_liquidity_usd {
        LiquidityTier::Low
    } else if sample.liquidity_usd < thresholds.min_liquidity_usd * 10.0 {
        LiquidityTier::Medium
    } else {
        LiquidityTier::High
    };
    MarketCondition { volatility, liquidity, gas }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_condition_derivation() {
        let thresholds = BreakerThresholds::default();
        let calm = TelemetrySample {
            volatility_pct: 0.5,
            liquidity_usd: thresholds.min_liquidity_usd * 20.0,
            ..TelemetrySample::default()
        };
        let condition = derive_market_condition(&calm, &thresholds);
        assert_eq!(condition.volatility, ConditionLevel::Low);
        assert_eq!(condition.liquidity, LiquidityTier::High);
        assert_eq!(condition.gas, ConditionLevel::Normal);

        let stressed = TelemetrySample {
            volatility_pct: thresholds.max_volatility_pct + 1.0,
            gas_price_gwei: thresholds.max_gas_price_gwei + 1.0,
            liquidity_usd: thresholds.min_liquidity_usd / 2.0,
            ..TelemetrySample::default()
        };
        let condition = derive_market_condition(&stressed, &thresholds);
        assert_eq!(condition.volatility, ConditionLevel::Extreme);
        assert_eq!(condition.liquidity, LiquidityTier::Low);
        assert_eq!(condition.gas, ConditionLevel::Extreme);
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_ordering_enforced() {
        let engine = engine();
        assert_eq!(engine.state(), EngineState::Created);
        // start before initialize is refused.
        assert!(engine.start().await.is_err());
        use tokio_test::assert_ok;
        assert_ok!(engine.initialize().await);
        assert_eq!(engine.state(), EngineState::Initialized);
        // double initialize is refused.
        assert!(engine.initialize().await.is_err());
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        engine.pause();
        assert_eq!(engine.state(), EngineState::Paused);
        engine.resume();
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[tokio::test]
    async fn test_stop_terminates_within_budget() {
        let mut config = EngineConfig::default();
        config.safety.emergency.trade_completion_timeout_ms = 100;
        config.safety.emergency.position_liquidation_timeout_ms = 100;
        config.safety.emergency.system_shutdown_timeout_ms = 200;
        config.safety.emergency.gradual_restart_delay_ms = 30;
        let engine = Engine::new(config).unwrap();
        engine.initialize().await.unwrap();
        engine.start().await.unwrap();

        let budget = Duration::from_millis(100 + 100 + 200 + 500);
        let stopped = tokio::time::timeout(budget, engine.stop()).await;
        assert!(stopped.is_ok(), "stop exceeded its budget");
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_submit_refused_when_gated() {
        let engine = engine();
        engine.initialize().await.unwrap();
        engine.safety().breakers.trip("emergency", "test trip");
        engine.safety().recompute_gate();

        let opportunity = Opportunity::new(
            crate::types::OpportunityKind::PriceArbitrage,
            "WETH/USDC",
            "test",
            crate::types::Urgency::High,
            crate::types::OpportunityPayload::ChainEvent(crate::types::ChainEventPayload {
                contract: "0x0".into(),
                event: "swap".into(),
                block: 1,
                tx_hash: "0x0".into(),
            }),
        );
        let refused = engine.submit_opportunity(opportunity).await;
        assert!(refused.is_err());
        assert!(refused.unwrap_err().to_string().contains("safety_gated"));
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let engine = engine();
        engine.initialize().await.unwrap();
        let status = engine.status();
        assert_eq!(status.state, EngineState::Initialized);
        assert!(status.trading_allowed);
        assert_eq!(status.pipeline.received, 0);
    }
}
