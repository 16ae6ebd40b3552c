// Safety-plane scenarios: the loss-breaker cascade halts trading, a gated
// pipeline never reaches the executor, and incidents run their full
// detect -> respond -> validate -> resolve lifecycle.
use arbflow::config::{PipelineConfig, SafetyConfig};
use arbflow::pipeline::{
    Executor, OpportunityPipeline, PipelineContext, SubmitOutcome, Terminal,
};
use arbflow::safety::{IncidentStatus, LogAlertSink, SafetyPlane};
use arbflow::types::{
    ArbitragePayload, ExecutionResult, LiquidityTier, Opportunity, OpportunityKind,
    OpportunityPayload, TelemetrySample, TradeResult, Urgency,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn plane() -> Arc<SafetyPlane> {
    let mut config = SafetyConfig::default();
    config.emergency.trade_completion_timeout_ms = 50;
    config.emergency.position_liquidation_timeout_ms = 50;
    config.emergency.min_recovery_wait_ms = 0;
    config.emergency.gradual_restart_delay_ms = 30;
    Arc::new(SafetyPlane::new(config, Arc::new(LogAlertSink)))
}

fn losing_trade(pnl: f64) -> TradeResult {
    TradeResult {
        opportunity_id: uuid::Uuid::new_v4().to_string(),
        success: false,
        pnl_usd: pnl,
        gas_used: 120_000,
    }
}

fn profitable_opportunity() -> Opportunity {
    Opportunity::new(
        OpportunityKind::PriceArbitrage,
        "WETH/USDC",
        "aggregator",
        Urgency::High,
        OpportunityPayload::Arbitrage(ArbitragePayload {
            buy_venue: "venue-v2".into(),
            sell_venue: "venue-v3".into(),
            buy_price: 2000.0,
            sell_price: 2030.0,
            spread_pct: 1.5,
            fee_budget_pct: 0.6,
            net_profit_pct: 0.9,
            price_impact_pct: 0.1,
            liquidity: LiquidityTier::High,
            combined_liquidity_usd: 10_000_000.0,
            source_count: 4,
            risk_score: 20.0,
        }),
    )
}

struct CountingExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl Executor for CountingExecutor {
    async fn execute(
        &self,
        _: &Opportunity,
        _: &PipelineContext,
    ) -> anyhow::Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionResult { success: true, pnl_usd: 1.0, gas_used: 1, tx_ref: None })
    }
}

#[tokio::test]
async fn daily_loss_cascade_halts_trading() {
    let plane = plane();
    let pipeline = Arc::new(OpportunityPipeline::new(
        PipelineConfig::default(),
        plane.gate(),
    ));

    // Default limit is 1000: -400, -400 stay under it.
    plane.record_trade_result(&losing_trade(-400.0)).await;
    plane.record_trade_result(&losing_trade(-400.0)).await;
    assert!(plane.is_trading_allowed());

    // The third loss crosses the daily limit and drags emergency with it.
    plane.record_trade_result(&losing_trade(-300.0)).await;
    assert!(!plane.is_trading_allowed());
    assert!(plane.breakers.is_tripped("daily_loss"));
    assert!(plane.breakers.is_tripped("emergency"));

    // New admissions are rejected naming the active gates.
    let outcome = pipeline.submit(profitable_opportunity()).await;
    match outcome.terminal() {
        Some(Terminal::SafetyGated(reason)) => {
            assert!(reason.contains("daily_loss"));
        }
        other => panic!("expected safety gate, got {other:?}"),
    }

    // daily_loss is a long-duration breaker; it does not recover promptly.
    assert!(plane.breakers.auto_recover().is_empty());
    assert!(!plane.breakers.is_trading_allowed());
}

#[tokio::test]
async fn gated_pipeline_never_reaches_executor() {
    let plane = plane();
    let pipeline = Arc::new(OpportunityPipeline::new(
        PipelineConfig::default(),
        plane.gate(),
    ));

    // An opportunity is queued while the gate is open.
    let outcome = pipeline.submit(profitable_opportunity()).await;
    assert_eq!(outcome, SubmitOutcome::Queued);

    // The gate closes before the executor loop starts.
    plane.breakers.trip("market_crash", "synthetic crash");
    plane.recompute_gate();
    assert!(!plane.is_trading_allowed());

    let executor = Arc::new(CountingExecutor { calls: AtomicUsize::new(0) });
    let (trade_tx, _trade_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = pipeline.run_executor(executor.clone(), trade_tx, shutdown_rx);

    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown_tx.send(true).unwrap();
    let _ = worker.await;

    // No execution was initiated while any breaker was tripped.
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.queue_depth(), 1);
}

#[tokio::test]
async fn incident_detects_responds_validates_resolves() {
    let plane = plane();

    // Synthetic resource exhaustion: CPU 95%, memory 90%.
    let hot = TelemetrySample {
        cpu_pct: 95.0,
        memory_pct: 90.0,
        ..TelemetrySample::default()
    };
    plane.ingest_telemetry(hot).await;

    let active = plane.incidents.active_incidents();
    assert_eq!(active.len(), 1);
    let incident = &active[0];
    assert_eq!(incident.kind, "resource_exhaustion");
    assert_eq!(incident.status, IncidentStatus::Responding);
    let notes: Vec<&str> = incident.timeline.iter().map(|t| t.note.as_str()).collect();
    assert!(notes.iter().any(|n| n.contains("reduce_load")));
    assert!(notes.iter().any(|n| n.contains("clear_caches")));
    assert!(notes.iter().any(|n| n.contains("restart_heavy")));

    // Metrics normalize; validators pass; the incident resolves.
    let calm = TelemetrySample {
        cpu_pct: 25.0,
        memory_pct: 35.0,
        error_rate: 0.0,
        avg_latency_ms: 20.0,
        ..TelemetrySample::default()
    };
    plane.ingest_telemetry(calm).await;

    let incident = plane.incidents.incident(&incident.id).unwrap();
    assert_eq!(incident.status, IncidentStatus::Resolved);

    let positions: Vec<(usize, &str)> = incident
        .timeline
        .iter()
        .enumerate()
        .filter(|(_, t)| {
            t.note.starts_with("detected")
                || t.note.starts_with("responding")
                || t.note.starts_with("validating_recovery")
                || t.note.starts_with("resolved")
        })
        .map(|(i, t)| (i, t.note.as_str()))
        .collect();
    assert!(positions.len() >= 4);
    assert!(positions[0].1.starts_with("detected"));
    assert!(positions.last().unwrap().1.starts_with("resolved"));
}

#[tokio::test]
async fn recovery_reopens_after_checklist() {
    let plane = plane();
    plane.record_trade_result(&losing_trade(-1_500.0)).await;
    assert!(!plane.is_trading_allowed());
    assert!(plane.emergency.is_stopped());

    let recovered = plane.attempt_recovery().await.unwrap();
    assert!(recovered);
    assert!(plane.is_trading_allowed());
}
