// End-to-end flow: venue quotes fan into the aggregator, a cross-venue
// opportunity comes out, and the pipeline admits and releases it exactly
// once to the executor.
use arbflow::aggregator::PriceAggregator;
use arbflow::config::{AggregatorConfig, PipelineConfig};
use arbflow::pipeline::{
    Executor, OpportunityPipeline, PipelineContext, RiskAssessment, RiskAssessor,
    RiskRecommendation, SubmitOutcome,
};
use arbflow::types::{
    now_ms, ExecutionResult, LiquidityTier, Opportunity, PricePoint, TradeResult, TradingGate,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn quote(source: &str, venue: &str, price: f64) -> PricePoint {
    PricePoint {
        symbol: "WETH/USDC".into(),
        source_id: source.into(),
        venue: venue.into(),
        price,
        volume: None,
        liquidity: Some(5_000_000.0),
        confidence: 0.9,
        weight: 1.0,
        timestamp_ms: now_ms(),
    }
}

struct CalmRisk;

#[async_trait]
impl RiskAssessor for CalmRisk {
    async fn assess(&self, _: &Opportunity) -> anyhow::Result<RiskAssessment> {
        Ok(RiskAssessment {
            risk_score: 20.0,
            factors: vec![],
            recommendation: RiskRecommendation::Proceed,
        })
    }
}

struct CountingExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl Executor for CountingExecutor {
    async fn execute(
        &self,
        _opportunity: &Opportunity,
        _context: &PipelineContext,
    ) -> anyhow::Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionResult {
            success: true,
            pnl_usd: 12.5,
            gas_used: 180_000,
            tx_ref: Some("0xtest".into()),
        })
    }
}

#[tokio::test]
async fn profitable_cross_venue_spread_is_admitted() {
    let (opportunity_tx, mut opportunity_rx) = mpsc::channel(16);
    let aggregator = PriceAggregator::new(
        AggregatorConfig::default(),
        Arc::new(DashMap::new()),
        opportunity_tx,
    );

    // Source A quotes 2000 on venue-v2, source B quotes 2030 on venue-v3.
    aggregator.ingest(quote("a", "venue-v2", 2000.0));
    aggregator.ingest(quote("b", "venue-v3", 2030.0));

    let opportunity = opportunity_rx.try_recv().expect("cross-venue opportunity");
    let payload = opportunity.arbitrage().unwrap();
    assert_eq!(payload.buy_venue, "venue-v2");
    assert_eq!(payload.sell_venue, "venue-v3");
    assert!((payload.spread_pct - 1.5).abs() < 1e-9);
    assert!((payload.net_profit_pct - 0.9).abs() < 1e-9);
    assert_eq!(payload.liquidity, LiquidityTier::High);

    // The pipeline admits it and the score clears the execution floor.
    let (_gate_tx, gate_rx) = watch::channel(TradingGate::default());
    let pipeline = Arc::new(OpportunityPipeline::new(PipelineConfig::default(), gate_rx));
    pipeline.set_risk_assessor(Arc::new(CalmRisk));

    let outcome = pipeline.submit(opportunity).await;
    assert_eq!(outcome, SubmitOutcome::Queued);
    let entry = pipeline.next_for_execution().expect("queued entry");
    assert!(entry.context.scores.as_ref().unwrap().total >= 60.0);
}

#[tokio::test]
async fn executor_called_at_most_once_per_opportunity() {
    let (_gate_tx, gate_rx) = watch::channel(TradingGate::default());
    let pipeline = Arc::new(OpportunityPipeline::new(PipelineConfig::default(), gate_rx));
    pipeline.set_risk_assessor(Arc::new(CalmRisk));

    let (opportunity_tx, mut opportunity_rx) = mpsc::channel(16);
    let aggregator = PriceAggregator::new(
        AggregatorConfig::default(),
        Arc::new(DashMap::new()),
        opportunity_tx,
    );
    aggregator.ingest(quote("a", "venue-v2", 2000.0));
    aggregator.ingest(quote("b", "venue-v3", 2030.0));
    let opportunity = opportunity_rx.try_recv().unwrap();
    let opportunity_id = opportunity.id.clone();

    assert_eq!(pipeline.submit(opportunity).await, SubmitOutcome::Queued);

    let executor = Arc::new(CountingExecutor { calls: AtomicUsize::new(0) });
    let (trade_tx, mut trade_rx) = mpsc::channel::<TradeResult>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = pipeline.run_executor(executor.clone(), trade_tx, shutdown_rx);

    let trade = tokio::time::timeout(Duration::from_secs(2), trade_rx.recv())
        .await
        .expect("trade result within deadline")
        .expect("trade result");
    assert_eq!(trade.opportunity_id, opportunity_id);
    assert!(trade.success);

    // Give the loop time to (incorrectly) double-release, then stop it.
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown_tx.send(true).unwrap();
    let _ = worker.await;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.stats().executed, 1);
    assert_eq!(pipeline.in_flight(), 0);
}
