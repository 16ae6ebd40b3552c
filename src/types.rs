// Core data model shared across the engine
use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Urgency attached to opportunities and router events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    /// Queue index, highest urgency first.
    pub fn queue_index(self) -> usize {
        match self {
            Urgency::Critical => 0,
            Urgency::High => 1,
            Urgency::Medium => 2,
            Urgency::Low => 3,
        }
    }
}

/// Liquidity tier derived from combined venue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiquidityTier {
    Low,
    Medium,
    High,
}

/// A single observation from one price source for one symbol.
/// Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub source_id: String,
    /// Venue the quote trades on (DEX name, exchange name, ...).
    pub venue: String,
    pub price: f64,
    pub volume: Option<f64>,
    pub liquidity: Option<f64>,
    /// Source-declared confidence in [0, 1].
    pub confidence: f64,
    /// Source-declared aggregation weight.
    pub weight: f64,
    pub timestamp_ms: u64,
}

impl PricePoint {
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp_ms)
    }

    /// Sources must only deliver points with a positive price.
    pub fn is_valid(&self) -> bool {
        self.price > 0.0 && self.price.is_finite()
    }
}

/// Weighted consensus across fresh non-outlier source quotes for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedPrice {
    pub symbol: String,
    pub price: f64,
    pub volume_weighted_price: Option<f64>,
    pub confidence: f64,
    /// (max - min) / min across contributors, as a fraction.
    pub spread: f64,
    pub source_count: usize,
    pub outlier_count: usize,
    pub points: Vec<PricePoint>,
    pub processing_latency_us: u64,
    pub timestamp_ms: u64,
}

/// Tagged opportunity variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    PriceArbitrage,
    Mempool,
    MevSandwich,
    MevFrontrun,
    PriceAnomaly,
    BlockchainEvent,
}

impl OpportunityKind {
    pub fn is_mev(self) -> bool {
        matches!(self, OpportunityKind::MevSandwich | OpportunityKind::MevFrontrun)
    }
}

/// Cross-venue price arbitrage details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitragePayload {
    pub buy_venue: String,
    pub sell_venue: String,
    pub buy_price: f64,
    pub sell_price: f64,
    /// Gross spread as a percentage of the mean price.
    pub spread_pct: f64,
    /// Round-trip trading-fee budget, percent.
    pub fee_budget_pct: f64,
    pub net_profit_pct: f64,
    /// Predicted total price impact, percent.
    pub price_impact_pct: f64,
    pub liquidity: LiquidityTier,
    pub combined_liquidity_usd: f64,
    /// Price sources contributing to the aggregate behind this candidate.
    pub source_count: usize,
    /// 0..=100, higher is riskier.
    pub risk_score: f64,
}

/// MEV risk classification for mempool traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MevRisk {
    Low,
    Medium,
    High,
}

/// Pending-transaction analysis details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolPayload {
    pub tx_hash: String,
    pub gas_price_gwei: f64,
    pub value_usd: f64,
    pub token_pair: Option<(String, String)>,
    pub has_opportunity: bool,
    pub mev_risk: MevRisk,
    pub confidence: f64,
    pub priority_score: f64,
}

/// Sandwich pattern: a burst of pending swaps on one token pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandwichPayload {
    pub token_pair: (String, String),
    pub bundle: Vec<String>,
    pub window_ms: u64,
}

/// A source quote diverging hard from the consensus of its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyPayload {
    pub observed: f64,
    pub reference: f64,
    pub deviation_pct: f64,
}

/// Decoded on-chain event of interest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEventPayload {
    pub contract: String,
    pub event: String,
    pub block: u64,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "payload_kind")]
pub enum OpportunityPayload {
    Arbitrage(ArbitragePayload),
    Mempool(MempoolPayload),
    Sandwich(SandwichPayload),
    Anomaly(AnomalyPayload),
    ChainEvent(ChainEventPayload),
}

/// A structured candidate trade presented to the pipeline.
///
/// Created by the aggregator or the event listener; mutated only by the
/// pipeline, which attaches scores and risk through its own context record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub kind: OpportunityKind,
    pub symbol: String,
    pub source: String,
    pub detected_at_ms: u64,
    pub urgency: Urgency,
    pub payload: OpportunityPayload,
}

impl Opportunity {
    pub fn new(
        kind: OpportunityKind,
        symbol: impl Into<String>,
        source: impl Into<String>,
        urgency: Urgency,
        payload: OpportunityPayload,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            symbol: symbol.into(),
            source: source.into(),
            detected_at_ms: now_ms(),
            urgency,
            payload,
        }
    }

    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.detected_at_ms)
    }

    pub fn arbitrage(&self) -> Option<&ArbitragePayload> {
        match &self.payload {
            OpportunityPayload::Arbitrage(p) => Some(p),
            _ => None,
        }
    }

    pub fn mempool(&self) -> Option<&MempoolPayload> {
        match &self.payload {
            OpportunityPayload::Mempool(p) => Some(p),
            _ => None,
        }
    }

    /// Net profit percentage where the variant defines one.
    pub fn net_profit_pct(&self) -> Option<f64> {
        self.arbitrage().map(|p| p.net_profit_pct)
    }
}

/// Result handed back by the external executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub pnl_usd: f64,
    pub gas_used: u64,
    pub tx_ref: Option<String>,
}

/// Completed trade outcome, fed back into loss accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub opportunity_id: String,
    pub success: bool,
    pub pnl_usd: f64,
    pub gas_used: u64,
}

/// Coarse level tags used by market-condition scoring and breaker checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionLevel {
    Low,
    Normal,
    High,
    Extreme,
}

/// Snapshot of current market conditions consumed by the pipeline's
/// market sub-score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketCondition {
    pub volatility: ConditionLevel,
    pub liquidity: LiquidityTier,
    pub gas: ConditionLevel,
}

impl Default for MarketCondition {
    fn default() -> Self {
        Self {
            volatility: ConditionLevel::Normal,
            liquidity: LiquidityTier::Medium,
            gas: ConditionLevel::Normal,
        }
    }
}

/// Read-only trading gate snapshot published by the safety plane and
/// consumed by the pipeline. `reasons` names every active gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingGate {
    pub allowed: bool,
    pub reasons: Vec<String>,
}

impl Default for TradingGate {
    fn default() -> Self {
        Self { allowed: true, reasons: Vec::new() }
    }
}

/// One telemetry sample evaluated by the safety plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp_ms: u64,
    pub cpu_pct: f64,
    pub memory_pct: f64,
    /// Errors per processed unit, [0, 1].
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub rpc_failure_rate: f64,
    pub gas_price_gwei: f64,
    /// Recent realized volatility, percent.
    pub volatility_pct: f64,
    /// Largest recent drop of any tracked symbol, percent.
    pub price_drop_pct: f64,
    /// Widest observed cross-venue spread, percent.
    pub spread_pct: f64,
    pub liquidity_usd: f64,
    pub pending_queue_depth: usize,
    pub execution_delay_ms: f64,
    pub network_congestion_pct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_point_validity() {
        let mut point = PricePoint {
            symbol: "WETH/USDC".into(),
            source_id: "chainlink".into(),
            venue: "chain".into(),
            price: 2000.0,
            volume: None,
            liquidity: None,
            confidence: 0.95,
            weight: 1.0,
            timestamp_ms: now_ms(),
        };
        assert!(point.is_valid());

        point.price = 0.0;
        assert!(!point.is_valid());
        point.price = f64::NAN;
        assert!(!point.is_valid());
    }

    #[test]
    fn test_urgency_queue_order() {
        assert!(Urgency::Critical.queue_index() < Urgency::Low.queue_index());
        assert_eq!(Urgency::High.queue_index(), 1);
    }

    #[test]
    fn test_opportunity_accessors() {
        let opp = Opportunity::new(
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
                price_impact_pct: 0.2,
                liquidity: LiquidityTier::High,
                combined_liquidity_usd: 10_000_000.0,
                source_count: 2,
                risk_score: 20.0,
            }),
        );
        assert_eq!(opp.net_profit_pct(), Some(0.9));
        assert!(opp.mempool().is_none());
        assert!(!opp.kind.is_mev());
    }
}
