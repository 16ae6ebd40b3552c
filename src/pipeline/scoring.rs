// Sub-score computation for the scoring stage. Pure functions of the
// opportunity, its age, and the current market condition.
use crate::config::PipelineConfig;
use crate::types::{
    ConditionLevel, LiquidityTier, MarketCondition, MevRisk, Opportunity, OpportunityPayload,
    Urgency,
};
use serde::{Deserialize, Serialize};

/// Stage-two scoring weights.
const WEIGHT_PROFIT: f64 = 0.4;
const WEIGHT_CONFIDENCE: f64 = 0.2;
const WEIGHT_LIQUIDITY: f64 = 0.15;
const WEIGHT_SPEED: f64 = 0.1;
const WEIGHT_RISK: f64 = 0.1;
const WEIGHT_MARKET: f64 = 0.05;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scores {
    pub profit: f64,
    pub confidence: f64,
    pub liquidity: f64,
    pub speed: f64,
    /// Raw risk, higher is worse; weighted into the total as `100 - risk`.
    pub risk: f64,
    pub market: f64,
    pub total: f64,
}

pub fn compute_scores(
    opportunity: &Opportunity,
    now: u64,
    config: &PipelineConfig,
    market: &MarketCondition,
) -> Scores {
    let profit = profit_score(opportunity);
    let confidence = confidence_score(opportunity);
    let liquidity = liquidity_score(opportunity);
    let speed = speed_score(opportunity, now, config);
    let risk = risk_score(opportunity);
    let market = market_score(market);

    let total = profit * WEIGHT_PROFIT
        + confidence * WEIGHT_CONFIDENCE
        + liquidity * WEIGHT_LIQUIDITY
        + speed * WEIGHT_SPEED
        + (100.0 - risk) * WEIGHT_RISK
        + market * WEIGHT_MARKET;

    Scores { profit, confidence, liquidity, speed, risk, market, total }
}

fn profit_score(opportunity: &Opportunity) -> f64 {
    match &opportunity.payload {
        OpportunityPayload::Arbitrage(p) => (p.net_profit_pct * 50.0).clamp(0.0, 100.0),
        OpportunityPayload::Mempool(p) => (p.value_usd / 1_000.0).clamp(0.0, 100.0),
        OpportunityPayload::Sandwich(_) => 60.0,
        // Anomalies and chain events carry no profit estimate of their own.
        OpportunityPayload::Anomaly(p) => p.deviation_pct.clamp(0.0, 100.0),
        OpportunityPayload::ChainEvent(_) => 30.0,
    }
}

fn confidence_score(opportunity: &Opportunity) -> f64 {
    match &opportunity.payload {
        // Variants with a declared confidence use it directly.
        OpportunityPayload::Mempool(p) => (p.confidence * 100.0).clamp(0.0, 100.0),
        OpportunityPayload::Arbitrage(p) => {
            let mut score: f64 = 50.0;
            if p.source_count > 3 {
                score += 20.0;
            }
            if p.liquidity == LiquidityTier::High {
                score += 15.0;
            }
            if p.price_impact_pct < 0.5 {
                score += 15.0;
            }
            score.min(100.0)
        }
        OpportunityPayload::Sandwich(p) => (40.0 + 10.0 * p.bundle.len() as f64).min(100.0),
        OpportunityPayload::Anomaly(_) => 50.0,
        OpportunityPayload::ChainEvent(_) => 50.0,
    }
}

fn liquidity_score(opportunity: &Opportunity) -> f64 {
    let tier = match &opportunity.payload {
        OpportunityPayload::Arbitrage(p) => p.liquidity,
        _ => LiquidityTier::Medium,
    };
    match tier {
        LiquidityTier::Low => 20.0,
        LiquidityTier::Medium => 60.0,
        LiquidityTier::High => 100.0,
    }
}

fn speed_score(opportunity: &Opportunity, now: u64, config: &PipelineConfig) -> f64 {
    let age = opportunity.age_ms(now) as f64;
    (100.0 - age / config.opportunity_timeout_ms as f64 * 100.0).max(0.0)
}

fn risk_score(opportunity: &Opportunity) -> f64 {
    let base = match &opportunity.payload {
        OpportunityPayload::Arbitrage(p) => p.risk_score,
        OpportunityPayload::Mempool(p) => match p.mev_risk {
            MevRisk::Low => 30.0,
            MevRisk::Medium => 50.0,
            MevRisk::High => 70.0,
        },
        OpportunityPayload::Sandwich(_) => 60.0,
        OpportunityPayload::Anomaly(_) => 80.0,
        OpportunityPayload::ChainEvent(_) => 40.0,
    };
    let urgency_penalty = match opportunity.urgency {
        Urgency::Critical => 10.0,
        Urgency::High => 5.0,
        _ => 0.0,
    };
    (base + urgency_penalty).min(100.0)
}

fn market_score(market: &MarketCondition) -> f64 {
    let mut score: f64 = 50.0;
    score += match market.volatility {
        ConditionLevel::Low => 10.0,
        ConditionLevel::Normal => 0.0,
        ConditionLevel::High => -20.0,
        ConditionLevel::Extreme => -40.0,
    };
    score += match market.liquidity {
        LiquidityTier::High => 20.0,
        LiquidityTier::Medium => 0.0,
        LiquidityTier::Low => -20.0,
    };
    score += match market.gas {
        ConditionLevel::Low => 10.0,
        ConditionLevel::Normal => 0.0,
        ConditionLevel::High => -15.0,
        ConditionLevel::Extreme => -30.0,
    };
    score.clamp(0.0, 100.0)
}

/// Execution queue priority: total score plus urgency and MEV boosts and a
/// freshness decay, capped at 150. Mempool candidates additionally carry
/// their stream priority (value, confidence, decay at observation), which
/// lifts the queue position by up to 10 points.
pub fn execution_priority(opportunity: &Opportunity, scores: &Scores, now: u64) -> f64 {
    let mut priority = scores.total;
    if opportunity.urgency == Urgency::Critical {
        priority += 20.0;
    }
    if opportunity.kind.is_mev() {
        priority += 15.0;
    }
    let age_s = opportunity.age_ms(now) as f64 / 1000.0;
    priority += (20.0 - age_s).max(0.0);
    if let Some(p) = opportunity.mempool() {
        priority += (p.priority_score / 10.0).clamp(0.0, 10.0);
    }
    priority.min(150.0)
}
