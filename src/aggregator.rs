// Price aggregation: outlier rejection, confidence-weighted consensus, and
// cross-venue spread detection feeding the opportunity pipeline.
use crate::config::AggregatorConfig;
use crate::metrics as m;
use crate::types::{
    now_ms, AggregatedPrice, ArbitragePayload, LiquidityTier, Opportunity, OpportunityKind,
    OpportunityPayload, PricePoint, Urgency,
};
use dashmap::DashMap;
use rust_decimal::prelude::{Decimal, ToPrimitive};
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Modified Z-score cutoff for the median/MAD outlier test.
const MODIFIED_Z_CUTOFF: f64 = 3.5;

/// Fallback venue depth when a source reports no liquidity, USD.
const DEFAULT_LIQUIDITY_USD: f64 = 1_000_000.0;

/// Aggregates per-source price points into a per-symbol consensus and emits
/// `price_arbitrage` opportunities when venues disagree past the fee budget.
pub struct PriceAggregator {
    config: AggregatorConfig,
    /// symbol -> source -> latest point from that source.
    prices: DashMap<String, HashMap<String, PricePoint>>,
    history: DashMap<String, VecDeque<AggregatedPrice>>,
    /// source id -> reliability (success-rate EMA), maintained by the feed
    /// manager and read here for the confidence formula.
    reliability: Arc<DashMap<String, f64>>,
    opportunity_tx: mpsc::Sender<Opportunity>,
}

impl PriceAggregator {
    pub fn new(
        config: AggregatorConfig,
        reliability: Arc<DashMap<String, f64>>,
        opportunity_tx: mpsc::Sender<Opportunity>,
    ) -> Self {
        Self {
            config,
            prices: DashMap::new(),
            history: DashMap::new(),
            reliability,
            opportunity_tx,
        }
    }

    /// Ingest one point, recompute the symbol's aggregate, and emit any
    /// cross-venue opportunities found among the fresh contributors.
    pub fn ingest(&self, point: PricePoint) -> Option<AggregatedPrice> {
        if !point.is_valid() {
            warn!("discarding invalid price point from {}", point.source_id);
            return None;
        }
        let symbol = point.symbol.clone();
        self.prices
            .entry(symbol.clone())
            .or_default()
            .insert(point.source_id.clone(), point);

        let aggregated = self.aggregate_at(&symbol, now_ms())?;
        metrics::counter!(m::PRICES_AGGREGATED).increment(1);

        for opportunity in self.cross_venue_opportunities(&aggregated) {
            if let Err(err) = self.opportunity_tx.try_send(opportunity) {
                debug!("opportunity channel full, dropping: {err}");
            }
        }

        self.history
            .entry(symbol)
            .or_default()
            .push_back(aggregated.clone());
        if let Some(mut history) = self.history.get_mut(&aggregated.symbol) {
            while history.len() > self.config.history_depth {
                history.pop_front();
            }
        }
        Some(aggregated)
    }

    /// Pure aggregation of the currently stored points for `symbol`, as of
    /// `now`. Aggregating the same set twice with the same `now` yields the
    /// same result.
    pub fn aggregate_at(&self, symbol: &str, now: u64) -> Option<AggregatedPrice> {
        let started = Instant::now();
        let fresh: Vec<PricePoint> = {
            let by_source = self.prices.get(symbol)?;
            by_source
                .values()
                .filter(|p| p.age_ms(now) <= self.config.max_price_age_ms)
                .cloned()
                .collect()
        };
        if fresh.len() < self.config.min_sources {
            return None;
        }

        let (kept, outlier_count) = self.filter_outliers(&fresh);
        if kept.is_empty() {
            metrics::counter!(m::PRICE_OUTLIERS).increment(outlier_count as u64);
            return None;
        }
        if outlier_count > 0 {
            metrics::counter!(m::PRICE_OUTLIERS).increment(outlier_count as u64);
        }

        let weight_sum: f64 = kept.iter().map(|p| p.weight * p.confidence).sum();
        let price = if weight_sum > 0.0 {
            kept.iter().map(|p| p.price * p.weight * p.confidence).sum::<f64>() / weight_sum
        } else {
            kept.iter().map(|p| p.price).sum::<f64>() / kept.len() as f64
        };

        let volume_sum: f64 = kept.iter().filter_map(|p| p.volume).sum();
        let volume_weighted_price = if volume_sum > 0.0 {
            Some(
                kept.iter()
                    .filter_map(|p| p.volume.map(|v| p.price * v))
                    .sum::<f64>()
                    / volume_sum,
            )
        } else {
            None
        };

        let min = kept.iter().map(|p| p.price).fold(f64::INFINITY, f64::min);
        let max = kept.iter().map(|p| p.price).fold(f64::NEG_INFINITY, f64::max);
        let spread = if min > 0.0 { (max - min) / min } else { 0.0 };

        let confidence = self.confidence(&kept, spread, now);

        Some(AggregatedPrice {
            symbol: symbol.to_string(),
            price,
            volume_weighted_price,
            confidence,
            spread,
            source_count: kept.len(),
            outlier_count,
            points: kept,
            processing_latency_us: started.elapsed().as_micros() as u64,
            timestamp_ms: now,
        })
    }

    /// Median/MAD modified-Z outlier test plus a relative deviation cutoff.
    fn filter_outliers(&self, points: &[PricePoint]) -> (Vec<PricePoint>, usize) {
        if points.len() < 3 {
            // Too few samples to call anything an outlier.
            return (points.to_vec(), 0);
        }
        let median = median_of(points.iter().map(|p| p.price));
        let mad = median_of(points.iter().map(|p| (p.price - median).abs()));

        let mut kept = Vec::with_capacity(points.len());
        let mut outliers = 0usize;
        for point in points {
            let deviation = (point.price - median).abs();
            let relative = if median > 0.0 { deviation / median } else { 0.0 };
            let modified_z = if mad > 0.0 { 0.6745 * deviation / mad } else { 0.0 };
            if modified_z > MODIFIED_Z_CUTOFF || relative > self.config.outlier_threshold {
                debug!(
                    "outlier from {} on {}: {} (median {median:.6}, z {modified_z:.2})",
                    point.source_id, point.symbol, point.price
                );
                outliers += 1;
            } else {
                kept.push(point.clone());
            }
        }
        (kept, outliers)
    }

    /// Confidence grows with source agreement and decays with spread,
    /// unreliable sources, and stale points. Clamped to [0.1, 1.0].
    fn confidence(&self, kept: &[PricePoint], spread: f64, now: u64) -> f64 {
        let base = (0.4 + 0.15 * (kept.len() as f64 - 1.0)).min(0.9);
        let spread_factor = (1.0 - 10.0 * spread).max(0.3);
        let reliability_factor = {
            let sum: f64 = kept
                .iter()
                .map(|p| self.reliability.get(&p.source_id).map(|r| *r).unwrap_or(1.0))
                .sum();
            sum / kept.len() as f64
        };
        let avg_age_ms =
            kept.iter().map(|p| p.age_ms(now) as f64).sum::<f64>() / kept.len() as f64;
        let freshness_factor =
            (1.0 - avg_age_ms / self.config.max_price_age_ms as f64).max(0.5);

        (base * spread_factor * reliability_factor * freshness_factor).clamp(0.1, 1.0)
    }

    /// Every pair of contributing venues whose relative disagreement exceeds
    /// the fee ceiling becomes a `price_arbitrage` candidate.
    fn cross_venue_opportunities(&self, aggregated: &AggregatedPrice) -> Vec<Opportunity> {
        let fee_ceiling = self.config.fee_budget_pct / 100.0;
        let mut opportunities = Vec::new();

        for (i, a) in aggregated.points.iter().enumerate() {
            for b in aggregated.points.iter().skip(i + 1) {
                if a.venue == b.venue {
                    continue;
                }
                let mean = (a.price + b.price) / 2.0;
                if mean <= 0.0 {
                    continue;
                }
                let gap = (a.price - b.price).abs() / mean;
                if gap <= fee_ceiling {
                    continue;
                }
                let (buy, sell) = if a.price <= b.price { (a, b) } else { (b, a) };
                // Spread and net profit in exact decimal arithmetic; the
                // reported spread is relative to the buy side.
                let buy_price = Decimal::from_f64_retain(buy.price).unwrap_or_default();
                let sell_price = Decimal::from_f64_retain(sell.price).unwrap_or_default();
                if buy_price <= Decimal::ZERO {
                    continue;
                }
                let spread = (sell_price - buy_price) / buy_price * dec!(100);
                let fee_budget = Decimal::from_f64_retain(self.config.fee_budget_pct)
                    .unwrap_or_default();
                let spread_pct = spread.to_f64().unwrap_or(0.0);
                let net_profit_pct = (spread - fee_budget).to_f64().unwrap_or(0.0);
                let price_impact_pct = self.price_impact_pct(buy) + self.price_impact_pct(sell);
                let combined_liquidity = buy.liquidity.unwrap_or(DEFAULT_LIQUIDITY_USD)
                    + sell.liquidity.unwrap_or(DEFAULT_LIQUIDITY_USD);
                let liquidity = liquidity_tier(combined_liquidity);
                let risk_score =
                    self.risk_score(net_profit_pct, spread_pct, &aggregated.symbol);

                let urgency = if net_profit_pct > 2.0 {
                    Urgency::Critical
                } else if net_profit_pct > 0.5 {
                    Urgency::High
                } else {
                    Urgency::Medium
                };

                opportunities.push(Opportunity::new(
                    OpportunityKind::PriceArbitrage,
                    aggregated.symbol.clone(),
                    "aggregator",
                    urgency,
                    OpportunityPayload::Arbitrage(ArbitragePayload {
                        buy_venue: buy.venue.clone(),
                        sell_venue: sell.venue.clone(),
                        buy_price: buy.price,
                        sell_price: sell.price,
                        spread_pct,
                        fee_budget_pct: self.config.fee_budget_pct,
                        net_profit_pct,
                        price_impact_pct,
                        liquidity,
                        combined_liquidity_usd: combined_liquidity,
                        source_count: aggregated.source_count,
                        risk_score,
                    }),
                ));
            }
        }
        opportunities
    }

    /// Square-root impact model for one leg, percent of notional.
    fn price_impact_pct(&self, point: &PricePoint) -> f64 {
        let liquidity = point.liquidity.unwrap_or(DEFAULT_LIQUIDITY_USD).max(1.0);
        (self.config.trade_size_usd / liquidity).sqrt() * 0.01 * 100.0
    }

    /// Penalties for thin profit, wide spreads, and recent volatility,
    /// capped at 100.
    fn risk_score(&self, net_profit_pct: f64, spread_pct: f64, symbol: &str) -> f64 {
        let mut score: f64 = 10.0;
        if net_profit_pct < 0.5 {
            score += 30.0;
        } else if net_profit_pct < 1.0 {
            score += 15.0;
        }
        if spread_pct > 5.0 {
            score += 25.0;
        } else if spread_pct > 2.0 {
            score += 10.0;
        }
        if let Some(volatility) = self.recent_volatility_pct(symbol) {
            if volatility > 2.0 {
                score += 20.0;
            } else if volatility > 1.0 {
                score += 10.0;
            }
        }
        score.min(100.0)
    }

    /// Std-dev of recent aggregated prices relative to their mean, percent.
    pub fn recent_volatility_pct(&self, symbol: &str) -> Option<f64> {
        let history = self.history.get(symbol)?;
        if history.len() < 3 {
            return None;
        }
        let prices: Vec<f64> = history.iter().map(|a| a.price).collect();
        let mean = prices.iter().sum::<f64>() / prices.len() as f64;
        if mean <= 0.0 {
            return None;
        }
        let variance =
            prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / prices.len() as f64;
        Some(variance.sqrt() / mean * 100.0)
    }

    /// Trailing mean of other sources' fresh quotes, used by the feed
    /// manager's anomaly detector.
    pub fn peer_mean_excluding(&self, symbol: &str, source_id: &str, now: u64) -> Option<f64> {
        let by_source = self.prices.get(symbol)?;
        let peers: Vec<f64> = by_source
            .values()
            .filter(|p| p.source_id != source_id && p.age_ms(now) <= self.config.max_price_age_ms)
            .map(|p| p.price)
            .collect();
        if peers.is_empty() {
            return None;
        }
        Some(peers.iter().sum::<f64>() / peers.len() as f64)
    }

    pub fn latest(&self, symbol: &str) -> Option<AggregatedPrice> {
        self.history.get(symbol)?.back().cloned()
    }

    /// Widest spread among symbols with a current aggregate, percent.
    pub fn widest_spread_pct(&self) -> f64 {
        self.history
            .iter()
            .filter_map(|entry| entry.value().back().map(|a| a.spread * 100.0))
            .fold(0.0, f64::max)
    }

    /// Highest recent volatility across tracked symbols, percent.
    pub fn max_recent_volatility_pct(&self) -> f64 {
        let symbols: Vec<String> = self.history.iter().map(|e| e.key().clone()).collect();
        symbols
            .iter()
            .filter_map(|symbol| self.recent_volatility_pct(symbol))
            .fold(0.0, f64::max)
    }

    /// Largest peak-to-latest drop across tracked symbols, percent.
    /// Feeds the market-crash breaker.
    pub fn max_recent_drop_pct(&self) -> f64 {
        self.history
            .iter()
            .filter_map(|entry| {
                let history = entry.value();
                let latest = history.back()?.price;
                let peak = history.iter().map(|a| a.price).fold(f64::NEG_INFINITY, f64::max);
                if peak > 0.0 && latest < peak {
                    Some((peak - latest) / peak * 100.0)
                } else {
                    None
                }
            })
            .fold(0.0, f64::max)
    }

    /// Combined latest liquidity across contributing points, USD.
    pub fn total_recent_liquidity_usd(&self) -> f64 {
        self.history
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .back()
                    .map(|a| a.points.iter().filter_map(|p| p.liquidity).sum::<f64>())
            })
            .sum()
    }
}

fn median_of(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn liquidity_tier(combined_usd: f64) -> LiquidityTier {
    if combined_usd < 100_000.0 {
        LiquidityTier::Low
    } else if combined_usd < 1_000_000.0 {
        LiquidityTier::Medium
    } else {
        LiquidityTier::High
    }
}
