// Layered circuit breakers: a fixed registry of named gates over market,
// system, and loss telemetry. Trading is allowed iff every breaker is armed.
use crate::config::BreakerThresholds;
use crate::metrics as m;
use crate::types::{now_ms, TelemetrySample, TradeResult};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const ONE_HOUR_MS: u64 = 3_600_000;
pub const ONE_DAY_MS: u64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerGroup {
    Market,
    System,
    Loss,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationClass {
    Short,
    Medium,
    Long,
    Emergency,
}

impl DurationClass {
    pub fn duration(self) -> Duration {
        match self {
            DurationClass::Short => Duration::from_secs(5 * 60),
            DurationClass::Medium => Duration::from_secs(30 * 60),
            DurationClass::Long => Duration::from_secs(60 * 60),
            DurationClass::Emergency => Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// The full breaker registry.
pub const BREAKER_REGISTRY: &[(&str, BreakerGroup, DurationClass)] = &[
    // Market
    ("extreme_volatility", BreakerGroup::Market, DurationClass::Short),
    ("low_liquidity", BreakerGroup::Market, DurationClass::Medium),
    ("high_gas_price", BreakerGroup::Market, DurationClass::Short),
    ("market_crash", BreakerGroup::Market, DurationClass::Long),
    ("unusual_spread", BreakerGroup::Market, DurationClass::Short),
    // System
    ("high_error_rate", BreakerGroup::System, DurationClass::Medium),
    ("rpc_failure", BreakerGroup::System, DurationClass::Short),
    ("execution_delay", BreakerGroup::System, DurationClass::Short),
    ("memory_pressure", BreakerGroup::System, DurationClass::Medium),
    ("network_congestion", BreakerGroup::System, DurationClass::Short),
    // Loss
    ("daily_loss", BreakerGroup::Loss, DurationClass::Long),
    ("consecutive_loss", BreakerGroup::Loss, DurationClass::Medium),
    ("drawdown", BreakerGroup::Loss, DurationClass::Long),
    ("hourly_loss", BreakerGroup::Loss, DurationClass::Medium),
    // Emergency
    ("emergency", BreakerGroup::Emergency, DurationClass::Emergency),
];

/// Breakers whose trip also forces the emergency breaker.
pub const CRITICAL_BREAKERS: &[&str] = &["market_crash", "daily_loss", "drawdown", "emergency"];

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub name: &'static str,
    pub group: BreakerGroup,
    pub duration_class: DurationClass,
    pub tripped: bool,
    pub tripped_at: Option<Instant>,
    pub trip_count: u64,
    pub last_reason: Option<String>,
    pub auto_recovery: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: &'static str,
    pub group: BreakerGroup,
    pub tripped: bool,
    pub trip_count: u64,
    pub last_reason: Option<String>,
}

/// Rolling PnL and drawdown accounting behind the loss breakers.
#[derive(Debug, Clone)]
pub struct LossTracker {
    pub daily_pnl: f64,
    pub hourly_pnl: f64,
    pub consecutive_losses: u32,
    pub peak_value: f64,
    pub current_value: f64,
    pub last_daily_reset_ms: u64,
    pub last_hourly_reset_ms: u64,
}

impl LossTracker {
    fn new(now: u64) -> Self {
        Self {
            daily_pnl: 0.0,
            hourly_pnl: 0.0,
            consecutive_losses: 0,
            peak_value: 0.0,
            current_value: 0.0,
            last_daily_reset_ms: now,
            last_hourly_reset_ms: now,
        }
    }

    fn roll_windows(&mut self, now: u64) {
        if now.saturating_sub(self.last_hourly_reset_ms) >= ONE_HOUR_MS {
            self.hourly_pnl = 0.0;
            self.last_hourly_reset_ms = now;
        }
        if now.saturating_sub(self.last_daily_reset_ms) >= ONE_DAY_MS {
            self.daily_pnl = 0.0;
            self.last_daily_reset_ms = now;
        }
    }

    fn record(&mut self, result: &TradeResult, now: u64) {
        self.roll_windows(now);
        self.daily_pnl += result.pnl_usd;
        self.hourly_pnl += result.pnl_usd;
        self.current_value += result.pnl_usd;
        if result.pnl_usd > 0.0 {
            self.consecutive_losses = 0;
        } else if result.pnl_usd < 0.0 {
            self.consecutive_losses += 1;
        }
        if self.current_value > self.peak_value {
            self.peak_value = self.current_value;
        }
    }

    pub fn drawdown_pct(&self) -> f64 {
        if self.peak_value <= 0.0 {
            return 0.0;
        }
        (self.peak_value - self.current_value) / self.peak_value * 100.0
    }
}

/// Single source of truth for the `is_trading_allowed` gate.
pub struct CircuitBreakerManager {
    thresholds: BreakerThresholds,
    breakers: RwLock<HashMap<&'static str, CircuitBreaker>>,
    loss: RwLock<LossTracker>,
}

impl CircuitBreakerManager {
    pub fn new(thresholds: BreakerThresholds) -> Self {
        let mut breakers = HashMap::new();
        for &(name, group, duration_class) in BREAKER_REGISTRY {
            breakers.insert(
                name,
                CircuitBreaker {
                    name,
                    group,
                    duration_class,
                    tripped: false,
                    tripped_at: None,
                    trip_count: 0,
                    last_reason: None,
                    auto_recovery: group != BreakerGroup::Emergency,
                },
            );
        }
        info!("circuit breaker registry armed with {} breakers", breakers.len());
        Self {
            thresholds,
            breakers: RwLock::new(breakers),
            loss: RwLock::new(LossTracker::new(now_ms())),
        }
    }

    /// Evaluate one telemetry sample against every threshold; returns the
    /// breakers newly tripped by this sample.
    pub fn evaluate(&self, sample: &TelemetrySample) -> Vec<&'static str> {
        self.auto_recover();
        let t = &self.thresholds;
        let mut tripped = Vec::new();

        let mut check = |name: &'static str, crossed: bool, reason: String| {
            if crossed && self.trip(name, &reason) {
                tripped.push(name);
            }
        };

        check(
            "extreme_volatility",
            sample.volatility_pct > t.max_volatility_pct,
            format!("volatility {:.1}% > {:.1}%", sample.volatility_pct, t.max_volatility_pct),
        );
        check(
            "low_liquidity",
            sample.liquidity_usd > 0.0 && sample.liquidity_usd < t.min_liquidity_usd,
            format!("liquidity ${:.0} < ${:.0}", sample.liquidity_usd, t.min_liquidity_usd),
        );
        check(
            "high_gas_price",
            sample.gas_price_gwei > t.max_gas_price_gwei,
            format!("gas {:.0} gwei > {:.0}", sample.gas_price_gwei, t.max_gas_price_gwei),
        );
        check(
            "market_crash",
            sample.price_drop_pct > t.market_crash_drop_pct,
            format!("price drop {:.1}% > {:.1}%", sample.price_drop_pct, t.market_crash_drop_pct),
        );
        check(
            "unusual_spread",
            sample.spread_pct > t.max_spread_pct,
            format!("spread {:.2}% > {:.2}%", sample.spread_pct, t.max_spread_pct),
        );
        check(
            "high_error_rate",
            sample.error_rate > t.max_error_rate,
            format!("error rate {:.2} > {:.2}", sample.error_rate, t.max_error_rate),
        );
        check(
            "rpc_failure",
            sample.rpc_failure_rate > t.max_rpc_failure_rate,
            format!("rpc failure rate {:.2} > {:.2}", sample.rpc_failure_rate, t.max_rpc_failure_rate),
        );
        check(
            "execution_delay",
            sample.execution_delay_ms > t.max_execution_delay_ms,
            format!("execution delay {:.0}ms > {:.0}ms", sample.execution_delay_ms, t.max_execution_delay_ms),
        );
        check(
            "memory_pressure",
            sample.memory_pct > t.max_memory_pct,
            format!("memory {:.0}% > {:.0}%", sample.memory_pct, t.max_memory_pct),
        );
        check(
            "network_congestion",
            sample.network_congestion_pct > t.max_network_congestion_pct,
            format!("congestion {:.0}% > {:.0}%", sample.network_congestion_pct, t.max_network_congestion_pct),
        );

        tripped
    }

    /// Feed one trade outcome into loss accounting and re-check the loss
    /// breakers. Returns the breakers newly tripped.
    pub fn record_trade(&self, result: &TradeResult) -> Vec<&'static str> {
        let now = now_ms();
        let (daily, hourly, consecutive, drawdown) = {
            let mut loss = self.loss.write();
            loss.record(result, now);
            (loss.daily_pnl, loss.hourly_pnl, loss.consecutive_losses, loss.drawdown_pct())
        };

        let t = &self.thresholds;
        let mut tripped = Vec::new();
        let mut check = |name: &'static str, crossed: bool, reason: String| {
            if crossed && self.trip(name, &reason) {
                tripped.push(name);
            }
        };
        check(
            "daily_loss",
            daily <= -t.max_daily_loss_usd,
            format!("daily pnl ${daily:.0} breached -${:.0}", t.max_daily_loss_usd),
        );
        check(
            "hourly_loss",
            hourly <= -t.max_hourly_loss_usd,
            format!("hourly pnl ${hourly:.0} breached -${:.0}", t.max_hourly_loss_usd),
        );
        check(
            "consecutive_loss",
            consecutive >= t.max_consecutive_losses,
            format!("{consecutive} consecutive losses"),
        );
        check(
            "drawdown",
            drawdown > t.max_drawdown_pct,
            format!("drawdown {drawdown:.1}% > {:.1}%", t.max_drawdown_pct),
        );
        tripped
    }

    /// Trip a breaker. Re-tripping an already-tripped breaker only bumps its
    /// counter. Returns true when the state changed armed -> tripped.
    pub fn trip(&self, name: &str, reason: &str) -> bool {
        let force_emergency = {
            let mut breakers = self.breakers.write();
            let Some(breaker) = breakers.get_mut(name) else {
                warn!("unknown breaker {name}");
                return false;
            };
            breaker.trip_count += 1;
            breaker.last_reason = Some(reason.to_string());
            if breaker.tripped {
                return false;
            }
            breaker.tripped = true;
            breaker.tripped_at = Some(Instant::now());
            warn!("circuit breaker {name} TRIPPED: {reason}");
            metrics::counter!(m::BREAKER_TRIPS, "breaker" => breaker.name).increment(1);
            CRITICAL_BREAKERS.contains(&name) && name != "emergency"
        };
        // Critical breakers drag the emergency breaker down with them.
        if force_emergency {
            self.trip("emergency", &format!("critical breaker {name} tripped"));
        }
        true
    }

    /// Re-arm tripped breakers whose duration has elapsed. Emergency never
    /// auto-recovers.
    pub fn auto_recover(&self) -> Vec<&'static str> {
        let mut recovered = Vec::new();
        let mut breakers = self.breakers.write();
        for breaker in breakers.values_mut() {
            if breaker.tripped && breaker.auto_recovery {
                if let Some(at) = breaker.tripped_at {
                    if at.elapsed() >= breaker.duration_class.duration() {
                        breaker.tripped = false;
                        breaker.tripped_at = None;
                        info!("circuit breaker {} auto-recovered", breaker.name);
                        recovered.push(breaker.name);
                    }
                }
            }
        }
        recovered
    }

    /// Explicit reset, used by the emergency-stop recovery path.
    pub fn reset(&self, name: &str) {
        let mut breakers = self.breakers.write();
        if let Some(breaker) = breakers.get_mut(name) {
            breaker.tripped = false;
            breaker.tripped_at = None;
            info!("circuit breaker {name} reset");
        }
    }

    pub fn reset_all(&self) {
        let mut breakers = self.breakers.write();
        for breaker in breakers.values_mut() {
            breaker.tripped = false;
            breaker.tripped_at = None;
        }
        info!("all circuit breakers reset");
    }

    /// Trading is allowed iff every breaker is armed.
    pub fn is_trading_allowed(&self) -> bool {
        self.breakers.read().values().all(|b| !b.tripped)
    }

    pub fn active_trips(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .read()
            .values()
            .filter(|b| b.tripped)
            .map(|b| b.name.to_string())
            .collect();
        names.sort();
        names
    }

    pub fn is_tripped(&self, name: &str) -> bool {
        self.breakers.read().get(name).map(|b| b.tripped).unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> = self
            .breakers
            .read()
            .values()
            .map(|b| BreakerStatus {
                name: b.name,
                group: b.group,
                tripped: b.tripped,
                trip_count: b.trip_count,
                last_reason: b.last_reason.clone(),
            })
            .collect();
        statuses.sort_by_key(|s| s.name);
        statuses
    }

    pub fn loss_snapshot(&self) -> LossTracker {
        self.loss.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn rewind_trip(&self, name: &str, by: Duration) {
        let mut breakers = self.breakers.write();
        if let Some(breaker) = breakers.get_mut(name) {
            breaker.tripped_at = Some(Instant::now() - by);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(pnl: f64) -> TradeResult {
        TradeResult {
            opportunity_id: uuid::Uuid::new_v4().to_string(),
            success: pnl > 0.0,
            pnl_usd: pnl,
            gas_used: 150_000,
        }
    }

    #[test]
    fn test_registry_fully_armed_at_start() {
        let manager = CircuitBreakerManager::new(BreakerThresholds::default());
        assert!(manager.is_trading_allowed());
        assert_eq!(manager.snapshot().len(), BREAKER_REGISTRY.len());
    }

    #[test]
    fn test_daily_loss_cascade_to_emergency() {
        let manager = CircuitBreakerManager::new(BreakerThresholds::default());
        // -400, -400: under the 1000 limit, still trading.
        manager.record_trade(&trade(-400.0));
        manager.record_trade(&trade(-400.0));
        assert!(manager.is_trading_allowed());
        // Third trade crosses the limit.
        let tripped = manager.record_trade(&trade(-300.0));
        assert!(tripped.contains(&"daily_loss"));
        assert!(manager.is_tripped("daily_loss"));
        assert!(manager.is_tripped("emergency"));
        assert!(!manager.is_trading_allowed());
        let active = manager.active_trips();
        assert!(active.contains(&"daily_loss".to_string()));
        assert!(active.contains(&"emergency".to_string()));
    }

    #[test]
    fn test_retrip_only_bumps_counter() {
        let manager = CircuitBreakerManager::new(BreakerThresholds::default());
        assert!(manager.trip("rpc_failure", "first"));
        assert!(!manager.trip("rpc_failure", "second"));
        let status = manager
            .snapshot()
            .into_iter()
            .find(|s| s.name == "rpc_failure")
            .unwrap();
        assert_eq!(status.trip_count, 2);
        assert_eq!(status.last_reason.as_deref(), Some("second"));
    }

    #[test]
    fn test_telemetry_trips_market_breakers() {
        let manager = CircuitBreakerManager::new(BreakerThresholds::default());
        let sample = TelemetrySample {
            volatility_pct: 20.0,
            gas_price_gwei: 500.0,
            spread_pct: 12.0,
            ..TelemetrySample::default()
        };
        let tripped = manager.evaluate(&sample);
        assert!(tripped.contains(&"extreme_volatility"));
        assert!(tripped.contains(&"high_gas_price"));
        assert!(tripped.contains(&"unusual_spread"));
        assert!(!manager.is_trading_allowed());
    }

    #[test]
    fn test_auto_recovery_after_duration() {
        let manager = CircuitBreakerManager::new(BreakerThresholds::default());
        manager.trip("rpc_failure", "outage");
        assert!(!manager.is_trading_allowed());
        // Not yet elapsed.
        assert!(manager.auto_recover().is_empty());
        manager.rewind_trip("rpc_failure", Duration::from_secs(6 * 60));
        let recovered = manager.auto_recover();
        assert_eq!(recovered, vec!["rpc_failure"]);
        assert!(manager.is_trading_allowed());
    }

    #[test]
    fn test_emergency_never_auto_recovers() {
        let manager = CircuitBreakerManager::new(BreakerThresholds::default());
        manager.trip("emergency", "manual");
        manager.rewind_trip("emergency", Duration::from_secs(10 * 60 * 60));
        assert!(manager.auto_recover().is_empty());
        assert!(manager.is_tripped("emergency"));
    }

    #[test]
    fn test_consecutive_losses_reset_on_profit() {
        let manager = CircuitBreakerManager::new(BreakerThresholds::default());
        for _ in 0..4 {
            manager.record_trade(&trade(-10.0));
        }
        manager.record_trade(&trade(5.0));
        assert_eq!(manager.loss_snapshot().consecutive_losses, 0);
        assert!(!manager.is_tripped("consecutive_loss"));
    }

    #[test]
    fn test_drawdown_tracking() {
        let manager = CircuitBreakerManager::new(BreakerThresholds::default());
        manager.record_trade(&trade(1_000.0));
        manager.record_trade(&trade(-200.0));
        let loss = manager.loss_snapshot();
        assert!((loss.drawdown_pct() - 20.0).abs() < 1e-9);
        assert!(manager.is_tripped("drawdown"));
    }
}
