// Engine configuration: explicit per-component records with defaults,
// environment overrides, TOML loading, and loud validation at init.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;

/// One streaming/RPC endpoint served by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub ws_url: String,
    pub http_url: String,
    /// Lower is preferred. 0..=10.
    pub priority: u8,
    pub weight: f64,
    /// Requests admitted per rate-limit window.
    pub rate_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub rate_limit_window_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub request_timeout_ms: u64,
    pub health_probe_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            rate_limit_window_ms: 1_000,
            reconnect_delay_ms: 500,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            request_timeout_ms: 10_000,
            health_probe_interval_ms: 15_000,
        }
    }
}

/// Cache write policy per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    WriteThrough,
    WriteBehind,
    CacheAside,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheCategory {
    pub ttl_secs: u64,
    pub policy: CachePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub prefix: String,
    /// Shared-tier connection string; empty disables the shared tier.
    pub redis_url: String,
    pub max_memory_bytes: usize,
    pub categories: HashMap<String, CacheCategory>,
    pub write_behind_flush_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut categories = HashMap::new();
        categories.insert("prices".into(), CacheCategory { ttl_secs: 30, policy: CachePolicy::WriteThrough });
        categories.insert("opportunities".into(), CacheCategory { ttl_secs: 60, policy: CachePolicy::WriteBehind });
        categories.insert("pools".into(), CacheCategory { ttl_secs: 300, policy: CachePolicy::CacheAside });
        categories.insert("tokens".into(), CacheCategory { ttl_secs: 3_600, policy: CachePolicy::CacheAside });
        categories.insert("transactions".into(), CacheCategory { ttl_secs: 86_400, policy: CachePolicy::WriteThrough });
        categories.insert("analytics".into(), CacheCategory { ttl_secs: 300, policy: CachePolicy::WriteBehind });
        Self {
            prefix: "arbflow".into(),
            redis_url: String::new(),
            max_memory_bytes: 64 * 1024 * 1024,
            categories,
            write_behind_flush_ms: 1_000,
            cleanup_interval_ms: 30_000,
        }
    }
}

/// One on-chain oracle feed mapping a symbol to an aggregator contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleFeedConfig {
    pub symbol: String,
    pub feed_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedsConfig {
    pub poll_interval_ms: u64,
    pub failover_threshold: u32,
    /// Relative deviation from peer mean that flags a price anomaly.
    pub anomaly_threshold: f64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub symbols: Vec<String>,
    pub oracle_feeds: Vec<OracleFeedConfig>,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            failover_threshold: 5,
            anomaly_threshold: 0.05,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            symbols: vec!["WETH/USDC".into()],
            oracle_feeds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub min_sources: usize,
    pub max_price_age_ms: u64,
    /// Relative deviation from the median that discards a point outright.
    pub outlier_threshold: f64,
    /// Round-trip trading-fee budget, percent of notional.
    pub fee_budget_pct: f64,
    /// Notional used by the price-impact model, USD.
    pub trade_size_usd: f64,
    pub history_depth: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_sources: 2,
            max_price_age_ms: 30_000,
            outlier_threshold: 0.10,
            fee_budget_pct: 0.6,
            trade_size_usd: 10_000.0,
            history_depth: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    /// Total queue budget; each priority class gets a quarter.
    pub max_queue_size: usize,
    pub handler_error_budget: u64,
    pub cache_events: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_interval_ms: 100,
            max_queue_size: 4_000,
            handler_error_budget: 100,
            cache_events: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolConfig {
    pub enabled: bool,
    /// Contracts whose pending traffic and logs are watched.
    pub dex_contracts: Vec<String>,
    pub frontrun_gas_gwei: f64,
    pub sandwich_window_ms: u64,
    pub sandwich_min_txs: usize,
    /// Token symbols treated as high-value for confidence boosts.
    pub high_value_tokens: Vec<String>,
    pub large_amount_usd: f64,
    /// Token contract address -> aggregator symbol, used to value decoded
    /// swap amounts in USD.
    pub token_symbols: HashMap<String, String>,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dex_contracts: Vec::new(),
            frontrun_gas_gwei: 100.0,
            sandwich_window_ms: 30_000,
            sandwich_min_txs: 3,
            high_value_tokens: vec!["WETH".into(), "WBTC".into()],
            large_amount_usd: 50_000.0,
            token_symbols: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Admission floor as a fraction (0.005 = 0.5%).
    pub min_profit_threshold: f64,
    pub max_risk_score: f64,
    pub max_concurrent_opportunities: usize,
    pub opportunity_timeout_ms: u64,
    pub price_validity_window_ms: u64,
    pub mev_max_age_ms: u64,
    pub risk_assessment_timeout_ms: u64,
    pub history_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_profit_threshold: 0.005,
            max_risk_score: 70.0,
            max_concurrent_opportunities: 10,
            opportunity_timeout_ms: 30_000,
            price_validity_window_ms: 10_000,
            mev_max_age_ms: 5_000,
            risk_assessment_timeout_ms: 2_000,
            history_depth: 1_000,
        }
    }
}

/// Thresholds for the full breaker registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerThresholds {
    // Market
    pub max_volatility_pct: f64,
    pub min_liquidity_usd: f64,
    pub max_gas_price_gwei: f64,
    pub market_crash_drop_pct: f64,
    pub max_spread_pct: f64,
    // System
    pub max_error_rate: f64,
    pub max_rpc_failure_rate: f64,
    pub max_execution_delay_ms: f64,
    pub max_memory_pct: f64,
    pub max_network_congestion_pct: f64,
    // Loss
    pub max_daily_loss_usd: f64,
    pub max_hourly_loss_usd: f64,
    pub max_consecutive_losses: u32,
    pub max_drawdown_pct: f64,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            max_volatility_pct: 15.0,
            min_liquidity_usd: 50_000.0,
            max_gas_price_gwei: 300.0,
            market_crash_drop_pct: 20.0,
            max_spread_pct: 10.0,
            max_error_rate: 0.25,
            max_rpc_failure_rate: 0.5,
            max_execution_delay_ms: 15_000.0,
            max_memory_pct: 90.0,
            max_network_congestion_pct: 90.0,
            max_daily_loss_usd: 1_000.0,
            max_hourly_loss_usd: 400.0,
            max_consecutive_losses: 5,
            max_drawdown_pct: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    pub trade_completion_timeout_ms: u64,
    pub position_liquidation_timeout_ms: u64,
    pub system_shutdown_timeout_ms: u64,
    pub min_recovery_wait_ms: u64,
    pub gradual_restart_delay_ms: u64,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            trade_completion_timeout_ms: 30_000,
            position_liquidation_timeout_ms: 60_000,
            system_shutdown_timeout_ms: 15_000,
            min_recovery_wait_ms: 300_000,
            gradual_restart_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentConfig {
    pub detection_interval_ms: u64,
    /// Z-score above which a sample is anomalous.
    pub anomaly_threshold: f64,
    pub baseline_window_hours: u64,
    pub cascade_timeout_ms: u64,
    pub cascade_min_incidents: usize,
    pub max_recovery_attempts: u32,
    pub escalation_interval_ms: u64,
    pub step_timeout_ms: u64,
    pub step_retries: u32,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            detection_interval_ms: 5_000,
            anomaly_threshold: 3.0,
            baseline_window_hours: 24,
            cascade_timeout_ms: 120_000,
            cascade_min_incidents: 3,
            max_recovery_attempts: 3,
            escalation_interval_ms: 300_000,
            step_timeout_ms: 10_000,
            step_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub monitoring_interval_ms: u64,
    pub metrics_window_size: usize,
    pub breakers: BreakerThresholds,
    pub emergency: EmergencyConfig,
    pub incidents: IncidentConfig,
    pub alert_timeout_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_ms: 5_000,
            metrics_window_size: 720,
            breakers: BreakerThresholds::default(),
            emergency: EmergencyConfig::default(),
            incidents: IncidentConfig::default(),
            alert_timeout_ms: 2_000,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    pub cache: CacheConfig,
    pub feeds: FeedsConfig,
    pub aggregator: AggregatorConfig,
    pub router: RouterConfig,
    pub mempool: MempoolConfig,
    pub pipeline: PipelineConfig,
    pub safety: SafetyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            cache: CacheConfig::default(),
            feeds: FeedsConfig::default(),
            aggregator: AggregatorConfig::default(),
            router: RouterConfig::default(),
            mempool: MempoolConfig::default(),
            pipeline: PipelineConfig::default(),
            safety: SafetyConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = env::var("MIN_PROFIT_THRESHOLD") {
            config.pipeline.min_profit_threshold = v.parse().unwrap_or(config.pipeline.min_profit_threshold);
        }
        if let Ok(v) = env::var("MAX_RISK_SCORE") {
            config.pipeline.max_risk_score = v.parse().unwrap_or(config.pipeline.max_risk_score);
        }
        if let Ok(v) = env::var("MAX_CONCURRENT_OPPORTUNITIES") {
            config.pipeline.max_concurrent_opportunities =
                v.parse().unwrap_or(config.pipeline.max_concurrent_opportunities);
        }
        if let Ok(v) = env::var("OPPORTUNITY_TIMEOUT_MS") {
            config.pipeline.opportunity_timeout_ms = v.parse().unwrap_or(config.pipeline.opportunity_timeout_ms);
        }
        if let Ok(v) = env::var("OUTLIER_THRESHOLD") {
            config.aggregator.outlier_threshold = v.parse().unwrap_or(config.aggregator.outlier_threshold);
        }
        if let Ok(v) = env::var("MIN_SOURCES") {
            config.aggregator.min_sources = v.parse().unwrap_or(config.aggregator.min_sources);
        }
        if let Ok(v) = env::var("MAX_PRICE_AGE_MS") {
            config.aggregator.max_price_age_ms = v.parse().unwrap_or(config.aggregator.max_price_age_ms);
        }
        if let Ok(v) = env::var("MONITORING_INTERVAL_MS") {
            config.safety.monitoring_interval_ms = v.parse().unwrap_or(config.safety.monitoring_interval_ms);
        }
        if let Ok(v) = env::var("METRICS_WINDOW_SIZE") {
            config.safety.metrics_window_size = v.parse().unwrap_or(config.safety.metrics_window_size);
        }
        if let Ok(v) = env::var("RATE_LIMIT_WINDOW_MS") {
            config.transport.rate_limit_window_ms = v.parse().unwrap_or(config.transport.rate_limit_window_ms);
        }
        if let Ok(v) = env::var("MAX_DAILY_LOSS_USD") {
            config.safety.breakers.max_daily_loss_usd = v.parse().unwrap_or(config.safety.breakers.max_daily_loss_usd);
        }
        if let Ok(v) = env::var("TRADE_COMPLETION_TIMEOUT_MS") {
            config.safety.emergency.trade_completion_timeout_ms =
                v.parse().unwrap_or(config.safety.emergency.trade_completion_timeout_ms);
        }
        if let Ok(v) = env::var("REDIS_URL") {
            config.cache.redis_url = v;
        }
        if let Ok(v) = env::var("CACHE_PREFIX") {
            config.cache.prefix = v;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fail loudly on invalid thresholds. Fatal configuration errors are an
    /// initialization failure, never a silent fallback.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.min_profit_threshold <= 0.0 || self.pipeline.min_profit_threshold >= 1.0 {
            anyhow::bail!("pipeline.min_profit_threshold must be in (0, 1)");
        }
        if !(0.0..=100.0).contains(&self.pipeline.max_risk_score) {
            anyhow::bail!("pipeline.max_risk_score must be in [0, 100]");
        }
        if self.pipeline.max_concurrent_opportunities == 0 {
            anyhow::bail!("pipeline.max_concurrent_opportunities must be positive");
        }
        if self.aggregator.min_sources == 0 {
            anyhow::bail!("aggregator.min_sources must be positive");
        }
        if self.aggregator.outlier_threshold <= 0.0 {
            anyhow::bail!("aggregator.outlier_threshold must be positive");
        }
        if self.aggregator.max_price_age_ms == 0 {
            anyhow::bail!("aggregator.max_price_age_ms must be positive");
        }
        if self.router.batch_size == 0 {
            anyhow::bail!("router.batch_size must be positive");
        }
        if self.router.max_queue_size < 4 {
            anyhow::bail!("router.max_queue_size must be at least 4");
        }
        if self.safety.breakers.max_daily_loss_usd <= 0.0 {
            anyhow::bail!("safety.breakers.max_daily_loss_usd must be positive");
        }
        if self.safety.breakers.max_drawdown_pct <= 0.0 {
            anyhow::bail!("safety.breakers.max_drawdown_pct must be positive");
        }
        if self.safety.incidents.anomaly_threshold <= 0.0 {
            anyhow::bail!("safety.incidents.anomaly_threshold must be positive");
        }
        if self.cache.max_memory_bytes == 0 {
            anyhow::bail!("cache.max_memory_bytes must be positive");
        }
        for (name, category) in &self.cache.categories {
            if category.ttl_secs == 0 {
                anyhow::bail!("cache category {name} has zero ttl");
            }
        }
        for endpoint in &self.transport.endpoints {
            if endpoint.priority > 10 {
                anyhow::bail!("endpoint {} priority must be 0..=10", endpoint.id);
            }
            if endpoint.rate_limit == 0 {
                anyhow::bail!("endpoint {} rate_limit must be positive", endpoint.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_category_defaults() {
        let config = CacheConfig::default();
        let prices = config.categories.get("prices").unwrap();
        assert_eq!(prices.ttl_secs, 30);
        assert_eq!(prices.policy, CachePolicy::WriteThrough);
        let analytics = config.categories.get("analytics").unwrap();
        assert_eq!(analytics.policy, CachePolicy::WriteBehind);
    }

    #[test]
    fn test_validation_rejects_bad_thresholds() {
        let mut config = EngineConfig::default();
        config.pipeline.min_profit_threshold = 0.0;
        assert!(config.validate().is_err());

        config = EngineConfig::default();
        config.aggregator.min_sources = 0;
        assert!(config.validate().is_err());

        config = EngineConfig::default();
        config.transport.endpoints.push(EndpointConfig {
            id: "bad".into(),
            ws_url: "ws://localhost".into(),
            http_url: "http://localhost".into(),
            priority: 11,
            weight: 1.0,
            rate_limit: 10,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = EngineConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.pipeline.max_risk_score, config.pipeline.max_risk_score);
        assert_eq!(parsed.cache.categories.len(), config.cache.categories.len());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbflow.toml");
        let mut config = EngineConfig::default();
        config.pipeline.max_concurrent_opportunities = 42;
        config.save_to_file(&path).unwrap();

        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.pipeline.max_concurrent_opportunities, 42);
        assert!(loaded.validate().is_ok());
    }
}
