// On-chain oracle price source reading Chainlink-style aggregator feeds.
use super::{PriceSource, SourceKind};
use crate::config::OracleFeedConfig;
use crate::types::{now_ms, PricePoint};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reads `latestRoundData()` from per-symbol aggregator contracts.
pub struct ChainOracleSource {
    id: String,
    provider: Arc<Provider<Http>>,
    feeds: HashMap<String, Address>,
    weight: f64,
}

impl ChainOracleSource {
    pub fn new(id: impl Into<String>, rpc_url: &str, feeds: &[OracleFeedConfig]) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .context("failed to create RPC provider for chain oracle")?;
        let mut feed_map = HashMap::new();
        for feed in feeds {
            let address: Address = feed
                .feed_address
                .parse()
                .with_context(|| format!("invalid feed address for {}", feed.symbol))?;
            feed_map.insert(feed.symbol.clone(), address);
        }
        info!("chain oracle source configured with {} feeds", feed_map.len());
        Ok(Self {
            id: id.into(),
            provider: Arc::new(provider),
            feeds: feed_map,
            weight: 1.0,
        })
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[async_trait]
impl PriceSource for ChainOracleSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ChainOracle
    }

    fn venue(&self) -> &str {
        "chain-oracle"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn fetch(&self, symbol: &str) -> Result<PricePoint> {
        let feed_address = self
            .feeds
            .get(symbol)
            .ok_or_else(|| anyhow::anyhow!("no oracle feed for {symbol}"))?;

        let abi = ethers::abi::parse_abi(&[
            "function latestRoundData() external view returns (uint80 roundId, int256 answer, uint256 startedAt, uint256 updatedAt, uint80 answeredInRound)",
            "function decimals() external view returns (uint8)",
        ])?;
        let feed = Contract::new(*feed_address, abi, self.provider.clone());

        let (round_id, answer, _started_at, updated_at, _answered_in_round): (u64, I256, U256, U256, u64) =
            feed.method::<_, (u64, I256, U256, U256, u64)>("latestRoundData", ())?
                .call()
                .await
                .context("failed to fetch latest round data")?;
        let decimals: u8 = feed
            .method::<_, u8>("decimals", ())?
            .call()
            .await
            .context("failed to fetch feed decimals")?;

        if answer.is_negative() {
            anyhow::bail!("negative answer from oracle feed for {symbol}");
        }
        let price = answer.as_u128() as f64 / 10_f64.powi(decimals as i32);
        if price <= 0.0 {
            anyhow::bail!("zero price from oracle feed for {symbol}");
        }

        let updated_ms = updated_at.as_u64().saturating_mul(1000);
        let age_s = now_ms().saturating_sub(updated_ms) / 1000;
        if age_s > 3600 {
            warn!("oracle answer for {symbol} is {age_s}s old");
        }
        debug!("oracle {symbol}: {price:.6} (round {round_id}, age {age_s}s)");

        Ok(PricePoint {
            symbol: symbol.to_string(),
            source_id: self.id.clone(),
            venue: self.venue().to_string(),
            price,
            volume: None,
            liquidity: None,
            confidence: 0.95,
            weight: self.weight,
            timestamp_ms: updated_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_feed_address() {
        let feeds = vec![OracleFeedConfig {
            symbol: "WETH/USD".into(),
            feed_address: "not-an-address".into(),
        }];
        assert!(ChainOracleSource::new("oracle", "http://localhost:8545", &feeds).is_err());
    }

    #[tokio::test]
    async fn test_unknown_symbol_errors() {
        let source = ChainOracleSource::new("oracle", "http://localhost:8545", &[]).unwrap();
        assert!(source.fetch("WETH/USD").await.is_err());
    }
}
