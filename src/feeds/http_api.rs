// DEX aggregator HTTP API price source.
use super::{PriceSource, SourceKind};
use crate::types::{now_ms, PricePoint};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    price: f64,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    liquidity: Option<f64>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Polls a REST quote endpoint (`GET <base>/v1/quote?symbol=...`).
pub struct HttpApiSource {
    id: String,
    venue: String,
    client: reqwest::Client,
    base_url: String,
    weight: f64,
}

impl HttpApiSource {
    pub fn new(
        id: impl Into<String>,
        venue: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for aggregator API source")?;
        Ok(Self {
            id: id.into(),
            venue: venue.into(),
            client,
            base_url: base_url.into(),
            weight: 1.0,
        })
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[async_trait]
impl PriceSource for HttpApiSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::HttpApi
    }

    fn venue(&self) -> &str {
        &self.venue
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn fetch(&self, symbol: &str) -> Result<PricePoint> {
        let url = format!("{}/v1/quote", self.base_url);
        let quote: QuoteResponse = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .context("quote request failed")?
            .error_for_status()
            .context("quote request returned an error status")?
            .json()
            .await
            .context("quote response was not valid JSON")?;

        if quote.price <= 0.0 || !quote.price.is_finite() {
            anyhow::bail!("aggregator API returned non-positive price for {symbol}");
        }
        debug!("{} quote for {symbol}: {:.6}", self.id, quote.price);

        Ok(PricePoint {
            symbol: symbol.to_string(),
            source_id: self.id.clone(),
            venue: self.venue.clone(),
            price: quote.price,
            volume: quote.volume,
            liquidity: quote.liquidity,
            confidence: quote.confidence.unwrap_or(0.8).clamp(0.0, 1.0),
            weight: self.weight,
            timestamp_ms: now_ms(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_response_parsing() {
        let quote: QuoteResponse =
            serde_json::from_str(r#"{"price": 2000.5, "liquidity": 5000000.0}"#).unwrap();
        assert_eq!(quote.price, 2000.5);
        assert_eq!(quote.liquidity, Some(5_000_000.0));
        assert!(quote.volume.is_none());
        assert!(quote.confidence.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_errors() {
        let source = HttpApiSource::new(
            "agg",
            "venue-agg",
            "http://127.0.0.1:1",
            Duration::from_millis(200),
        )
        .unwrap();
        assert!(source.fetch("WETH/USDC").await.is_err());
    }
}
