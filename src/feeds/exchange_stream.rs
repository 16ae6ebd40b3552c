// Centralized-exchange streaming price source over WebSocket.
use super::{PriceSource, SourceKind};
use crate::types::{now_ms, PricePoint};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct TickerMessage {
    symbol: String,
    price: f64,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    liquidity: Option<f64>,
}

/// Subscribes to a ticker stream and converts frames into price points.
pub struct ExchangeStreamSource {
    id: String,
    venue: String,
    ws_url: String,
    weight: f64,
}

impl ExchangeStreamSource {
    pub fn new(
        id: impl Into<String>,
        venue: impl Into<String>,
        ws_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            venue: venue.into(),
            ws_url: ws_url.into(),
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[async_trait]
impl PriceSource for ExchangeStreamSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ExchangeStream
    }

    fn venue(&self) -> &str {
        &self.venue
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn fetch(&self, _symbol: &str) -> Result<PricePoint> {
        anyhow::bail!("source {} is streaming-only", self.id)
    }

    /// Runs until the stream ends or errors; the feed manager handles
    /// backoff and resubscription.
    async fn subscribe(&self, symbols: &[String], tx: mpsc::Sender<PricePoint>) -> Result<()> {
        let (mut stream, _) = connect_async(&self.ws_url)
            .await
            .context("exchange stream connect failed")?;
        info!("{} connected to {}", self.id, self.ws_url);

        let subscribe = json!({
            "op": "subscribe",
            "channel": "ticker",
            "symbols": symbols,
        });
        stream
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("failed to send ticker subscription")?;

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let ticker: TickerMessage = match serde_json::from_str(&text) {
                        Ok(ticker) => ticker,
                        Err(err) => {
                            debug!("{} skipping non-ticker frame: {err}", self.id);
                            continue;
                        }
                    };
                    if ticker.price <= 0.0 || !ticker.price.is_finite() {
                        warn!("{} delivered non-positive price, skipping", self.id);
                        continue;
                    }
                    let point = PricePoint {
                        symbol: ticker.symbol,
                        source_id: self.id.clone(),
                        venue: self.venue.clone(),
                        price: ticker.price,
                        volume: ticker.volume,
                        liquidity: ticker.liquidity,
                        confidence: 0.85,
                        weight: self.weight,
                        timestamp_ms: now_ms(),
                    };
                    if tx.send(point).await.is_err() {
                        // Receiver gone; shut the stream down quietly.
                        break;
                    }
                }
                Ok(Message::Ping(payload)) => {
                    stream.send(Message::Pong(payload)).await.ok();
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("{} stream error: {err}", self.id);
                    anyhow::bail!("stream error: {err}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_parsing() {
        let ticker: TickerMessage =
            serde_json::from_str(r#"{"symbol":"WETH/USDC","price":2001.25,"volume":123.0}"#)
                .unwrap();
        assert_eq!(ticker.symbol, "WETH/USDC");
        assert_eq!(ticker.price, 2001.25);
        assert_eq!(ticker.volume, Some(123.0));
    }

    #[tokio::test]
    async fn test_fetch_is_unsupported() {
        let source = ExchangeStreamSource::new("cex", "venue-cex", "ws://127.0.0.1:1");
        assert!(source.fetch("WETH/USDC").await.is_err());
        assert!(source.supports_streaming());
    }
}
