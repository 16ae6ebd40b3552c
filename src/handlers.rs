// Router handlers wired by the engine: decoded chain events become pipeline
// candidates, and pool reserve updates land in the shared cache.
use crate::cache::CacheManager;
use crate::router::{EventHandler, RoutedEvent};
use crate::types::{ChainEventPayload, Opportunity, OpportunityKind, OpportunityPayload};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Turns routed swap events into `blockchain_event` opportunities.
pub struct ChainEventHandler {
    opportunity_tx: mpsc::Sender<Opportunity>,
}

impl ChainEventHandler {
    pub fn new(opportunity_tx: mpsc::Sender<Opportunity>) -> Self {
        Self { opportunity_tx }
    }
}

#[async_trait]
impl EventHandler for ChainEventHandler {
    async fn handle(&self, batch: &[RoutedEvent]) -> anyhow::Result<()> {
        for routed in batch {
            if routed.event.event_type != "swap" {
                continue;
            }
            let contract = routed.event.contract.clone().unwrap_or_default();
            let opportunity = Opportunity::new(
                OpportunityKind::BlockchainEvent,
                contract.clone(),
                "chain-events",
                routed.priority,
                OpportunityPayload::ChainEvent(ChainEventPayload {
                    contract,
                    event: routed.event.event_type.clone(),
                    block: routed.event.block.unwrap_or(0),
                    tx_hash: routed.event.tx_hash.clone().unwrap_or_default(),
                }),
            );
            if let Err(err) = self.opportunity_tx.try_send(opportunity) {
                debug!("chain-event opportunity dropped: {err}");
            }
        }
        Ok(())
    }
}

/// Persists pool reserve updates from sync events into the pools category.
pub struct PoolStateHandler {
    cache: Arc<CacheManager>,
}

impl PoolStateHandler {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EventHandler for PoolStateHandler {
    async fn handle(&self, batch: &[RoutedEvent]) -> anyhow::Result<()> {
        for routed in batch {
            if routed.event.event_type != "sync" {
                continue;
            }
            let Some(contract) = routed.event.contract.as_deref() else { continue };
            let reserve0 = routed.event.payload.get("reserve0").cloned();
            let reserve1 = routed.event.payload.get("reserve1").cloned();
            if reserve0.is_none() && reserve1.is_none() {
                continue;
            }
            let entry = json!({
                "reserve0": reserve0,
                "reserve1": reserve1,
                "block": routed.event.block,
                "updated_at_ms": routed.event.received_at_ms,
            });
            self.cache.set("pools", contract, entry).await;
        }
        Ok(())
    }
}

/// Counts mint/burn liquidity events for telemetry.
pub struct LiquidityEventHandler;

#[async_trait]
impl EventHandler for LiquidityEventHandler {
    async fn handle(&self, batch: &[RoutedEvent]) -> anyhow::Result<()> {
        for routed in batch {
            debug!(
                "liquidity event {} on {:?} at block {:?}",
                routed.event.event_type, routed.event.contract, routed.event.block
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::router::RawEvent;
    use crate::types::{now_ms, Urgency};

    fn routed(event_type: &str, payload: serde_json::Value) -> RoutedEvent {
        let mut event = RawEvent::new(event_type, payload);
        event.contract = Some("0xpool".into());
        event.block = Some(123);
        event.tx_hash = Some("0xhash".into());
        RoutedEvent {
            route: "chain".into(),
            handler: "sink".into(),
            priority: Urgency::High,
            transformed: event.payload.clone(),
            event,
        }
    }

    #[tokio::test]
    async fn test_swap_events_become_opportunities() {
        let (tx, mut rx) = mpsc::channel(8);
        let handler = ChainEventHandler::new(tx);
        handler
            .handle(&[routed("swap", json!({})), routed("sync", json!({}))])
            .await
            .unwrap();

        let opportunity = rx.try_recv().expect("swap opportunity");
        assert_eq!(opportunity.kind, OpportunityKind::BlockchainEvent);
        assert_eq!(opportunity.symbol, "0xpool");
        match opportunity.payload {
            OpportunityPayload::ChainEvent(payload) => {
                assert_eq!(payload.block, 123);
                assert_eq!(payload.tx_hash, "0xhash");
            }
            _ => panic!("wrong payload"),
        }
        // The sync event did not produce a second opportunity.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_events_update_pool_cache() {
        let cache = Arc::new(CacheManager::new(CacheConfig::default()).unwrap());
        let handler = PoolStateHandler::new(Arc::clone(&cache));
        handler
            .handle(&[routed(
                "sync",
                json!({ "reserve0": "1000000", "reserve1": "400", "at": now_ms() }),
            )])
            .await
            .unwrap();

        let entry = cache.get("pools", "0xpool").await.expect("pool entry");
        assert_eq!(entry["reserve0"], "1000000");
        assert_eq!(entry["block"], 123);
    }

    #[tokio::test]
    async fn test_sync_without_reserves_is_skipped() {
        let cache = Arc::new(CacheManager::new(CacheConfig::default()).unwrap());
        let handler = PoolStateHandler::new(Arc::clone(&cache));
        handler.handle(&[routed("sync", json!({}))]).await.unwrap();
        assert!(cache.get("pools", "0xpool").await.is_none());
    }
}
