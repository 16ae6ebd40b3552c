// Mempool and chain-event listener: watches pending transactions and DEX
// logs, decodes swap traffic best-effort, and emits MEV-pattern signals.
use crate::aggregator::PriceAggregator;
use crate::config::MempoolConfig;
use crate::router::{DataRouter, RawEvent};
use crate::types::{
    now_ms, MempoolPayload, MevRisk, Opportunity, OpportunityKind, OpportunityPayload,
    SandwichPayload, Urgency,
};
use anyhow::{Context, Result};
use dashmap::DashMap;
use ethers::prelude::*;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Known V2/V3 router swap selectors.
const SWAP_SELECTORS: [[u8; 4]; 6] = [
    [0x38, 0xed, 0x17, 0x39], // swapExactTokensForTokens
    [0x88, 0x03, 0xdb, 0xee], // swapTokensForExactTokens
    [0x7f, 0xf3, 0x6a, 0xb5], // swapExactETHForTokens
    [0x18, 0xcb, 0xaf, 0xe5], // swapExactTokensForETH
    [0x41, 0x4b, 0xf3, 0x89], // exactInputSingle
    [0xc0, 0x4b, 0x8d, 0x59], // exactInput
];

/// keccak topics for the pool events we decode.
const TOPIC_SWAP: &str = "0xd78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822";
const TOPIC_SYNC: &str = "0x1c411e9a96e071241c2f21f7726b17ae89e3cab4c78be50e062b03a9fffbbad1";
const TOPIC_MINT: &str = "0x4c209b5fc8ad50758f13e2e1088ba56a560dff690a1c6fef26394f4c03821c4f";
const TOPIC_BURN: &str = "0xdccd412f0b1252819cb1fd330b93224ca42612892bb3f4f789976e6d81936496";

static TOPIC_EVENTS: Lazy<HashMap<H256, &'static str>> = Lazy::new(|| {
    let mut topics = HashMap::new();
    topics.insert(TOPIC_SWAP.parse().expect("const topic"), "swap");
    topics.insert(TOPIC_SYNC.parse().expect("const topic"), "sync");
    topics.insert(TOPIC_MINT.parse().expect("const topic"), "mint");
    topics.insert(TOPIC_BURN.parse().expect("const topic"), "burn");
    topics
});

#[derive(Debug, Clone)]
struct PendingSwap {
    tx_hash: String,
    seen_at_ms: u64,
}

/// Subscribes to pending transactions and DEX contract logs, forwarding
/// decoded events to the router and MEV signals to the pipeline.
pub struct EventListenerManager {
    config: MempoolConfig,
    dex_contracts: HashSet<Address>,
    /// lowercased token address -> aggregator symbol for USD valuation.
    token_symbols: HashMap<String, String>,
    aggregator: Arc<PriceAggregator>,
    router: Arc<DataRouter>,
    opportunity_tx: mpsc::Sender<Opportunity>,
    /// sorted token pair -> recent pending swaps on that pair.
    pair_buckets: DashMap<String, Vec<PendingSwap>>,
}

impl EventListenerManager {
    pub fn new(
        config: MempoolConfig,
        aggregator: Arc<PriceAggregator>,
        router: Arc<DataRouter>,
        opportunity_tx: mpsc::Sender<Opportunity>,
    ) -> Result<Self> {
        let mut dex_contracts = HashSet::new();
        for raw in &config.dex_contracts {
            let address: Address = raw
                .parse()
                .with_context(|| format!("invalid DEX contract address {raw}"))?;
            dex_contracts.insert(address);
        }
        let token_symbols = config
            .token_symbols
            .iter()
            .map(|(address, symbol)| (address.to_lowercase(), symbol.clone()))
            .collect();
        Ok(Self {
            config,
            dex_contracts,
            token_symbols,
            aggregator,
            router,
            opportunity_tx,
            pair_buckets: DashMap::new(),
        })
    }

    /// Start the pending-transaction and log subscription workers.
    pub fn start(
        self: &Arc<Self>,
        provider: Arc<Provider<Ws>>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Pending transactions.
        {
            let listener = Arc::clone(self);
            let provider = Arc::clone(&provider);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let mut stream = match provider.subscribe_pending_txs().await {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!("pending-tx subscription failed: {err}, retrying");
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                            continue;
                        }
                    };
                    info!("subscribed to pending transactions");
                    loop {
                        tokio::select! {
                            hash = stream.next() => {
                                match hash {
                                    Some(hash) => {
                                        let seen_at_ms = now_ms();
                                        if let Ok(Some(tx)) = provider.get_transaction(hash).await {
                                            listener.analyze_pending_tx(&tx, seen_at_ms).await;
                                        }
                                    }
                                    None => break,
                                }
                            }
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                        }
                    }
                    warn!("pending-tx stream ended, resubscribing");
                }
            }));
        }

        // DEX contract logs.
        {
            let listener = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let addresses: Vec<Address> = listener.dex_contracts.iter().copied().collect();
                let filter = Filter::new().address(addresses);
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let mut stream = match provider.subscribe_logs(&filter).await {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!("log subscription failed: {err}, retrying");
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                            continue;
                        }
                    };
                    info!("subscribed to DEX contract logs");
                    loop {
                        tokio::select! {
                            log = stream.next() => {
                                match log {
                                    Some(log) => listener.handle_log(log).await,
                                    None => break,
                                }
                            }
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                        }
                    }
                    warn!("log stream ended, resubscribing");
                }
            }));
        }

        handles
    }

    /// Heuristic analysis of one pending transaction. `seen_at_ms` is when
    /// the hash first appeared on the pending stream.
    pub async fn analyze_pending_tx(&self, tx: &Transaction, seen_at_ms: u64) {
        let Some(to) = tx.to else { return };
        let input = tx.input.as_ref();
        let selector_match = input.len() >= 4 && SWAP_SELECTORS.iter().any(|s| input[..4] == *s);
        if !self.dex_contracts.contains(&to) && !selector_match {
            return;
        }

        let tx_hash = format!("{:#x}", tx.hash);
        let gas_price_gwei = tx
            .gas_price
            .map(|g| g.as_u128() as f64 / 1e9)
            .unwrap_or(0.0);
        let path = decode_swap_path(input);
        let amount_units = decode_amount_in(input)
            .map(|a| u256_to_f64(a) / 1e18)
            .unwrap_or(0.0);

        let token_pair = path.as_ref().and_then(|p| {
            let first = p.first()?;
            let last = p.last()?;
            let mut pair = [format!("{first:#x}"), format!("{last:#x}")];
            pair.sort();
            Some((pair[0].clone(), pair[1].clone()))
        });

        // The decoded amount is denominated in the path's input token;
        // convert to USD through that token's latest aggregated price.
        let path_symbols: Vec<String> = path
            .as_ref()
            .map(|p| p.iter().filter_map(|a| self.symbol_for(a)).collect())
            .unwrap_or_default();
        let input_token_price = path
            .as_ref()
            .and_then(|p| p.first())
            .and_then(|token| self.symbol_for(token))
            .and_then(|symbol| self.aggregator.latest(&symbol))
            .map(|aggregated| aggregated.price);
        let value_usd = input_token_price
            .map(|price| amount_units * price)
            .unwrap_or(0.0);

        // Confidence: base 0.5 with bounded boosts, clamped to 1.0.
        let mut confidence: f64 = 0.5;
        if gas_price_gwei > self.config.frontrun_gas_gwei {
            confidence += 0.15;
        }
        if path_symbols.iter().any(|symbol| {
            self.config
                .high_value_tokens
                .iter()
                .any(|token| symbol.contains(token.as_str()))
        }) {
            confidence += 0.15;
        }
        if value_usd > self.config.large_amount_usd {
            confidence += 0.15;
        }
        let confidence = confidence.min(1.0);

        let mev_risk = if gas_price_gwei > self.config.frontrun_gas_gwei {
            MevRisk::High
        } else if gas_price_gwei > self.config.frontrun_gas_gwei / 2.0 {
            MevRisk::Medium
        } else {
            MevRisk::Low
        };

        let priority_score =
            mempool_priority_score(value_usd, confidence, now_ms().saturating_sub(seen_at_ms));

        let payload = MempoolPayload {
            tx_hash: tx_hash.clone(),
            gas_price_gwei,
            value_usd,
            token_pair: token_pair.clone(),
            has_opportunity: selector_match,
            mev_risk,
            confidence,
            priority_score,
        };

        // Front-running suspicion rides on outlier gas pricing.
        if gas_price_gwei > self.config.frontrun_gas_gwei {
            debug!("front-run suspicion on {tx_hash}: {gas_price_gwei:.1} gwei");
            self.emit(Opportunity::new(
                OpportunityKind::MevFrontrun,
                pair_symbol(&token_pair),
                "mempool",
                Urgency::High,
                OpportunityPayload::Mempool(payload.clone()),
            ));
        }

        // Sandwich detection buckets pending swaps by sorted token pair.
        if let Some(pair) = &token_pair {
            let bucket_key = format!("{}|{}", pair.0, pair.1);
            let now = now_ms();
            let bundle = {
                let mut bucket = self.pair_buckets.entry(bucket_key).or_default();
                bucket.retain(|swap| now.saturating_sub(swap.seen_at_ms) <= self.config.sandwich_window_ms);
                bucket.push(PendingSwap { tx_hash: tx_hash.clone(), seen_at_ms: now });
                if bucket.len() >= self.config.sandwich_min_txs {
                    let bundle: Vec<String> = bucket.iter().map(|s| s.tx_hash.clone()).collect();
                    bucket.clear();
                    Some(bundle)
                } else {
                    None
                }
            };
            if let Some(bundle) = bundle {
                warn!("sandwich pattern on {} ({} txs)", pair_symbol(&token_pair), bundle.len());
                self.emit(Opportunity::new(
                    OpportunityKind::MevSandwich,
                    pair_symbol(&token_pair),
                    "mempool",
                    Urgency::Critical,
                    OpportunityPayload::Sandwich(SandwichPayload {
                        token_pair: pair.clone(),
                        bundle,
                        window_ms: self.config.sandwich_window_ms,
                    }),
                ));
            }
        }

        if payload.has_opportunity {
            self.emit(Opportunity::new(
                OpportunityKind::Mempool,
                pair_symbol(&token_pair),
                "mempool",
                Urgency::Medium,
                OpportunityPayload::Mempool(payload),
            ));
        }
    }

    /// Decode one contract log and forward it to the router; registered
    /// handlers turn routed swaps into pipeline candidates.
    pub async fn handle_log(&self, log: Log) {
        let Some(event_name) = classify_log(&log) else { return };
        let contract = format!("{:#x}", log.address);
        let block = log.block_number.map(|b| b.as_u64());
        let tx_hash = log.transaction_hash.map(|h| format!("{h:#x}"));

        let mut payload = json!({
            "contract": contract,
            "data": format!("0x{}", hex::encode(log.data.as_ref())),
            "topics": log.topics.iter().map(|t| format!("{t:#x}")).collect::<Vec<_>>(),
        });
        match event_name {
            "sync" => {
                if let Some((reserve0, reserve1)) = decode_sync_reserves(log.data.as_ref()) {
                    payload["reserve0"] = json!(reserve0.to_string());
                    payload["reserve1"] = json!(reserve1.to_string());
                }
            }
            "swap" => {
                if let Some(amounts) = decode_swap_amounts(log.data.as_ref()) {
                    payload["amount0_in"] = json!(amounts[0].to_string());
                    payload["amount1_in"] = json!(amounts[1].to_string());
                    payload["amount0_out"] = json!(amounts[2].to_string());
                    payload["amount1_out"] = json!(amounts[3].to_string());
                }
            }
            _ => {}
        }

        let mut event = RawEvent::new(event_name, payload);
        event.contract = Some(contract);
        event.block = block;
        event.tx_hash = tx_hash;
        self.router.route(event).await;
    }

    fn symbol_for(&self, token: &Address) -> Option<String> {
        self.token_symbols.get(&format!("{token:#x}")).cloned()
    }

    fn emit(&self, opportunity: Opportunity) {
        if let Err(err) = self.opportunity_tx.try_send(opportunity) {
            debug!("mempool opportunity dropped: {err}");
        }
    }
}

/// Stream priority for a pending-swap signal: USD value term, weighted
/// confidence, and a freshness term that decays to zero over 20 seconds.
pub fn mempool_priority_score(value_usd: f64, confidence: f64, age_ms: u64) -> f64 {
    let value_term = (value_usd / 1_000.0).min(50.0);
    let time_decay = (20.0 - age_ms as f64 / 1000.0).max(0.0);
    value_term + 30.0 * confidence + time_decay
}

fn pair_symbol(pair: &Option<(String, String)>) -> String {
    match pair {
        Some((a, b)) => format!("{a}/{b}"),
        None => "unknown".to_string(),
    }
}

/// Classify a log by topic0 into the events we care about.
pub fn classify_log(log: &Log) -> Option<&'static str> {
    let topic0 = log.topics.first()?;
    TOPIC_EVENTS.get(topic0).copied()
}

/// Best-effort amount decode: first calldata word after the selector.
pub fn decode_amount_in(input: &[u8]) -> Option<U256> {
    if input.len() < 36 {
        return None;
    }
    Some(U256::from_big_endian(&input[4..36]))
}

/// Sync log data: two reserve words.
pub fn decode_sync_reserves(data: &[u8]) -> Option<(U256, U256)> {
    if data.len() < 64 {
        return None;
    }
    Some((
        U256::from_big_endian(&data[..32]),
        U256::from_big_endian(&data[32..64]),
    ))
}

/// V2 Swap log data: amount0In, amount1In, amount0Out, amount1Out.
pub fn decode_swap_amounts(data: &[u8]) -> Option<[U256; 4]> {
    if data.len() < 128 {
        return None;
    }
    Some([
        U256::from_big_endian(&data[..32]),
        U256::from_big_endian(&data[32..64]),
        U256::from_big_endian(&data[64..96]),
        U256::from_big_endian(&data[96..128]),
    ])
}

/// Best-effort V2 router path decode (dynamic address[] argument).
pub fn decode_swap_path(input: &[u8]) -> Option<Vec<Address>> {
    if input.len() < 4 + 32 * 3 {
        return None;
    }
    // Path offset is the third argument word for the V2 swap family.
    let offset_word = U256::from_big_endian(&input[4 + 64..4 + 96]);
    if offset_word > U256::from(input.len()) {
        return None;
    }
    let length_start = 4 + offset_word.as_usize();
    if input.len() < length_start + 32 {
        return None;
    }
    let length_word = U256::from_big_endian(&input[length_start..length_start + 32]);
    if length_word > U256::from(16u64) {
        return None;
    }
    let path_len = length_word.as_usize();
    if path_len == 0 || path_len > 16 {
        return None;
    }
    let mut path = Vec::with_capacity(path_len);
    for i in 0..path_len {
        let word_start = length_start + 32 + i * 32;
        if input.len() < word_start + 32 {
            return None;
        }
        path.push(Address::from_slice(&input[word_start + 12..word_start + 32]));
    }
    Some(path)
}

fn u256_to_f64(value: U256) -> f64 {
    if value > U256::from(u128::MAX) {
        u128::MAX as f64
    } else {
        value.as_u128() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AggregatorConfig, RouterConfig};
    use crate::types::PricePoint;

    fn swap_calldata(amount_in: U256, path: &[Address]) -> Vec<u8> {
        let mut data = vec![0x38, 0xed, 0x17, 0x39];
        let mut word = [0u8; 32];
        amount_in.to_big_endian(&mut word);
        data.extend_from_slice(&word); // amountIn
        data.extend_from_slice(&[0u8; 32]); // amountOutMin
        U256::from(5 * 32).to_big_endian(&mut word);
        data.extend_from_slice(&word); // path offset
        data.extend_from_slice(&[0u8; 32]); // to
        data.extend_from_slice(&[0u8; 32]); // deadline
        U256::from(path.len()).to_big_endian(&mut word);
        data.extend_from_slice(&word); // path length
        for address in path {
            let mut padded = [0u8; 32];
            padded[12..].copy_from_slice(address.as_bytes());
            data.extend_from_slice(&padded);
        }
        data
    }

    fn aggregator(tx: mpsc::Sender<Opportunity>) -> Arc<PriceAggregator> {
        Arc::new(PriceAggregator::new(
            AggregatorConfig::default(),
            Arc::new(DashMap::new()),
            tx,
        ))
    }

    fn quote(source: &str, venue: &str, symbol: &str, price: f64) -> PricePoint {
        PricePoint {
            symbol: symbol.into(),
            source_id: source.into(),
            venue: venue.into(),
            price,
            volume: None,
            liquidity: None,
            confidence: 0.9,
            weight: 1.0,
            timestamp_ms: now_ms(),
        }
    }

    fn listener_with_config(
        config: MempoolConfig,
    ) -> (Arc<EventListenerManager>, Arc<PriceAggregator>, mpsc::Receiver<Opportunity>) {
        let (tx, rx) = mpsc::channel(64);
        let aggregator = aggregator(tx.clone());
        let router = Arc::new(DataRouter::new(RouterConfig::default(), None));
        let listener = Arc::new(
            EventListenerManager::new(config, Arc::clone(&aggregator), router, tx).unwrap(),
        );
        (listener, aggregator, rx)
    }

    fn listener() -> (Arc<EventListenerManager>, mpsc::Receiver<Opportunity>) {
        let (listener, _aggregator, rx) = listener_with_config(MempoolConfig::default());
        (listener, rx)
    }

    fn pending_tx(gas_gwei: u64, input: Vec<u8>) -> Transaction {
        let mut tx = Transaction::default();
        tx.hash = H256::random();
        tx.to = Some(Address::random());
        tx.gas_price = Some(U256::from(gas_gwei) * U256::exp10(9));
        tx.input = input.into();
        tx
    }

    #[test]
    fn test_swap_path_decode_roundtrip() {
        let path = vec![Address::random(), Address::random(), Address::random()];
        let data = swap_calldata(U256::from(1_000u64), &path);
        assert_eq!(decode_swap_path(&data).unwrap(), path);
        assert_eq!(decode_amount_in(&data).unwrap(), U256::from(1_000u64));
    }

    #[test]
    fn test_path_decode_rejects_garbage() {
        assert!(decode_swap_path(&[0u8; 8]).is_none());
        let mut junk = vec![0x38, 0xed, 0x17, 0x39];
        junk.extend_from_slice(&[0xffu8; 96]);
        assert!(decode_swap_path(&junk).is_none());
    }

    #[tokio::test]
    async fn test_high_gas_emits_frontrun_signal() {
        let (listener, mut rx) = listener();
        let path = vec![Address::random(), Address::random()];
        let tx = pending_tx(150, swap_calldata(U256::from(10u64), &path));
        listener.analyze_pending_tx(&tx, now_ms()).await;

        let mut kinds = Vec::new();
        while let Ok(opportunity) = rx.try_recv() {
            kinds.push(opportunity.kind);
        }
        assert!(kinds.contains(&OpportunityKind::MevFrontrun));
        assert!(kinds.contains(&OpportunityKind::Mempool));
    }

    #[tokio::test]
    async fn test_pending_value_converted_to_usd() {
        let weth = Address::random();
        let mut config = MempoolConfig::default();
        config
            .token_symbols
            .insert(format!("{weth:#x}"), "WETH/USDC".into());
        let (listener, aggregator, mut rx) = listener_with_config(config);

        // Two fresh quotes at the same price give the symbol an aggregate
        // without emitting a cross-venue opportunity.
        aggregator.ingest(quote("s1", "v1", "WETH/USDC", 2_000.0));
        aggregator.ingest(quote("s2", "v2", "WETH/USDC", 2_000.0));

        // 30 WETH at $2000 is $60k notional, past the large-amount bar.
        let amount = U256::exp10(18) * U256::from(30u64);
        let path = vec![weth, Address::random()];
        let tx = pending_tx(40, swap_calldata(amount, &path));
        listener.analyze_pending_tx(&tx, now_ms()).await;

        let mut payload = None;
        while let Ok(opportunity) = rx.try_recv() {
            if opportunity.kind == OpportunityKind::Mempool {
                payload = opportunity.mempool().cloned();
            }
        }
        let payload = payload.expect("mempool opportunity");
        assert!((payload.value_usd - 60_000.0).abs() < 1.0, "value was {}", payload.value_usd);
        // Boosts: high-value token (+0.15) and large USD amount (+0.15).
        assert!((payload.confidence - 0.8).abs() < 1e-9);
        // Fresh signal: full value term (capped at 50) + confidence + decay.
        assert!(payload.priority_score > 90.0);
    }

    #[tokio::test]
    async fn test_unpriced_token_values_at_zero() {
        let (listener, mut rx) = listener();
        let amount = U256::exp10(18) * U256::from(100_000u64);
        let path = vec![Address::random(), Address::random()];
        let tx = pending_tx(40, swap_calldata(amount, &path));
        listener.analyze_pending_tx(&tx, now_ms()).await;

        let mut payload = None;
        while let Ok(opportunity) = rx.try_recv() {
            if opportunity.kind == OpportunityKind::Mempool {
                payload = opportunity.mempool().cloned();
            }
        }
        let payload = payload.expect("mempool opportunity");
        // A huge raw unit count without a price never counts as USD notional.
        assert_eq!(payload.value_usd, 0.0);
        assert!((payload.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_priority_score_decays_with_age() {
        let fresh = mempool_priority_score(10_000.0, 0.8, 0);
        let aged = mempool_priority_score(10_000.0, 0.8, 10_000);
        let stale = mempool_priority_score(10_000.0, 0.8, 30_000);
        assert!((fresh - (10.0 + 24.0 + 20.0)).abs() < 1e-9);
        assert!((fresh - aged - 10.0).abs() < 1e-9);
        // Past 20 seconds the decay term bottoms out at zero.
        assert!((stale - (10.0 + 24.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sandwich_detection_on_burst() {
        let (listener, mut rx) = listener();
        let path = vec![Address::random(), Address::random()];
        for _ in 0..3 {
            let tx = pending_tx(40, swap_calldata(U256::from(10u64), &path));
            listener.analyze_pending_tx(&tx, now_ms()).await;
        }

        let mut sandwich = None;
        while let Ok(opportunity) = rx.try_recv() {
            if opportunity.kind == OpportunityKind::MevSandwich {
                sandwich = Some(opportunity);
            }
        }
        let sandwich = sandwich.expect("sandwich signal expected after 3 swaps");
        assert_eq!(sandwich.urgency, Urgency::Critical);
        match sandwich.payload {
            OpportunityPayload::Sandwich(payload) => assert_eq!(payload.bundle.len(), 3),
            _ => panic!("wrong payload"),
        }
    }

    #[tokio::test]
    async fn test_non_dex_traffic_ignored() {
        let (listener, mut rx) = listener();
        let tx = pending_tx(40, vec![0xaa, 0xbb, 0xcc, 0xdd]);
        listener.analyze_pending_tx(&tx, now_ms()).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_log_classification() {
        let mut log = Log::default();
        log.topics = vec![TOPIC_SWAP.parse().unwrap()];
        assert_eq!(classify_log(&log), Some("swap"));
        log.topics = vec![H256::random()];
        assert_eq!(classify_log(&log), None);
    }

    #[test]
    fn test_sync_reserve_decode() {
        let mut data = [0u8; 64];
        let mut word = [0u8; 32];
        U256::from(1_000_000u64).to_big_endian(&mut word);
        data[..32].copy_from_slice(&word);
        U256::from(400u64).to_big_endian(&mut word);
        data[32..].copy_from_slice(&word);

        let (reserve0, reserve1) = decode_sync_reserves(&data).unwrap();
        assert_eq!(reserve0, U256::from(1_000_000u64));
        assert_eq!(reserve1, U256::from(400u64));
        assert!(decode_sync_reserves(&data[..40]).is_none());
    }

    #[test]
    fn test_swap_amount_decode() {
        let mut data = Vec::new();
        let mut word = [0u8; 32];
        for amount in [10u64, 0, 0, 42] {
            U256::from(amount).to_big_endian(&mut word);
            data.extend_from_slice(&word);
        }
        let amounts = decode_swap_amounts(&data).unwrap();
        assert_eq!(amounts[0], U256::from(10u64));
        assert_eq!(amounts[3], U256::from(42u64));
        assert!(decode_swap_amounts(&data[..100]).is_none());
    }

    #[tokio::test]
    async fn test_sync_log_routes_with_reserves() {
        use crate::router::{EventHandler, Route, RoutePattern, RoutedEvent};
        use std::sync::Mutex;

        struct Capture(Mutex<Vec<RoutedEvent>>);
        #[async_trait::async_trait]
        impl EventHandler for Capture {
            async fn handle(&self, batch: &[RoutedEvent]) -> anyhow::Result<()> {
                self.0.lock().unwrap().extend_from_slice(batch);
                Ok(())
            }
        }

        let (tx, _rx) = mpsc::channel(8);
        let router = Arc::new(DataRouter::new(RouterConfig::default(), None));
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        router.register_handler("sink", capture.clone());
        router.register_route(Route {
            name: "pool-sync".into(),
            pattern: RoutePattern::regex("^sync$").unwrap(),
            handler: "sink".into(),
            priority: Urgency::Medium,
            cache: false,
            transform: false,
        });
        let listener =
            Arc::new(
                EventListenerManager::new(
                    MempoolConfig::default(),
                    aggregator(tx.clone()),
                    router.clone(),
                    tx,
                )
                .unwrap(),
            );

        let mut log = Log::default();
        log.address = Address::random();
        log.topics = vec![TOPIC_SYNC.parse().unwrap()];
        let mut data = [0u8; 64];
        let mut word = [0u8; 32];
        U256::from(777u64).to_big_endian(&mut word);
        data[..32].copy_from_slice(&word);
        U256::from(888u64).to_big_endian(&mut word);
        data[32..].copy_from_slice(&word);
        log.data = data.to_vec().into();

        listener.handle_log(log).await;
        router.tick().await;

        let captured = capture.0.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].event.payload["reserve0"], "777");
        assert_eq!(captured[0].event.payload["reserve1"], "888");
    }
}
