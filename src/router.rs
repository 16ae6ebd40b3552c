// Event routing: category routes with regex/custom predicates, optional
// cache dedupe and transformation, and bounded priority queues drained in
// strict priority order on a fixed tick.
use crate::cache::CacheManager;
use crate::config::RouterConfig;
use crate::metrics as m;
use crate::types::{now_ms, Urgency};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Raw event entering the router; the payload is opaque JSON.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub event_type: String,
    pub contract: Option<String>,
    pub block: Option<u64>,
    pub tx_hash: Option<String>,
    pub payload: Value,
    pub received_at_ms: u64,
}

impl RawEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            contract: None,
            block: None,
            tx_hash: None,
            payload,
            received_at_ms: now_ms(),
        }
    }
}

/// Event after matching a route, carrying the transformed payload.
#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub route: String,
    pub handler: String,
    pub priority: Urgency,
    pub event: RawEvent,
    pub transformed: Value,
}

/// Route predicate: a regex over the event type, or an arbitrary matcher.
#[derive(Clone)]
pub enum RoutePattern {
    Regex(Regex),
    Custom(Arc<dyn Fn(&RawEvent) -> bool + Send + Sync>),
}

impl RoutePattern {
    pub fn regex(pattern: &str) -> anyhow::Result<Self> {
        Ok(Self::Regex(Regex::new(pattern)?))
    }

    fn matches(&self, event: &RawEvent) -> bool {
        match self {
            RoutePattern::Regex(regex) => regex.is_match(&event.event_type),
            RoutePattern::Custom(predicate) => predicate(event),
        }
    }
}

#[derive(Clone)]
pub struct Route {
    pub name: String,
    pub pattern: RoutePattern,
    pub handler: String,
    pub priority: Urgency,
    pub cache: bool,
    pub transform: bool,
}

/// Typed batch consumer registered by handler name.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, batch: &[RoutedEvent]) -> anyhow::Result<()>;
}

type Transformer = Arc<dyn Fn(&RawEvent) -> Value + Send + Sync>;

#[derive(Debug, Default)]
struct RouterCounters {
    routed: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    handler_errors: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RouterStats {
    pub routed: u64,
    pub dropped: u64,
    pub dispatched: u64,
    pub handler_errors: u64,
    pub queue_depths: [usize; 4],
}

/// Categorizes, filters, transforms, batches, and dispatches raw events.
pub struct DataRouter {
    config: RouterConfig,
    routes: RwLock<Vec<Route>>,
    handlers: DashMap<String, Arc<dyn EventHandler>>,
    transformers: DashMap<String, Transformer>,
    /// One bounded FIFO per priority class, index 0 = critical.
    queues: [Mutex<VecDeque<RoutedEvent>>; 4],
    cache: Option<Arc<CacheManager>>,
    handler_error_counts: DashMap<String, u64>,
    counters: RouterCounters,
}

impl DataRouter {
    pub fn new(config: RouterConfig, cache: Option<Arc<CacheManager>>) -> Self {
        Self {
            config,
            routes: RwLock::new(Vec::new()),
            handlers: DashMap::new(),
            transformers: DashMap::new(),
            queues: [
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
            ],
            cache,
            handler_error_counts: DashMap::new(),
            counters: RouterCounters::default(),
        }
    }

    pub fn register_route(&self, route: Route) {
        info!("registered route {} -> {} ({:?})", route.name, route.handler, route.priority);
        self.routes.write().push(route);
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn register_transformer(&self, route_name: impl Into<String>, transformer: Transformer) {
        self.transformers.insert(route_name.into(), transformer);
    }

    /// Match, dedupe, transform, and enqueue one event.
    pub async fn route(&self, event: RawEvent) {
        let matching: Vec<Route> = {
            let routes = self.routes.read();
            routes.iter().filter(|r| r.pattern.matches(&event)).cloned().collect()
        };
        for route in matching {
            if route.cache && self.config.cache_events {
                if let Some(cache) = &self.cache {
                    let key = dedupe_key(&route.name, &event);
                    if cache.get("transactions", &key).await.is_some() {
                        debug!("duplicate event suppressed on route {}", route.name);
                        continue;
                    }
                    cache.set("transactions", &key, json!(true)).await;
                }
            }

            let transformed = if route.transform {
                match self.transformers.get(&route.name) {
                    Some(transformer) => transformer(&event),
                    None => default_normalize(&route, &event),
                }
            } else {
                event.payload.clone()
            };

            let routed = RoutedEvent {
                route: route.name.clone(),
                handler: route.handler.clone(),
                priority: route.priority,
                event: event.clone(),
                transformed,
            };
            self.enqueue(routed);
        }
    }

    fn enqueue(&self, event: RoutedEvent) {
        let cap = (self.config.max_queue_size / 4).max(1);
        let mut queue = self.queues[event.priority.queue_index()].lock();
        queue.push_back(event);
        if queue.len() > cap {
            // Oldest event gives way under overflow.
            queue.pop_front();
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::ROUTER_DROPPED).increment(1);
        }
        self.counters.routed.fetch_add(1, Ordering::Relaxed);
    }

    /// One dispatch tick: drain the queues in strict priority order, up to
    /// `batch_size` events per class, and hand per-handler batches over.
    /// Returns the number of events dispatched.
    pub async fn tick(&self) -> usize {
        let mut by_handler: HashMap<String, Vec<RoutedEvent>> = HashMap::new();
        let mut drained = 0usize;

        for queue in &self.queues {
            let batch: Vec<RoutedEvent> = {
                let mut guard = queue.lock();
                let take = self.config.batch_size.min(guard.len());
                guard.drain(..take).collect()
            };
            for event in batch {
                metrics::counter!(m::ROUTER_EVENTS, "priority" => format!("{:?}", event.priority))
                    .increment(1);
                by_handler.entry(event.handler.clone()).or_default().push(event);
                drained += 1;
            }
        }

        for (handler_name, batch) in by_handler {
            let Some(handler) = self.handlers.get(&handler_name).map(|h| Arc::clone(&h)) else {
                warn!("no handler registered as {handler_name}, dropping {} events", batch.len());
                continue;
            };
            if let Err(err) = handler.handle(&batch).await {
                // Handler failures never stop routing; they eat error budget.
                let mut count = self.handler_error_counts.entry(handler_name.clone()).or_insert(0);
                *count += 1;
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::ROUTER_HANDLER_ERRORS).increment(1);
                if *count > self.config.handler_error_budget {
                    warn!("handler {handler_name} exhausted its error budget: {err}");
                } else {
                    debug!("handler {handler_name} error: {err}");
                }
            }
        }

        self.counters.dispatched.fetch_add(drained as u64, Ordering::Relaxed);
        drained
    }

    /// Dispatcher loop, one tick per `batch_interval_ms`.
    pub fn spawn_dispatcher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(router.config.batch_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        router.tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            // Drain whatever is left, then exit.
                            while router.tick().await > 0 {}
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.counters.routed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            queue_depths: [
                self.queues[0].lock().len(),
                self.queues[1].lock().len(),
                self.queues[2].lock().len(),
                self.queues[3].lock().len(),
            ],
        }
    }

    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.lock().len()).sum()
    }
}

/// Stable dedupe key derived from the route and event identity.
fn dedupe_key(route_name: &str, event: &RawEvent) -> String {
    format!(
        "{route_name}:{}:{}:{}:{}",
        event.event_type,
        event.contract.as_deref().unwrap_or("-"),
        event.block.map(|b| b.to_string()).unwrap_or_else(|| "-".into()),
        event.tx_hash.as_deref().unwrap_or("-"),
    )
}

/// Default normalizer: cast numeric strings and attach route metadata.
fn default_normalize(route: &Route, event: &RawEvent) -> Value {
    let mut normalized = event.payload.clone();
    cast_numeric_fields(&mut normalized);
    json!({
        "data": normalized,
        "route": route.name,
        "event_type": event.event_type,
        "contract": event.contract,
        "block": event.block,
        "tx_hash": event.tx_hash,
        "routed_at_ms": now_ms(),
    })
}

fn cast_numeric_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                cast_numeric_fields(v);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                cast_numeric_fields(item);
            }
        }
        Value::String(s) => {
            if let Ok(parsed) = s.parse::<f64>() {
                if let Some(number) = serde_json::Number::from_f64(parsed) {
                    *value = Value::Number(number);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        seen: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, batch: &[RoutedEvent]) -> anyhow::Result<()> {
            self.seen.fetch_add(batch.len(), Ordering::Relaxed);
            if self.fail {
                anyhow::bail!("handler failure");
            }
            Ok(())
        }
    }

    fn router(batch_size: usize) -> DataRouter {
        DataRouter::new(
            RouterConfig {
                batch_size,
                max_queue_size: 8_000,
                ..RouterConfig::default()
            },
            None,
        )
    }

    fn route(name: &str, pattern: &str, priority: Urgency) -> Route {
        Route {
            name: name.into(),
            pattern: RoutePattern::regex(pattern).unwrap(),
            handler: "sink".into(),
            priority,
            cache: false,
            transform: false,
        }
    }

    #[tokio::test]
    async fn test_routing_and_dispatch() {
        let router = router(10);
        let handler = Arc::new(CountingHandler { seen: AtomicUsize::new(0), fail: false });
        router.register_handler("sink", handler.clone());
        router.register_route(route("swaps", "^swap$", Urgency::High));

        router.route(RawEvent::new("swap", json!({"amount": "1.5"}))).await;
        router.route(RawEvent::new("mint", json!({}))).await;

        assert_eq!(router.tick().await, 1);
        assert_eq!(handler.seen.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_strict_priority_with_per_class_budget() {
        let router = router(100);
        let handler = Arc::new(CountingHandler { seen: AtomicUsize::new(0), fail: false });
        router.register_handler("sink", handler.clone());
        router.register_route(route("critical", "^crit$", Urgency::Critical));
        router.register_route(route("low", "^low$", Urgency::Low));

        for _ in 0..1000 {
            router.route(RawEvent::new("crit", json!({}))).await;
        }
        router.route(RawEvent::new("low", json!({}))).await;

        // The low event must be dispatched within ceil(1000/100) ticks.
        let mut ticks = 0;
        while router.pending() > 0 {
            router.tick().await;
            ticks += 1;
            assert!(ticks <= 10, "low event starved past the bound");
        }
        assert_eq!(handler.seen.load(Ordering::Relaxed), 1001);
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest() {
        let router = DataRouter::new(
            RouterConfig { batch_size: 10, max_queue_size: 8, ..RouterConfig::default() },
            None,
        );
        router.register_route(route("e", "^e$", Urgency::Medium));
        for _ in 0..5 {
            router.route(RawEvent::new("e", json!({}))).await;
        }
        // Per-class cap is max_queue_size/4 = 2.
        assert_eq!(router.stats().queue_depths[Urgency::Medium.queue_index()], 2);
        assert_eq!(router.stats().dropped, 3);
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_stop_routing() {
        let router = router(10);
        let failing = Arc::new(CountingHandler { seen: AtomicUsize::new(0), fail: true });
        router.register_handler("sink", failing.clone());
        router.register_route(route("e", "^e$", Urgency::Medium));

        router.route(RawEvent::new("e", json!({}))).await;
        router.tick().await;
        router.route(RawEvent::new("e", json!({}))).await;
        router.tick().await;

        assert_eq!(failing.seen.load(Ordering::Relaxed), 2);
        assert_eq!(router.stats().handler_errors, 2);
    }

    #[tokio::test]
    async fn test_default_normalizer_casts_numerics() {
        let router = router(10);
        let handler = Arc::new(CountingHandler { seen: AtomicUsize::new(0), fail: false });
        router.register_handler("sink", handler);
        router.register_route(Route {
            name: "n".into(),
            pattern: RoutePattern::regex("^e$").unwrap(),
            handler: "sink".into(),
            priority: Urgency::Medium,
            cache: false,
            transform: true,
        });

        router
            .route(RawEvent::new("e", json!({"amount": "123.5", "label": "swap#1"})))
            .await;
        let queued = router.queues[Urgency::Medium.queue_index()].lock()[0].clone();
        assert_eq!(queued.transformed["data"]["amount"], 123.5);
        assert_eq!(queued.transformed["data"]["label"], "swap#1");
        assert_eq!(queued.transformed["route"], "n");
    }

    #[test]
    fn test_dedupe_key_stability() {
        let mut event = RawEvent::new("swap", json!({}));
        event.contract = Some("0xabc".into());
        event.block = Some(100);
        event.tx_hash = Some("0xdead".into());
        assert_eq!(dedupe_key("r", &event), "r:swap:0xabc:100:0xdead");
    }

    #[tokio::test]
    async fn test_custom_predicate_route() {
        let router = router(10);
        let handler = Arc::new(CountingHandler { seen: AtomicUsize::new(0), fail: false });
        router.register_handler("sink", handler.clone());
        router.register_route(Route {
            name: "big-blocks".into(),
            pattern: RoutePattern::Custom(Arc::new(|e| e.block.unwrap_or(0) > 50)),
            handler: "sink".into(),
            priority: Urgency::High,
            cache: false,
            transform: false,
        });

        let mut small = RawEvent::new("any", json!({}));
        small.block = Some(10);
        let mut big = RawEvent::new("any", json!({}));
        big.block = Some(100);
        router.route(small).await;
        router.route(big).await;
        assert_eq!(router.tick().await, 1);
    }
}
