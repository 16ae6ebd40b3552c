// Multi-endpoint streaming transport with scored failover and per-endpoint
// rate limiting. Subscriptions survive endpoint loss by re-establishing on
// the next best endpoint.
mod rate_limit;

pub use rate_limit::SlidingWindow;

use crate::config::{EndpointConfig, TransportConfig};
use crate::error::EngineError;
use crate::metrics as m;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Consecutive probe successes required to re-arm an unhealthy endpoint.
const PROBE_SUCCESSES_TO_REARM: u32 = 3;

/// Backoff jitter keeps reconnecting clients from stampeding an endpoint.
fn with_jitter(delay_ms: u64) -> u64 {
    use rand::Rng;
    delay_ms + rand::thread_rng().gen_range(0..=delay_ms / 4)
}

/// Mutable per-endpoint health and scoring state.
#[derive(Debug)]
struct EndpointState {
    config: EndpointConfig,
    healthy: bool,
    total_requests: u64,
    successful_requests: u64,
    consecutive_failures: u32,
    avg_latency_ms: f64,
    healthy_since: Option<Instant>,
    probe_successes: u32,
    reconnect_attempts: u32,
    last_error: Option<String>,
}

impl EndpointState {
    fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            healthy: true,
            total_requests: 0,
            successful_requests: 0,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            healthy_since: Some(Instant::now()),
            probe_successes: 0,
            reconnect_attempts: 0,
            last_error: None,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    fn uptime_minutes(&self) -> f64 {
        self.healthy_since
            .map(|t| t.elapsed().as_secs_f64() / 60.0)
            .unwrap_or(0.0)
    }

    /// Composite endpoint score; unhealthy endpoints are never scored.
    fn score(&self) -> f64 {
        (10.0 - self.config.priority as f64) * 10.0
            + self.success_rate() * 30.0
            + (1000.0 - self.avg_latency_ms) / 10.0
            - self.consecutive_failures as f64 * 5.0
            + (self.uptime_minutes() / 10.0).min(10.0)
    }

    fn record_success(&mut self, latency_ms: f64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.consecutive_failures = 0;
        self.avg_latency_ms = if self.total_requests == 1 {
            latency_ms
        } else {
            self.avg_latency_ms * 0.9 + latency_ms * 0.1
        };
        self.last_error = None;
    }

    fn record_failure(&mut self, error: &str, max_attempts_before_unhealthy: u32) {
        self.total_requests += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        if self.consecutive_failures >= max_attempts_before_unhealthy {
            self.mark_unhealthy();
        }
    }

    fn mark_unhealthy(&mut self) {
        if self.healthy {
            warn!("endpoint {} marked unhealthy", self.config.id);
        }
        self.healthy = false;
        self.healthy_since = None;
        self.probe_successes = 0;
    }

    fn rearm(&mut self) {
        self.healthy = true;
        self.healthy_since = Some(Instant::now());
        self.consecutive_failures = 0;
        self.reconnect_attempts = 0;
        self.probe_successes = 0;
    }
}

/// Read-only endpoint health snapshot for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointHealth {
    pub id: String,
    pub healthy: bool,
    pub score: f64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
}

/// Multi-provider transport. Unary requests go over JSON-RPC HTTP; streaming
/// subscriptions run over WebSocket with automatic failover.
pub struct WebSocketManager {
    config: TransportConfig,
    endpoints: Arc<RwLock<HashMap<String, EndpointState>>>,
    limiters: Arc<HashMap<String, SlidingWindow>>,
    http: reqwest::Client,
    shutdown: watch::Receiver<bool>,
}

impl WebSocketManager {
    pub fn new(config: TransportConfig, shutdown: watch::Receiver<bool>) -> Self {
        let mut endpoints = HashMap::new();
        let mut limiters = HashMap::new();
        for endpoint in &config.endpoints {
            limiters.insert(
                endpoint.id.clone(),
                SlidingWindow::new(
                    endpoint.rate_limit,
                    Duration::from_millis(config.rate_limit_window_ms),
                ),
            );
            endpoints.insert(endpoint.id.clone(), EndpointState::new(endpoint.clone()));
        }
        info!("transport initialized with {} endpoints", endpoints.len());
        Self {
            config,
            endpoints: Arc::new(RwLock::new(endpoints)),
            limiters: Arc::new(limiters),
            http: reqwest::Client::new(),
            shutdown,
        }
    }

    /// Best healthy endpoint by score, ties broken by priority.
    pub fn primary(&self) -> Option<String> {
        self.select_excluding(&[])
    }

    /// Next best endpoint after the primary.
    pub fn failover_endpoint(&self) -> Option<String> {
        let primary = self.primary()?;
        self.select_excluding(&[primary])
    }

    fn select_excluding(&self, excluded: &[String]) -> Option<String> {
        let endpoints = self.endpoints.read();
        endpoints
            .values()
            .filter(|e| e.healthy && !excluded.contains(&e.config.id))
            .max_by(|a, b| {
                a.score()
                    .partial_cmp(&b.score())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Ties go to the lower (preferred) priority.
                    .then(b.config.priority.cmp(&a.config.priority))
            })
            .map(|e| e.config.id.clone())
    }

    /// Unary JSON-RPC request on the primary endpoint, transparently routed
    /// to the next best endpoint after at most one failure. Rate-limited
    /// calls fail immediately without failover.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let primary = self.primary().ok_or(EngineError::NoEndpointAvailable)?;
        match self.request_on(&primary, method, params.clone()).await {
            Ok(value) => Ok(value),
            Err(err @ EngineError::RateLimited { .. }) => {
                metrics::counter!(m::TRANSPORT_RATE_LIMITED).increment(1);
                Err(err)
            }
            Err(err) => {
                warn!("request on {} failed ({err}), failing over", primary);
                metrics::counter!(m::TRANSPORT_FAILOVERS).increment(1);
                let next = self
                    .select_excluding(&[primary])
                    .ok_or(EngineError::NoEndpointAvailable)?;
                self.request_on(&next, method, params).await
            }
        }
    }

    async fn request_on(
        &self,
        endpoint_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, EngineError> {
        let limiter = self
            .limiters
            .get(endpoint_id)
            .ok_or(EngineError::NoEndpointAvailable)?;
        if !limiter.try_acquire() {
            return Err(EngineError::RateLimited {
                endpoint: endpoint_id.to_string(),
            });
        }

        let http_url = {
            let endpoints = self.endpoints.read();
            let state = endpoints
                .get(endpoint_id)
                .ok_or(EngineError::NoEndpointAvailable)?;
            state.config.http_url.clone()
        };

        metrics::counter!(m::TRANSPORT_REQUESTS, "endpoint" => endpoint_id.to_string()).increment(1);
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(self.config.request_timeout_ms),
            async {
                let response = self.http.post(&http_url).json(&body).send().await?;
                response.json::<Value>().await
            },
        )
        .await;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(Ok(value)) => {
                if let Some(error) = value.get("error") {
                    self.note_failure(endpoint_id, &error.to_string());
                    return Err(EngineError::SourceError {
                        source_id: endpoint_id.to_string(),
                        message: error.to_string(),
                    });
                }
                self.note_success(endpoint_id, latency_ms);
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            }
            Ok(Err(err)) => {
                self.note_failure(endpoint_id, &err.to_string());
                Err(EngineError::HttpError(err))
            }
            Err(_) => {
                self.note_failure(endpoint_id, "request timeout");
                Err(EngineError::Timeout(format!(
                    "request to {endpoint_id} exceeded {}ms",
                    self.config.request_timeout_ms
                )))
            }
        }
    }

    fn note_success(&self, endpoint_id: &str, latency_ms: f64) {
        let mut endpoints = self.endpoints.write();
        if let Some(state) = endpoints.get_mut(endpoint_id) {
            state.record_success(latency_ms);
        }
    }

    fn note_failure(&self, endpoint_id: &str, error: &str) {
        let mut endpoints = self.endpoints.write();
        if let Some(state) = endpoints.get_mut(endpoint_id) {
            state.record_failure(error, self.config.max_reconnect_attempts);
        }
    }

    /// Open a streaming subscription. The returned channel delivers decoded
    /// JSON messages; on endpoint loss the subscription is re-established on
    /// the current best endpoint with exponential backoff.
    pub fn subscribe(&self, subscribe_msg: Value) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(1024);
        let endpoints = Arc::clone(&self.endpoints);
        let config = self.config.clone();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut delay_ms = config.reconnect_delay_ms;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let target = {
                    let guard = endpoints.read();
                    guard
                        .values()
                        .filter(|e| e.healthy)
                        .max_by(|a, b| {
                            a.score()
                                .partial_cmp(&b.score())
                                .unwrap_or(std::cmp::Ordering::Equal)
                                .then(b.config.priority.cmp(&a.config.priority))
                        })
                        .map(|e| (e.config.id.clone(), e.config.ws_url.clone()))
                };
                let Some((endpoint_id, ws_url)) = target else {
                    warn!("no healthy endpoint for subscription, retrying in {delay_ms}ms");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(config.max_reconnect_delay_ms);
                    continue;
                };

                match connect_async(&ws_url).await {
                    Ok((mut stream, _)) => {
                        debug!("subscription connected to {endpoint_id}");
                        delay_ms = config.reconnect_delay_ms;
                        {
                            let mut guard = endpoints.write();
                            if let Some(state) = guard.get_mut(&endpoint_id) {
                                state.reconnect_attempts = 0;
                            }
                        }
                        if let Err(err) =
                            stream.send(Message::Text(subscribe_msg.to_string())).await
                        {
                            warn!("failed to send subscribe message on {endpoint_id}: {err}");
                            Self::note_stream_failure(&endpoints, &endpoint_id, &config);
                            continue;
                        }

                        loop {
                            tokio::select! {
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        let _ = stream.close(None).await;
                                        return;
                                    }
                                }
                                message = stream.next() => {
                                    match message {
                                        Some(Ok(Message::Text(text))) => {
                                            match serde_json::from_str::<Value>(&text) {
                                                Ok(value) => {
                                                    if tx.send(value).await.is_err() {
                                                        // Receiver dropped; subscription done.
                                                        let _ = stream.close(None).await;
                                                        return;
                                                    }
                                                }
                                                Err(err) => {
                                                    debug!("discarding undecodable frame: {err}");
                                                }
                                            }
                                        }
                                        Some(Ok(Message::Ping(payload))) => {
                                            let _ = stream.send(Message::Pong(payload)).await;
                                        }
                                        Some(Ok(Message::Close(_))) | None => {
                                            warn!("subscription stream on {endpoint_id} closed");
                                            break;
                                        }
                                        Some(Ok(_)) => {}
                                        Some(Err(err)) => {
                                            warn!("subscription stream error on {endpoint_id}: {err}");
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                        Self::note_stream_failure(&endpoints, &endpoint_id, &config);
                        tokio::time::sleep(Duration::from_millis(with_jitter(delay_ms))).await;
                        delay_ms = (delay_ms * 2).min(config.max_reconnect_delay_ms);
                    }
                    Err(err) => {
                        warn!("subscription connect to {endpoint_id} failed: {err}");
                        Self::note_stream_failure(&endpoints, &endpoint_id, &config);
                        tokio::time::sleep(Duration::from_millis(with_jitter(delay_ms))).await;
                        delay_ms = (delay_ms * 2).min(config.max_reconnect_delay_ms);
                    }
                }
            }
        });
        rx
    }

    fn note_stream_failure(
        endpoints: &Arc<RwLock<HashMap<String, EndpointState>>>,
        endpoint_id: &str,
        config: &TransportConfig,
    ) {
        let mut guard = endpoints.write();
        if let Some(state) = guard.get_mut(endpoint_id) {
            state.consecutive_failures += 1;
            state.reconnect_attempts += 1;
            if state.reconnect_attempts >= config.max_reconnect_attempts {
                state.mark_unhealthy();
            }
        }
    }

    /// One lightweight unary probe; three consecutive successes re-arm an
    /// unhealthy endpoint.
    pub async fn probe(&self, endpoint_id: &str) -> bool {
        let http_url = {
            let endpoints = self.endpoints.read();
            match endpoints.get(endpoint_id) {
                Some(state) => state.config.http_url.clone(),
                None => return false,
            }
        };
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_blockNumber",
            "params": [],
        });
        let ok = tokio::time::timeout(
            Duration::from_millis(self.config.request_timeout_ms),
            self.http.post(&http_url).json(&body).send(),
        )
        .await
        .map(|r| r.map(|resp| resp.status().is_success()).unwrap_or(false))
        .unwrap_or(false);

        let mut endpoints = self.endpoints.write();
        if let Some(state) = endpoints.get_mut(endpoint_id) {
            if ok {
                state.probe_successes += 1;
                if !state.healthy && state.probe_successes >= PROBE_SUCCESSES_TO_REARM {
                    info!("endpoint {endpoint_id} re-armed after successful probes");
                    state.rearm();
                }
            } else {
                state.probe_successes = 0;
            }
        }
        ok
    }

    /// Background health monitor probing unhealthy endpoints.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                manager.config.health_probe_interval_ms,
            ));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let unhealthy: Vec<String> = {
                            let endpoints = manager.endpoints.read();
                            endpoints
                                .values()
                                .filter(|e| !e.healthy)
                                .map(|e| e.config.id.clone())
                                .collect()
                        };
                        for endpoint_id in unhealthy {
                            manager.probe(&endpoint_id).await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Immutable endpoint health snapshot.
    pub fn snapshot(&self) -> Vec<EndpointHealth> {
        let endpoints = self.endpoints.read();
        let mut health: Vec<EndpointHealth> = endpoints
            .values()
            .map(|e| EndpointHealth {
                id: e.config.id.clone(),
                healthy: e.healthy,
                score: e.score(),
                success_rate: e.success_rate(),
                avg_latency_ms: e.avg_latency_ms,
                consecutive_failures: e.consecutive_failures,
            })
            .collect();
        health.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        health
    }

    /// Force an endpoint unhealthy (testing and incident failover actions).
    pub fn mark_endpoint_unhealthy(&self, endpoint_id: &str) {
        let mut endpoints = self.endpoints.write();
        if let Some(state) = endpoints.get_mut(endpoint_id) {
            state.mark_unhealthy();
        }
    }
}
