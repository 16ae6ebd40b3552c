// The safety plane: layered circuit breakers, emergency stop, and incident
// response behind a single published `TradingGate` snapshot. The pipeline
// only ever sees the snapshot; all mutation happens here.
pub mod breakers;
pub mod emergency;
pub mod incident;

pub use breakers::{BreakerStatus, CircuitBreakerManager};
pub use emergency::{
    EmergencyActions, EmergencyLevel, EmergencyStopManager, LogActions, StopPhase,
};
pub use incident::{Incident, IncidentManager, IncidentStatus, RecoveryValidator, Severity};

use crate::config::SafetyConfig;
use crate::metrics as m;
use crate::types::{TelemetrySample, TradeResult, TradingGate, Urgency};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Best-effort alert target. Implementations must not block the caller past
/// the configured timeout; the plane enforces it with a hard deadline.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, category: &str, payload: Value, priority: Urgency);
}

/// Default sink: structured log lines.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, category: &str, payload: Value, priority: Urgency) {
        warn!(category = category, priority = ?priority, payload = %payload, "alert");
    }
}

/// Wraps a sink with the configured send deadline.
struct BoundedAlertSink {
    inner: Arc<dyn AlertSink>,
    timeout: Duration,
}

#[async_trait]
impl AlertSink for BoundedAlertSink {
    async fn send(&self, category: &str, payload: Value, priority: Urgency) {
        if tokio::time::timeout(self.timeout, self.inner.send(category, payload, priority))
            .await
            .is_err()
        {
            warn!("alert sink timed out delivering {category}");
        }
    }
}

/// Facade over the three safety subsystems. Owns the gate snapshot.
pub struct SafetyPlane {
    config: SafetyConfig,
    pub breakers: Arc<CircuitBreakerManager>,
    pub emergency: Arc<EmergencyStopManager>,
    pub incidents: Arc<IncidentManager>,
    gate_tx: watch::Sender<TradingGate>,
    gate_rx: watch::Receiver<TradingGate>,
    alert: Arc<dyn AlertSink>,
}

impl SafetyPlane {
    pub fn new(config: SafetyConfig, alert: Arc<dyn AlertSink>) -> Self {
        let alert: Arc<dyn AlertSink> = Arc::new(BoundedAlertSink {
            inner: alert,
            timeout: Duration::from_millis(config.alert_timeout_ms.max(1)),
        });
        let breakers = Arc::new(CircuitBreakerManager::new(config.breakers.clone()));
        let emergency = Arc::new(EmergencyStopManager::new(
            config.emergency.clone(),
            Arc::clone(&alert),
        ));
        let incidents = Arc::new(IncidentManager::new(
            config.incidents.clone(),
            Arc::clone(&alert),
        ));
        let (gate_tx, gate_rx) = watch::channel(TradingGate::default());
        info!("safety plane initialized");
        Self {
            config,
            breakers,
            emergency,
            incidents,
            gate_tx,
            gate_rx,
            alert,
        }
    }

    /// Subscribe to the published gate snapshot.
    pub fn gate(&self) -> watch::Receiver<TradingGate> {
        self.gate_rx.clone()
    }

    pub fn is_trading_allowed(&self) -> bool {
        self.gate_rx.borrow().allowed
    }

    /// Recompute and publish the gate from breaker and stop state.
    pub fn recompute_gate(&self) {
        let mut reasons: Vec<String> = self
            .breakers
            .active_trips()
            .into_iter()
            .map(|name| format!("breaker:{name}"))
            .collect();
        if self.emergency.is_stopped() {
            reasons.push("emergency_stop".to_string());
        }
        let gate = TradingGate {
            allowed: reasons.is_empty(),
            reasons,
        };
        metrics::gauge!(m::TRADING_ALLOWED).set(if gate.allowed { 1.0 } else { 0.0 });
        self.gate_tx.send_replace(gate);
    }

    /// Evaluate one telemetry sample across breakers and incident detection.
    pub async fn ingest_telemetry(&self, sample: TelemetrySample) {
        let tripped = self.breakers.evaluate(&sample);
        for name in tripped {
            // Alerting happens here so the breaker layer stays synchronous.
            self.alert_breaker_trip(name).await;
        }

        let opened = self.incidents.observe(&sample).await;
        for incident_id in opened {
            self.incidents.respond(&incident_id).await;
        }
        self.recompute_gate();
    }

    async fn alert_breaker_trip(&self, name: &str) {
        self.alert
            .send("breaker_trip", json!({ "breaker": name }), Urgency::Critical)
            .await;
    }

    /// Feed a trade outcome into loss accounting. Critical loss trips force
    /// an emergency stop.
    pub async fn record_trade_result(&self, result: &TradeResult) {
        let tripped = self.breakers.record_trade(result);
        let critical = tripped
            .iter()
            .any(|name| breakers::CRITICAL_BREAKERS.contains(name));
        if critical && !self.emergency.is_stopped() {
            let reason = format!("loss breakers tripped: {}", tripped.join(", "));
            if let Err(err) = self
                .emergency
                .trigger(&reason, EmergencyLevel::Critical, "circuit_breakers")
                .await
            {
                warn!("emergency stop trigger failed: {err}");
            }
        }
        self.recompute_gate();
    }

    /// Programmatic emergency stop.
    pub async fn emergency_stop(
        &self,
        reason: &str,
        level: EmergencyLevel,
        triggered_by: &str,
    ) -> anyhow::Result<()> {
        self.emergency.trigger(reason, level, triggered_by).await?;
        self.recompute_gate();
        Ok(())
    }

    /// Attempt emergency recovery; on success the breakers are re-armed and
    /// the gate reopens.
    pub async fn attempt_recovery(&self) -> anyhow::Result<bool> {
        let recovered = self.emergency.attempt_recovery().await?;
        if recovered {
            self.breakers.reset_all();
        }
        self.recompute_gate();
        Ok(recovered)
    }

    /// Monitor worker: consumes telemetry samples and runs the periodic
    /// breaker auto-recovery check.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        mut telemetry_rx: mpsc::Receiver<TelemetrySample>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let plane = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                plane.config.monitoring_interval_ms,
            ));
            loop {
                tokio::select! {
                    sample = telemetry_rx.recv() => {
                        match sample {
                            Some(sample) => plane.ingest_telemetry(sample).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        let recovered = plane.breakers.auto_recover();
                        if !recovered.is_empty() {
                            info!("breakers auto-recovered: {recovered:?}");
                        }
                        plane.recompute_gate();
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

    /// Trade-result worker fed by the pipeline's executor loop.
    pub fn spawn_trade_listener(
        self: &Arc<Self>,
        mut trade_rx: mpsc::Receiver<TradeResult>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let plane = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = trade_rx.recv() => {
                        match result {
                            Some(result) => plane.record_trade_result(&result).await,
                            None => break,
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
}
