// Emergency stop: phased graceful shutdown with a recovery checklist and a
// gradual restart. Emergency-level stops stay down until explicitly reset.
use super::AlertSink;
use crate::config::EmergencyConfig;
use crate::types::{now_ms, Urgency};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyLevel {
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPhase {
    Idle,
    Initiated,
    TradesCompleting,
    PositionsLiquidating,
    Shutdown,
}

/// External hooks invoked by the stop procedures. Position handling lives
/// outside the engine; the default implementation acknowledges and logs.
#[async_trait]
pub trait EmergencyActions: Send + Sync {
    async fn cancel_open_trades(&self) -> anyhow::Result<()>;
    async fn reduce_positions(&self, fraction: f64) -> anyhow::Result<()>;
    async fn liquidate_positions(&self) -> anyhow::Result<()>;
    async fn close_connections(&self) -> anyhow::Result<()>;
    async fn snapshot_state(&self) -> anyhow::Result<()>;
}

/// Default actions: log and acknowledge.
pub struct LogActions;

#[async_trait]
impl EmergencyActions for LogActions {
    async fn cancel_open_trades(&self) -> anyhow::Result<()> {
        warn!("emergency action: cancel open trades");
        Ok(())
    }
    async fn reduce_positions(&self, fraction: f64) -> anyhow::Result<()> {
        warn!("emergency action: reduce positions by {:.0}%", fraction * 100.0);
        Ok(())
    }
    async fn liquidate_positions(&self) -> anyhow::Result<()> {
        warn!("emergency action: liquidate positions");
        Ok(())
    }
    async fn close_connections(&self) -> anyhow::Result<()> {
        warn!("emergency action: close external connections");
        Ok(())
    }
    async fn snapshot_state(&self) -> anyhow::Result<()> {
        info!("emergency action: snapshot state");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcedureStep {
    pub name: String,
    pub ok: bool,
    pub note: String,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopRecord {
    pub reason: String,
    pub level: EmergencyLevel,
    pub triggered_by: String,
    pub at_ms: u64,
    pub procedure_log: Vec<ProcedureStep>,
}

/// Recovery checklist item names; all must pass before restart.
pub const RECOVERY_CHECKLIST: &[&str] = &[
    "system_health",
    "risk_parameters",
    "market_conditions",
    "capital_allocation",
    "test_executions",
];

type ChecklistFn = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyStatus {
    pub phase: StopPhase,
    pub record: Option<StopRecord>,
    pub recoverable: bool,
}

pub struct EmergencyStopManager {
    config: EmergencyConfig,
    phase: RwLock<StopPhase>,
    record: RwLock<Option<StopRecord>>,
    actions: RwLock<Arc<dyn EmergencyActions>>,
    /// In-flight trade count published by the engine; drained before the
    /// trade-completion phase ends.
    in_flight: RwLock<Option<watch::Receiver<usize>>>,
    checklist: RwLock<HashMap<&'static str, ChecklistFn>>,
    /// Set by `reset_emergency` to make an emergency-level stop recoverable.
    emergency_acknowledged: RwLock<bool>,
    alert: Arc<dyn AlertSink>,
}

impl EmergencyStopManager {
    pub fn new(config: EmergencyConfig, alert: Arc<dyn AlertSink>) -> Self {
        let mut checklist: HashMap<&'static str, ChecklistFn> = HashMap::new();
        for &item in RECOVERY_CHECKLIST {
            checklist.insert(item, Arc::new(|| true));
        }
        Self {
            config,
            phase: RwLock::new(StopPhase::Idle),
            record: RwLock::new(None),
            actions: RwLock::new(Arc::new(LogActions)),
            in_flight: RwLock::new(None),
            checklist: RwLock::new(checklist),
            emergency_acknowledged: RwLock::new(false),
            alert,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(config: EmergencyConfig) -> Self {
        Self::new(config, Arc::new(super::LogAlertSink))
    }

    pub fn set_actions(&self, actions: Arc<dyn EmergencyActions>) {
        *self.actions.write() = actions;
    }

    pub fn set_in_flight_probe(&self, rx: watch::Receiver<usize>) {
        *self.in_flight.write() = Some(rx);
    }

    /// Replace one checklist item's validator.
    pub fn set_checklist_item(&self, name: &'static str, check: ChecklistFn) {
        self.checklist.write().insert(name, check);
    }

    pub fn is_stopped(&self) -> bool {
        *self.phase.read() != StopPhase::Idle
    }

    pub fn phase(&self) -> StopPhase {
        *self.phase.read()
    }

    pub fn status(&self) -> EmergencyStatus {
        EmergencyStatus {
            phase: self.phase(),
            record: self.record.read().clone(),
            recoverable: self.is_recoverable(),
        }
    }

    fn is_recoverable(&self) -> bool {
        match self.record.read().as_ref() {
            Some(record) => {
                record.level != EmergencyLevel::Emergency || *self.emergency_acknowledged.read()
            }
            None => true,
        }
    }

    fn log_step(&self, name: &str, ok: bool, note: impl Into<String>) {
        let mut record = self.record.write();
        if let Some(record) = record.as_mut() {
            record.procedure_log.push(ProcedureStep {
                name: name.to_string(),
                ok,
                note: note.into(),
                at_ms: now_ms(),
            });
        }
    }

    /// Run the phased stop procedure for the given level. Idempotent: a stop
    /// in progress absorbs further triggers.
    pub async fn trigger(
        &self,
        reason: &str,
        level: EmergencyLevel,
        triggered_by: &str,
    ) -> anyhow::Result<()> {
        {
            let mut phase = self.phase.write();
            if *phase != StopPhase::Idle {
                warn!("emergency stop already active, ignoring trigger from {triggered_by}");
                return Ok(());
            }
            *phase = StopPhase::Initiated;
        }
        error!("EMERGENCY STOP ({level:?}) triggered by {triggered_by}: {reason}");
        *self.record.write() = Some(StopRecord {
            reason: reason.to_string(),
            level,
            triggered_by: triggered_by.to_string(),
            at_ms: now_ms(),
            procedure_log: Vec::new(),
        });
        if level == EmergencyLevel::Emergency {
            *self.emergency_acknowledged.write() = false;
        }
        self.alert
            .send(
                "emergency_stop",
                json!({ "reason": reason, "level": level, "by": triggered_by }),
                Urgency::Critical,
            )
            .await;

        let actions = self.actions.read().clone();

        // New trades are already refused once the phase left Idle.
        self.log_step("stop_new_trades", true, "admission gate closed");

        // Drain in-flight trades, force-cancel on timeout.
        *self.phase.write() = StopPhase::TradesCompleting;
        let drained = self.wait_for_drain().await;
        if drained {
            self.log_step("complete_trades", true, "in-flight trades drained");
        } else {
            let cancel = actions.cancel_open_trades().await;
            self.log_step(
                "force_cancel_trades",
                cancel.is_ok(),
                "drain timeout, open trades cancelled",
            );
        }

        match level {
            EmergencyLevel::Warning => {
                let reduced = actions.reduce_positions(0.5).await;
                self.log_step("reduce_positions", reduced.is_ok(), "positions reduced 50%");
            }
            EmergencyLevel::Critical | EmergencyLevel::Emergency => {
                *self.phase.write() = StopPhase::PositionsLiquidating;
                let liquidation = tokio::time::timeout(
                    Duration::from_millis(self.config.position_liquidation_timeout_ms),
                    actions.liquidate_positions(),
                )
                .await;
                match liquidation {
                    Ok(Ok(())) => self.log_step("liquidate_positions", true, "liquidated"),
                    Ok(Err(err)) => self.log_step("liquidate_positions", false, err.to_string()),
                    Err(_) => self.log_step("liquidate_positions", false, "liquidation timeout"),
                }
            }
        }

        if level == EmergencyLevel::Emergency {
            let closed = actions.close_connections().await;
            self.log_step("shutdown_connections", closed.is_ok(), "external connections closed");
        }
        let snapshot = actions.snapshot_state().await;
        self.log_step("snapshot_state", snapshot.is_ok(), "state snapshot taken");

        *self.phase.write() = StopPhase::Shutdown;
        info!("emergency stop procedure complete ({level:?})");
        Ok(())
    }

    async fn wait_for_drain(&self) -> bool {
        let rx = self.in_flight.read().clone();
        let Some(mut rx) = rx else { return true };
        let deadline = Duration::from_millis(self.config.trade_completion_timeout_ms);
        tokio::time::timeout(deadline, async {
            loop {
                if *rx.borrow() == 0 {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Allow recovery from an emergency-level stop.
    pub fn reset_emergency(&self) {
        *self.emergency_acknowledged.write() = true;
        info!("emergency-level stop acknowledged; recovery permitted");
    }

    /// Recovery: minimum wait, full checklist, then a gradual restart in
    /// thirds of the configured restart delay.
    pub async fn attempt_recovery(&self) -> anyhow::Result<bool> {
        if !self.is_stopped() {
            return Ok(true);
        }
        if !self.is_recoverable() {
            anyhow::bail!("emergency-level stop requires an explicit reset before recovery");
        }
        let stopped_at = self
            .record
            .read()
            .as_ref()
            .map(|r| r.at_ms)
            .unwrap_or(0);
        let elapsed = now_ms().saturating_sub(stopped_at);
        if elapsed < self.config.min_recovery_wait_ms {
            info!(
                "recovery deferred: {elapsed}ms since stop, minimum {}ms",
                self.config.min_recovery_wait_ms
            );
            return Ok(false);
        }

        // Every checklist item must pass.
        let checks: Vec<(&'static str, ChecklistFn)> = {
            let checklist = self.checklist.read();
            RECOVERY_CHECKLIST
                .iter()
                .filter_map(|&name| checklist.get(name).map(|f| (name, Arc::clone(f))))
                .collect()
        };
        for (name, check) in checks {
            if !check() {
                warn!("recovery checklist item {name} failed; staying stopped");
                self.log_step("recovery_checklist", false, format!("{name} failed"));
                return Ok(false);
            }
        }
        self.log_step("recovery_checklist", true, "all items passed");

        // Gradual restart: connections, monitoring, limited trading, full.
        let step_delay = Duration::from_millis(self.config.gradual_restart_delay_ms / 3);
        info!("gradual restart: re-establishing connections");
        tokio::time::sleep(step_delay).await;
        info!("gradual restart: monitoring resumed");
        tokio::time::sleep(step_delay).await;
        info!("gradual restart: limited trading enabled");
        tokio::time::sleep(step_delay).await;
        info!("gradual restart: full operations restored");

        *self.phase.write() = StopPhase::Idle;
        *self.record.write() = None;
        *self.emergency_acknowledged.write() = false;
        self.alert
            .send("emergency_recovery", json!({ "status": "recovered" }), Urgency::High)
            .await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> EmergencyConfig {
        EmergencyConfig {
            trade_completion_timeout_ms: 100,
            position_liquidation_timeout_ms: 100,
            system_shutdown_timeout_ms: 100,
            min_recovery_wait_ms: 0,
            gradual_restart_delay_ms: 30,
        }
    }

    #[tokio::test]
    async fn test_warning_stop_phases() {
        let manager = EmergencyStopManager::for_test(fast_config());
        assert!(!manager.is_stopped());
        manager
            .trigger("spread widening", EmergencyLevel::Warning, "breaker:unusual_spread")
            .await
            .unwrap();
        assert!(manager.is_stopped());
        assert_eq!(manager.phase(), StopPhase::Shutdown);
        let record = manager.status().record.unwrap();
        let steps: Vec<&str> = record.procedure_log.iter().map(|s| s.name.as_str()).collect();
        assert!(steps.contains(&"stop_new_trades"));
        assert!(steps.contains(&"reduce_positions"));
        assert!(!steps.contains(&"liquidate_positions"));
    }

    #[tokio::test]
    async fn test_critical_stop_liquidates() {
        let manager = EmergencyStopManager::for_test(fast_config());
        manager
            .trigger("daily loss limit", EmergencyLevel::Critical, "breaker:daily_loss")
            .await
            .unwrap();
        let record = manager.status().record.unwrap();
        let steps: Vec<&str> = record.procedure_log.iter().map(|s| s.name.as_str()).collect();
        assert!(steps.contains(&"liquidate_positions"));
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let manager = EmergencyStopManager::for_test(fast_config());
        let (tx, rx) = watch::channel(2usize);
        manager.set_in_flight_probe(rx);
        let handle = {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tx.send(0).unwrap();
            })
        };
        manager
            .trigger("drain test", EmergencyLevel::Warning, "test")
            .await
            .unwrap();
        handle.await.unwrap();
        let record = manager.status().record.unwrap();
        assert!(record
            .procedure_log
            .iter()
            .any(|s| s.name == "complete_trades" && s.ok));
    }

    #[tokio::test]
    async fn test_drain_timeout_forces_cancel() {
        let manager = EmergencyStopManager::for_test(fast_config());
        let (_tx, rx) = watch::channel(3usize);
        manager.set_in_flight_probe(rx);
        manager
            .trigger("stuck trades", EmergencyLevel::Warning, "test")
            .await
            .unwrap();
        let record = manager.status().record.unwrap();
        assert!(record
            .procedure_log
            .iter()
            .any(|s| s.name == "force_cancel_trades"));
    }

    #[tokio::test]
    async fn test_emergency_level_requires_reset() {
        let manager = EmergencyStopManager::for_test(fast_config());
        manager
            .trigger("catastrophe", EmergencyLevel::Emergency, "operator")
            .await
            .unwrap();
        assert!(manager.attempt_recovery().await.is_err());
        manager.reset_emergency();
        assert!(manager.attempt_recovery().await.unwrap());
        assert!(!manager.is_stopped());
    }

    #[tokio::test]
    async fn test_failed_checklist_blocks_recovery() {
        let manager = EmergencyStopManager::for_test(fast_config());
        manager.set_checklist_item("system_health", Arc::new(|| false));
        manager
            .trigger("degraded", EmergencyLevel::Warning, "test")
            .await
            .unwrap();
        assert!(!manager.attempt_recovery().await.unwrap());
        assert!(manager.is_stopped());

        manager.set_checklist_item("system_health", Arc::new(|| true));
        assert!(manager.attempt_recovery().await.unwrap());
        assert!(!manager.is_stopped());
    }

    #[tokio::test]
    async fn test_min_recovery_wait_enforced() {
        let mut config = fast_config();
        config.min_recovery_wait_ms = 60_000;
        let manager = EmergencyStopManager::for_test(config);
        manager
            .trigger("wait test", EmergencyLevel::Warning, "test")
            .await
            .unwrap();
        assert!(!manager.attempt_recovery().await.unwrap());
        assert!(manager.is_stopped());
    }

    #[tokio::test]
    async fn test_double_trigger_is_absorbed() {
        let manager = EmergencyStopManager::for_test(fast_config());
        manager.trigger("first", EmergencyLevel::Warning, "a").await.unwrap();
        manager.trigger("second", EmergencyLevel::Critical, "b").await.unwrap();
        let record = manager.status().record.unwrap();
        assert_eq!(record.reason, "first");
    }
}
