// Incident response: EMA baselines with z-score anomaly detection, pattern
// and cascade detection, automated response procedures with failover, and
// validated recovery with escalation timers.
use super::AlertSink;
use crate::config::IncidentConfig;
use crate::metrics as m;
use crate::types::{now_ms, TelemetrySample, Urgency};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pattern-anomaly thresholds.
const CPU_HIGH_PCT: f64 = 90.0;
const MEMORY_HIGH_PCT: f64 = 85.0;
const ERROR_RATE_HIGH: f64 = 0.2;
const LATENCY_HIGH_MS: f64 = 1_000.0;

/// Baseline samples required before z-scores are trusted.
const BASELINE_WARMUP: u64 = 12;

const MAX_ESCALATION_LEVEL: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Detected,
    Responding,
    FailoverInProgress,
    ValidatingRecovery,
    Resolved,
    ResponseFailed,
    FailoverFailed,
    MaximumEscalationReached,
}

impl IncidentStatus {
    pub fn is_active(self) -> bool {
        !matches!(self, IncidentStatus::Resolved)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub seq: u32,
    pub at_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: String,
    pub kind: String,
    /// Metric that triggered a z-score incident, if any.
    pub metric: Option<String>,
    pub severity: Severity,
    pub escalation_level: u8,
    pub status: IncidentStatus,
    pub timeline: Vec<TimelineEntry>,
    pub response_attempts: u32,
    pub opened_at_ms: u64,
    pub escalation_deadline_ms: u64,
}

impl Incident {
    fn push_timeline(&mut self, note: impl Into<String>) {
        let seq = self.timeline.len() as u32 + 1;
        self.timeline.push(TimelineEntry { seq, at_ms: now_ms(), note: note.into() });
    }
}

/// EMA baseline of one metric's mean and variance.
#[derive(Debug, Clone, Default)]
pub struct MetricBaseline {
    pub mean: f64,
    pub variance: f64,
    pub samples: u64,
}

impl MetricBaseline {
    const ALPHA: f64 = 0.05;

    pub fn update(&mut self, value: f64) {
        if self.samples == 0 {
            self.mean = value;
            self.variance = 0.0;
        } else {
            let delta = value - self.mean;
            self.mean += Self::ALPHA * delta;
            self.variance = (1.0 - Self::ALPHA) * (self.variance + Self::ALPHA * delta * delta);
        }
        self.samples += 1;
    }

    pub fn z_score(&self, value: f64) -> f64 {
        if self.samples < BASELINE_WARMUP {
            return 0.0;
        }
        let std_dev = self.variance.sqrt();
        if std_dev < 1e-9 {
            return 0.0;
        }
        (value - self.mean).abs() / std_dev
    }
}

type StepAction = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type ValidatorFn = Arc<dyn Fn(&TelemetrySample) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ResponseStep {
    pub name: String,
    pub timeout_ms: u64,
    pub retries: u32,
}

#[derive(Clone)]
pub struct RecoveryValidator {
    pub name: String,
    pub required: bool,
    pub check: ValidatorFn,
}

/// Continuous anomaly detector and automated responder.
pub struct IncidentManager {
    config: IncidentConfig,
    baselines: DashMap<String, MetricBaseline>,
    incidents: DashMap<String, Incident>,
    /// kind -> id of the currently active incident of that kind.
    active_by_kind: DashMap<String, String>,
    step_registry: DashMap<String, StepAction>,
    procedures: RwLock<HashMap<String, Vec<ResponseStep>>>,
    failovers: RwLock<HashMap<String, String>>,
    validators: RwLock<Vec<RecoveryValidator>>,
    alert: Arc<dyn AlertSink>,
}

impl IncidentManager {
    pub fn new(config: IncidentConfig, alert: Arc<dyn AlertSink>) -> Self {
        let manager = Self {
            config,
            baselines: DashMap::new(),
            incidents: DashMap::new(),
            active_by_kind: DashMap::new(),
            step_registry: DashMap::new(),
            procedures: RwLock::new(HashMap::new()),
            failovers: RwLock::new(HashMap::new()),
            validators: RwLock::new(Vec::new()),
            alert,
        };
        manager.install_defaults();
        manager
    }

    fn install_defaults(&self) {
        for step in [
            "reduce_load",
            "clear_caches",
            "restart_heavy",
            "reset_connections",
            "pause_ingest",
            "switch_endpoint",
        ] {
            let name = step.to_string();
            self.register_step(
                step,
                Arc::new(move || {
                    let name = name.clone();
                    Box::pin(async move {
                        info!("incident response step: {name}");
                        Ok(())
                    })
                }),
            );
        }

        let step = |name: &str| ResponseStep {
            name: name.to_string(),
            timeout_ms: self.config.step_timeout_ms,
            retries: self.config.step_retries,
        };
        let mut procedures = self.procedures.write();
        procedures.insert(
            "resource_exhaustion".into(),
            vec![step("reduce_load"), step("clear_caches"), step("restart_heavy")],
        );
        procedures.insert(
            "service_degradation".into(),
            vec![step("reset_connections"), step("reduce_load")],
        );
        procedures.insert(
            "cascade_failure".into(),
            vec![step("reduce_load"), step("reset_connections"), step("clear_caches")],
        );
        procedures.insert("metric_anomaly".into(), vec![step("reduce_load")]);
        drop(procedures);

        let mut failovers = self.failovers.write();
        failovers.insert("resource_exhaustion".into(), "restart_heavy".into());
        failovers.insert("service_degradation".into(), "switch_endpoint".into());
        failovers.insert("cascade_failure".into(), "switch_endpoint".into());
        failovers.insert("metric_anomaly".into(), "reset_connections".into());
        drop(failovers);

        let mut validators = self.validators.write();
        validators.push(RecoveryValidator {
            name: "resources_cleared".into(),
            required: true,
            check: Arc::new(|s| s.cpu_pct < CPU_HIGH_PCT && s.memory_pct < MEMORY_HIGH_PCT),
        });
        validators.push(RecoveryValidator {
            name: "error_rate_normal".into(),
            required: true,
            check: Arc::new(|s| s.error_rate < ERROR_RATE_HIGH),
        });
        validators.push(RecoveryValidator {
            name: "queues_drained".into(),
            required: false,
            check: Arc::new(|s| s.pending_queue_depth < 10_000),
        });
    }

    pub fn register_step(&self, name: &str, action: StepAction) {
        self.step_registry.insert(name.to_string(), action);
    }

    pub fn register_validator(&self, validator: RecoveryValidator) {
        self.validators.write().push(validator);
    }

    pub fn set_procedure(&self, kind: &str, steps: Vec<ResponseStep>) {
        self.procedures.write().insert(kind.to_string(), steps);
    }

    /// One detection cycle: update baselines, open incidents for anomalies,
    /// resolve incidents whose conditions normalized, advance escalations.
    /// Returns ids of incidents opened by this sample.
    pub async fn observe(&self, sample: &TelemetrySample) -> Vec<String> {
        let metrics = [
            ("cpu_pct", sample.cpu_pct),
            ("memory_pct", sample.memory_pct),
            ("error_rate", sample.error_rate),
            ("avg_latency_ms", sample.avg_latency_ms),
        ];
        let mut opened = Vec::new();

        // Z-score anomalies against the rolling baselines.
        for (name, value) in metrics {
            let z = {
                let mut baseline = self.baselines.entry(name.to_string()).or_default();
                let z = baseline.z_score(value);
                baseline.update(value);
                z
            };
            if z > self.config.anomaly_threshold {
                if let Some(id) = self.open_incident(
                    "metric_anomaly",
                    Some(name.to_string()),
                    Severity::Medium,
                    format!("{name} z-score {z:.1} above {:.1}", self.config.anomaly_threshold),
                ) {
                    opened.push(id);
                }
            }
        }

        // Pattern anomalies.
        if sample.cpu_pct > CPU_HIGH_PCT && sample.memory_pct > MEMORY_HIGH_PCT {
            if let Some(id) = self.open_incident(
                "resource_exhaustion",
                None,
                Severity::High,
                format!("cpu {:.0}% and memory {:.0}% simultaneously high", sample.cpu_pct, sample.memory_pct),
            ) {
                opened.push(id);
            }
        }
        if sample.error_rate > ERROR_RATE_HIGH && sample.avg_latency_ms > LATENCY_HIGH_MS {
            if let Some(id) = self.open_incident(
                "service_degradation",
                None,
                Severity::High,
                format!("error rate {:.2} with latency {:.0}ms", sample.error_rate, sample.avg_latency_ms),
            ) {
                opened.push(id);
            }
        }

        // Cascade: several related incidents active inside the window.
        let now = now_ms();
        let recent_active = self
            .incidents
            .iter()
            .filter(|i| {
                i.status.is_active()
                    && i.kind != "cascade_failure"
                    && now.saturating_sub(i.opened_at_ms) <= self.config.cascade_timeout_ms
            })
            .count();
        if recent_active >= self.config.cascade_min_incidents {
            if let Some(id) = self.open_incident(
                "cascade_failure",
                None,
                Severity::Critical,
                format!("{recent_active} related incidents inside the cascade window"),
            ) {
                opened.push(id);
            }
        }

        self.check_resolutions(sample).await;
        self.advance_escalations().await;
        opened
    }

    /// Open an incident unless one of this kind is already active.
    fn open_incident(
        &self,
        kind: &str,
        metric: Option<String>,
        severity: Severity,
        detail: String,
    ) -> Option<String> {
        if let Some(existing) = self.active_by_kind.get(kind) {
            if self
                .incidents
                .get(existing.value())
                .map(|i| i.status.is_active())
                .unwrap_or(false)
            {
                return None;
            }
        }
        let id = uuid::Uuid::new_v4().to_string();
        let escalation_level = match severity {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        };
        let mut incident = Incident {
            id: id.clone(),
            kind: kind.to_string(),
            metric,
            severity,
            escalation_level,
            status: IncidentStatus::Detected,
            timeline: Vec::new(),
            response_attempts: 0,
            opened_at_ms: now_ms(),
            escalation_deadline_ms: now_ms() + self.config.escalation_interval_ms,
        };
        incident.push_timeline(format!("detected: {detail}"));
        warn!("incident opened: {kind} ({detail})");
        metrics::counter!(m::INCIDENTS_OPENED, "kind" => kind.to_string()).increment(1);
        self.incidents.insert(id.clone(), incident);
        self.active_by_kind.insert(kind.to_string(), id.clone());
        Some(id)
    }

    /// Run the automated response procedure for one incident.
    pub async fn respond(&self, incident_id: &str) {
        let (kind, attempts) = {
            let Some(mut incident) = self.incidents.get_mut(incident_id) else { return };
            incident.status = IncidentStatus::Responding;
            incident.response_attempts += 1;
            incident.push_timeline("responding: automated procedure started");
            (incident.kind.clone(), incident.response_attempts)
        };
        debug!("responding to incident {incident_id} ({kind}), attempt {attempts}");

        let steps = self.procedures.read().get(&kind).cloned().unwrap_or_default();
        let mut failed_step: Option<String> = None;
        for step in steps {
            if !self.run_step(&step).await {
                failed_step = Some(step.name.clone());
                break;
            }
            if let Some(mut incident) = self.incidents.get_mut(incident_id) {
                incident.push_timeline(format!("response step {} completed", step.name));
            }
        }

        match failed_step {
            None => {
                if let Some(mut incident) = self.incidents.get_mut(incident_id) {
                    incident.push_timeline("response procedure completed, awaiting recovery");
                }
            }
            Some(step_name) => {
                warn!("incident {incident_id} response step {step_name} failed, running failover");
                if let Some(mut incident) = self.incidents.get_mut(incident_id) {
                    incident.status = IncidentStatus::FailoverInProgress;
                    incident.push_timeline(format!("failover_in_progress: step {step_name} failed"));
                }
                let failover = self.failovers.read().get(&kind).cloned();
                let failover_ok = match failover {
                    Some(action_name) => {
                        self.run_step(&ResponseStep {
                            name: action_name,
                            timeout_ms: self.config.step_timeout_ms,
                            retries: 0,
                        })
                        .await
                    }
                    None => false,
                };
                if let Some(mut incident) = self.incidents.get_mut(incident_id) {
                    if failover_ok {
                        incident.status = IncidentStatus::Responding;
                        incident.push_timeline("failover completed, awaiting recovery");
                    } else {
                        incident.status = IncidentStatus::FailoverFailed;
                        incident.push_timeline("failover_failed");
                    }
                }
                if !failover_ok {
                    self.alert
                        .send(
                            "incident_failover_failed",
                            json!({ "incident": incident_id, "kind": kind }),
                            Urgency::Critical,
                        )
                        .await;
                }
            }
        }
    }

    async fn run_step(&self, step: &ResponseStep) -> bool {
        let Some(action) = self.step_registry.get(&step.name).map(|a| Arc::clone(&a)) else {
            warn!("no registered action for response step {}", step.name);
            return false;
        };
        for attempt in 0..=step.retries {
            let outcome =
                tokio::time::timeout(Duration::from_millis(step.timeout_ms), action()).await;
            match outcome {
                Ok(Ok(())) => return true,
                Ok(Err(err)) => {
                    warn!("response step {} failed (attempt {attempt}): {err}", step.name)
                }
                Err(_) => warn!("response step {} timed out (attempt {attempt})", step.name),
            }
        }
        false
    }

    /// Resolve incidents whose conditions normalized and whose required
    /// validators all pass.
    async fn check_resolutions(&self, sample: &TelemetrySample) {
        let responding: Vec<Incident> = self
            .incidents
            .iter()
            .filter(|i| matches!(i.status, IncidentStatus::Responding))
            .map(|i| i.clone())
            .collect();
        let candidates: Vec<String> = responding
            .into_iter()
            .filter(|i| self.is_normalized(i, sample))
            .map(|i| i.id)
            .collect();

        for id in candidates {
            if let Some(mut incident) = self.incidents.get_mut(&id) {
                incident.status = IncidentStatus::ValidatingRecovery;
                incident.push_timeline("validating_recovery: conditions normalized");
            }
            let validated = self.validate_recovery(sample);
            if validated {
                if let Some(mut incident) = self.incidents.get_mut(&id) {
                    incident.status = IncidentStatus::Resolved;
                    incident.push_timeline("resolved: recovery validated");
                    info!("incident {} ({}) resolved", incident.id, incident.kind);
                }
                metrics::counter!(m::INCIDENTS_RESOLVED).increment(1);
            } else {
                let retry = {
                    let Some(mut incident) = self.incidents.get_mut(&id) else { continue };
                    incident.push_timeline("recovery validation failed");
                    incident.response_attempts < self.config.max_recovery_attempts
                };
                if retry {
                    self.respond(&id).await;
                } else {
                    if let Some(mut incident) = self.incidents.get_mut(&id) {
                        incident.status = IncidentStatus::ResponseFailed;
                        incident.push_timeline("response_failed: recovery attempts exhausted");
                    }
                    self.escalate(&id).await;
                }
            }
        }
    }

    /// An incident cannot resolve unless every required validator passes.
    fn validate_recovery(&self, sample: &TelemetrySample) -> bool {
        let validators = self.validators.read();
        for validator in validators.iter().filter(|v| v.required) {
            if !(validator.check)(sample) {
                debug!("recovery validator {} failed", validator.name);
                return false;
            }
        }
        true
    }

    fn is_normalized(&self, incident: &Incident, sample: &TelemetrySample) -> bool {
        match incident.kind.as_str() {
            "resource_exhaustion" => {
                sample.cpu_pct < CPU_HIGH_PCT && sample.memory_pct < MEMORY_HIGH_PCT
            }
            "service_degradation" => {
                sample.error_rate < ERROR_RATE_HIGH && sample.avg_latency_ms < LATENCY_HIGH_MS
            }
            "cascade_failure" => {
                let now = now_ms();
                self.incidents
                    .iter()
                    .filter(|i| {
                        i.status.is_active()
                            && i.kind != "cascade_failure"
                            && now.saturating_sub(i.opened_at_ms) <= self.config.cascade_timeout_ms
                    })
                    .count()
                    < self.config.cascade_min_incidents
            }
            "metric_anomaly" => {
                let Some(metric) = &incident.metric else { return true };
                let value = match metric.as_str() {
                    "cpu_pct" => sample.cpu_pct,
                    "memory_pct" => sample.memory_pct,
                    "error_rate" => sample.error_rate,
                    "avg_latency_ms" => sample.avg_latency_ms,
                    _ => return true,
                };
                let z = self
                    .baselines
                    .get(metric)
                    .map(|b| b.z_score(value))
                    .unwrap_or(0.0);
                z < 0.7 * self.config.anomaly_threshold
            }
            _ => true,
        }
    }

    /// Escalation timers: an incident left unresolved past its deadline
    /// advances one level and fires that level's actions.
    async fn advance_escalations(&self) {
        let now = now_ms();
        let due: Vec<String> = self
            .incidents
            .iter()
            .filter(|i| i.status.is_active() && now >= i.escalation_deadline_ms)
            .map(|i| i.id.clone())
            .collect();
        for id in due {
            self.escalate(&id).await;
        }
    }

    async fn escalate(&self, incident_id: &str) {
        let (kind, level, maxed) = {
            let Some(mut incident) = self.incidents.get_mut(incident_id) else { return };
            if incident.escalation_level >= MAX_ESCALATION_LEVEL {
                incident.status = IncidentStatus::MaximumEscalationReached;
                incident.push_timeline("maximum_escalation_reached");
                (incident.kind.clone(), incident.escalation_level, true)
            } else {
                incident.escalation_level += 1;
                incident.escalation_deadline_ms = now_ms() + self.config.escalation_interval_ms;
                let level = incident.escalation_level;
                incident.push_timeline(format!("escalated to level {level}"));
                (incident.kind.clone(), level, false)
            }
        };

        let (category, priority) = if maxed {
            ("incident_max_escalation", Urgency::Critical)
        } else {
            match level {
                0 | 1 => ("incident_notice", Urgency::Medium),
                2 => ("incident_escalation", Urgency::High),
                _ => ("incident_oncall", Urgency::Critical),
            }
        };
        warn!("incident {incident_id} ({kind}) escalation level {level}");
        self.alert
            .send(category, json!({ "incident": incident_id, "kind": kind, "level": level }), priority)
            .await;
    }

    pub fn incident(&self, id: &str) -> Option<Incident> {
        self.incidents.get(id).map(|i| i.clone())
    }

    pub fn active_incidents(&self) -> Vec<Incident> {
        self.incidents
            .iter()
            .filter(|i| i.status.is_active())
            .map(|i| i.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.incidents.iter().filter(|i| i.status.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> IncidentManager {
        IncidentManager::new(IncidentConfig::default(), Arc::new(super::super::LogAlertSink))
    }

    fn hot_sample() -> TelemetrySample {
        TelemetrySample {
            cpu_pct: 95.0,
            memory_pct: 90.0,
            ..TelemetrySample::default()
        }
    }

    fn calm_sample() -> TelemetrySample {
        TelemetrySample {
            cpu_pct: 30.0,
            memory_pct: 40.0,
            error_rate: 0.01,
            avg_latency_ms: 50.0,
            ..TelemetrySample::default()
        }
    }

    #[test]
    fn test_baseline_warmup_suppresses_z() {
        let mut baseline = MetricBaseline::default();
        for _ in 0..5 {
            baseline.update(50.0);
        }
        assert_eq!(baseline.z_score(500.0), 0.0);
    }

    #[test]
    fn test_baseline_detects_deviation_after_warmup() {
        let mut baseline = MetricBaseline::default();
        for i in 0..50 {
            baseline.update(50.0 + (i % 5) as f64);
        }
        assert!(baseline.z_score(200.0) > 3.0);
        assert!(baseline.z_score(52.0) < 3.0);
    }

    #[tokio::test]
    async fn test_resource_exhaustion_lifecycle() {
        let manager = manager();
        let opened = manager.observe(&hot_sample()).await;
        assert_eq!(opened.len(), 1);
        let id = &opened[0];
        assert_eq!(manager.incident(id).unwrap().kind, "resource_exhaustion");
        assert_eq!(manager.incident(id).unwrap().status, IncidentStatus::Detected);

        manager.respond(id).await;
        let incident = manager.incident(id).unwrap();
        assert_eq!(incident.status, IncidentStatus::Responding);
        let notes: Vec<&str> = incident.timeline.iter().map(|t| t.note.as_str()).collect();
        assert!(notes.iter().any(|n| n.contains("reduce_load")));
        assert!(notes.iter().any(|n| n.contains("clear_caches")));
        assert!(notes.iter().any(|n| n.contains("restart_heavy")));

        // Metrics normalize; the incident validates and resolves.
        manager.observe(&calm_sample()).await;
        let incident = manager.incident(id).unwrap();
        assert_eq!(incident.status, IncidentStatus::Resolved);

        // Timeline ordering: detected -> responding -> validating -> resolved.
        let sequence: Vec<&str> = incident
            .timeline
            .iter()
            .map(|t| t.note.split(':').next().unwrap_or(""))
            .collect();
        let detected = sequence.iter().position(|n| n.starts_with("detected")).unwrap();
        let responding = sequence.iter().position(|n| n.starts_with("responding")).unwrap();
        let validating = sequence.iter().position(|n| n.starts_with("validating_recovery")).unwrap();
        let resolved = sequence.iter().position(|n| n.starts_with("resolved")).unwrap();
        assert!(detected < responding && responding < validating && validating < resolved);
        // Sequence numbers are strictly increasing from 1.
        for (index, entry) in incident.timeline.iter().enumerate() {
            assert_eq!(entry.seq as usize, index + 1);
        }
    }

    #[tokio::test]
    async fn test_no_duplicate_incident_per_kind() {
        let manager = manager();
        let first = manager.observe(&hot_sample()).await;
        let second = manager.observe(&hot_sample()).await;
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_step_triggers_failover() {
        let manager = manager();
        manager.register_step(
            "clear_caches",
            Arc::new(|| Box::pin(async { anyhow::bail!("cache layer wedged") })),
        );
        let opened = manager.observe(&hot_sample()).await;
        let id = &opened[0];
        manager.respond(id).await;
        let incident = manager.incident(id).unwrap();
        // Failover (restart_heavy) succeeded, so the incident keeps responding.
        assert_eq!(incident.status, IncidentStatus::Responding);
        assert!(incident
            .timeline
            .iter()
            .any(|t| t.note.starts_with("failover_in_progress")));
    }

    #[tokio::test]
    async fn test_required_validator_blocks_resolution() {
        let manager = manager();
        manager.register_validator(RecoveryValidator {
            name: "always_red".into(),
            required: true,
            check: Arc::new(|_| false),
        });
        let opened = manager.observe(&hot_sample()).await;
        let id = &opened[0];
        manager.respond(id).await;
        manager.observe(&calm_sample()).await;
        let incident = manager.incident(id).unwrap();
        assert_ne!(incident.status, IncidentStatus::Resolved);
    }

    #[tokio::test]
    async fn test_escalation_on_deadline() {
        let config = IncidentConfig {
            escalation_interval_ms: 0,
            ..IncidentConfig::default()
        };
        let manager = IncidentManager::new(config, Arc::new(super::super::LogAlertSink));
        let opened = manager.observe(&hot_sample()).await;
        let id = &opened[0];
        let before = manager.incident(id).unwrap().escalation_level;
        manager.observe(&hot_sample()).await;
        let after = manager.incident(id).unwrap();
        assert!(after.escalation_level > before || after.status == IncidentStatus::MaximumEscalationReached);
    }

    #[tokio::test]
    async fn test_cascade_detection() {
        let manager = manager();
        // Open three distinct incident kinds.
        manager.open_incident("resource_exhaustion", None, Severity::High, "a".into());
        manager.open_incident("service_degradation", None, Severity::High, "b".into());
        manager.open_incident("metric_anomaly", Some("cpu_pct".into()), Severity::Medium, "c".into());
        let opened = manager.observe(&calm_sample()).await;
        assert!(manager
            .active_incidents()
            .iter()
            .any(|i| i.kind == "cascade_failure"));
        // The cascade incident itself came from this observe call.
        assert!(opened.iter().any(|id| {
            manager.incident(id).map(|i| i.kind == "cascade_failure").unwrap_or(false)
        }));
    }
}
