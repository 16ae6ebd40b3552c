// The opportunity pipeline: a per-opportunity stage machine running
// validation -> scoring -> risk assessment -> execution decision -> queueing
// under bounded concurrency, gated by the safety plane's published snapshot.
pub mod scoring;

pub use scoring::{compute_scores, execution_priority, Scores};

use crate::config::PipelineConfig;
use crate::metrics as m;
use crate::types::{
    now_ms, ExecutionResult, LiquidityTier, MarketCondition, MevRisk, Opportunity,
    OpportunityKind, OpportunityPayload, TradeResult, TradingGate,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pipeline stages; `Terminal` ends the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stage {
    Detected,
    Validation,
    Scoring,
    RiskAssessment,
    ExecutionDecision,
    QueuedForExecution,
    Terminal(Terminal),
}

/// Outcome of submitting an opportunity.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The context reached the execution queue and awaits release.
    Queued,
    /// The context ended in a terminal state without queueing.
    Finished(Terminal),
}

impl SubmitOutcome {
    pub fn terminal(&self) -> Option<&Terminal> {
        match self {
            SubmitOutcome::Finished(terminal) => Some(terminal),
            SubmitOutcome::Queued => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum Terminal {
    Executed,
    RejectedValidation(String),
    RejectedLowScore,
    RejectedHighRisk,
    ExecutionDeclined(String),
    Expired,
    Error(String),
    Backpressure,
    SafetyGated(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskRecommendation {
    Proceed,
    Caution,
    Decline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: f64,
    pub factors: Vec<String>,
    pub recommendation: RiskRecommendation,
}

/// External risk assessor; must respect the caller-provided deadline.
#[async_trait]
pub trait RiskAssessor: Send + Sync {
    async fn assess(&self, opportunity: &Opportunity) -> anyhow::Result<RiskAssessment>;
}

/// External executor; called at most once per opportunity id.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        opportunity: &Opportunity,
        context: &PipelineContext,
    ) -> anyhow::Result<ExecutionResult>;
}

/// Per-opportunity processing record, owned exclusively by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    pub opportunity: Opportunity,
    pub stage: Stage,
    pub scores: Option<Scores>,
    pub risk: Option<RiskAssessment>,
    pub started_at_ms: u64,
    pub processing_ms: u64,
}

impl PipelineContext {
    fn new(opportunity: Opportunity) -> Self {
        Self {
            opportunity,
            stage: Stage::Detected,
            scores: None,
            risk: None,
            started_at_ms: now_ms(),
            processing_ms: 0,
        }
    }
}

/// Queue entry ordered by execution priority.
#[derive(Debug, Clone)]
pub struct QueuedOpportunity {
    pub context: PipelineContext,
    pub execution_priority: f64,
    pub queued_at_ms: u64,
}

impl PartialEq for QueuedOpportunity {
    fn eq(&self, other: &Self) -> bool {
        self.execution_priority == other.execution_priority
    }
}
impl Eq for QueuedOpportunity {}
impl PartialOrd for QueuedOpportunity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedOpportunity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.execution_priority.total_cmp(&other.execution_priority)
    }
}

#[derive(Debug, Default)]
struct PipelineCounters {
    received: AtomicU64,
    queued: AtomicU64,
    executed: AtomicU64,
    rejected_validation: AtomicU64,
    rejected_low_score: AtomicU64,
    rejected_high_risk: AtomicU64,
    declined: AtomicU64,
    expired: AtomicU64,
    errors: AtomicU64,
    backpressure: AtomicU64,
    safety_gated: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub received: u64,
    pub queued: u64,
    pub executed: u64,
    pub rejected_validation: u64,
    pub rejected_low_score: u64,
    pub rejected_high_risk: u64,
    pub declined: u64,
    pub expired: u64,
    pub errors: u64,
    pub backpressure: u64,
    pub safety_gated: u64,
    pub in_flight: usize,
    pub queue_depth: usize,
}

/// Multi-stage opportunity pipeline with bounded concurrency.
pub struct OpportunityPipeline {
    config: PipelineConfig,
    gate: watch::Receiver<TradingGate>,
    risk_assessor: RwLock<Option<Arc<dyn RiskAssessor>>>,
    market: RwLock<MarketCondition>,
    in_flight: AtomicUsize,
    queue: Mutex<BinaryHeap<QueuedOpportunity>>,
    released_ids: DashMap<String, ()>,
    history: Mutex<VecDeque<PipelineContext>>,
    counters: PipelineCounters,
}

impl OpportunityPipeline {
    pub fn new(config: PipelineConfig, gate: watch::Receiver<TradingGate>) -> Self {
        Self {
            config,
            gate,
            risk_assessor: RwLock::new(None),
            market: RwLock::new(MarketCondition::default()),
            in_flight: AtomicUsize::new(0),
            queue: Mutex::new(BinaryHeap::new()),
            released_ids: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            counters: PipelineCounters::default(),
        }
    }

    pub fn set_risk_assessor(&self, assessor: Arc<dyn RiskAssessor>) {
        *self.risk_assessor.write() = Some(assessor);
    }

    pub fn set_market_condition(&self, market: MarketCondition) {
        *self.market.write() = market;
    }

    pub fn market_condition(&self) -> MarketCondition {
        *self.market.read()
    }

    /// Run one opportunity through the full stage machine. Admission is
    /// refused while the safety gate is closed or the concurrency bound is
    /// hit.
    pub async fn submit(&self, opportunity: Opportunity) -> SubmitOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::OPPORTUNITIES_RECEIVED).increment(1);

        let gate = self.gate.borrow().clone();
        if !gate.allowed {
            let reason = if gate.reasons.is_empty() {
                "safety_gated".to_string()
            } else {
                gate.reasons.join(", ")
            };
            debug!("opportunity {} refused: safety gate ({reason})", opportunity.id);
            let mut context = PipelineContext::new(opportunity);
            return SubmitOutcome::Finished(self.finish(
                &mut context,
                Terminal::SafetyGated(reason),
                false,
            ));
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if current >= self.config.max_concurrent_opportunities {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let mut context = PipelineContext::new(opportunity);
            return SubmitOutcome::Finished(self.finish(&mut context, Terminal::Backpressure, false));
        }
        metrics::gauge!(m::PIPELINE_IN_FLIGHT).set(self.in_flight.load(Ordering::SeqCst) as f64);

        let mut context = PipelineContext::new(opportunity);
        match self.run_stages(&mut context).await {
            Some(terminal) => SubmitOutcome::Finished(self.finish(&mut context, terminal, true)),
            // Context parked on the execution queue; the slot stays held
            // until the executor loop releases it.
            None => SubmitOutcome::Queued,
        }
    }

    /// Returns `Some(terminal)` when the context ended, `None` when it was
    /// queued for execution (slot retained until release).
    async fn run_stages(&self, context: &mut PipelineContext) -> Option<Terminal> {
        // --- validation ---
        context.stage = Stage::Validation;
        if let Err(terminal) = self.validate(context) {
            return Some(terminal);
        }

        // --- scoring ---
        if self.expired(context) {
            return Some(Terminal::Expired);
        }
        context.stage = Stage::Scoring;
        let market = self.market_condition();
        let scores = compute_scores(&context.opportunity, now_ms(), &self.config, &market);
        context.scores = Some(scores.clone());
        if scores.total < 50.0 {
            return Some(Terminal::RejectedLowScore);
        }

        // --- risk assessment ---
        if self.expired(context) {
            return Some(Terminal::Expired);
        }
        context.stage = Stage::RiskAssessment;
        let assessment = self.assess_risk(&context.opportunity).await;
        context.risk = Some(assessment.clone());

        // --- execution decision ---
        if self.expired(context) {
            return Some(Terminal::Expired);
        }
        context.stage = Stage::ExecutionDecision;
        if let Err(terminal) = self.decide(context, &scores, &assessment) {
            return Some(terminal);
        }

        // --- queue for execution ---
        context.stage = Stage::QueuedForExecution;
        context.processing_ms = now_ms().saturating_sub(context.started_at_ms);
        let priority = execution_priority(&context.opportunity, &scores, now_ms());
        self.queue.lock().push(QueuedOpportunity {
            context: context.clone(),
            execution_priority: priority,
            queued_at_ms: now_ms(),
        });
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::OPPORTUNITIES_QUEUED).increment(1);
        debug!(
            "opportunity {} queued at priority {priority:.1} (score {:.1})",
            context.opportunity.id, scores.total
        );
        None
    }

    fn expired(&self, context: &PipelineContext) -> bool {
        context.opportunity.age_ms(now_ms()) > self.config.opportunity_timeout_ms
    }

    fn validate(&self, context: &PipelineContext) -> Result<(), Terminal> {
        let opportunity = &context.opportunity;
        let now = now_ms();
        let age = opportunity.age_ms(now);
        if age > self.config.opportunity_timeout_ms {
            return Err(Terminal::Expired);
        }

        match &opportunity.payload {
            OpportunityPayload::Arbitrage(p) => {
                if age > self.config.price_validity_window_ms {
                    return Err(Terminal::RejectedValidation("price data too old".into()));
                }
                if p.net_profit_pct < self.config.min_profit_threshold * 100.0 {
                    return Err(Terminal::RejectedValidation(format!(
                        "net profit {:.3}% below floor",
                        p.net_profit_pct
                    )));
                }
                if p.buy_venue.is_empty() || p.sell_venue.is_empty() {
                    return Err(Terminal::RejectedValidation("missing venue".into()));
                }
                if p.liquidity == LiquidityTier::Low {
                    return Err(Terminal::RejectedValidation("insufficient liquidity".into()));
                }
                if p.price_impact_pct > 2.0 {
                    return Err(Terminal::RejectedValidation(format!(
                        "price impact {:.2}% too high",
                        p.price_impact_pct
                    )));
                }
            }
            OpportunityPayload::Mempool(p) => {
                if !p.has_opportunity && p.mev_risk != MevRisk::High {
                    return Err(Terminal::RejectedValidation("no actionable signal".into()));
                }
            }
            OpportunityPayload::Sandwich(_) => {
                if age > self.config.mev_max_age_ms {
                    return Err(Terminal::RejectedValidation("mev signal expired".into()));
                }
            }
            OpportunityPayload::Anomaly(_) | OpportunityPayload::ChainEvent(_) => {}
        }

        if opportunity.kind.is_mev() && age > self.config.mev_max_age_ms {
            return Err(Terminal::RejectedValidation("mev signal expired".into()));
        }
        Ok(())
    }

    /// Bounded-time delegation to the registered assessor; timeout or error
    /// yields a declining risk-75 assessment.
    async fn assess_risk(&self, opportunity: &Opportunity) -> RiskAssessment {
        let assessor = self.risk_assessor.read().clone();
        let Some(assessor) = assessor else {
            return RiskAssessment {
                risk_score: 50.0,
                factors: vec!["no assessor registered".into()],
                recommendation: RiskRecommendation::Caution,
            };
        };
        let deadline = Duration::from_millis(self.config.risk_assessment_timeout_ms);
        match tokio::time::timeout(deadline, assessor.assess(opportunity)).await {
            Ok(Ok(assessment)) => assessment,
            Ok(Err(err)) => {
                warn!("risk assessor failed for {}: {err}", opportunity.id);
                declined_assessment("assessor error")
            }
            Err(_) => {
                warn!("risk assessment timed out for {}", opportunity.id);
                declined_assessment("assessment timeout")
            }
        }
    }

    fn decide(
        &self,
        context: &PipelineContext,
        scores: &Scores,
        assessment: &RiskAssessment,
    ) -> Result<(), Terminal> {
        if scores.total < 60.0 {
            return Err(Terminal::ExecutionDeclined(format!(
                "score {:.1} below execution floor",
                scores.total
            )));
        }
        if assessment.risk_score > self.config.max_risk_score {
            return Err(Terminal::RejectedHighRisk);
        }
        if assessment.recommendation == RiskRecommendation::Decline {
            return Err(Terminal::ExecutionDeclined("risk assessor declined".into()));
        }
        // Type-specific overrides.
        if context.opportunity.kind.is_mev() && scores.speed <= 80.0 {
            return Err(Terminal::ExecutionDeclined("mev signal too slow".into()));
        }
        if context.opportunity.kind == OpportunityKind::PriceArbitrage
            && (scores.profit <= 40.0 || scores.confidence <= 60.0)
        {
            return Err(Terminal::ExecutionDeclined(
                "arbitrage profit/confidence floor not met".into(),
            ));
        }
        Ok(())
    }

    /// Pop the highest-priority queued opportunity. Each id is released at
    /// most once; re-queued duplicates are skipped.
    pub fn next_for_execution(&self) -> Option<QueuedOpportunity> {
        let mut queue = self.queue.lock();
        while let Some(entry) = queue.pop() {
            let id = entry.context.opportunity.id.clone();
            if self.released_ids.insert(id, ()).is_none() {
                return Some(entry);
            }
        }
        None
    }

    /// Executor loop: pulls in priority order, re-checks the safety gate
    /// before every execution, and feeds trade results back.
    pub fn run_executor(
        self: &Arc<Self>,
        executor: Arc<dyn Executor>,
        trade_tx: mpsc::Sender<TradeResult>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            info!("pipeline executor loop started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let gate = pipeline.gate.borrow().clone();
                if !gate.allowed {
                    // Safety gate closed: nothing reaches the executor.
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    continue;
                }
                let Some(entry) = pipeline.next_for_execution() else {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() { break; }
                            continue;
                        }
                    }
                };

                let mut context = entry.context;
                let deadline = Duration::from_millis(pipeline.config.opportunity_timeout_ms);
                let outcome =
                    tokio::time::timeout(deadline, executor.execute(&context.opportunity, &context))
                        .await;
                let terminal = match outcome {
                    Ok(Ok(result)) => {
                        metrics::counter!(m::OPPORTUNITIES_EXECUTED).increment(1);
                        let trade = TradeResult {
                            opportunity_id: context.opportunity.id.clone(),
                            success: result.success,
                            pnl_usd: result.pnl_usd,
                            gas_used: result.gas_used,
                        };
                        if trade_tx.send(trade).await.is_err() {
                            debug!("trade result channel closed");
                        }
                        Terminal::Executed
                    }
                    Ok(Err(err)) => {
                        warn!("executor failed for {}: {err}", context.opportunity.id);
                        Terminal::Error(err.to_string())
                    }
                    Err(_) => Terminal::Expired,
                };
                pipeline.finish(&mut context, terminal, true);
            }
            info!("pipeline executor loop stopped");
        })
    }

    fn finish(&self, context: &mut PipelineContext, terminal: Terminal, held_slot: bool) -> Terminal {
        context.processing_ms = now_ms().saturating_sub(context.started_at_ms);
        context.stage = Stage::Terminal(terminal.clone());

        let (counter, reason) = match &terminal {
            Terminal::Executed => (&self.counters.executed, "executed"),
            Terminal::RejectedValidation(_) => (&self.counters.rejected_validation, "validation"),
            Terminal::RejectedLowScore => (&self.counters.rejected_low_score, "low_score"),
            Terminal::RejectedHighRisk => (&self.counters.rejected_high_risk, "high_risk"),
            Terminal::ExecutionDeclined(_) => (&self.counters.declined, "declined"),
            Terminal::Expired => (&self.counters.expired, "expired"),
            Terminal::Error(_) => (&self.counters.errors, "error"),
            Terminal::Backpressure => (&self.counters.backpressure, "backpressure"),
            Terminal::SafetyGated(_) => (&self.counters.safety_gated, "safety_gated"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if !matches!(terminal, Terminal::Executed) {
            metrics::counter!(m::OPPORTUNITIES_REJECTED, "reason" => reason).increment(1);
        }

        if held_slot {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            metrics::gauge!(m::PIPELINE_IN_FLIGHT)
                .set(self.in_flight.load(Ordering::SeqCst) as f64);
        }

        let mut history = self.history.lock();
        history.push_back(context.clone());
        while history.len() > self.config.history_depth {
            history.pop_front();
        }
        terminal
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn history(&self) -> Vec<PipelineContext> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            received: self.counters.received.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            rejected_validation: self.counters.rejected_validation.load(Ordering::Relaxed),
            rejected_low_score: self.counters.rejected_low_score.load(Ordering::Relaxed),
            rejected_high_risk: self.counters.rejected_high_risk.load(Ordering::Relaxed),
            declined: self.counters.declined.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            backpressure: self.counters.backpressure.load(Ordering::Relaxed),
            safety_gated: self.counters.safety_gated.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            queue_depth: self.queue_depth(),
        }
    }
}

fn declined_assessment(reason: &str) -> RiskAssessment {
    RiskAssessment {
        risk_score: 75.0,
        factors: vec![reason.to_string()],
        recommendation: RiskRecommendation::Decline,
    }
}
