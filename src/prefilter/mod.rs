// =============================================================================
// Pre-evaluation (P2) — route, dedup, correlate, gate
// =============================================================================
//
// Transforms the raw candidate stream into a vetted stream for P3 without
// mutating candidate identity. Steps are pure functions over their inputs; a
// panic in any of them sends the candidate to the dead-letter ledger and
// never blocks the pipeline.
// =============================================================================

pub mod correlation;
pub mod dedup;
pub mod quality;
pub mod reinforce;
pub mod router;

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::PreEvalConfig;
use crate::errors::DropReason;
use crate::metrics::PipelineMetrics;
use crate::params::{Consumer, ParameterStore};
use crate::types::{PriorityBand, SignalCandidate};

use correlation::{CorrelationEffect, CorrelationTracker};
use dedup::{DedupOutcome, DedupTracker};
use reinforce::ReinforcementTracker;
use router::{IntelligentRouter, Lane};

/// Margin under the quality floor inside which a dropped candidate is still
/// worth a delayed second look.
const EDGE_MARGIN: f64 = 0.05;
/// Dead-letter ledger retention.
const MAX_DEAD_LETTERS: usize = 100;

// ---------------------------------------------------------------------------
// Output type
// ---------------------------------------------------------------------------

/// A candidate that survived pre-evaluation, annotated for P3.
#[derive(Debug, Clone)]
pub struct VettedCandidate {
    pub candidate: SignalCandidate,
    pub lane: Lane,
    /// Weighted quality composite in [0, 1].
    pub composite: f64,
    /// Set when this candidate earned its slot via delayed-observation
    /// reinforcement.
    pub reinforced: bool,
}

/// Queue depths, lane distribution, and drop reasons for the operator
/// surface.
#[derive(Debug, Clone, Serialize)]
pub struct PreEvalReport {
    pub queue_depth_candidates: u64,
    pub queue_depth_vetted: u64,
    pub lane_express: u64,
    pub lane_standard: u64,
    pub lane_deep: u64,
    pub lane_degradations: u64,
    pub dedup_suppressions: u64,
    pub dead_lettered: u64,
    pub drop_reasons: std::collections::HashMap<String, u64>,
}

// ---------------------------------------------------------------------------
// PreEvaluator
// ---------------------------------------------------------------------------

/// The P2 engine. Interior mutability throughout: the worker pool shares one
/// instance behind an Arc.
pub struct PreEvaluator {
    cfg: PreEvalConfig,
    params: Arc<ParameterStore>,
    metrics: Arc<PipelineMetrics>,
    router: Mutex<IntelligentRouter>,
    dedup: Mutex<DedupTracker>,
    correlation: Mutex<CorrelationTracker>,
    reinforce: Mutex<ReinforcementTracker>,
    dead_letters: Mutex<VecDeque<(String, String)>>,
}

impl PreEvaluator {
    pub fn new(
        cfg: PreEvalConfig,
        params: Arc<ParameterStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            router: Mutex::new(IntelligentRouter::new(cfg.clone())),
            dedup: Mutex::new(DedupTracker::new(cfg.clone())),
            correlation: Mutex::new(CorrelationTracker::new(cfg.clone())),
            reinforce: Mutex::new(ReinforcementTracker::new(cfg.clone())),
            dead_letters: Mutex::new(VecDeque::new()),
            cfg,
            params,
            metrics,
        }
    }

    /// Update the observed downstream queue load for the router.
    pub fn note_load(&self, load: f64) {
        self.router.lock().note_load(load);
    }

    /// Process one candidate through routing, dedup, correlation, and the
    /// quality gate.
    pub fn process(
        &self,
        candidate: SignalCandidate,
        now_ms: i64,
    ) -> Result<VettedCandidate, DropReason> {
        use std::sync::atomic::Ordering::Relaxed;

        if now_ms > candidate.expires_at_ms {
            return self.reject(candidate, DropReason::Expired);
        }
        if let Err(detail) = candidate.validate() {
            return self.reject(candidate, DropReason::Invalid { detail });
        }

        let result = catch_unwind(AssertUnwindSafe(|| self.run_steps(candidate.clone(), now_ms)));
        match result {
            Ok(inner) => inner,
            Err(_) => {
                self.metrics.dead_lettered.fetch_add(1, Relaxed);
                self.metrics.bump_reason("dead_letter");
                let mut ledger = self.dead_letters.lock();
                ledger.push_back((candidate.id.clone(), "pre_eval_panic".into()));
                while ledger.len() > MAX_DEAD_LETTERS {
                    ledger.pop_front();
                }
                warn!(candidate = %candidate.id, "pre-evaluation panicked; dead-lettered");
                Err(DropReason::DeadLetter { stage: "pre_eval" })
            }
        }
    }

    fn run_steps(
        &self,
        mut candidate: SignalCandidate,
        now_ms: i64,
    ) -> Result<VettedCandidate, DropReason> {
        use std::sync::atomic::Ordering::Relaxed;

        let (_, set) = self.params.get(Consumer::SignalGen);

        // ── Routing ──────────────────────────────────────────────────────
        let ambiguous = self
            .dedup
            .lock()
            .has_conflict(&candidate.symbol, candidate.direction);
        let decision = self.router.lock().route(&candidate, ambiguous);
        match decision.lane {
            Lane::Express => self.metrics.lane_express.fetch_add(1, Relaxed),
            Lane::Standard => self.metrics.lane_standard.fetch_add(1, Relaxed),
            Lane::Deep => self.metrics.lane_deep.fetch_add(1, Relaxed),
        };
        if decision.degraded {
            self.metrics.lane_degradations.fetch_add(1, Relaxed);
            self.metrics.bump_reason("degradation_queue_pressure");
        }

        // ── Step 1: dedup ────────────────────────────────────────────────
        match self.dedup.lock().check(&candidate, now_ms) {
            DedupOutcome::Unique => {}
            DedupOutcome::DiversityPreserved { distinct_strategies } => {
                self.metrics.bump_reason("diversity_preserved");
                debug!(candidate = %candidate.id, distinct_strategies, "diversity guard preserved near-duplicate");
            }
            DedupOutcome::Suppressed { kept_candidate } => {
                self.metrics.dedup_suppressions.fetch_add(1, Relaxed);
                return self.reject(candidate, DropReason::Duplicate { kept_candidate });
            }
            DedupOutcome::Supersedes { superseded } => {
                // The earlier, weaker emission already went downstream; the
                // suppression is recorded against it.
                self.metrics.dedup_suppressions.fetch_add(1, Relaxed);
                debug!(candidate = %candidate.id, superseded = %superseded, "supersedes earlier duplicate");
            }
        }

        // ── Steps 2 + 3: correlation and quality gate ────────────────────
        let mut composite = quality::composite(&candidate.quality, &set, candidate.regime);
        let mut demoted = false;

        match self
            .correlation
            .lock()
            .assess(&candidate, composite, now_ms)
        {
            CorrelationEffect::None => {}
            CorrelationEffect::Reinforce { confidence_bump } => {
                self.metrics.correlation_reinforcements.fetch_add(1, Relaxed);
                candidate.confidence = (candidate.confidence + confidence_bump).min(1.0);
                candidate.quality.confidence =
                    (candidate.quality.confidence + confidence_bump).min(1.0);
                composite = quality::composite(&candidate.quality, &set, candidate.regime);
            }
            CorrelationEffect::WinsConflict { against, correlation } => {
                self.metrics.correlation_conflicts.fetch_add(1, Relaxed);
                debug!(candidate = %candidate.id, against = %against, correlation, "won correlation conflict");
            }
            CorrelationEffect::Demote { against, correlation } => {
                self.metrics.correlation_conflicts.fetch_add(1, Relaxed);
                debug!(candidate = %candidate.id, against = %against, correlation, "demoted by correlation conflict");
                demoted = true;
            }
        }

        let gated = quality::gate(&candidate.quality, &set, candidate.regime, &self.cfg);
        match gated {
            Err(reason) => {
                // Just-missed candidates get a delayed second look.
                if let DropReason::BelowQualityFloor { composite: c } = &reason {
                    let floor = set
                        .num_scoped(crate::params::QUALITY_FLOOR, None, Some(candidate.regime))
                        .unwrap_or(0.40);
                    if *c >= floor - EDGE_MARGIN {
                        self.reinforce.lock().track(candidate.clone(), now_ms);
                    }
                }
                self.reject(candidate, reason)
            }
            Ok((score, band)) => {
                composite = score;
                candidate.band = if demoted { PriorityBand::Low } else { band };
                if demoted {
                    // Demoted candidates are tracked for re-promotion.
                    self.reinforce.lock().track(candidate.clone(), now_ms);
                }
                Ok(VettedCandidate {
                    candidate,
                    lane: decision.lane,
                    composite,
                    reinforced: false,
                })
            }
        }
    }

    /// Feed a closed bar: updates the correlation series and returns any
    /// re-promoted candidates (standard lane, REINFORCED tag).
    pub fn observe_bar(&self, symbol: &str, close: f64, now_ms: i64) -> Vec<VettedCandidate> {
        use std::sync::atomic::Ordering::Relaxed;

        self.correlation.lock().observe_close(symbol, close);

        let promoted = self.reinforce.lock().observe_bar(symbol, close, now_ms);
        let (_, set) = self.params.get(Consumer::SignalGen);

        promoted
            .into_iter()
            .map(|mut candidate| {
                self.metrics.reinforced_promotions.fetch_add(1, Relaxed);
                let composite =
                    quality::composite(&candidate.quality, &set, candidate.regime);
                candidate.band = quality::band_for(composite, &self.cfg);
                debug!(candidate = %candidate.id, composite, "re-promoted after delayed confirmation");
                VettedCandidate {
                    candidate,
                    lane: Lane::Standard,
                    composite,
                    reinforced: true,
                }
            })
            .collect()
    }

    /// Operator metrics: queue depths, lane distribution, drop reasons.
    pub fn report(&self) -> PreEvalReport {
        let snap = self.metrics.snapshot();
        PreEvalReport {
            queue_depth_candidates: snap.depth_candidates,
            queue_depth_vetted: snap.depth_vetted,
            lane_express: snap.lane_express,
            lane_standard: snap.lane_standard,
            lane_deep: snap.lane_deep,
            lane_degradations: snap.lane_degradations,
            dedup_suppressions: snap.dedup_suppressions,
            dead_lettered: snap.dead_lettered,
            drop_reasons: snap.reasons,
        }
    }

    pub fn dead_letters(&self) -> Vec<(String, String)> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    fn reject(
        &self,
        candidate: SignalCandidate,
        reason: DropReason,
    ) -> Result<VettedCandidate, DropReason> {
        self.metrics.bump_reason(reason.label());
        // CRITICAL-classified items are never dropped silently.
        if candidate.band == PriorityBand::Critical {
            warn!(candidate = %candidate.id, %reason, "dropping CRITICAL-classified candidate");
        } else {
            debug!(candidate = %candidate.id, %reason, "candidate dropped");
        }
        Err(reason)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
