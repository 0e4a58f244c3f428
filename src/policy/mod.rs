// =============================================================================
// Execution policy (P3) — one of {REPLACE, STRENGTHEN, NEW, IGNORE} per
// vetted candidate
// =============================================================================
//
// Decision rules, evaluated in order, first match wins:
//
//   1. IGNORE      — same-direction open with >= origin confidence that
//                    outlives the candidate; or symbol risk budget gone; or
//                    REPLACE cooldown active.
//   2. REPLACE     — opposite-direction open outscored by the replace
//                    margin. Old position -> CLOSING, candidate originates
//                    a new one.
//   3. STRENGTHEN  — same-direction open outscored by the smaller margin:
//                    widen take-profit or tighten stop per parameter, size
//                    unchanged.
//   4. NEW         — no (symbol, direction) open and caps respected.
//
// Exits are clamped to volatility bounds before any verdict executes; a
// post-clamp risk/reward under the floor downgrades to IGNORE.
//
// The per-symbol map is the pipeline's only cross-phase mutable state;
// `decide` waits a bounded time for the stripe lock and yields IGNORE with
// CONTENTION on timeout. A REPLACE whose target already turned CLOSING is
// the same CONTENTION path.
// =============================================================================

pub mod book;
pub mod risk;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PolicyConfig;
use crate::metrics::PipelineMetrics;
use crate::params::{self, Consumer, ParameterStore};
use crate::prefilter::VettedCandidate;
use crate::types::{
    ClosureReason, Direction, ExecutionDecision, OutcomeRecord, Position, PositionEvent,
    PositionStatus, RationaleCode, RegimeLabel, Verdict,
};

use book::PositionBook;

/// Candidate context retained per open position so outcome records can carry
/// the feature snapshot forward.
#[derive(Debug, Clone)]
struct OriginMeta {
    features: HashMap<String, f64>,
    regime: RegimeLabel,
    strategy: String,
}

/// What the stripe-locked rule evaluation concluded; side effects that
/// require I/O happen after the lock is released.
struct RuleOutcome {
    verdict: Verdict,
    rationale: RationaleCode,
    target_position: Option<String>,
    opened: Option<Position>,
}

/// The P3 engine.
pub struct ExecutionPolicy {
    cfg: PolicyConfig,
    params: Arc<ParameterStore>,
    metrics: Arc<PipelineMetrics>,
    book: Arc<PositionBook>,
    /// symbol -> timestamp of the last REPLACE.
    replace_cooldowns: Mutex<HashMap<String, i64>>,
    /// position id -> origin candidate context.
    origin_meta: Mutex<HashMap<String, OriginMeta>>,
    /// Positions confirmed live by the execution collaborator.
    activated: Mutex<HashSet<String>>,
}

impl ExecutionPolicy {
    pub fn new(
        cfg: PolicyConfig,
        book: Arc<PositionBook>,
        params: Arc<ParameterStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            cfg,
            params,
            metrics,
            book,
            replace_cooldowns: Mutex::new(HashMap::new()),
            origin_meta: Mutex::new(HashMap::new()),
            activated: Mutex::new(HashSet::new()),
        }
    }

    /// Read-only view of the per-symbol position map.
    pub fn snapshot(&self) -> HashMap<String, book::SymbolPositions> {
        self.book.snapshot()
    }

    // -------------------------------------------------------------------
    // decide
    // -------------------------------------------------------------------

    pub fn decide(&self, vetted: &VettedCandidate, now_ms: i64) -> ExecutionDecision {
        use std::sync::atomic::Ordering::Relaxed;

        let candidate = &vetted.candidate;
        let (_, set) = self.params.get(Consumer::Policy);

        // Volatility clamp first: every executing verdict uses these exits.
        let atr = candidate
            .features
            .get("atr_14")
            .copied()
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or_else(|| (candidate.entry_price - candidate.stop_loss).abs());

        let plan = risk::plan_exits(
            candidate.direction,
            candidate.entry_price,
            atr,
            candidate.stop_loss,
            candidate.take_profit,
            &set,
            candidate.regime,
        );
        let Some(plan) = plan else {
            return self.finish(candidate, Verdict::Ignore, RationaleCode::RewardFloor, None, 0.0, candidate.stop_loss, candidate.take_profit, now_ms);
        };
        if plan.risk_reward < risk::rr_floor(&set, candidate.regime) {
            return self.finish(
                candidate,
                Verdict::Ignore,
                RationaleCode::RewardFloor,
                None,
                plan.risk_reward,
                plan.stop_loss,
                plan.take_profit,
                now_ms,
            );
        }

        let replace_margin = set
            .num_scoped(params::REPLACE_MARGIN, None, Some(candidate.regime))
            .unwrap_or(0.15);
        let strengthen_margin = set
            .num_scoped(params::STRENGTHEN_MARGIN, None, Some(candidate.regime))
            .unwrap_or(0.05);
        let strengthen_mode = set
            .choice(params::STRENGTHEN_MODE)
            .unwrap_or("widen_tp")
            .to_string();

        let cooldown_active = {
            let cooldowns = self.replace_cooldowns.lock();
            cooldowns
                .get(&candidate.symbol)
                .is_some_and(|&last| now_ms - last < self.cfg.replace_cooldown_secs * 1_000)
        };

        let composite = vetted.composite;
        let global_open = self.book.total_open();
        let timeout = Duration::from_millis(self.cfg.contention_timeout_ms);

        let outcome = self.book.with_symbol(&candidate.symbol, timeout, |sp| {
            let direction = candidate.direction;
            let same = sp.get(direction).cloned();
            let opposite = sp.get(direction.opposite()).cloned();

            // ── Rule 1: IGNORE ──────────────────────────────────────────
            if let Some(p) = &same {
                if p.status == PositionStatus::Open
                    && p.origin_confidence >= candidate.confidence
                    && candidate.expires_at_ms <= p.origin_expires_at_ms
                {
                    return RuleOutcome {
                        verdict: Verdict::Ignore,
                        rationale: RationaleCode::WeakerThanOpen,
                        target_position: Some(p.id.clone()),
                        opened: None,
                    };
                }
            }
            if sp.risk_pct() >= self.cfg.symbol_risk_budget_pct {
                return RuleOutcome {
                    verdict: Verdict::Ignore,
                    rationale: RationaleCode::RiskBudgetExhausted,
                    target_position: None,
                    opened: None,
                };
            }
            if cooldown_active {
                return RuleOutcome {
                    verdict: Verdict::Ignore,
                    rationale: RationaleCode::ReplaceCooldown,
                    target_position: None,
                    opened: None,
                };
            }

            // ── Rule 2: REPLACE ─────────────────────────────────────────
            if let Some(p) = &opposite {
                if composite > p.origin_composite + replace_margin {
                    if p.status == PositionStatus::Closing {
                        // Raced with an in-flight close.
                        return RuleOutcome {
                            verdict: Verdict::Ignore,
                            rationale: RationaleCode::Contention,
                            target_position: Some(p.id.clone()),
                            opened: None,
                        };
                    }
                    if let Some(target) = sp.get_mut(direction.opposite()) {
                        target.status = PositionStatus::Closing;
                    }
                    let opened = self.build_position(candidate, composite, plan, now_ms);
                    sp.set(opened.clone());
                    return RuleOutcome {
                        verdict: Verdict::Replace,
                        rationale: RationaleCode::OppositeOutscored,
                        target_position: Some(p.id.clone()),
                        opened: Some(opened),
                    };
                }
            }

            // ── Rule 3: STRENGTHEN ──────────────────────────────────────
            if let Some(p) = &same {
                let within_exposure =
                    sp.risk_pct() < self.cfg.symbol_risk_budget_pct;
                if p.status == PositionStatus::Open
                    && composite > p.origin_composite + strengthen_margin
                    && within_exposure
                {
                    if let Some(target) = sp.get_mut(direction) {
                        apply_strengthen(target, &strengthen_mode, plan);
                        target.origin_composite = composite;
                        target.origin_confidence = candidate.confidence;
                    }
                    return RuleOutcome {
                        verdict: Verdict::Strengthen,
                        rationale: RationaleCode::SameDirectionBoost,
                        target_position: Some(p.id.clone()),
                        opened: None,
                    };
                }
                // A same-direction open that the candidate cannot improve.
                return RuleOutcome {
                    verdict: Verdict::Ignore,
                    rationale: RationaleCode::WeakerThanOpen,
                    target_position: Some(p.id.clone()),
                    opened: None,
                };
            }

            // ── Rule 4: NEW ─────────────────────────────────────────────
            if opposite.is_some() && !self.cfg.allow_hedging {
                return RuleOutcome {
                    verdict: Verdict::Ignore,
                    rationale: RationaleCode::HedgingDisabled,
                    target_position: None,
                    opened: None,
                };
            }
            if global_open >= self.cfg.max_positions_global
                || sp.open_count() >= self.cfg.max_positions_per_symbol
            {
                return RuleOutcome {
                    verdict: Verdict::Ignore,
                    rationale: RationaleCode::PositionCapReached,
                    target_position: None,
                    opened: None,
                };
            }

            let opened = self.build_position(candidate, composite, plan, now_ms);
            sp.set(opened.clone());
            RuleOutcome {
                verdict: Verdict::New,
                rationale: RationaleCode::FreshSymbol,
                target_position: None,
                opened: Some(opened),
            }
        });

        let Some(outcome) = outcome else {
            // Bounded lock wait expired.
            self.metrics.contention_timeouts.fetch_add(1, Relaxed);
            return self.finish(
                candidate,
                Verdict::Ignore,
                RationaleCode::Contention,
                None,
                plan.risk_reward,
                plan.stop_loss,
                plan.take_profit,
                now_ms,
            );
        };

        // Post-lock side effects: journal, origin meta, cooldown stamp.
        if let Some(opened) = &outcome.opened {
            self.book.journal_open(opened);
            // The snapshot carries the signal's own scores so the adaptive
            // layer can re-simulate thresholds against realized outcomes.
            let mut features = candidate.features.clone();
            features.insert("signal_confidence".to_string(), candidate.confidence);
            features.insert("signal_strength".to_string(), candidate.strength);
            features.insert("composite_score".to_string(), composite);
            self.origin_meta.lock().insert(
                opened.id.clone(),
                OriginMeta {
                    features,
                    regime: candidate.regime,
                    strategy: candidate.strategy.clone(),
                },
            );
        }
        if outcome.verdict == Verdict::Replace {
            self.replace_cooldowns
                .lock()
                .insert(candidate.symbol.clone(), now_ms);
            if let Some(target) = &outcome.target_position {
                self.book.apply_event(&PositionEvent::Closing {
                    position_id: target.clone(),
                });
            }
        }

        self.finish(
            candidate,
            outcome.verdict,
            outcome.rationale,
            outcome.target_position,
            plan.risk_reward,
            plan.stop_loss,
            plan.take_profit,
            now_ms,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        candidate: &crate::types::SignalCandidate,
        verdict: Verdict,
        rationale: RationaleCode,
        target_position: Option<String>,
        risk_reward: f64,
        stop_loss: f64,
        take_profit: f64,
        now_ms: i64,
    ) -> ExecutionDecision {
        use std::sync::atomic::Ordering::Relaxed;

        self.metrics.record_verdict(verdict);
        self.metrics
            .positions_open
            .store(self.book.total_open() as u64, Relaxed);

        let decision = ExecutionDecision {
            id: Uuid::new_v4().to_string(),
            candidate_id: candidate.id.clone(),
            symbol: candidate.symbol.clone(),
            verdict,
            target_position,
            rationale,
            risk_reward,
            stop_loss,
            take_profit,
            decided_at_ms: now_ms,
        };

        info!(
            candidate = %decision.candidate_id,
            verdict = %decision.verdict,
            rationale = %decision.rationale,
            risk_reward = decision.risk_reward,
            "execution decision"
        );
        decision
    }

    fn build_position(
        &self,
        candidate: &crate::types::SignalCandidate,
        composite: f64,
        plan: risk::ExitPlan,
        now_ms: i64,
    ) -> Position {
        Position {
            id: Uuid::new_v4().to_string(),
            symbol: candidate.symbol.clone(),
            direction: candidate.direction,
            entry_price: candidate.entry_price,
            entry_time_ms: now_ms,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            size: 1.0,
            origin_candidate: candidate.id.clone(),
            origin_composite: composite,
            origin_confidence: candidate.confidence,
            origin_expires_at_ms: candidate.expires_at_ms,
            status: PositionStatus::Open,
        }
    }

    // -------------------------------------------------------------------
    // Position events and outcomes
    // -------------------------------------------------------------------

    /// Apply a lifecycle event from the execution collaborator. A CLOSED
    /// event yields the OutcomeRecord for P5.
    pub fn on_position_event(&self, event: &PositionEvent) -> Option<OutcomeRecord> {
        use std::sync::atomic::Ordering::Relaxed;

        if let PositionEvent::Activated { position_id } = event {
            self.activated.lock().insert(position_id.clone());
        }

        let affected = self.book.apply_event(event);
        self.metrics
            .positions_open
            .store(self.book.total_open() as u64, Relaxed);

        let PositionEvent::Closed {
            position_id,
            reason,
            price,
            ts_ms,
        } = event
        else {
            return None;
        };
        let position = affected?;

        self.activated.lock().remove(position_id);
        let meta = self.origin_meta.lock().remove(position_id);
        let (features, regime, strategy) = match meta {
            Some(m) => (m.features, m.regime, m.strategy),
            None => (HashMap::new(), RegimeLabel::default(), String::new()),
        };

        Some(OutcomeRecord {
            candidate_id: position.origin_candidate.clone(),
            position_id: Some(position_id.clone()),
            reason: *reason,
            pnl_pct: book::realized_pnl_pct(&position, *price),
            hold_duration_ms: (ts_ms - position.entry_time_ms).max(0),
            features,
            regime,
            strategy,
            symbol: position.symbol.clone(),
            closed_at_ms: *ts_ms,
        })
    }

    /// Stop/take-profit evaluation on a mark-price update: positions whose
    /// exit level is crossed. The component does not place orders; the
    /// hints go back to the execution collaborator.
    pub fn evaluate_price(&self, symbol: &str, price: f64) -> Vec<(String, ClosureReason)> {
        let timeout = Duration::from_millis(self.cfg.contention_timeout_ms);
        self.book
            .with_symbol(symbol, timeout, |sp| {
                let mut hits = Vec::new();
                for p in [&sp.long, &sp.short].into_iter().flatten() {
                    if p.status != PositionStatus::Open {
                        continue;
                    }
                    let (sl_hit, tp_hit) = match p.direction {
                        Direction::Long => (price <= p.stop_loss, price >= p.take_profit),
                        Direction::Short => (price >= p.stop_loss, price <= p.take_profit),
                    };
                    if sl_hit {
                        hits.push((p.id.clone(), ClosureReason::StopLoss));
                    } else if tp_hit {
                        hits.push((p.id.clone(), ClosureReason::TakeProfit));
                    }
                }
                hits
            })
            .unwrap_or_default()
    }

    /// Expire positions the collaborator never confirmed. Returns TIMEOUT
    /// outcomes for the candidates that originated them.
    pub fn sweep_unactivated(&self, now_ms: i64) -> Vec<OutcomeRecord> {
        let grace_ms = self.cfg.activation_grace_secs * 1_000;
        let activated = self.activated.lock().clone();

        let stale: Vec<Position> = self
            .book
            .snapshot()
            .values()
            .flat_map(|sp| [sp.long.clone(), sp.short.clone()])
            .flatten()
            .filter(|p| {
                p.status == PositionStatus::Open
                    && !activated.contains(&p.id)
                    && now_ms - p.entry_time_ms > grace_ms
            })
            .collect();

        let mut outcomes = Vec::new();
        for position in stale {
            debug!(position = %position.id, symbol = %position.symbol, "unactivated position expired");
            self.metrics.bump_reason("unactivated_expired");
            if let Some(outcome) = self.on_position_event(&PositionEvent::Closed {
                position_id: position.id.clone(),
                reason: ClosureReason::Timeout,
                price: position.entry_price,
                ts_ms: now_ms,
            }) {
                outcomes.push(outcome);
            }
        }
        if !outcomes.is_empty() {
            warn!(count = outcomes.len(), "expired unactivated positions");
        }
        outcomes
    }
}

/// STRENGTHEN effect: widen take-profit or tighten stop-loss, never size.
fn apply_strengthen(position: &mut Position, mode: &str, plan: risk::ExitPlan) {
    match (mode, position.direction) {
        ("tighten_sl", Direction::Long) => {
            position.stop_loss = position.stop_loss.max(plan.stop_loss);
        }
        ("tighten_sl", Direction::Short) => {
            position.stop_loss = position.stop_loss.min(plan.stop_loss);
        }
        (_, Direction::Long) => {
            position.take_profit = position.take_profit.max(plan.take_profit);
        }
        (_, Direction::Short) => {
            position.take_profit = position.take_profit.min(plan.take_profit);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
