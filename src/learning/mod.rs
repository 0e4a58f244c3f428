// =============================================================================
// Adaptive learning (P5) — close the loop from outcomes to parameters
// =============================================================================
//
// Staged by recorded volume:
//
//   COLLECTING            — below `min_signals_for_learning`: metrics only.
//   PATTERN DISCOVERY     — every `pattern_discovery_interval` outcomes:
//                           cluster, surface patterns, nudge per-strategy
//                           weights. No global parameter change.
//   PARAMETER OPTIMIZATION— every `optimization_interval` outcomes: evaluate
//                           perturbations under time-decayed performance and
//                           publish a new ParameterSet version on a win.
//
// The cycle back to P1 is broken through time: P5 publishes versions into
// the store; P1 and P3 pick them up on their next operation.
// =============================================================================

pub mod history;
pub mod optimizer;
pub mod patterns;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::LearningConfig;
use crate::metrics::PipelineMetrics;
use crate::params::{Consumer, OverlayScope, ParamOverlay, ParamValue, ParameterSet, ParameterStore};
use crate::types::{OutcomeRecord, RegimeLabel};

use history::SignalHistory;

/// Which stage one `record` call executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearningStage {
    /// Below the learning floor, or between cadence points.
    Collecting,
    PatternDiscovery,
    Optimization,
}

/// The P5 engine.
pub struct AdaptiveLearner {
    cfg: LearningConfig,
    history: Arc<SignalHistory>,
    params: Arc<ParameterStore>,
    metrics: Arc<PipelineMetrics>,
    strategy_weights: Mutex<HashMap<String, f64>>,
}

impl AdaptiveLearner {
    pub fn new(
        cfg: LearningConfig,
        history: Arc<SignalHistory>,
        params: Arc<ParameterStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            cfg,
            history,
            params,
            metrics,
            strategy_weights: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest one outcome. Idempotent by candidate id: a duplicate changes
    /// nothing, including parameter transitions.
    pub fn record(&self, outcome: OutcomeRecord, now_ms: i64) -> LearningStage {
        use std::sync::atomic::Ordering::Relaxed;

        if !self.history.append(outcome) {
            self.metrics.outcomes_duplicate.fetch_add(1, Relaxed);
            return LearningStage::Collecting;
        }
        self.metrics.outcomes_recorded.fetch_add(1, Relaxed);

        let total = self.history.len();
        if total < self.cfg.min_signals_for_learning {
            return LearningStage::Collecting;
        }

        if self.cfg.optimization_interval > 0 && total % self.cfg.optimization_interval == 0 {
            self.run_optimization(now_ms);
            return LearningStage::Optimization;
        }

        if self.cfg.pattern_discovery_interval > 0
            && total % self.cfg.pattern_discovery_interval == 0
        {
            self.run_pattern_discovery();
            return LearningStage::PatternDiscovery;
        }

        LearningStage::Collecting
    }

    /// The ACTIVE parameter set for `consumer`.
    pub fn current_parameters(&self, consumer: Consumer) -> (u64, Arc<ParameterSet>) {
        self.params.get(consumer)
    }

    /// Publish a set directly (operator path); subscribers are notified by
    /// the store.
    pub fn publish(&self, set: ParameterSet) -> anyhow::Result<u64> {
        let version = self.params.put(set)?;
        self.metrics
            .parameter_versions_published
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(version)
    }

    /// Current internal weight for a strategy (1.0 until learned otherwise).
    pub fn strategy_weight(&self, strategy: &str) -> f64 {
        self.strategy_weights
            .lock()
            .get(strategy)
            .copied()
            .unwrap_or(1.0)
    }

    // -------------------------------------------------------------------
    // Stages
    // -------------------------------------------------------------------

    fn run_pattern_discovery(&self) {
        use std::sync::atomic::Ordering::Relaxed;

        let window = self.history.recent(self.cfg.pattern_discovery_interval * 2);
        let found = patterns::discover(
            &window,
            self.cfg.pattern_min_samples,
            self.cfg.pattern_min_success,
        );
        if found.is_empty() {
            debug!("pattern discovery: nothing above thresholds");
            return;
        }
        self.metrics
            .patterns_discovered
            .fetch_add(found.len() as u64, Relaxed);

        let mut weights = self.strategy_weights.lock();
        patterns::adjust_strategy_weights(&mut weights, &found, &window);
        info!(
            patterns = found.len(),
            strategies = weights.len(),
            "pattern discovery adjusted strategy weights"
        );
    }

    fn run_optimization(&self, now_ms: i64) {
        use std::sync::atomic::Ordering::Relaxed;

        let window = self.history.recent(self.cfg.optimization_interval * 2);
        let (version, current) = self.params.get(Consumer::SignalGen);

        let adjustments =
            optimizer::propose_adjustments(&current, &window, &self.cfg, now_ms);
        let overlays = self.propose_regime_overlays(&current, &window, now_ms);

        if adjustments.is_empty() && overlays.is_empty() {
            debug!(version, "optimization pass adopted nothing");
            return;
        }

        let mut next = (*current).clone();
        next.created_at_ms = now_ms;
        for adj in &adjustments {
            next.parameters
                .insert(adj.parameter.clone(), ParamValue::Number(adj.to));
        }
        for overlay in overlays {
            // Replace any previous overlay with the same scope.
            next.overlays.retain(|o| o.scope != overlay.scope);
            next.overlays.push(overlay);
        }

        match self.params.put(next) {
            Ok(new_version) => {
                self.metrics
                    .parameter_versions_published
                    .fetch_add(1, Relaxed);
                info!(
                    from_version = version,
                    new_version,
                    adjustments = adjustments.len(),
                    "optimization published parameter set"
                );
            }
            Err(e) => {
                // The previous ACTIVE set simply remains.
                tracing::warn!(error = %e, "failed to publish optimized parameter set");
            }
        }
    }

    /// Regime-scoped refinements: when one regime's outcomes support a
    /// different threshold than the global one, emit an overlay instead of
    /// moving the base value.
    fn propose_regime_overlays(
        &self,
        current: &ParameterSet,
        window: &[OutcomeRecord],
        now_ms: i64,
    ) -> Vec<ParamOverlay> {
        let mut overlays = Vec::new();
        for regime in [
            RegimeLabel::TrendingBull,
            RegimeLabel::TrendingBear,
            RegimeLabel::RangeBound,
            RegimeLabel::HighVolatility,
        ] {
            let subset: Vec<OutcomeRecord> = window
                .iter()
                .filter(|r| r.regime == regime)
                .cloned()
                .collect();
            if subset.len() < self.cfg.min_signals_for_learning {
                continue;
            }
            let adjustments =
                optimizer::propose_adjustments(current, &subset, &self.cfg, now_ms);
            if adjustments.is_empty() {
                continue;
            }
            let mut parameters = HashMap::new();
            for adj in adjustments {
                parameters.insert(adj.parameter, ParamValue::Number(adj.to));
            }
            debug!(regime = %regime, overlays = parameters.len(), "regime overlay proposed");
            overlays.push(ParamOverlay {
                scope: OverlayScope {
                    category: None,
                    regime: Some(regime),
                },
                parameters,
            });
        }
        overlays
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;
    use crate::types::ClosureReason;

    const NOW: i64 = 1_700_000_000_000;

    fn learner(cfg: LearningConfig) -> AdaptiveLearner {
        AdaptiveLearner::new(
            cfg,
            Arc::new(SignalHistory::in_memory()),
            Arc::new(ParameterStore::in_memory()),
            Arc::new(PipelineMetrics::new()),
        )
    }

    fn outcome(id: &str, confidence: f64, pnl: f64) -> OutcomeRecord {
        OutcomeRecord {
            candidate_id: id.into(),
            position_id: None,
            reason: if pnl > 0.0 {
                ClosureReason::TakeProfit
            } else {
                ClosureReason::StopLoss
            },
            pnl_pct: pnl,
            hold_duration_ms: 60_000,
            features: HashMap::from([
                ("signal_confidence".to_string(), confidence),
                ("rsi_14".to_string(), 25.0),
            ]),
            regime: RegimeLabel::RangeBound,
            strategy: "rsi_reversal".into(),
            symbol: "BTCUSDT".into(),
            closed_at_ms: NOW - 3_600_000,
        }
    }

    #[test]
    fn collecting_below_learning_floor() {
        let l = learner(LearningConfig::default());
        for i in 0..49 {
            let stage = l.record(outcome(&format!("c{i}"), 0.8, 1.0), NOW);
            assert_eq!(stage, LearningStage::Collecting);
        }
        assert_eq!(l.current_parameters(Consumer::SignalGen).0, 0);
    }

    #[test]
    fn pattern_discovery_fires_on_interval() {
        let l = learner(LearningConfig::default());
        let mut last_stage = LearningStage::Collecting;
        for i in 0..50 {
            last_stage = l.record(outcome(&format!("c{i}"), 0.8, 1.0), NOW);
        }
        assert_eq!(last_stage, LearningStage::PatternDiscovery);
        // All winners: rsi_reversal's weight drifted up.
        assert!(l.strategy_weight("rsi_reversal") > 1.0);
        assert!((l.strategy_weight("unknown") - 1.0).abs() < 1e-12);
        // Pattern discovery never publishes parameters.
        assert_eq!(l.current_parameters(Consumer::SignalGen).0, 0);
    }

    #[test]
    fn duplicate_outcomes_cause_no_transitions() {
        let mut cfg = LearningConfig::default();
        cfg.min_signals_for_learning = 2;
        cfg.pattern_discovery_interval = 2;
        let l = learner(cfg);

        l.record(outcome("a", 0.8, 1.0), NOW);
        // 49 duplicates of the same id: the store must not advance.
        for _ in 0..49 {
            let stage = l.record(outcome("a", 0.8, 1.0), NOW);
            assert_eq!(stage, LearningStage::Collecting);
        }
        assert_eq!(l.history.len(), 1);
        assert_eq!(l.metrics.snapshot().outcomes_duplicate, 49);
    }

    /// The seed learning scenario: enough outcomes where low-confidence
    /// signals lose, so optimization raises the threshold and publishes.
    #[test]
    fn optimization_publishes_improved_threshold() {
        let mut cfg = LearningConfig::default();
        cfg.min_signals_for_learning = 50;
        cfg.optimization_interval = 200;
        let l = learner(cfg);

        let mut last_stage = LearningStage::Collecting;
        for i in 0..250 {
            // Low-confidence losers, high-confidence winners.
            let (conf, pnl) = if i % 2 == 0 { (0.62, -1.0) } else { (0.90, 1.2) };
            last_stage = l.record(outcome(&format!("c{i}"), conf, pnl), NOW);
        }
        // The 200th outcome triggered optimization.
        assert_eq!(l.metrics.snapshot().parameter_versions_published, 1);

        let (version, set) = l.current_parameters(Consumer::SignalGen);
        assert_eq!(version, 1);
        let threshold = set.num(params::CONFIDENCE_THRESHOLD).unwrap();
        assert!(threshold > 0.60, "threshold should have risen, got {threshold}");

        // Subscribers saw the publish.
        let rx = l.params.subscribe(Consumer::SignalGen);
        assert_eq!(*rx.borrow(), 1);
        let _ = last_stage;
    }

    #[test]
    fn optimization_without_signal_keeps_active_set() {
        let mut cfg = LearningConfig::default();
        cfg.min_signals_for_learning = 10;
        cfg.optimization_interval = 20;
        let l = learner(cfg);

        // Uniform coin-flip outcomes: nothing to adopt.
        for i in 0..40 {
            let pnl = if i % 2 == 0 { 1.0 } else { -1.0 };
            l.record(outcome(&format!("c{i}"), 0.9, pnl), NOW);
        }
        assert_eq!(l.metrics.snapshot().parameter_versions_published, 0);
        assert_eq!(l.current_parameters(Consumer::Policy).0, 0);
    }
}
