// =============================================================================
// Intelligent router — express / standard / deep lane selection
// =============================================================================
//
// Lane choice per candidate:
//   Express  — every quality sub-score clears a high floor AND system load
//              sits below its target. ~3 ms budget.
//   Standard — the default. ~8 ms budget.
//   Deep     — market stress above threshold OR strategy conflict on the
//              same symbol inside a small window. ~35 ms budget.
//
// Under load (queue depth past the high-watermark) lanes degrade
// deep -> standard -> express, bounded by a ceiling on the degraded
// fraction. Every degradation is recorded with its cause.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::config::PreEvalConfig;
use crate::types::{RegimeLabel, SignalCandidate};

/// Processing tier with its per-candidate time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Lane {
    Express,
    Standard,
    Deep,
}

impl Lane {
    pub fn budget_ms(self) -> u64 {
        match self {
            Self::Express => 3,
            Self::Standard => 8,
            Self::Deep => 35,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Express => write!(f, "express"),
            Self::Standard => write!(f, "standard"),
            Self::Deep => write!(f, "deep"),
        }
    }
}

/// Outcome of one routing decision.
#[derive(Debug, Clone, Copy)]
pub struct RouteDecision {
    pub lane: Lane,
    /// Set when load pressure pushed the candidate down a tier.
    pub degraded: bool,
}

/// Routes candidates by data-quality fingerprint, stress, and load.
pub struct IntelligentRouter {
    cfg: PreEvalConfig,
    /// Queue-depth fraction of the vetted channel, fed by the pipeline.
    load: f64,
    routed: u64,
    degraded: u64,
}

impl IntelligentRouter {
    pub fn new(cfg: PreEvalConfig) -> Self {
        Self {
            cfg,
            load: 0.0,
            routed: 0,
            degraded: 0,
        }
    }

    /// Update the observed downstream queue load (0.0 = empty, 1.0 = full).
    pub fn note_load(&mut self, load: f64) {
        self.load = load.clamp(0.0, 1.0);
    }

    /// Choose a lane. `ambiguous` flags conflicting strategies on the same
    /// symbol within the dedup window.
    pub fn route(&mut self, candidate: &SignalCandidate, ambiguous: bool) -> RouteDecision {
        let stressed = candidate.regime == RegimeLabel::HighVolatility
            || market_stress(candidate) >= self.cfg.stress_threshold;

        let natural = if stressed || ambiguous {
            Lane::Deep
        } else if candidate.quality.min() >= self.cfg.express_subscore_floor
            && self.load < self.cfg.express_load_target
        {
            Lane::Express
        } else {
            Lane::Standard
        };

        self.routed += 1;

        // Degradation path: only under pressure, only within the bound.
        let over_watermark = self.load >= self.cfg.queue_high_watermark;
        let within_bound =
            (self.degraded as f64) <= self.cfg.degrade_max_fraction * self.routed as f64;

        let lane = if over_watermark && within_bound && natural != Lane::Express {
            self.degraded += 1;
            let downgraded = match natural {
                Lane::Deep => Lane::Standard,
                Lane::Standard => Lane::Express,
                Lane::Express => Lane::Express,
            };
            debug!(
                candidate = %candidate.id,
                from = %natural,
                to = %downgraded,
                load = self.load,
                cause = "queue_pressure",
                "lane degraded"
            );
            downgraded
        } else {
            natural
        };

        RouteDecision {
            lane,
            degraded: lane != natural,
        }
    }

    pub fn degraded_count(&self) -> u64 {
        self.degraded
    }
}

/// Stress read from the candidate's own frame snapshot: wide bands or an
/// extreme ATR percentage.
fn market_stress(candidate: &SignalCandidate) -> f64 {
    let bbw = candidate
        .features
        .get("bb_width_20")
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0);
    let atr_pct = candidate
        .features
        .get("atr_pct_14")
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0);
    ((bbw / 8.0) + (atr_pct / 4.0)).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, PriorityBand, QualityScores, Timeframe};
    use std::collections::HashMap;

    fn candidate(min_subscore: f64, regime: RegimeLabel) -> SignalCandidate {
        SignalCandidate {
            id: "BTCUSDT:1m:60000:test".into(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            close_time_ms: 60_000,
            direction: Direction::Long,
            strength: 0.8,
            confidence: 0.8,
            entry_price: 100.0,
            stop_loss: 99.0,
            take_profit: 102.0,
            expires_at_ms: 900_000,
            strategy: "test".into(),
            features: HashMap::new(),
            quality: QualityScores {
                data_completeness: min_subscore,
                signal_clarity: min_subscore,
                confidence: min_subscore,
                volatility_fit: min_subscore,
                liquidity_fit: min_subscore,
            },
            band: PriorityBand::Medium,
            regime,
            emitted_at_ms: 60_000,
        }
    }

    #[test]
    fn pristine_candidate_rides_express_when_quiet() {
        let mut router = IntelligentRouter::new(PreEvalConfig::default());
        router.note_load(0.1);
        let d = router.route(&candidate(0.9, RegimeLabel::RangeBound), false);
        assert_eq!(d.lane, Lane::Express);
        assert!(!d.degraded);
    }

    #[test]
    fn default_is_standard() {
        let mut router = IntelligentRouter::new(PreEvalConfig::default());
        router.note_load(0.1);
        let d = router.route(&candidate(0.6, RegimeLabel::RangeBound), false);
        assert_eq!(d.lane, Lane::Standard);
    }

    #[test]
    fn stress_or_ambiguity_goes_deep() {
        let mut router = IntelligentRouter::new(PreEvalConfig::default());
        router.note_load(0.1);

        let d = router.route(&candidate(0.9, RegimeLabel::HighVolatility), false);
        assert_eq!(d.lane, Lane::Deep);

        let d = router.route(&candidate(0.9, RegimeLabel::RangeBound), true);
        assert_eq!(d.lane, Lane::Deep);
    }

    #[test]
    fn load_cannot_lift_into_express_without_quality() {
        let mut router = IntelligentRouter::new(PreEvalConfig::default());
        router.note_load(0.6); // above express target, below watermark
        let d = router.route(&candidate(0.95, RegimeLabel::RangeBound), false);
        assert_eq!(d.lane, Lane::Standard);
    }

    #[test]
    fn watermark_degrades_and_respects_bound() {
        let mut router = IntelligentRouter::new(PreEvalConfig::default());
        router.note_load(0.95);

        // Deep degrades to standard under pressure.
        let d = router.route(&candidate(0.9, RegimeLabel::HighVolatility), false);
        assert_eq!(d.lane, Lane::Standard);
        assert!(d.degraded);

        // Standard degrades to express.
        let d = router.route(&candidate(0.6, RegimeLabel::RangeBound), false);
        assert_eq!(d.lane, Lane::Express);
        assert!(d.degraded);

        // The bound (50 %) stops further degradation: 2 of 3 would exceed it.
        let d = router.route(&candidate(0.6, RegimeLabel::RangeBound), false);
        assert_eq!(d.lane, Lane::Standard);
        assert!(!d.degraded);
        assert_eq!(router.degraded_count(), 2);
    }

    #[test]
    fn lane_budgets_are_tiered() {
        assert!(Lane::Express.budget_ms() < Lane::Standard.budget_ms());
        assert!(Lane::Standard.budget_ms() < Lane::Deep.budget_ms());
    }
}
