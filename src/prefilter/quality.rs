// =============================================================================
// Quality gate — composite scoring, floor, and priority banding
// =============================================================================
//
// Composite = weighted sum of the five sub-scores; the weights come from the
// active ParameterSet so the adaptive layer can retune them. Candidates
// below the floor are dropped; survivors are bucketed into the four priority
// bands by fixed thresholds from the config.
// =============================================================================

use crate::config::PreEvalConfig;
use crate::errors::DropReason;
use crate::params::{self, ParameterSet};
use crate::types::{PriorityBand, QualityScores, RegimeLabel};

/// Weighted composite of the five sub-scores, in [0, 1]. Weights are
/// normalised so a retuned set cannot push the composite out of range.
pub fn composite(scores: &QualityScores, set: &ParameterSet, regime: RegimeLabel) -> f64 {
    let weight = |name: &str, fallback: f64| {
        set.num_scoped(name, None, Some(regime))
            .unwrap_or(fallback)
            .max(0.0)
    };
    let weights = [
        weight(params::QUALITY_W_COMPLETENESS, 0.25),
        weight(params::QUALITY_W_CLARITY, 0.25),
        weight(params::QUALITY_W_CONFIDENCE, 0.20),
        weight(params::QUALITY_W_VOLATILITY, 0.15),
        weight(params::QUALITY_W_LIQUIDITY, 0.15),
    ];
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }

    let values = scores.as_array();
    let sum: f64 = values
        .iter()
        .zip(weights.iter())
        .map(|(v, w)| v.clamp(0.0, 1.0) * w)
        .sum();
    (sum / total).clamp(0.0, 1.0)
}

/// Band for a composite under the fixed thresholds.
pub fn band_for(composite: f64, cfg: &PreEvalConfig) -> PriorityBand {
    if composite >= cfg.band_critical {
        PriorityBand::Critical
    } else if composite >= cfg.band_high {
        PriorityBand::High
    } else if composite >= cfg.band_medium {
        PriorityBand::Medium
    } else {
        PriorityBand::Low
    }
}

/// Run the gate: drop below the floor, band otherwise.
pub fn gate(
    scores: &QualityScores,
    set: &ParameterSet,
    regime: RegimeLabel,
    cfg: &PreEvalConfig,
) -> Result<(f64, PriorityBand), DropReason> {
    let score = composite(scores, set, regime);
    let floor = set
        .num_scoped(params::QUALITY_FLOOR, None, Some(regime))
        .unwrap_or(0.40);
    if score < floor {
        return Err(DropReason::BelowQualityFloor { composite: score });
    }
    Ok((score, band_for(score, cfg)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(v: f64) -> QualityScores {
        QualityScores {
            data_completeness: v,
            signal_clarity: v,
            confidence: v,
            volatility_fit: v,
            liquidity_fit: v,
        }
    }

    #[test]
    fn uniform_scores_pass_through() {
        let set = ParameterSet::baseline();
        let c = composite(&scores(0.7), &set, RegimeLabel::RangeBound);
        assert!((c - 0.7).abs() < 1e-9);
    }

    #[test]
    fn weights_steer_the_composite() {
        let set = ParameterSet::baseline()
            .with_num(params::QUALITY_W_COMPLETENESS, 1.0)
            .with_num(params::QUALITY_W_CLARITY, 0.0)
            .with_num(params::QUALITY_W_CONFIDENCE, 0.0)
            .with_num(params::QUALITY_W_VOLATILITY, 0.0)
            .with_num(params::QUALITY_W_LIQUIDITY, 0.0);
        let mut s = scores(0.2);
        s.data_completeness = 0.9;
        let c = composite(&s, &set, RegimeLabel::RangeBound);
        assert!((c - 0.9).abs() < 1e-9);
    }

    #[test]
    fn banding_thresholds() {
        let cfg = PreEvalConfig::default();
        assert_eq!(band_for(0.90, &cfg), PriorityBand::Critical);
        assert_eq!(band_for(0.78, &cfg), PriorityBand::High);
        assert_eq!(band_for(0.55, &cfg), PriorityBand::Medium);
        assert_eq!(band_for(0.45, &cfg), PriorityBand::Low);
        // Boundary values land in the higher band.
        assert_eq!(band_for(cfg.band_high, &cfg), PriorityBand::High);
    }

    #[test]
    fn gate_drops_below_floor() {
        let cfg = PreEvalConfig::default();
        let set = ParameterSet::baseline();
        match gate(&scores(0.2), &set, RegimeLabel::RangeBound, &cfg) {
            Err(DropReason::BelowQualityFloor { composite }) => {
                assert!(composite < 0.40);
            }
            other => panic!("expected floor drop, got {other:?}"),
        }
        let (score, band) = gate(&scores(0.78), &set, RegimeLabel::RangeBound, &cfg).unwrap();
        assert!((score - 0.78).abs() < 1e-9);
        assert_eq!(band, PriorityBand::High);
    }

    #[test]
    fn degenerate_weights_read_zero() {
        let set = ParameterSet::baseline()
            .with_num(params::QUALITY_W_COMPLETENESS, 0.0)
            .with_num(params::QUALITY_W_CLARITY, 0.0)
            .with_num(params::QUALITY_W_CONFIDENCE, 0.0)
            .with_num(params::QUALITY_W_VOLATILITY, 0.0)
            .with_num(params::QUALITY_W_LIQUIDITY, 0.0);
        assert_eq!(composite(&scores(0.9), &set, RegimeLabel::RangeBound), 0.0);
    }
}
