// =============================================================================
// Parameter optimization — perturbation search under time-decayed outcomes
// =============================================================================
//
// For each tunable threshold, a small set of perturbations is evaluated by
// replaying recorded outcomes: a stricter threshold keeps only the outcomes
// whose originating signal would still have cleared it. Performance is the
// time-weighted win rate, `w = exp(-Δ/H)` for an outcome aged Δ hours with
// half-life H. A perturbation beating the incumbent by the minimum
// improvement is adopted.
// =============================================================================

use tracing::{debug, info};

use crate::config::LearningConfig;
use crate::params::{self, ParameterSet};
use crate::types::OutcomeRecord;

/// Tunables the optimizer may move, with the outcome-feature key used to
/// re-simulate them and the absolute perturbation step.
const TUNABLES: &[(&str, &str, f64)] = &[
    (params::CONFIDENCE_THRESHOLD, "signal_confidence", 0.05),
    (params::MIN_STRENGTH, "signal_strength", 0.05),
    (params::QUALITY_FLOOR, "composite_score", 0.05),
];

/// One adopted adjustment.
#[derive(Debug, Clone)]
pub struct Adjustment {
    pub parameter: String,
    pub from: f64,
    pub to: f64,
    pub base_score: f64,
    pub new_score: f64,
}

/// Time-decay weight for an outcome aged `age_ms`, half-life in hours.
pub fn time_weight(age_ms: i64, half_life_hours: f64) -> f64 {
    if half_life_hours <= 0.0 {
        return 1.0;
    }
    let age_hours = age_ms.max(0) as f64 / 3_600_000.0;
    (-age_hours / half_life_hours).exp()
}

/// Weighted win rate over `records` at `now_ms`. `None` when no weight
/// survives (a simulation with nothing left is a failure, not a zero).
pub fn weighted_win_rate(
    records: &[&OutcomeRecord],
    now_ms: i64,
    half_life_hours: f64,
) -> Option<f64> {
    let mut weight_sum = 0.0;
    let mut win_sum = 0.0;
    for record in records {
        let w = time_weight(now_ms - record.closed_at_ms, half_life_hours);
        weight_sum += w;
        if record.pnl_pct > 0.0 {
            win_sum += w;
        }
    }
    (weight_sum > 0.0).then(|| win_sum / weight_sum)
}

/// Weighted expectancy (mean PnL percent) over `records`.
pub fn weighted_expectancy(
    records: &[&OutcomeRecord],
    now_ms: i64,
    half_life_hours: f64,
) -> Option<f64> {
    let mut weight_sum = 0.0;
    let mut pnl_sum = 0.0;
    for record in records {
        let w = time_weight(now_ms - record.closed_at_ms, half_life_hours);
        weight_sum += w;
        pnl_sum += w * record.pnl_pct;
    }
    (weight_sum > 0.0).then(|| pnl_sum / weight_sum)
}

/// Outcomes whose originating signal would clear `threshold` on
/// `feature_key`. Records without the feature are kept (they predate the
/// snapshot enrichment and cannot be re-judged).
fn surviving<'a>(
    records: &'a [OutcomeRecord],
    feature_key: &str,
    threshold: f64,
) -> Vec<&'a OutcomeRecord> {
    records
        .iter()
        .filter(|r| {
            r.features
                .get(feature_key)
                .copied()
                .filter(|v| v.is_finite())
                .map_or(true, |v| v >= threshold)
        })
        .collect()
}

/// Evaluate perturbations of every tunable against `records`; return the
/// adjustments worth adopting (at most one per parameter).
pub fn propose_adjustments(
    current: &ParameterSet,
    records: &[OutcomeRecord],
    cfg: &LearningConfig,
    now_ms: i64,
) -> Vec<Adjustment> {
    let mut adjustments = Vec::new();

    for &(parameter, feature_key, step) in TUNABLES {
        let Some(base_value) = current.num(parameter) else {
            continue;
        };

        let base_records = surviving(records, feature_key, base_value);
        let Some(base_score) = weighted_win_rate(&base_records, now_ms, cfg.half_life_hours)
        else {
            debug!(parameter, "no weighted outcomes under incumbent; skipping");
            continue;
        };

        let mut best: Option<(f64, f64)> = None; // (value, score)
        for candidate_value in [base_value - step, base_value + step] {
            if !(0.0..=1.0).contains(&candidate_value) {
                continue;
            }
            let sim_records = surviving(records, feature_key, candidate_value);
            // A perturbation that filters everything out cannot be judged.
            let Some(score) = weighted_win_rate(&sim_records, now_ms, cfg.half_life_hours)
            else {
                debug!(parameter, candidate_value, "simulation empty; perturbation skipped");
                continue;
            };
            // Guard against adopting thresholds that keep almost nothing.
            if sim_records.len() < cfg.pattern_min_samples {
                continue;
            }
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((candidate_value, score));
            }
        }

        if let Some((value, score)) = best {
            let improvement = if base_score > 0.0 {
                (score - base_score) / base_score
            } else {
                score
            };
            if improvement >= cfg.min_improvement {
                info!(
                    parameter,
                    from = base_value,
                    to = value,
                    base_score,
                    new_score = score,
                    "perturbation adopted"
                );
                adjustments.push(Adjustment {
                    parameter: parameter.to_string(),
                    from: base_value,
                    to: value,
                    base_score,
                    new_score: score,
                });
            }
        }
    }

    adjustments
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClosureReason, RegimeLabel};
    use std::collections::HashMap;

    const NOW: i64 = 1_700_000_000_000;
    const HOUR: i64 = 3_600_000;

    fn outcome(id: &str, confidence: f64, pnl: f64, age_hours: i64) -> OutcomeRecord {
        OutcomeRecord {
            candidate_id: id.into(),
            position_id: None,
            reason: if pnl > 0.0 {
                ClosureReason::TakeProfit
            } else {
                ClosureReason::StopLoss
            },
            pnl_pct: pnl,
            hold_duration_ms: HOUR,
            features: HashMap::from([("signal_confidence".to_string(), confidence)]),
            regime: RegimeLabel::RangeBound,
            strategy: "rsi_reversal".into(),
            symbol: "BTCUSDT".into(),
            closed_at_ms: NOW - age_hours * HOUR,
        }
    }

    #[test]
    fn time_weight_halves_at_half_life() {
        let w = time_weight(12 * HOUR, 12.0);
        assert!((w - (-1.0_f64).exp()).abs() < 1e-12);
        assert!((time_weight(0, 12.0) - 1.0).abs() < 1e-12);
        assert!(time_weight(240 * HOUR, 12.0) < 1e-8);
    }

    #[test]
    fn recent_outcomes_count_more() {
        let fresh_win = outcome("a", 0.9, 1.0, 0);
        let stale_loss = outcome("b", 0.9, -1.0, 120);
        let records = [&fresh_win, &stale_loss];
        let rate = weighted_win_rate(&records, NOW, 12.0).unwrap();
        // The stale loss is nearly weightless.
        assert!(rate > 0.99, "got {rate}");
    }

    #[test]
    fn empty_simulation_reads_none() {
        assert!(weighted_win_rate(&[], NOW, 12.0).is_none());
    }

    /// Low-confidence signals lose, high-confidence signals win: the
    /// optimizer should raise the confidence threshold.
    #[test]
    fn raises_threshold_when_low_confidence_loses() {
        let cfg = LearningConfig::default();
        let current = ParameterSet::baseline(); // confidence_threshold 0.60

        let mut records = Vec::new();
        // 30 low-confidence losers in [0.60, 0.65).
        for i in 0..30 {
            records.push(outcome(&format!("lo{i}"), 0.62, -1.0, 1));
        }
        // 30 high-confidence winners at 0.9.
        for i in 0..30 {
            records.push(outcome(&format!("hi{i}"), 0.90, 1.2, 1));
        }

        let adjustments = propose_adjustments(&current, &records, &cfg, NOW);
        let adj = adjustments
            .iter()
            .find(|a| a.parameter == params::CONFIDENCE_THRESHOLD)
            .expect("confidence threshold adjustment");
        assert!(adj.to > adj.from);
        assert!((adj.to - 0.65).abs() < 1e-9);
        assert!(adj.new_score > adj.base_score);
    }

    #[test]
    fn no_adjustment_below_min_improvement() {
        let cfg = LearningConfig::default();
        let current = ParameterSet::baseline();

        // Uniform results: moving the threshold changes nothing.
        let records: Vec<OutcomeRecord> = (0..40)
            .map(|i| outcome(&format!("c{i}"), 0.9, if i % 2 == 0 { 1.0 } else { -1.0 }, 1))
            .collect();
        assert!(propose_adjustments(&current, &records, &cfg, NOW).is_empty());
    }

    #[test]
    fn thin_simulations_are_skipped() {
        let cfg = LearningConfig::default();
        let current = ParameterSet::baseline();

        // Only 4 outcomes above the raised threshold: below
        // pattern_min_samples, so the perturbation cannot be adopted.
        let mut records = Vec::new();
        for i in 0..10 {
            records.push(outcome(&format!("lo{i}"), 0.62, -1.0, 1));
        }
        for i in 0..4 {
            records.push(outcome(&format!("hi{i}"), 0.90, 1.0, 1));
        }
        let adjustments = propose_adjustments(&current, &records, &cfg, NOW);
        assert!(adjustments
            .iter()
            .all(|a| a.parameter != params::CONFIDENCE_THRESHOLD));
    }
}
