// =============================================================================
// Decision risk parameters — volatility-aware exit clamping
// =============================================================================
//
// Stop-loss and take-profit start from the candidate's recommended prices
// and are clamped into ATR-derived bounds from the active ParameterSet.
// Risk/reward is recomputed after clamping; a decision whose post-clamp R:R
// sits below the floor is downgraded to IGNORE by the caller.
// =============================================================================

use crate::params::{self, ParameterSet};
use crate::types::{Direction, RegimeLabel};

/// Minimum exit distance as a fraction of ATR. Exits tighter than this are
/// noise-level and get widened.
const MIN_ATR_FRACTION: f64 = 0.5;

/// Clamped exits plus the resulting risk/reward.
#[derive(Debug, Clone, Copy)]
pub struct ExitPlan {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_reward: f64,
}

/// Clamp the candidate's recommended exits into volatility bounds and
/// recompute risk/reward.
///
/// Returns `None` when inputs are degenerate (non-positive entry or ATR).
pub fn plan_exits(
    direction: Direction,
    entry: f64,
    atr: f64,
    recommended_stop: f64,
    recommended_profit: f64,
    set: &ParameterSet,
    regime: RegimeLabel,
) -> Option<ExitPlan> {
    if entry <= 0.0 || !entry.is_finite() || atr <= 0.0 || !atr.is_finite() {
        return None;
    }

    let sl_mult = set
        .num_scoped(params::ATR_SL_MULT, None, Some(regime))
        .unwrap_or(1.5);
    let tp_mult = set
        .num_scoped(params::ATR_TP_MULT, None, Some(regime))
        .unwrap_or(2.5);

    let min_dist = atr * MIN_ATR_FRACTION;
    let max_sl_dist = atr * sl_mult.max(MIN_ATR_FRACTION);
    let max_tp_dist = atr * tp_mult.max(MIN_ATR_FRACTION);

    let sl_dist = (entry - recommended_stop).abs().clamp(min_dist, max_sl_dist);
    let tp_dist = (recommended_profit - entry)
        .abs()
        .clamp(min_dist, max_tp_dist);

    let (stop_loss, take_profit) = match direction {
        Direction::Long => (entry - sl_dist, entry + tp_dist),
        Direction::Short => (entry + sl_dist, entry - tp_dist),
    };

    let risk_reward = tp_dist / sl_dist;
    if !risk_reward.is_finite() {
        return None;
    }

    Some(ExitPlan {
        stop_loss,
        take_profit,
        risk_reward,
    })
}

/// The configured risk/reward floor.
pub fn rr_floor(set: &ParameterSet, regime: RegimeLabel) -> f64 {
    set.num_scoped(params::RR_FLOOR, None, Some(regime))
        .unwrap_or(1.2)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommended_exits_within_bounds_pass_through() {
        let set = ParameterSet::baseline();
        // ATR 100: sl bound [50, 150], tp bound [50, 250].
        let plan = plan_exits(
            Direction::Long,
            10_000.0,
            100.0,
            9_900.0,  // 100 below entry
            10_200.0, // 200 above entry
            &set,
            RegimeLabel::RangeBound,
        )
        .unwrap();
        assert!((plan.stop_loss - 9_900.0).abs() < 1e-9);
        assert!((plan.take_profit - 10_200.0).abs() < 1e-9);
        assert!((plan.risk_reward - 2.0).abs() < 1e-9);
    }

    #[test]
    fn wide_stop_is_clamped_in() {
        let set = ParameterSet::baseline();
        let plan = plan_exits(
            Direction::Long,
            10_000.0,
            100.0,
            9_000.0, // 1000 below entry; bound is 150
            10_200.0,
            &set,
            RegimeLabel::RangeBound,
        )
        .unwrap();
        assert!((plan.stop_loss - 9_850.0).abs() < 1e-9);
    }

    #[test]
    fn tight_exits_are_widened_to_noise_floor() {
        let set = ParameterSet::baseline();
        let plan = plan_exits(
            Direction::Long,
            10_000.0,
            100.0,
            9_995.0,  // 5 below entry; min is 50
            10_005.0, // 5 above entry
            &set,
            RegimeLabel::RangeBound,
        )
        .unwrap();
        assert!((plan.stop_loss - 9_950.0).abs() < 1e-9);
        assert!((plan.take_profit - 10_050.0).abs() < 1e-9);
        assert!((plan.risk_reward - 1.0).abs() < 1e-9);
    }

    #[test]
    fn short_exits_mirror() {
        let set = ParameterSet::baseline();
        let plan = plan_exits(
            Direction::Short,
            10_000.0,
            100.0,
            10_100.0,
            9_800.0,
            &set,
            RegimeLabel::RangeBound,
        )
        .unwrap();
        assert!(plan.stop_loss > 10_000.0);
        assert!(plan.take_profit < 10_000.0);
        assert!((plan.risk_reward - 2.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_inputs_yield_none() {
        let set = ParameterSet::baseline();
        assert!(plan_exits(
            Direction::Long,
            0.0,
            100.0,
            9_900.0,
            10_200.0,
            &set,
            RegimeLabel::RangeBound
        )
        .is_none());
        assert!(plan_exits(
            Direction::Long,
            10_000.0,
            f64::NAN,
            9_900.0,
            10_200.0,
            &set,
            RegimeLabel::RangeBound
        )
        .is_none());
    }

    #[test]
    fn clamping_can_push_rr_below_floor() {
        let set = ParameterSet::baseline();
        // Candidate promised a huge reward, but the tp bound caps it while
        // the stop stays wide: R:R collapses below the 1.2 floor.
        let plan = plan_exits(
            Direction::Long,
            10_000.0,
            100.0,
            9_850.0,  // distance 150 = max sl bound
            12_000.0, // capped to 250
            &set,
            RegimeLabel::RangeBound,
        )
        .unwrap();
        assert!((plan.risk_reward - 250.0 / 150.0).abs() < 1e-9);
        assert!(plan.risk_reward > rr_floor(&set, RegimeLabel::RangeBound));

        // With a tighter tp multiplier the floor check fails.
        let tight = set.with_num(params::ATR_TP_MULT, 1.0);
        let plan = plan_exits(
            Direction::Long,
            10_000.0,
            100.0,
            9_850.0,
            12_000.0,
            &tight,
            RegimeLabel::RangeBound,
        )
        .unwrap();
        assert!(plan.risk_reward < rr_floor(&tight, RegimeLabel::RangeBound));
    }
}
