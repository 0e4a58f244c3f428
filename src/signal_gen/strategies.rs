// =============================================================================
// Strategies — registered plug-ins that turn frames into trade proposals
// =============================================================================
//
// A strategy is a registered callable with a declared name, validated at
// startup by the registry. Each receives the freshly published frame plus a
// short history window and returns zero or one proposal. No runtime code
// injection: the catalog is fixed at construction.
// =============================================================================

use std::sync::Arc;

use crate::params::{self, ParameterSet};
use crate::types::{Direction, IndicatorFrame, RegimeLabel};

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Everything a strategy may read when evaluating one bar close.
pub struct StrategyContext<'a> {
    pub frame: &'a IndicatorFrame,
    /// Previous frames, oldest first, not including `frame`.
    pub history: &'a [IndicatorFrame],
    pub regime: RegimeLabel,
    /// Parameter set captured at operation entry.
    pub params: &'a ParameterSet,
}

/// A proposal produced by one strategy for one frame.
#[derive(Debug, Clone)]
pub struct StrategySignal {
    pub direction: Direction,
    /// Signal magnitude in [0, 1].
    pub strength: f64,
    /// Strategy self-confidence in [0, 1].
    pub confidence: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// How unambiguous the read was, in [0, 1]; feeds the signal_clarity
    /// quality sub-score.
    pub clarity: f64,
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, ctx: &StrategyContext<'_>) -> Option<StrategySignal>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Startup-validated strategy catalog.
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    /// Validate declarations: at least one strategy, unique non-empty names
    /// restricted to `[a-z0-9_]`.
    pub fn new(strategies: Vec<Arc<dyn Strategy>>) -> Result<Self, String> {
        if strategies.is_empty() {
            return Err("no strategies registered".into());
        }
        let mut seen = std::collections::HashSet::new();
        for s in &strategies {
            let name = s.name();
            if name.is_empty() {
                return Err("strategy with empty name".into());
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            {
                return Err(format!("strategy name {name:?} not in [a-z0-9_]"));
            }
            if !seen.insert(name.to_string()) {
                return Err(format!("duplicate strategy name {name:?}"));
            }
        }
        Ok(Self { strategies })
    }

    /// The built-in catalog.
    pub fn standard() -> Self {
        // Static catalog with valid names; construction cannot fail.
        match Self::new(vec![
            Arc::new(RsiReversal),
            Arc::new(EmaTrendFollow),
            Arc::new(BollingerBreakout),
        ]) {
            Ok(r) => r,
            Err(_) => unreachable!("built-in strategy names are valid"),
        }
    }

    pub fn all(&self) -> &[Arc<dyn Strategy>] {
        &self.strategies
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Stop/take-profit around `entry` from the frame's ATR and the active
/// multipliers.
fn atr_exits(
    direction: Direction,
    entry: f64,
    atr: f64,
    set: &ParameterSet,
    regime: RegimeLabel,
) -> (f64, f64) {
    let sl_mult = set
        .num_scoped(params::ATR_SL_MULT, None, Some(regime))
        .unwrap_or(1.5);
    let tp_mult = set
        .num_scoped(params::ATR_TP_MULT, None, Some(regime))
        .unwrap_or(2.5);

    let sl_dist = atr * sl_mult;
    let tp_dist = atr * tp_mult;

    match direction {
        Direction::Long => (entry - sl_dist, entry + tp_dist),
        Direction::Short => (entry + sl_dist, entry - tp_dist),
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// RSI reversal
// ---------------------------------------------------------------------------

/// Long when RSI dips below 30 and turns upward; short when it tops 70 and
/// turns down. Strength scales with oversold/overbought depth.
pub struct RsiReversal;

impl Strategy for RsiReversal {
    fn name(&self) -> &str {
        "rsi_reversal"
    }

    fn evaluate(&self, ctx: &StrategyContext<'_>) -> Option<StrategySignal> {
        let rsi = ctx.frame.value("rsi_14")?;
        let prev_rsi = ctx.history.last().and_then(|f| f.value("rsi_14"))?;
        let atr = ctx.frame.value("atr_14")?;
        let entry = ctx.frame.bar.close;
        if entry <= 0.0 || atr <= 0.0 {
            return None;
        }

        let (direction, depth) = if rsi < 30.0 && rsi > prev_rsi {
            (Direction::Long, (30.0 - prev_rsi.min(rsi)) / 30.0)
        } else if rsi > 70.0 && rsi < prev_rsi {
            (Direction::Short, (prev_rsi.max(rsi) - 70.0) / 30.0)
        } else {
            return None;
        };

        // Depth of the excursion drives strength; the turn itself drives
        // confidence.
        let turn = (rsi - prev_rsi).abs() / 10.0;
        let strength = clamp01(0.55 + depth * 0.9);
        let confidence = clamp01(0.45 + depth * 0.5 + turn * 0.3);
        let clarity = clamp01(0.5 + depth);

        let (stop_loss, take_profit) = atr_exits(direction, entry, atr, ctx.params, ctx.regime);

        Some(StrategySignal {
            direction,
            strength,
            confidence,
            stop_loss,
            take_profit,
            clarity,
        })
    }
}

// ---------------------------------------------------------------------------
// EMA trend following
// ---------------------------------------------------------------------------

/// Rides an aligned EMA stack: long when 9 > 21 > 55 with price above the
/// fast EMA, mirrored for shorts. ADX scales conviction.
pub struct EmaTrendFollow;

impl Strategy for EmaTrendFollow {
    fn name(&self) -> &str {
        "ema_trend"
    }

    fn evaluate(&self, ctx: &StrategyContext<'_>) -> Option<StrategySignal> {
        let trend = ctx.frame.value("ema_trend")?;
        let e9 = ctx.frame.value("ema_9")?;
        let adx = ctx.frame.value("adx_14")?;
        let atr = ctx.frame.value("atr_14")?;
        let entry = ctx.frame.bar.close;
        if entry <= 0.0 || atr <= 0.0 {
            return None;
        }

        let direction = if trend > 0.5 && entry > e9 {
            Direction::Long
        } else if trend < -0.5 && entry < e9 {
            Direction::Short
        } else {
            return None;
        };

        // Weak trends are not worth riding.
        if adx < 20.0 {
            return None;
        }

        let adx_score = clamp01(adx / 50.0);
        let strength = clamp01(0.5 + adx_score * 0.5);
        let confidence = clamp01(0.5 + adx_score * 0.4);
        let clarity = clamp01(0.6 + adx_score * 0.4);

        let (stop_loss, take_profit) = atr_exits(direction, entry, atr, ctx.params, ctx.regime);

        Some(StrategySignal {
            direction,
            strength,
            confidence,
            stop_loss,
            take_profit,
            clarity,
        })
    }
}

// ---------------------------------------------------------------------------
// Bollinger breakout
// ---------------------------------------------------------------------------

/// Breakouts originate here: a close beyond a band after a tight squeeze is
/// the single source of the breakout tag downstream.
pub struct BollingerBreakout;

impl Strategy for BollingerBreakout {
    fn name(&self) -> &str {
        "bb_breakout"
    }

    fn evaluate(&self, ctx: &StrategyContext<'_>) -> Option<StrategySignal> {
        let upper = ctx.frame.value("bb_upper_20")?;
        let lower = ctx.frame.value("bb_lower_20")?;
        let width = ctx.frame.value("bb_width_20")?;
        let atr = ctx.frame.value("atr_14")?;
        let close = ctx.frame.bar.close;
        if close <= 0.0 || atr <= 0.0 {
            return None;
        }

        let direction = if close > upper {
            Direction::Long
        } else if close < lower {
            Direction::Short
        } else {
            return None;
        };

        // Distance beyond the band, in ATR units.
        let excess = match direction {
            Direction::Long => (close - upper) / atr,
            Direction::Short => (lower - close) / atr,
        };
        if excess <= 0.0 {
            return None;
        }

        // A breakout out of a squeeze is more meaningful than one out of an
        // already-wide channel.
        let squeeze_bonus = if width < 2.0 { 0.15 } else { 0.0 };

        let strength = clamp01(0.5 + excess * 0.4 + squeeze_bonus);
        let confidence = clamp01(0.45 + excess * 0.35 + squeeze_bonus);
        let clarity = clamp01(0.4 + excess * 0.5);

        let (stop_loss, take_profit) = atr_exits(direction, close, atr, ctx.params, ctx.regime);

        Some(StrategySignal {
            direction,
            strength,
            confidence,
            stop_loss,
            take_profit,
            clarity,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OhlcvBar, Timeframe};

    fn frame_with(values: &[(&str, f64)], close: f64) -> IndicatorFrame {
        IndicatorFrame {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M5,
            close_time_ms: 600_000,
            bar: OhlcvBar {
                open_time_ms: 300_000,
                close_time_ms: 600_000,
                open: close,
                high: close + 10.0,
                low: close - 10.0,
                close,
                volume: 100.0,
                tick_count: 200,
            },
            values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            data_completeness: 1.0,
        }
    }

    fn ctx<'a>(
        frame: &'a IndicatorFrame,
        history: &'a [IndicatorFrame],
        set: &'a ParameterSet,
    ) -> StrategyContext<'a> {
        StrategyContext {
            frame,
            history,
            regime: RegimeLabel::RangeBound,
            params: set,
        }
    }

    #[test]
    fn registry_rejects_bad_catalogs() {
        assert!(StrategyRegistry::new(vec![]).is_err());

        struct Named(&'static str);
        impl Strategy for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn evaluate(&self, _: &StrategyContext<'_>) -> Option<StrategySignal> {
                None
            }
        }
        assert!(StrategyRegistry::new(vec![Arc::new(Named("Bad Name"))]).is_err());
        assert!(
            StrategyRegistry::new(vec![Arc::new(Named("dup")), Arc::new(Named("dup"))]).is_err()
        );
        assert!(StrategyRegistry::new(vec![Arc::new(Named("ok_1"))]).is_ok());
    }

    #[test]
    fn rsi_reversal_long_on_oversold_turn() {
        let set = ParameterSet::baseline();
        let prev = frame_with(&[("rsi_14", 22.0)], 37_000.0);
        let frame = frame_with(&[("rsi_14", 27.0), ("atr_14", 150.0)], 37_000.0);
        let history = vec![prev];

        let sig = RsiReversal.evaluate(&ctx(&frame, &history, &set)).unwrap();
        assert_eq!(sig.direction, Direction::Long);
        assert!(sig.strength > 0.55 && sig.strength <= 1.0);
        assert!(sig.confidence > 0.45 && sig.confidence <= 1.0);
        assert!(sig.stop_loss < 37_000.0);
        assert!(sig.take_profit > 37_000.0);
    }

    #[test]
    fn rsi_reversal_quiet_in_midrange() {
        let set = ParameterSet::baseline();
        let prev = frame_with(&[("rsi_14", 48.0)], 37_000.0);
        let frame = frame_with(&[("rsi_14", 52.0), ("atr_14", 150.0)], 37_000.0);
        let history = vec![prev];
        assert!(RsiReversal.evaluate(&ctx(&frame, &history, &set)).is_none());
    }

    #[test]
    fn rsi_reversal_short_on_overbought_turn() {
        let set = ParameterSet::baseline();
        let prev = frame_with(&[("rsi_14", 81.0)], 37_000.0);
        let frame = frame_with(&[("rsi_14", 76.0), ("atr_14", 150.0)], 37_000.0);
        let history = vec![prev];

        let sig = RsiReversal.evaluate(&ctx(&frame, &history, &set)).unwrap();
        assert_eq!(sig.direction, Direction::Short);
        assert!(sig.stop_loss > 37_000.0);
        assert!(sig.take_profit < 37_000.0);
    }

    #[test]
    fn ema_trend_needs_alignment_and_adx() {
        let set = ParameterSet::baseline();
        let history: Vec<IndicatorFrame> = Vec::new();

        let aligned = frame_with(
            &[
                ("ema_trend", 1.0),
                ("ema_9", 36_900.0),
                ("adx_14", 32.0),
                ("atr_14", 150.0),
            ],
            37_000.0,
        );
        let sig = EmaTrendFollow
            .evaluate(&ctx(&aligned, &history, &set))
            .unwrap();
        assert_eq!(sig.direction, Direction::Long);

        let weak = frame_with(
            &[
                ("ema_trend", 1.0),
                ("ema_9", 36_900.0),
                ("adx_14", 15.0),
                ("atr_14", 150.0),
            ],
            37_000.0,
        );
        assert!(EmaTrendFollow.evaluate(&ctx(&weak, &history, &set)).is_none());

        let mixed = frame_with(
            &[
                ("ema_trend", 0.0),
                ("ema_9", 36_900.0),
                ("adx_14", 32.0),
                ("atr_14", 150.0),
            ],
            37_000.0,
        );
        assert!(EmaTrendFollow
            .evaluate(&ctx(&mixed, &history, &set))
            .is_none());
    }

    #[test]
    fn breakout_fires_beyond_bands_only() {
        let set = ParameterSet::baseline();
        let history: Vec<IndicatorFrame> = Vec::new();

        let above = frame_with(
            &[
                ("bb_upper_20", 36_800.0),
                ("bb_lower_20", 36_200.0),
                ("bb_width_20", 1.5),
                ("atr_14", 100.0),
            ],
            37_000.0,
        );
        let sig = BollingerBreakout
            .evaluate(&ctx(&above, &history, &set))
            .unwrap();
        assert_eq!(sig.direction, Direction::Long);
        // Squeeze bonus applies at width 1.5.
        assert!(sig.strength > 0.6);

        let inside = frame_with(
            &[
                ("bb_upper_20", 37_500.0),
                ("bb_lower_20", 36_500.0),
                ("bb_width_20", 3.0),
                ("atr_14", 100.0),
            ],
            37_000.0,
        );
        assert!(BollingerBreakout
            .evaluate(&ctx(&inside, &history, &set))
            .is_none());
    }

    #[test]
    fn missing_indicator_suppresses_signal() {
        let set = ParameterSet::baseline();
        let history: Vec<IndicatorFrame> = Vec::new();
        // NaN RSI reads as missing through IndicatorFrame::value.
        let mut frame = frame_with(&[("atr_14", 150.0)], 37_000.0);
        frame.values.insert("rsi_14".into(), f64::NAN);
        assert!(RsiReversal.evaluate(&ctx(&frame, &history, &set)).is_none());
    }
}
