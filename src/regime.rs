// =============================================================================
// Market regime classifier
// =============================================================================
//
// Classifies one (symbol, timeframe) stream into a discrete regime label from
// trend strength (ADX), EMA stack alignment, and volatility expansion
// (Bollinger width, ATR percent).
//
// Detection hierarchy (first match wins):
//
//   1. HIGH_VOLATILITY — BBW above the expansion threshold or ATR% extreme
//   2. TRENDING_BULL   — ADX above the trend floor with a bullish EMA stack
//   3. TRENDING_BEAR   — ADX above the trend floor with a bearish EMA stack
//   4. RANGE_BOUND     — everything else
//
// The label partitions adaptive learning and selects parameter overlays, so
// classification must stay cheap and deterministic.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::{adx, atr, bollinger, ema};
use crate::types::{OhlcvBar, RegimeLabel};

/// BBW above this reads as volatility expansion.
const BBW_EXPANSION: f64 = 5.0;
/// ATR as a percent of price above this reads as volatility expansion.
const ATR_PCT_EXTREME: f64 = 3.0;
/// ADX at or above this reads as trending.
const ADX_TREND_FLOOR: f64 = 25.0;

/// A regime classification with the metrics that produced it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeRead {
    pub label: RegimeLabel,
    pub adx: f64,
    pub bb_width: f64,
    pub atr_pct: f64,
    /// Confidence in the classification, [0, 1].
    pub confidence: f64,
}

/// Classify the current regime from closed bars (oldest-first).
///
/// Returns `None` until enough history exists for ADX-14 and the EMA stack.
pub fn classify(bars: &[OhlcvBar]) -> Option<RegimeRead> {
    if bars.len() < 56 {
        return None;
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let adx_val = adx::last(bars, 14)?;
    let bb = bollinger::bands(&closes, 20, 2.0)?;
    let atr_pct = atr::percent(bars, 14)?;

    let e9 = ema::last(&closes, 9)?;
    let e21 = ema::last(&closes, 21)?;
    let e55 = ema::last(&closes, 55)?;

    let bullish = e9 > e21 && e21 > e55;
    let bearish = e9 < e21 && e21 < e55;

    let (label, confidence) = if bb.width > BBW_EXPANSION || atr_pct > ATR_PCT_EXTREME {
        let excess = (bb.width / BBW_EXPANSION).max(atr_pct / ATR_PCT_EXTREME);
        (RegimeLabel::HighVolatility, (excess / 2.0).clamp(0.5, 1.0))
    } else if adx_val >= ADX_TREND_FLOOR && bullish {
        (RegimeLabel::TrendingBull, (adx_val / 50.0).clamp(0.5, 1.0))
    } else if adx_val >= ADX_TREND_FLOOR && bearish {
        (RegimeLabel::TrendingBear, (adx_val / 50.0).clamp(0.5, 1.0))
    } else {
        // Low ADX or a mixed EMA stack: chop.
        let conf = (1.0 - adx_val / 50.0).clamp(0.3, 1.0);
        (RegimeLabel::RangeBound, conf)
    };

    Some(RegimeRead {
        label,
        adx: adx_val,
        bb_width: bb.width,
        atr_pct,
        confidence,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
