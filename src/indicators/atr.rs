// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
//   TR    = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::types::OhlcvBar;

/// Most recent ATR over `bars` (oldest-first) using Wilder's smoothing.
///
/// Returns `None` with `period == 0`, fewer than `period + 1` bars, or any
/// non-finite intermediate.
pub fn wilder(bars: &[OhlcvBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for pair in bars.windows(2) {
        let prev_close = pair[0].close;
        let high = pair[1].high;
        let low = pair[1].low;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        tr_values.push(tr);
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    Some(atr)
}

/// ATR as a percentage of the latest close. Comparable across price scales;
/// feeds the volatility-fit quality score and the P3 clamp bounds.
pub fn percent(bars: &[OhlcvBar], period: usize) -> Option<f64> {
    let atr = wilder(bars, period)?;
    let last_close = bars.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some(atr / last_close * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> OhlcvBar {
        OhlcvBar {
            open_time_ms: 0,
            close_time_ms: 60_000,
            open,
            high,
            low,
            close,
            volume: 10.0,
            tick_count: 5,
        }
    }

    #[test]
    fn degenerate_inputs() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 20];
        assert!(wilder(&bars, 0).is_none());
        assert!(wilder(&bars[..10], 14).is_none());
    }

    #[test]
    fn constant_range_converges() {
        // Every bar spans 10 with a slight drift; ATR should sit near 10.
        let bars: Vec<OhlcvBar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                bar(base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let atr = wilder(&bars, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "got {atr}");
    }

    #[test]
    fn gap_feeds_true_range() {
        // |H - prevClose| dominates when price gaps between bars.
        let bars = vec![
            bar(100.0, 105.0, 95.0, 95.0),
            bar(110.0, 115.0, 108.0, 112.0),
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = wilder(&bars, 3).unwrap();
        assert!(atr > 7.0, "gap not reflected, got {atr}");
    }

    #[test]
    fn nan_yields_none() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, f64::NAN, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(wilder(&bars, 3).is_none());
    }

    #[test]
    fn percent_normalises_by_close() {
        let bars: Vec<OhlcvBar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let pct = percent(&bars, 14).unwrap();
        assert!(pct > 0.0 && pct.is_finite());
        let raw = wilder(&bars, 14).unwrap();
        let close = bars.last().unwrap().close;
        assert!((pct - raw / close * 100.0).abs() < 1e-12);
    }
}
