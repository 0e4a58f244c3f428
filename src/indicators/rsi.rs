// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   RSI      = 100 - 100 / (1 + avg_gain / avg_loss)
//
// RSI > 70 reads overbought, RSI < 30 oversold.
// =============================================================================

/// Full RSI series for `closes`, one value per close from index `period`.
///
/// Seeds the averages with the SMA of the first `period` deltas. Returns an
/// empty vec with `period == 0` or fewer than `period + 1` closes.
pub fn series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let Some(first) = from_averages(avg_gain, avg_loss) else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(deltas.len() - period + 1);
    out.push(first);

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match from_averages(avg_gain, avg_loss) {
            Some(rsi) => out.push(rsi),
            None => break,
        }
    }

    out
}

/// The most recent RSI value, if computable.
pub fn last(closes: &[f64], period: usize) -> Option<f64> {
    series(closes, period).last().copied()
}

/// RSI from smoothed averages, in [0, 100].
///
/// No movement at all reads 50 (neutral); only gains reads 100.
fn from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then_some(rsi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_inputs() {
        assert!(series(&[], 14).is_empty());
        assert!(series(&[1.0, 2.0, 3.0], 0).is_empty());
        // period deltas require period + 1 closes.
        let fourteen: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(series(&fourteen, 14).is_empty());
    }

    #[test]
    fn all_gains_pegs_at_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for v in series(&closes, 14) {
            assert!((v - 100.0).abs() < 1e-10);
        }
    }

    #[test]
    fn all_losses_pegs_at_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for v in series(&closes, 14) {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn flat_market_reads_neutral() {
        let closes = vec![100.0; 30];
        for v in series(&closes, 14) {
            assert!((v - 50.0).abs() < 1e-10);
        }
    }

    #[test]
    fn stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for v in series(&closes, 14) {
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn last_mirrors_series_tail() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.7).sin()).collect();
        let s = series(&closes, 14);
        assert_eq!(last(&closes, 14), s.last().copied());
    }
}
