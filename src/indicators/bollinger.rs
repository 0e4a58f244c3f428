// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA, upper/lower = SMA ± k·σ over the window. Band width
// (upper - lower) / middle * 100 is the volatility read used by the regime
// classifier and the breakout strategy.
// =============================================================================

/// Result of a Bollinger Band calculation over the trailing window.
#[derive(Debug, Clone, Copy)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle * 100.
    pub width: f64,
}

/// Bands over the final `period` closes with `num_std` deviations.
///
/// Returns `None` on insufficient data, a zero middle band, or non-finite
/// width.
pub fn bands(closes: &[f64], period: usize, num_std: f64) -> Option<Bands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    width.is_finite().then_some(Bands {
        upper,
        middle,
        lower,
        width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_holds() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let b = bands(&closes, 20, 2.0).unwrap();
        assert!(b.upper > b.middle);
        assert!(b.lower < b.middle);
        assert!(b.width > 0.0);
    }

    #[test]
    fn insufficient_data() {
        assert!(bands(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
    }

    #[test]
    fn flat_series_zero_width() {
        let closes = vec![100.0; 20];
        let b = bands(&closes, 20, 2.0).unwrap();
        assert!(b.width.abs() < 1e-10);
        assert!((b.upper - b.lower).abs() < 1e-10);
    }

    #[test]
    fn window_is_trailing() {
        // Earlier junk outside the window must not affect the result.
        let mut closes = vec![1_000.0; 10];
        closes.extend(std::iter::repeat(100.0).take(20));
        let b = bands(&closes, 20, 2.0).unwrap();
        assert!((b.middle - 100.0).abs() < 1e-10);
    }
}
