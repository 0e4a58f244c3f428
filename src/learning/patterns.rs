// =============================================================================
// Pattern discovery — cluster outcomes by quantized feature snapshot
// =============================================================================
//
// Outcomes are grouped by a coarse signature of the conditions they were
// taken under: strategy, regime, an RSI decile, and the EMA stack sign.
// Patterns whose success rate and sample count both clear their thresholds
// surface as discovered; they adjust per-strategy internal weights only, no
// global parameter change.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{OutcomeRecord, RegimeLabel};

/// Quantized condition signature for clustering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PatternKey {
    pub strategy: String,
    pub regime: RegimeLabel,
    /// RSI decile 0..=9, or 10 when the snapshot had no RSI.
    pub rsi_decile: u8,
    /// -1, 0, +1 from the `ema_trend` feature.
    pub trend_sign: i8,
}

impl PatternKey {
    fn for_record(record: &OutcomeRecord) -> Self {
        let rsi_decile = record
            .features
            .get("rsi_14")
            .copied()
            .filter(|v| v.is_finite())
            .map(|v| (v.clamp(0.0, 99.9) / 10.0) as u8)
            .unwrap_or(10);
        let trend_sign = record
            .features
            .get("ema_trend")
            .copied()
            .filter(|v| v.is_finite())
            .map(|v| {
                if v > 0.5 {
                    1
                } else if v < -0.5 {
                    -1
                } else {
                    0
                }
            })
            .unwrap_or(0);
        Self {
            strategy: record.strategy.clone(),
            regime: record.regime,
            rsi_decile,
            trend_sign,
        }
    }
}

/// A surfaced pattern.
#[derive(Debug, Clone, Serialize)]
pub struct Pattern {
    pub key: PatternKey,
    pub samples: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub avg_pnl_pct: f64,
}

/// Cluster `records` and surface patterns clearing both thresholds.
pub fn discover(records: &[OutcomeRecord], min_samples: usize, min_success: f64) -> Vec<Pattern> {
    let mut clusters: HashMap<PatternKey, Vec<&OutcomeRecord>> = HashMap::new();
    for record in records {
        clusters
            .entry(PatternKey::for_record(record))
            .or_default()
            .push(record);
    }

    let mut patterns: Vec<Pattern> = clusters
        .into_iter()
        .filter(|(_, members)| members.len() >= min_samples)
        .filter_map(|(key, members)| {
            let samples = members.len();
            let successes = members.iter().filter(|r| r.pnl_pct > 0.0).count();
            let success_rate = successes as f64 / samples as f64;
            if success_rate < min_success {
                return None;
            }
            let avg_pnl_pct =
                members.iter().map(|r| r.pnl_pct).sum::<f64>() / samples as f64;
            Some(Pattern {
                key,
                samples,
                successes,
                success_rate,
                avg_pnl_pct,
            })
        })
        .collect();

    patterns.sort_by(|a, b| {
        b.success_rate
            .partial_cmp(&a.success_rate)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    patterns
}

/// Per-strategy internal weights, nudged by discovered patterns. Bounded so
/// one hot streak cannot dominate the ensemble.
pub fn adjust_strategy_weights(
    weights: &mut HashMap<String, f64>,
    patterns: &[Pattern],
    records: &[OutcomeRecord],
) {
    const STEP: f64 = 0.05;
    const MIN_W: f64 = 0.25;
    const MAX_W: f64 = 2.0;

    // Strategies backing a surfaced pattern drift up.
    for pattern in patterns {
        let w = weights
            .entry(pattern.key.strategy.clone())
            .or_insert(1.0);
        *w = (*w + STEP).min(MAX_W);
    }

    // Strategies with a losing record overall drift down.
    let mut by_strategy: HashMap<&str, (usize, usize)> = HashMap::new();
    for record in records {
        let entry = by_strategy.entry(record.strategy.as_str()).or_default();
        entry.0 += 1;
        if record.pnl_pct <= 0.0 {
            entry.1 += 1;
        }
    }
    for (strategy, (total, losses)) in by_strategy {
        if total >= 10 && losses as f64 / total as f64 > 0.6 {
            let w = weights.entry(strategy.to_string()).or_insert(1.0);
            *w = (*w - STEP).max(MIN_W);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
