// =============================================================================
// Candidate deduplication — cosine similarity over feature snapshots
// =============================================================================
//
// Two candidates inside the sliding window are duplicates when they share
// symbol and direction AND their feature vectors read ≥ the cosine
// threshold. The higher-confidence one survives; the suppression is
// recorded.
//
// Diversity guard: when enough distinct strategies independently land on
// near-identical signals, that agreement is information, not redundancy —
// the candidates are all preserved.
// =============================================================================

use std::collections::{HashSet, VecDeque};

use crate::config::PreEvalConfig;
use crate::types::{Direction, SignalCandidate};

/// What the tracker concluded about an incoming candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    /// No near-duplicate in the window.
    Unique,
    /// Near-duplicates exist but strategy diversity preserves co-emission.
    DiversityPreserved { distinct_strategies: usize },
    /// Suppressed in favour of `kept_candidate` (equal or higher confidence).
    Suppressed { kept_candidate: String },
    /// The incoming candidate wins; the earlier one was already forwarded
    /// and is recorded as superseded.
    Supersedes { superseded: String },
}

struct WindowEntry {
    id: String,
    symbol: String,
    direction: Direction,
    strategy: String,
    confidence: f64,
    features: Vec<(String, f64)>,
    seen_at_ms: i64,
}

/// Sliding-window duplicate tracker for P2 step 1.
pub struct DedupTracker {
    cfg: PreEvalConfig,
    window: VecDeque<WindowEntry>,
}

impl DedupTracker {
    pub fn new(cfg: PreEvalConfig) -> Self {
        Self {
            cfg,
            window: VecDeque::new(),
        }
    }

    /// Assess `candidate` against the window, then record it.
    pub fn check(&mut self, candidate: &SignalCandidate, now_ms: i64) -> DedupOutcome {
        self.prune(now_ms);

        let features = sorted_features(candidate);

        // Collect near-duplicates: same symbol + direction, similar features.
        let mut best_match: Option<&WindowEntry> = None;
        let mut strategies: HashSet<&str> = HashSet::new();
        strategies.insert(&candidate.strategy);

        for entry in &self.window {
            if entry.symbol != candidate.symbol || entry.direction != candidate.direction {
                continue;
            }
            let sim = cosine_similarity(&features, &entry.features);
            if sim >= self.cfg.cosine_threshold {
                strategies.insert(&entry.strategy);
                let better = match best_match {
                    Some(current) => entry.confidence > current.confidence,
                    None => true,
                };
                if better {
                    best_match = Some(entry);
                }
            }
        }

        let outcome = match best_match {
            None => DedupOutcome::Unique,
            Some(_) if strategies.len() >= self.cfg.diversity_min_strategies => {
                DedupOutcome::DiversityPreserved {
                    distinct_strategies: strategies.len(),
                }
            }
            Some(entry) => {
                if candidate.confidence > entry.confidence {
                    DedupOutcome::Supersedes {
                        superseded: entry.id.clone(),
                    }
                } else {
                    DedupOutcome::Suppressed {
                        kept_candidate: entry.id.clone(),
                    }
                }
            }
        };

        // Suppressed candidates are not recorded: they must not themselves
        // suppress a later, stronger signal.
        if !matches!(outcome, DedupOutcome::Suppressed { .. }) {
            self.window.push_back(WindowEntry {
                id: candidate.id.clone(),
                symbol: candidate.symbol.clone(),
                direction: candidate.direction,
                strategy: candidate.strategy.clone(),
                confidence: candidate.confidence,
                features,
                seen_at_ms: now_ms,
            });
        }

        outcome
    }

    /// Recent candidates on `symbol` pointing the other way — the router's
    /// ambiguity signal.
    pub fn has_conflict(&self, symbol: &str, direction: Direction) -> bool {
        self.window
            .iter()
            .any(|e| e.symbol == symbol && e.direction == direction.opposite())
    }

    fn prune(&mut self, now_ms: i64) {
        let horizon = now_ms - self.cfg.dedup_window_secs * 1_000;
        while self
            .window
            .front()
            .is_some_and(|e| e.seen_at_ms < horizon)
        {
            self.window.pop_front();
        }
    }
}

fn sorted_features(candidate: &SignalCandidate) -> Vec<(String, f64)> {
    let mut v: Vec<(String, f64)> = candidate
        .features
        .iter()
        .filter(|(_, val)| val.is_finite())
        .map(|(k, val)| (k.clone(), *val))
        .collect();
    v.sort_by(|a, b| a.0.cmp(&b.0));
    v
}

/// Cosine similarity over the intersection of feature names. Empty
/// intersections read 0 (not similar).
fn cosine_similarity(a: &[(String, f64)], b: &[(String, f64)]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    let mut matched = 0usize;

    let mut i = 0;
    let mut j = 0;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                dot += a[i].1 * b[j].1;
                norm_a += a[i].1 * a[i].1;
                norm_b += b[j].1 * b[j].1;
                matched += 1;
                i += 1;
                j += 1;
            }
        }
    }

    if matched == 0 || norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        sim
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PriorityBand, QualityScores, RegimeLabel, Timeframe};
    use std::collections::HashMap;

    fn candidate(
        id: &str,
        symbol: &str,
        direction: Direction,
        strategy: &str,
        confidence: f64,
        features: &[(&str, f64)],
    ) -> SignalCandidate {
        SignalCandidate {
            id: id.into(),
            symbol: symbol.into(),
            timeframe: Timeframe::M5,
            close_time_ms: 300_000,
            direction,
            strength: 0.8,
            confidence,
            entry_price: 100.0,
            stop_loss: if direction == Direction::Long { 99.0 } else { 101.0 },
            take_profit: if direction == Direction::Long { 103.0 } else { 97.0 },
            expires_at_ms: 1_200_000,
            strategy: strategy.into(),
            features: features.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            quality: QualityScores {
                data_completeness: 1.0,
                signal_clarity: 0.8,
                confidence,
                volatility_fit: 0.7,
                liquidity_fit: 0.9,
            },
            band: PriorityBand::Medium,
            regime: RegimeLabel::RangeBound,
            emitted_at_ms: 300_000,
        }
    }

    const FEATS: &[(&str, f64)] = &[("rsi_14", 27.0), ("atr_14", 1.5), ("roc_14", -2.0)];
    // Nearly identical vector: cosine well above 0.85.
    const FEATS_NEAR: &[(&str, f64)] = &[("rsi_14", 27.5), ("atr_14", 1.45), ("roc_14", -1.9)];
    // Orthogonal-ish vector.
    const FEATS_FAR: &[(&str, f64)] = &[("rsi_14", 1.0), ("atr_14", 90.0), ("roc_14", 55.0)];

    fn tracker() -> DedupTracker {
        DedupTracker::new(PreEvalConfig::default())
    }

    #[test]
    fn first_candidate_is_unique() {
        let mut t = tracker();
        let c = candidate("a", "BTCUSDT", Direction::Long, "rsi_reversal", 0.8, FEATS);
        assert_eq!(t.check(&c, 0), DedupOutcome::Unique);
    }

    #[test]
    fn near_duplicate_lower_confidence_is_suppressed() {
        let mut t = tracker();
        let first = candidate("a", "BTCUSDT", Direction::Long, "rsi_reversal", 0.8, FEATS);
        let second = candidate("b", "BTCUSDT", Direction::Long, "ema_trend", 0.7, FEATS_NEAR);

        assert_eq!(t.check(&first, 0), DedupOutcome::Unique);
        assert_eq!(
            t.check(&second, 1_000),
            DedupOutcome::Suppressed {
                kept_candidate: "a".into()
            }
        );
    }

    #[test]
    fn near_duplicate_higher_confidence_supersedes() {
        let mut t = tracker();
        let first = candidate("a", "BTCUSDT", Direction::Long, "rsi_reversal", 0.6, FEATS);
        let second = candidate("b", "BTCUSDT", Direction::Long, "ema_trend", 0.9, FEATS_NEAR);

        t.check(&first, 0);
        assert_eq!(
            t.check(&second, 1_000),
            DedupOutcome::Supersedes {
                superseded: "a".into()
            }
        );
    }

    #[test]
    fn different_symbol_or_direction_is_not_duplicate() {
        let mut t = tracker();
        t.check(
            &candidate("a", "BTCUSDT", Direction::Long, "rsi_reversal", 0.8, FEATS),
            0,
        );
        assert_eq!(
            t.check(
                &candidate("b", "ETHUSDT", Direction::Long, "rsi_reversal", 0.8, FEATS),
                0
            ),
            DedupOutcome::Unique
        );
        assert_eq!(
            t.check(
                &candidate("c", "BTCUSDT", Direction::Short, "bb_breakout", 0.8, FEATS),
                0
            ),
            DedupOutcome::Unique
        );
    }

    #[test]
    fn dissimilar_features_are_not_duplicates() {
        let mut t = tracker();
        t.check(
            &candidate("a", "BTCUSDT", Direction::Long, "rsi_reversal", 0.8, FEATS),
            0,
        );
        assert_eq!(
            t.check(
                &candidate("b", "BTCUSDT", Direction::Long, "ema_trend", 0.7, FEATS_FAR),
                0
            ),
            DedupOutcome::Unique
        );
    }

    #[test]
    fn diversity_guard_preserves_multi_strategy_agreement() {
        let mut cfg = PreEvalConfig::default();
        cfg.diversity_min_strategies = 3;
        let mut t = DedupTracker::new(cfg);

        t.check(
            &candidate("a", "BTCUSDT", Direction::Long, "rsi_reversal", 0.8, FEATS),
            0,
        );
        // Second strategy: below the diversity bar, still suppressed.
        let second = candidate("b", "BTCUSDT", Direction::Long, "ema_trend", 0.7, FEATS_NEAR);
        assert!(matches!(
            t.check(&second, 0),
            DedupOutcome::Suppressed { .. }
        ));
        // A higher-confidence second strategy survives and is recorded.
        let second_hi =
            candidate("b2", "BTCUSDT", Direction::Long, "ema_trend", 0.95, FEATS_NEAR);
        assert!(matches!(
            t.check(&second_hi, 0),
            DedupOutcome::Supersedes { .. }
        ));
        // Third distinct strategy reaches the diversity bar.
        let third = candidate("c", "BTCUSDT", Direction::Long, "bb_breakout", 0.5, FEATS);
        assert_eq!(
            t.check(&third, 0),
            DedupOutcome::DiversityPreserved {
                distinct_strategies: 3
            }
        );
    }

    #[test]
    fn window_expires() {
        let mut t = tracker();
        t.check(
            &candidate("a", "BTCUSDT", Direction::Long, "rsi_reversal", 0.8, FEATS),
            0,
        );
        // 16 minutes later the entry has aged out of the 15-minute window.
        let late = candidate("b", "BTCUSDT", Direction::Long, "ema_trend", 0.5, FEATS_NEAR);
        assert_eq!(t.check(&late, 16 * 60 * 1_000), DedupOutcome::Unique);
    }

    #[test]
    fn conflict_detection_feeds_router_ambiguity() {
        let mut t = tracker();
        t.check(
            &candidate("a", "BTCUSDT", Direction::Long, "rsi_reversal", 0.8, FEATS),
            0,
        );
        assert!(t.has_conflict("BTCUSDT", Direction::Short));
        assert!(!t.has_conflict("BTCUSDT", Direction::Long));
        assert!(!t.has_conflict("ETHUSDT", Direction::Short));
    }
}
