// =============================================================================
// Delayed-observation reinforcement — second chances for demoted candidates
// =============================================================================
//
// A candidate that was demoted (or sat right on the quality floor) is
// tracked for a short window. If subsequent bars move the way it predicted,
// it is re-promoted into the standard lane with a REINFORCED tag; otherwise
// it ages out silently.
// =============================================================================

use crate::config::PreEvalConfig;
use crate::types::{Direction, SignalCandidate};

struct Tracked {
    candidate: SignalCandidate,
    tracked_at_ms: i64,
}

/// Tracker for P2's delayed-observation step.
pub struct ReinforcementTracker {
    cfg: PreEvalConfig,
    tracked: Vec<Tracked>,
}

impl ReinforcementTracker {
    pub fn new(cfg: PreEvalConfig) -> Self {
        Self {
            cfg,
            tracked: Vec::new(),
        }
    }

    /// Start watching a demoted or edge candidate.
    pub fn track(&mut self, candidate: SignalCandidate, now_ms: i64) {
        // One slot per candidate id.
        if self.tracked.iter().any(|t| t.candidate.id == candidate.id) {
            return;
        }
        self.tracked.push(Tracked {
            candidate,
            tracked_at_ms: now_ms,
        });
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Feed a closed bar. Tracked candidates on `symbol` whose predicted
    /// move materialised are returned for re-promotion; expired entries are
    /// pruned.
    pub fn observe_bar(&mut self, symbol: &str, close: f64, now_ms: i64) -> Vec<SignalCandidate> {
        let window_ms = self.cfg.reinforce_window_secs * 1_000;
        let move_pct = self.cfg.reinforce_move_pct;

        let mut promoted = Vec::new();
        self.tracked.retain(|t| {
            if now_ms - t.tracked_at_ms > window_ms || now_ms > t.candidate.expires_at_ms {
                return false;
            }
            if t.candidate.symbol != symbol {
                return true;
            }
            let entry = t.candidate.entry_price;
            if entry <= 0.0 {
                return false;
            }
            let favourable = match t.candidate.direction {
                Direction::Long => (close - entry) / entry * 100.0,
                Direction::Short => (entry - close) / entry * 100.0,
            };
            if favourable >= move_pct {
                promoted.push(t.candidate.clone());
                false
            } else {
                true
            }
        });
        promoted
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

    fn candidate(id: &str, direction: Direction, entry: f64) -> SignalCandidate {
        SignalCandidate {
            id: id.into(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M5,
            close_time_ms: 300_000,
            direction,
            strength: 0.6,
            confidence: 0.6,
            entry_price: entry,
            stop_loss: if direction == Direction::Long {
                entry * 0.99
            } else {
                entry * 1.01
            },
            take_profit: if direction == Direction::Long {
                entry * 1.02
            } else {
                entry * 0.98
            },
            expires_at_ms: 2_000_000,
            strategy: "test".into(),
            features: HashMap::new(),
            quality: QualityScores {
                data_completeness: 1.0,
                signal_clarity: 0.5,
                confidence: 0.6,
                volatility_fit: 0.5,
                liquidity_fit: 0.5,
            },
            band: PriorityBand::Low,
            regime: RegimeLabel::RangeBound,
            emitted_at_ms: 300_000,
        }
    }

    #[test]
    fn confirmed_long_is_repromoted() {
        let mut t = ReinforcementTracker::new(PreEvalConfig::default());
        t.track(candidate("a", Direction::Long, 100.0), 0);

        // +0.1% is not enough at the default 0.3% threshold.
        assert!(t.observe_bar("BTCUSDT", 100.1, 60_000).is_empty());
        // +0.5% confirms.
        let promoted = t.observe_bar("BTCUSDT", 100.5, 120_000);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, "a");
        // Promoted entries leave the tracker.
        assert_eq!(t.tracked_count(), 0);
    }

    #[test]
    fn confirmed_short_is_repromoted() {
        let mut t = ReinforcementTracker::new(PreEvalConfig::default());
        t.track(candidate("s", Direction::Short, 100.0), 0);
        let promoted = t.observe_bar("BTCUSDT", 99.5, 60_000);
        assert_eq!(promoted.len(), 1);
    }

    #[test]
    fn adverse_move_never_promotes() {
        let mut t = ReinforcementTracker::new(PreEvalConfig::default());
        t.track(candidate("a", Direction::Long, 100.0), 0);
        assert!(t.observe_bar("BTCUSDT", 99.0, 60_000).is_empty());
        assert_eq!(t.tracked_count(), 1);
    }

    #[test]
    fn window_expiry_prunes() {
        let mut t = ReinforcementTracker::new(PreEvalConfig::default());
        t.track(candidate("a", Direction::Long, 100.0), 0);
        // Past the 5-minute window even a favourable bar does nothing.
        let promoted = t.observe_bar("BTCUSDT", 105.0, 6 * 60 * 1_000);
        assert!(promoted.is_empty());
        assert_eq!(t.tracked_count(), 0);
    }

    #[test]
    fn other_symbols_untouched() {
        let mut t = ReinforcementTracker::new(PreEvalConfig::default());
        t.track(candidate("a", Direction::Long, 100.0), 0);
        assert!(t.observe_bar("ETHUSDT", 200.0, 60_000).is_empty());
        assert_eq!(t.tracked_count(), 1);
    }

    #[test]
    fn duplicate_track_is_ignored() {
        let mut t = ReinforcementTracker::new(PreEvalConfig::default());
        t.track(candidate("a", Direction::Long, 100.0), 0);
        t.track(candidate("a", Direction::Long, 100.0), 1_000);
        assert_eq!(t.tracked_count(), 1);
    }
}
