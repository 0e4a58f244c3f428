// =============================================================================
// Cross-symbol correlation — conflict review and same-direction reinforcement
// =============================================================================
//
// A rolling N-bar Pearson correlation over per-bar returns. When two
// candidates land on highly correlated symbols:
//
//   * opposite directions -> conflict review: the stricter quality wins, the
//     other is demoted to LOW priority;
//   * same direction      -> they reinforce each other: confidence bumped by
//     a capped factor.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use crate::config::PreEvalConfig;
use crate::types::{Direction, SignalCandidate};

/// Effect of the correlation step on the current candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationEffect {
    None,
    /// Conflicting candidate on a correlated symbol outscored this one.
    Demote { against: String, correlation: f64 },
    /// This candidate outscored the conflicting one; the earlier candidate
    /// is recorded as the demoted side.
    WinsConflict { against: String, correlation: f64 },
    /// Same-direction agreement on a correlated symbol.
    Reinforce { confidence_bump: f64 },
}

struct RecentCandidate {
    id: String,
    symbol: String,
    direction: Direction,
    composite: f64,
    seen_at_ms: i64,
}

/// Rolling close-price series plus the recent-candidate window.
pub struct CorrelationTracker {
    cfg: PreEvalConfig,
    closes: HashMap<String, VecDeque<f64>>,
    recent: VecDeque<RecentCandidate>,
}

impl CorrelationTracker {
    pub fn new(cfg: PreEvalConfig) -> Self {
        Self {
            cfg,
            closes: HashMap::new(),
            recent: VecDeque::new(),
        }
    }

    /// Feed one closed bar for `symbol`.
    pub fn observe_close(&mut self, symbol: &str, close: f64) {
        if !close.is_finite() || close <= 0.0 {
            return;
        }
        let ring = self.closes.entry(symbol.to_string()).or_default();
        ring.push_back(close);
        while ring.len() > self.cfg.correlation_bars + 1 {
            ring.pop_front();
        }
    }

    /// Rolling correlation of per-bar returns between two symbols, when both
    /// have a full window.
    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        let ra = returns(self.closes.get(a)?);
        let rb = returns(self.closes.get(b)?);
        let n = ra.len().min(rb.len());
        if n < self.cfg.correlation_bars.min(10) {
            return None;
        }
        pearson(&ra[ra.len() - n..], &rb[rb.len() - n..])
    }

    /// Assess `candidate` (with its freshly computed composite) against the
    /// recent-candidate window, then record it.
    pub fn assess(
        &mut self,
        candidate: &SignalCandidate,
        composite: f64,
        now_ms: i64,
    ) -> CorrelationEffect {
        self.prune(now_ms);

        let mut effect = CorrelationEffect::None;
        let mut best_corr = 0.0_f64;

        for other in &self.recent {
            if other.symbol == candidate.symbol {
                continue;
            }
            let Some(corr) = self.correlation(&candidate.symbol, &other.symbol) else {
                continue;
            };
            if corr <= self.cfg.correlation_threshold {
                continue;
            }

            if other.direction == candidate.direction {
                if corr > best_corr && matches!(effect, CorrelationEffect::None) {
                    best_corr = corr;
                    let span = 1.0 - self.cfg.correlation_threshold;
                    let bump = (self.cfg.confidence_bump_cap * (corr - self.cfg.correlation_threshold)
                        / span)
                        .min(self.cfg.confidence_bump_cap);
                    effect = CorrelationEffect::Reinforce {
                        confidence_bump: bump,
                    };
                }
            } else {
                // Conflict review: stricter quality wins outright.
                effect = if composite >= other.composite {
                    CorrelationEffect::WinsConflict {
                        against: other.id.clone(),
                        correlation: corr,
                    }
                } else {
                    CorrelationEffect::Demote {
                        against: other.id.clone(),
                        correlation: corr,
                    }
                };
                break;
            }
        }

        self.recent.push_back(RecentCandidate {
            id: candidate.id.clone(),
            symbol: candidate.symbol.clone(),
            direction: candidate.direction,
            composite,
            seen_at_ms: now_ms,
        });

        effect
    }

    fn prune(&mut self, now_ms: i64) {
        let horizon = now_ms - self.cfg.dedup_window_secs * 1_000;
        while self
            .recent
            .front()
            .is_some_and(|e| e.seen_at_ms < horizon)
        {
            self.recent.pop_front();
        }
    }
}

fn returns(closes: &VecDeque<f64>) -> Vec<f64> {
    let v: Vec<f64> = closes.iter().copied().collect();
    v.windows(2)
        .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect()
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len();
    if n == 0 || n != b.len() {
        return None;
    }
    let nf = n as f64;
    let mean_a = a.iter().sum::<f64>() / nf;
    let mean_b = b.iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    let r = cov / (var_a.sqrt() * var_b.sqrt());
    r.is_finite().then_some(r)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
