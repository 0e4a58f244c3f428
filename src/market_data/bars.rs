// =============================================================================
// Bar aggregation — fold ticks into OHLCV bars with an out-of-order grace
// =============================================================================
//
// A bar does not close the instant a tick crosses its boundary: it stays
// open for a small grace interval so late ticks still fold into the bar they
// belong to. A bar is emitted once either
//
//   * a tick arrives with `ts >= close_time + grace`, or
//   * wall clock passes `close_time + grace` (timer-driven flush).
//
// Out-of-order ticks older than the currently open bar are dropped and
// counted; they missed their grace window.
// =============================================================================

use std::collections::BTreeMap;

use crate::types::{OhlcvBar, Timeframe};

/// Per-(symbol, timeframe) tick folder. One instance per stream; not shared
/// across threads (the P1 worker owns it).
pub struct BarBuilder {
    timeframe: Timeframe,
    grace_ms: i64,
    /// Oldest bar that has not been emitted yet.
    current: Option<OhlcvBar>,
    /// Bars after `current`, keyed by open time, accumulating during the
    /// grace window.
    future: BTreeMap<i64, OhlcvBar>,
    /// Ticks dropped for arriving later than the grace interval.
    dropped_late: u64,
}

impl BarBuilder {
    pub fn new(timeframe: Timeframe, grace_ms: i64) -> Self {
        Self {
            timeframe,
            grace_ms,
            current: None,
            future: BTreeMap::new(),
            dropped_late: 0,
        }
    }

    pub fn dropped_late(&self) -> u64 {
        self.dropped_late
    }

    /// Fold one tick. Returns any bars that closed as a result, in
    /// open-time order.
    pub fn apply_tick(&mut self, ts_ms: i64, price: f64, volume: f64) -> Vec<OhlcvBar> {
        let open = self.timeframe.bar_open(ts_ms);
        let close = self.timeframe.bar_close(ts_ms);

        let Some(current) = self.current.as_mut() else {
            self.current = Some(OhlcvBar::seed(open, close, price, volume));
            return Vec::new();
        };

        if open == current.open_time_ms {
            current.apply(price, volume);
            return Vec::new();
        }

        if open < current.open_time_ms {
            // Older than the oldest open bar: the grace window already
            // passed for it.
            self.dropped_late += 1;
            return Vec::new();
        }

        // The tick belongs to a later bar. Accumulate it, then emit every
        // bar whose grace window this tick's timestamp has passed.
        self.future
            .entry(open)
            .and_modify(|bar| bar.apply(price, volume))
            .or_insert_with(|| OhlcvBar::seed(open, close, price, volume));

        self.emit_closed_before(ts_ms)
    }

    /// Timer-driven close: emit every bar whose grace window has passed by
    /// `now_ms` wall clock.
    pub fn flush(&mut self, now_ms: i64) -> Vec<OhlcvBar> {
        self.emit_closed_before(now_ms)
    }

    /// Emit `current` (and promoted successors) while their
    /// `close_time + grace` lies at or before `threshold_ms`.
    fn emit_closed_before(&mut self, threshold_ms: i64) -> Vec<OhlcvBar> {
        let mut closed = Vec::new();
        loop {
            let ready = self
                .current
                .as_ref()
                .is_some_and(|bar| bar.close_time_ms + self.grace_ms <= threshold_ms);
            if !ready {
                break;
            }
            if let Some(bar) = self.current.take() {
                closed.push(bar);
            }
            // Promote the earliest future bar; gaps (bars with no ticks)
            // simply do not exist.
            if let Some((&open, _)) = self.future.iter().next() {
                if let Some(bar) = self.future.remove(&open) {
                    self.current = Some(bar);
                }
            }
        }
        closed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
