// =============================================================================
// FrameBuffer — ring of closed bars and published frames per stream
// =============================================================================
//
// Thread-safe ring buffer holding the most recent closed bars for each
// (symbol, timeframe), plus the IndicatorFrames published from them. When a
// bar is evicted the caller is told the new oldest close time so the
// indicator memo cache can evict in lockstep.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::types::{IndicatorFrame, OhlcvBar, StreamKey};

/// Thread-safe per-stream history store.
pub struct FrameBuffer {
    bars: RwLock<HashMap<StreamKey, VecDeque<OhlcvBar>>>,
    frames: RwLock<HashMap<StreamKey, VecDeque<IndicatorFrame>>>,
    max_bars: usize,
}

impl FrameBuffer {
    /// Retain at most `max_bars` closed bars (and as many frames) per key.
    pub fn new(max_bars: usize) -> Self {
        Self {
            bars: RwLock::new(HashMap::new()),
            frames: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Append a closed bar. Returns the oldest retained close time when the
    /// ring evicted an entry, so callers can expire memoized values.
    pub fn push_bar(&self, key: StreamKey, bar: OhlcvBar) -> Option<i64> {
        let mut map = self.bars.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));
        ring.push_back(bar);

        let mut evicted = false;
        while ring.len() > self.max_bars {
            ring.pop_front();
            evicted = true;
        }
        if evicted {
            ring.front().map(|b| b.close_time_ms)
        } else {
            None
        }
    }

    /// The most recent `count` closed bars, oldest first.
    pub fn recent_bars(&self, key: &StreamKey, count: usize) -> Vec<OhlcvBar> {
        let map = self.bars.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Number of closed bars stored for a key.
    pub fn bar_count(&self, key: &StreamKey) -> usize {
        self.bars.read().get(key).map_or(0, VecDeque::len)
    }

    /// Close price of the most recent bar, if any.
    pub fn last_close(&self, key: &StreamKey) -> Option<f64> {
        self.bars
            .read()
            .get(key)
            .and_then(|ring| ring.back().map(|b| b.close))
    }

    /// Store a published frame (immutable after this point).
    pub fn push_frame(&self, key: StreamKey, frame: IndicatorFrame) {
        let mut map = self.frames.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));
        ring.push_back(frame);
        while ring.len() > self.max_bars {
            ring.pop_front();
        }
    }

    /// The most recent `count` frames, oldest first.
    pub fn recent_frames(&self, key: &StreamKey, count: usize) -> Vec<IndicatorFrame> {
        let map = self.frames.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use std::collections::HashMap as StdHashMap;

    fn key() -> StreamKey {
        StreamKey::new("BTCUSDT", Timeframe::M1)
    }

    fn bar(i: i64, close: f64) -> OhlcvBar {
        OhlcvBar {
            open_time_ms: i * 60_000,
            close_time_ms: (i + 1) * 60_000,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            tick_count: 5,
        }
    }

    #[test]
    fn ring_trims_and_reports_eviction() {
        let buf = FrameBuffer::new(3);
        for i in 0..3 {
            assert!(buf.push_bar(key(), bar(i, 100.0 + i as f64)).is_none());
        }
        // Fourth push evicts bar 0; oldest retained close is bar 1's.
        let oldest = buf.push_bar(key(), bar(3, 103.0));
        assert_eq!(oldest, Some(2 * 60_000));
        assert_eq!(buf.bar_count(&key()), 3);

        let bars = buf.recent_bars(&key(), 10);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, 101.0);
        assert_eq!(bars[2].close, 103.0);
    }

    #[test]
    fn recent_bars_returns_tail_oldest_first() {
        let buf = FrameBuffer::new(10);
        for i in 0..5 {
            buf.push_bar(key(), bar(i, 100.0 + i as f64));
        }
        let tail = buf.recent_bars(&key(), 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].close, 103.0);
        assert_eq!(tail[1].close, 104.0);
    }

    #[test]
    fn empty_key_reads_empty() {
        let buf = FrameBuffer::new(10);
        assert!(buf.recent_bars(&key(), 5).is_empty());
        assert_eq!(buf.last_close(&key()), None);
        assert_eq!(buf.bar_count(&key()), 0);
    }

    #[test]
    fn frames_ring_caps() {
        let buf = FrameBuffer::new(2);
        for i in 0..4 {
            let b = bar(i, 100.0);
            buf.push_frame(
                key(),
                IndicatorFrame {
                    symbol: "BTCUSDT".into(),
                    timeframe: Timeframe::M1,
                    close_time_ms: b.close_time_ms,
                    bar: b,
                    values: StdHashMap::new(),
                    data_completeness: 1.0,
                },
            );
        }
        let frames = buf.recent_frames(&key(), 10);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].close_time_ms, 3 * 60_000);
        assert_eq!(frames[1].close_time_ms, 4 * 60_000);
    }
}
