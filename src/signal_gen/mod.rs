// =============================================================================
// Signal generation (P1) — ticks to bars to frames to candidates
// =============================================================================
//
// For every (symbol, timeframe) stream:
//
//   tick -> BarBuilder -> closed bar -> FrameBuffer ring -> IndicatorGraph
//        -> IndicatorFrame -> strategies -> SignalCandidate
//
// Stream state machine: WARMUP (insufficient history) -> ACTIVE <-> STALE
// (heartbeat silence) -> FAILED (all exchanges down). Only ACTIVE streams
// emit candidates.
//
// Ordering invariant: within one stream, emitted candidates carry strictly
// non-decreasing close times. Bars close in order, so this holds by
// construction; the generator still tracks and enforces it.
// =============================================================================

pub mod strategies;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::indicators::{IndicatorCache, IndicatorGraph};
use crate::market_data::{BarBuilder, FrameBuffer};
use crate::metrics::PipelineMetrics;
use crate::params::{self, Consumer, ParameterSet, ParameterStore};
use crate::regime;
use crate::types::{
    IndicatorFrame, MarketTick, OhlcvBar, PriorityBand, QualityScores, RegimeLabel,
    SignalCandidate, StreamKey,
};

use strategies::{StrategyContext, StrategyRegistry};

// ---------------------------------------------------------------------------
// Stream state
// ---------------------------------------------------------------------------

/// Lifecycle of one (symbol, timeframe) stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamPhase {
    Warmup,
    Active,
    Stale,
    Failed,
}

struct StreamState {
    phase: StreamPhase,
    builder: BarBuilder,
    last_tick_ms: i64,
    /// Ordering guard: close time of the last emitted candidate.
    last_emitted_close_ms: i64,
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// The P1 engine. Owns per-stream state; shared immutable collaborators come
/// in as Arcs.
pub struct SignalGenerator {
    cfg: PipelineConfig,
    graph: IndicatorGraph,
    cache: IndicatorCache,
    frames: Arc<FrameBuffer>,
    strategies: StrategyRegistry,
    params: Arc<ParameterStore>,
    metrics: Arc<PipelineMetrics>,
    streams: Mutex<HashMap<StreamKey, StreamState>>,
    /// Bars closed since the last drain, for downstream observers.
    closed_bars: Mutex<Vec<(StreamKey, OhlcvBar)>>,
}

impl SignalGenerator {
    pub fn new(
        cfg: PipelineConfig,
        graph: IndicatorGraph,
        strategies: StrategyRegistry,
        frames: Arc<FrameBuffer>,
        params: Arc<ParameterStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            cfg,
            graph,
            cache: IndicatorCache::new(),
            frames,
            strategies,
            params,
            metrics,
            streams: Mutex::new(HashMap::new()),
            closed_bars: Mutex::new(Vec::new()),
        }
    }

    /// Bars closed since the last call. The pipeline feeds these to the
    /// pre-evaluation correlation and reinforcement trackers.
    pub fn drain_closed_bars(&self) -> Vec<(StreamKey, OhlcvBar)> {
        std::mem::take(&mut *self.closed_bars.lock())
    }

    /// Atomically swap strategy parameters. In-flight bar computations keep
    /// the set they captured at entry.
    pub fn reload_parameters(&self, set: ParameterSet) -> anyhow::Result<u64> {
        self.params.put(set)
    }

    /// Fold one deduplicated tick into every configured timeframe. Returns
    /// candidates emitted by bars this tick closed, in close-time order.
    pub fn handle_tick(&self, tick: &MarketTick) -> Vec<SignalCandidate> {
        let mut emitted = Vec::new();
        let timeframes = self.cfg.timeframes.clone();

        for timeframe in timeframes {
            let key = StreamKey::new(tick.symbol.clone(), timeframe);
            let closed = {
                let mut streams = self.streams.lock();
                let state = streams.entry(key.clone()).or_insert_with(|| StreamState {
                    phase: StreamPhase::Warmup,
                    builder: BarBuilder::new(timeframe, self.cfg.ingest.bar_grace_ms),
                    last_tick_ms: tick.ts_ms,
                    last_emitted_close_ms: 0,
                });
                if state.phase == StreamPhase::Stale || state.phase == StreamPhase::Failed {
                    info!(stream = %key, "stream recovered");
                    state.phase = if self.frames.bar_count(&key) >= self.cfg.ingest.warmup_bars {
                        StreamPhase::Active
                    } else {
                        StreamPhase::Warmup
                    };
                }
                state.last_tick_ms = state.last_tick_ms.max(tick.ts_ms);
                let before = state.builder.dropped_late();
                let closed = state.builder.apply_tick(tick.ts_ms, tick.last, tick.volume);
                let dropped = state.builder.dropped_late() - before;
                if dropped > 0 {
                    self.metrics
                        .ticks_dropped_late
                        .fetch_add(dropped, std::sync::atomic::Ordering::Relaxed);
                }
                closed
            };

            for bar in closed {
                emitted.extend(self.on_bar_close(&key, bar));
            }
        }

        emitted
    }

    /// Timer-driven close of quiet bars: emit candidates for every bar whose
    /// grace window has passed by `now_ms`.
    pub fn flush(&self, now_ms: i64) -> Vec<SignalCandidate> {
        let mut emitted = Vec::new();
        let keys: Vec<StreamKey> = self.streams.lock().keys().cloned().collect();
        for key in keys {
            let closed = {
                let mut streams = self.streams.lock();
                match streams.get_mut(&key) {
                    Some(state) => state.builder.flush(now_ms),
                    None => Vec::new(),
                }
            };
            for bar in closed {
                emitted.extend(self.on_bar_close(&key, bar));
            }
        }
        emitted
    }

    /// Heartbeat sweep: streams silent past the window go STALE; with zero
    /// healthy exchanges everything goes FAILED.
    pub fn health_sweep(&self, now_ms: i64, healthy_exchanges: usize) {
        let heartbeat_ms = self.cfg.ingest.heartbeat_secs as i64 * 1_000;
        let mut streams = self.streams.lock();
        for (key, state) in streams.iter_mut() {
            if healthy_exchanges == 0 {
                if state.phase != StreamPhase::Failed {
                    warn!(stream = %key, "all exchanges down; stream FAILED");
                    state.phase = StreamPhase::Failed;
                }
                continue;
            }
            match state.phase {
                StreamPhase::Active | StreamPhase::Warmup => {
                    if now_ms - state.last_tick_ms > heartbeat_ms {
                        warn!(stream = %key, "stream went silent; STALE");
                        state.phase = StreamPhase::Stale;
                        self.metrics
                            .exchange_heartbeat_losses
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
                StreamPhase::Failed => {
                    // At least one exchange is back; let the next tick decide
                    // between Warmup and Active.
                    state.phase = StreamPhase::Stale;
                }
                StreamPhase::Stale => {}
            }
        }
    }

    /// Current phase for a stream (observability and tests).
    pub fn stream_phase(&self, key: &StreamKey) -> Option<StreamPhase> {
        self.streams.lock().get(key).map(|s| s.phase)
    }

    // -------------------------------------------------------------------
    // Bar close -> frame -> candidates
    // -------------------------------------------------------------------

    fn on_bar_close(&self, key: &StreamKey, bar: OhlcvBar) -> Vec<SignalCandidate> {
        use std::sync::atomic::Ordering::Relaxed;

        self.metrics.bars_closed.fetch_add(1, Relaxed);
        let close_time_ms = bar.close_time_ms;
        self.closed_bars.lock().push((key.clone(), bar.clone()));

        if let Some(oldest_kept) = self.frames.push_bar(key.clone(), bar) {
            self.cache.evict_before(key, oldest_kept);
        }

        let bars = self
            .frames
            .recent_bars(key, self.cfg.ingest.frame_ring_bars);

        // Memoized per (stream, close_time): a replayed bar close reuses the
        // cached values rather than recomputing.
        let values = match self.cache.get(key, close_time_ms) {
            Some(cached) => cached,
            None => {
                let (computed, _) = self.graph.evaluate(&bars);
                let nan_count = computed.values().filter(|v| v.is_nan()).count() as u64;
                if nan_count > 0 {
                    self.metrics.indicator_failures.fetch_add(nan_count, Relaxed);
                }
                let arc = Arc::new(computed);
                self.cache.insert(key.clone(), close_time_ms, arc.clone());
                arc
            }
        };

        let completeness = if self.graph.is_empty() {
            1.0
        } else {
            values.values().filter(|v| v.is_finite()).count() as f64 / self.graph.len() as f64
        };

        let Some(last_bar) = bars.last().cloned() else {
            return Vec::new();
        };
        let frame = IndicatorFrame {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            close_time_ms,
            bar: last_bar,
            values: (*values).clone(),
            data_completeness: completeness,
        };

        let history = self.frames.recent_frames(key, 20);
        self.frames.push_frame(key.clone(), frame.clone());
        self.metrics.frames_published.fetch_add(1, Relaxed);

        // Warmup gate: frames publish during warmup, candidates do not.
        let phase = {
            let mut streams = self.streams.lock();
            let Some(state) = streams.get_mut(key) else {
                return Vec::new();
            };
            if state.phase == StreamPhase::Warmup
                && self.frames.bar_count(key) >= self.cfg.ingest.warmup_bars
            {
                info!(stream = %key, "warmup complete; stream ACTIVE");
                state.phase = StreamPhase::Active;
            }
            state.phase
        };
        if phase != StreamPhase::Active {
            return Vec::new();
        }

        self.emit_candidates(key, &frame, &history)
    }

    fn emit_candidates(
        &self,
        key: &StreamKey,
        frame: &IndicatorFrame,
        history: &[IndicatorFrame],
    ) -> Vec<SignalCandidate> {
        use std::sync::atomic::Ordering::Relaxed;

        let (_, set) = self.params.get(Consumer::SignalGen);
        let regime_label = regime::classify(
            &self
                .frames
                .recent_bars(key, self.cfg.ingest.frame_ring_bars),
        )
        .map(|r| r.label)
        .unwrap_or_default();

        let ctx = StrategyContext {
            frame,
            history,
            regime: regime_label,
            params: &set,
        };

        let min_strength = set
            .num_scoped(params::MIN_STRENGTH, None, Some(regime_label))
            .unwrap_or(0.55);
        let min_confidence = set
            .num_scoped(params::CONFIDENCE_THRESHOLD, None, Some(regime_label))
            .unwrap_or(0.60);

        let mut out = Vec::new();
        for strategy in self.strategies.all() {
            // A panicking strategy is suppressed and counted, never fatal,
            // and stays registered.
            let result = catch_unwind(AssertUnwindSafe(|| strategy.evaluate(&ctx)));
            let signal = match result {
                Ok(Some(signal)) => signal,
                Ok(None) => continue,
                Err(_) => {
                    self.metrics.strategy_failures.fetch_add(1, Relaxed);
                    warn!(strategy = strategy.name(), stream = %key, "strategy panicked; suppressed");
                    continue;
                }
            };

            if signal.strength < min_strength || signal.confidence < min_confidence {
                self.metrics.candidates_below_threshold.fetch_add(1, Relaxed);
                continue;
            }

            let candidate = self.build_candidate(key, frame, regime_label, &signal, strategy.name());
            match candidate.validate() {
                Ok(()) => {
                    let mut streams = self.streams.lock();
                    if let Some(state) = streams.get_mut(key) {
                        if candidate.close_time_ms < state.last_emitted_close_ms {
                            // Should be unreachable: bars close in order.
                            self.metrics.bump_reason("out_of_order_candidate");
                            continue;
                        }
                        state.last_emitted_close_ms = candidate.close_time_ms;
                    }
                    drop(streams);
                    self.metrics.candidates_emitted.fetch_add(1, Relaxed);
                    debug!(
                        stream = %key,
                        strategy = strategy.name(),
                        direction = %candidate.direction,
                        strength = candidate.strength,
                        confidence = candidate.confidence,
                        "candidate emitted"
                    );
                    out.push(candidate);
                }
                Err(reason) => {
                    self.metrics.bump_reason("invalid_candidate");
                    warn!(stream = %key, strategy = strategy.name(), %reason, "candidate failed validation");
                }
            }
        }
        out
    }

    fn build_candidate(
        &self,
        key: &StreamKey,
        frame: &IndicatorFrame,
        regime_label: RegimeLabel,
        signal: &strategies::StrategySignal,
        strategy_name: &str,
    ) -> SignalCandidate {
        let quality = QualityScores {
            data_completeness: frame.data_completeness.clamp(0.0, 1.0),
            signal_clarity: signal.clarity.clamp(0.0, 1.0),
            confidence: signal.confidence.clamp(0.0, 1.0),
            volatility_fit: volatility_fit(frame),
            liquidity_fit: liquidity_fit(frame),
        };

        // Provisional band from strength; P2's quality gate re-buckets.
        let band = if signal.strength >= 0.9 {
            PriorityBand::Critical
        } else if signal.strength >= 0.75 {
            PriorityBand::High
        } else if signal.strength >= 0.6 {
            PriorityBand::Medium
        } else {
            PriorityBand::Low
        };

        SignalCandidate {
            id: SignalCandidate::compose_id(
                &key.symbol,
                key.timeframe,
                frame.close_time_ms,
                strategy_name,
            ),
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            close_time_ms: frame.close_time_ms,
            direction: signal.direction,
            strength: signal.strength,
            confidence: signal.confidence,
            entry_price: frame.bar.close,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            expires_at_ms: frame.close_time_ms + self.cfg.ingest.candidate_ttl_secs * 1_000,
            strategy: strategy_name.to_string(),
            features: frame.values.clone(),
            quality,
            band,
            regime: regime_label,
            emitted_at_ms: frame.close_time_ms,
        }
    }
}

/// How well current volatility fits tradeable conditions: ATR between 0.2 %
/// and 3 % of price reads well; extremes read poorly.
fn volatility_fit(frame: &IndicatorFrame) -> f64 {
    match frame.value("atr_pct_14") {
        Some(pct) if pct > 0.0 => {
            if pct < 0.2 {
                (pct / 0.2).clamp(0.0, 1.0)
            } else if pct <= 3.0 {
                1.0
            } else {
                (1.0 - (pct - 3.0) / 5.0).clamp(0.0, 1.0)
            }
        }
        _ => 0.5,
    }
}

/// Rough liquidity read from tick density of the closing bar.
fn liquidity_fit(frame: &IndicatorFrame) -> f64 {
    let ticks = frame.bar.tick_count as f64;
    (ticks / 100.0).clamp(0.1, 1.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Timeframe};

    fn generator() -> SignalGenerator {
        let mut cfg = PipelineConfig::default();
        cfg.symbols = vec!["BTCUSDT".into()];
        cfg.timeframes = vec![Timeframe::M1];
        cfg.ingest.warmup_bars = 20;
        SignalGenerator::new(
            cfg,
            IndicatorGraph::standard(),
            StrategyRegistry::standard(),
            Arc::new(FrameBuffer::new(500)),
            Arc::new(ParameterStore::in_memory()),
            Arc::new(PipelineMetrics::new()),
        )
    }

    fn tick(symbol: &str, seq: u64, ts_ms: i64, price: f64) -> MarketTick {
        MarketTick {
            source: "binance".into(),
            symbol: symbol.into(),
            sequence: seq,
            ts_ms,
            bid: price - 0.5,
            ask: price + 0.5,
            last: price,
            volume: 1.0,
            book_bids: None,
            book_asks: None,
        }
    }

    /// Drive `n` one-minute bars with deterministic prices; returns all
    /// candidates emitted along the way.
    fn drive_bars(
        gen: &SignalGenerator,
        n: usize,
        price_at: impl Fn(usize) -> f64,
    ) -> Vec<SignalCandidate> {
        let mut out = Vec::new();
        let mut seq = 0;
        for i in 0..n {
            let ts = i as i64 * 60_000 + 1_000;
            seq += 1;
            out.extend(gen.handle_tick(&tick("BTCUSDT", seq, ts, price_at(i))));
            // A second tick mid-bar.
            seq += 1;
            out.extend(gen.handle_tick(&tick(
                "BTCUSDT",
                seq,
                ts + 30_000,
                price_at(i) + 0.2,
            )));
        }
        // Close the final bar.
        out.extend(gen.flush(n as i64 * 60_000 + 10_000));
        out
    }

    #[test]
    fn warmup_emits_nothing() {
        let gen = generator();
        let candidates = drive_bars(&gen, 10, |i| 100.0 + i as f64);
        assert!(candidates.is_empty());
        let key = StreamKey::new("BTCUSDT", Timeframe::M1);
        assert_eq!(gen.stream_phase(&key), Some(StreamPhase::Warmup));
        // Frames still published during warmup.
        assert!(gen.metrics.snapshot().frames_published > 0);
    }

    #[test]
    fn active_after_warmup_and_ordering_holds() {
        let gen = generator();
        // V-shaped price path: slide then sharp recovery triggers the RSI
        // reversal somewhere on the turn.
        let candidates = drive_bars(&gen, 120, |i| {
            if i < 80 {
                1_000.0 - i as f64 * 4.0
            } else {
                680.0 + (i - 80) as f64 * 6.0
            }
        });

        let key = StreamKey::new("BTCUSDT", Timeframe::M1);
        assert_eq!(gen.stream_phase(&key), Some(StreamPhase::Active));

        // Ordering invariant within the stream.
        let mut last = 0;
        for c in &candidates {
            assert!(c.close_time_ms >= last, "close times must not regress");
            last = c.close_time_ms;
            assert!((0.0..=1.0).contains(&c.strength));
            assert!((0.0..=1.0).contains(&c.confidence));
            c.validate().unwrap();
        }
    }

    #[test]
    fn duplicate_bar_close_is_memoized() {
        let gen = generator();
        drive_bars(&gen, 30, |i| 100.0 + i as f64);
        let key = StreamKey::new("BTCUSDT", Timeframe::M1);
        let frames_before = gen.metrics.snapshot().frames_published;
        assert!(frames_before > 0);
        // The memo cache holds values for every closed bar.
        assert!(gen.cache.get(&key, 60_000).is_some());
    }

    #[test]
    fn health_sweep_marks_stale_and_failed() {
        let gen = generator();
        drive_bars(&gen, 25, |i| 100.0 + i as f64);
        let key = StreamKey::new("BTCUSDT", Timeframe::M1);

        // Stream last saw ticks around minute 25; two minutes later with a
        // 60 s heartbeat it is silent.
        let later = 27 * 60_000;
        gen.health_sweep(later, 1);
        assert_eq!(gen.stream_phase(&key), Some(StreamPhase::Stale));

        // Stale streams do not emit even if a flush closes bars.
        let emitted = gen.flush(later + 60_000);
        assert!(emitted.is_empty());

        // All exchanges down: FAILED.
        gen.health_sweep(later, 0);
        assert_eq!(gen.stream_phase(&key), Some(StreamPhase::Failed));

        // A fresh tick recovers the stream.
        gen.handle_tick(&tick("BTCUSDT", 9_999, later + 120_000, 130.0));
        assert_ne!(gen.stream_phase(&key), Some(StreamPhase::Failed));
    }

    #[test]
    fn reload_parameters_applies_to_next_bar() {
        let gen = generator();
        // Raise thresholds so high that nothing can pass.
        let set = ParameterSet::baseline()
            .with_num(params::MIN_STRENGTH, 0.999)
            .with_num(params::CONFIDENCE_THRESHOLD, 0.999);
        gen.reload_parameters(set).unwrap();

        let candidates = drive_bars(&gen, 120, |i| {
            if i < 80 {
                1_000.0 - i as f64 * 4.0
            } else {
                680.0 + (i - 80) as f64 * 6.0
            }
        });
        assert!(candidates.is_empty());
        assert!(gen.metrics.snapshot().candidates_below_threshold > 0);
    }

    #[test]
    fn candidate_direction_matches_recovery() {
        let gen = generator();
        let candidates = drive_bars(&gen, 120, |i| {
            if i < 80 {
                1_000.0 - i as f64 * 4.0
            } else {
                680.0 + (i - 80) as f64 * 6.0
            }
        });
        // Any RSI-reversal candidates on the recovery leg are longs.
        for c in candidates.iter().filter(|c| c.strategy == "rsi_reversal") {
            assert_eq!(c.direction, Direction::Long);
        }
    }
}
