// =============================================================================
// Shared types used across the Meridian signal pipeline
// =============================================================================
//
// Every record that crosses a phase boundary lives here as an explicit struct
// with a validated constructor. Validation failures are classified as
// `Validation` drops by the phase that encountered them; nothing in this
// module panics on bad input.
// =============================================================================

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Direction / priority / timeframe
// ---------------------------------------------------------------------------

/// Trade direction of a candidate or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// The opposite side. REPLACE decisions target the opposite-direction
    /// position.
    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Notification urgency band. Ordering: `Critical` outranks everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityBand {
    Critical,
    High,
    Medium,
    Low,
}

impl PriorityBand {
    /// Rank used by the dispatch heap: lower is more urgent.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

/// Bar aggregation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
}

impl Timeframe {
    /// Interval length in milliseconds.
    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::H1 => 3_600_000,
        }
    }

    /// The open time of the bar that contains `ts_ms`.
    pub fn bar_open(self, ts_ms: i64) -> i64 {
        let d = self.duration_ms();
        ts_ms.div_euclid(d) * d
    }

    /// The close time (exclusive boundary) of the bar that contains `ts_ms`.
    pub fn bar_close(self, ts_ms: i64) -> i64 {
        self.bar_open(ts_ms) + self.duration_ms()
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::M1 => write!(f, "1m"),
            Self::M5 => write!(f, "5m"),
            Self::M15 => write!(f, "15m"),
            Self::H1 => write!(f, "1h"),
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// Composite key that identifies one (symbol, timeframe) stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl StreamKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// Market regime
// ---------------------------------------------------------------------------

/// Discrete market-state label stamped on candidates at emission and carried
/// into outcome records for learning partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegimeLabel {
    TrendingBull,
    TrendingBear,
    RangeBound,
    HighVolatility,
}

impl Default for RegimeLabel {
    fn default() -> Self {
        Self::RangeBound
    }
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrendingBull => write!(f, "TRENDING_BULL"),
            Self::TrendingBear => write!(f, "TRENDING_BEAR"),
            Self::RangeBound => write!(f, "RANGE_BOUND"),
            Self::HighVolatility => write!(f, "HIGH_VOLATILITY"),
        }
    }
}

// ---------------------------------------------------------------------------
// MarketTick
// ---------------------------------------------------------------------------

/// One level of the order-book top-N snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
}

/// A single immutable market observation for one symbol.
///
/// Identity is `(source, symbol, sequence)`; the ingestion supervisor dedups
/// on that triple before anything downstream sees the tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTick {
    /// Originating exchange id (e.g. "binance").
    pub source: String,
    pub symbol: String,
    /// Monotonic per-(source, symbol) sequence number.
    pub sequence: u64,
    /// Event timestamp, UTC milliseconds.
    pub ts_ms: i64,
    pub bid: f64,
    pub ask: f64,
    /// Last trade price.
    pub last: f64,
    /// Traded volume since the previous tick.
    pub volume: f64,
    /// Optional top-N book snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_bids: Option<Vec<BookLevel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_asks: Option<Vec<BookLevel>>,
}

impl MarketTick {
    /// Mid price between best bid and ask.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Spread in basis points of the mid, when the book is sane.
    pub fn spread_bps(&self) -> Option<f64> {
        let mid = self.mid();
        if mid > 0.0 && self.ask >= self.bid {
            Some((self.ask - self.bid) / mid * 10_000.0)
        } else {
            None
        }
    }

    /// Reject ticks with non-finite or non-positive prices or a crossed book.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.is_empty() {
            return Err("empty symbol".into());
        }
        for (name, v) in [("bid", self.bid), ("ask", self.ask), ("last", self.last)] {
            if !v.is_finite() || v <= 0.0 {
                return Err(format!("{name} is not a positive finite price: {v}"));
            }
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(format!("volume is invalid: {}", self.volume));
        }
        if self.ask < self.bid {
            return Err(format!("crossed book: bid {} > ask {}", self.bid, self.ask));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bars and indicator frames
// ---------------------------------------------------------------------------

/// OHLCV aggregate over one timeframe interval for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub tick_count: u64,
}

impl OhlcvBar {
    /// Seed a bar from its first tick.
    pub fn seed(open_time_ms: i64, close_time_ms: i64, price: f64, volume: f64) -> Self {
        Self {
            open_time_ms,
            close_time_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            tick_count: 1,
        }
    }

    /// Fold one more tick into the bar.
    pub fn apply(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
        self.tick_count += 1;
    }
}

/// Snapshot of computed indicators for one (symbol, timeframe) bar close.
///
/// Immutable after publication; retained in a per-timeframe ring buffer and
/// evicted together with its memoized indicator values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorFrame {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub close_time_ms: i64,
    pub bar: OhlcvBar,
    /// indicator name -> value. NaN marks an indicator whose inputs were
    /// unavailable; `data_completeness` reflects the NaN proportion.
    pub values: HashMap<String, f64>,
    /// Fraction of requested indicators that produced a finite value, in
    /// [0, 1]. An empty indicator set yields 1.0.
    pub data_completeness: f64,
}

impl IndicatorFrame {
    /// Finite value for `name`, if computed.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().filter(|v| v.is_finite())
    }
}

// ---------------------------------------------------------------------------
// SignalCandidate
// ---------------------------------------------------------------------------

/// The five data-quality sub-scores attached to every candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityScores {
    pub data_completeness: f64,
    pub signal_clarity: f64,
    pub confidence: f64,
    pub volatility_fit: f64,
    pub liquidity_fit: f64,
}

impl QualityScores {
    /// Sub-scores in a fixed order matching the quality-weight parameters.
    pub fn as_array(&self) -> [f64; 5] {
        [
            self.data_completeness,
            self.signal_clarity,
            self.confidence,
            self.volatility_fit,
            self.liquidity_fit,
        ]
    }

    /// Minimum across the five sub-scores.
    pub fn min(&self) -> f64 {
        self.as_array().iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("data_completeness", self.data_completeness),
            ("signal_clarity", self.signal_clarity),
            ("confidence", self.confidence),
            ("volatility_fit", self.volatility_fit),
            ("liquidity_fit", self.liquidity_fit),
        ] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(format!("quality sub-score {name} out of [0,1]: {v}"));
            }
        }
        Ok(())
    }
}

/// A proposed trade action, created in P1, annotated through P2/P3 and
/// terminal in P4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalCandidate {
    /// Deterministic composite id: `symbol:timeframe:close_time:strategy`.
    pub id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Close time of the IndicatorFrame this candidate references.
    pub close_time_ms: i64,
    pub direction: Direction,
    /// Signal magnitude in [0, 1].
    pub strength: f64,
    /// Strategy confidence in [0, 1].
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// After this instant the candidate is no longer actionable.
    pub expires_at_ms: i64,
    /// Originating strategy tag.
    pub strategy: String,
    /// Copy of the IndicatorFrame values the strategy used.
    pub features: HashMap<String, f64>,
    pub quality: QualityScores,
    /// Provisional in P1; P2's quality gate re-buckets.
    pub band: PriorityBand,
    /// Regime label at emission time.
    pub regime: RegimeLabel,
    pub emitted_at_ms: i64,
}

impl SignalCandidate {
    /// Compose the deterministic candidate id.
    pub fn compose_id(
        symbol: &str,
        timeframe: Timeframe,
        close_time_ms: i64,
        strategy: &str,
    ) -> String {
        format!("{symbol}:{timeframe}:{close_time_ms}:{strategy}")
    }

    /// Validate the [0,1] range invariants and price sanity. A candidate
    /// failing this never leaves P1.
    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [("strength", self.strength), ("confidence", self.confidence)] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(format!("{name} out of [0,1]: {v}"));
            }
        }
        self.quality.validate()?;
        for (name, v) in [
            ("entry_price", self.entry_price),
            ("stop_loss", self.stop_loss),
            ("take_profit", self.take_profit),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(format!("{name} is not a positive finite price: {v}"));
            }
        }
        if self.expires_at_ms <= self.emitted_at_ms {
            return Err("candidate already expired at emission".into());
        }
        match self.direction {
            Direction::Long if self.stop_loss >= self.entry_price => {
                Err("long stop-loss must sit below entry".into())
            }
            Direction::Short if self.stop_loss <= self.entry_price => {
                Err("short stop-loss must sit above entry".into())
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Position lifecycle. CLOSING is entered when a REPLACE decision schedules
/// the close; CLOSED arrives from the execution collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// An active tracked exposure for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// UUID v4.
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_time_ms: i64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Unitless size.
    pub size: f64,
    /// Candidate that originated this position.
    pub origin_candidate: String,
    /// Composite score of the originating candidate at decision time.
    pub origin_composite: f64,
    /// Confidence of the originating candidate at decision time.
    pub origin_confidence: f64,
    /// Expiry of the originating candidate; compared against challengers.
    pub origin_expires_at_ms: i64,
    pub status: PositionStatus,
}

// ---------------------------------------------------------------------------
// ExecutionDecision
// ---------------------------------------------------------------------------

/// P3 output classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Replace,
    Strengthen,
    New,
    Ignore,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace => write!(f, "REPLACE"),
            Self::Strengthen => write!(f, "STRENGTHEN"),
            Self::New => write!(f, "NEW"),
            Self::Ignore => write!(f, "IGNORE"),
        }
    }
}

/// Machine-readable reason attached to every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RationaleCode {
    /// No open exposure for (symbol, direction); caps respected.
    FreshSymbol,
    /// Opposite-direction open beaten by the configured replace margin.
    OppositeOutscored,
    /// Same-direction open reinforced within exposure bounds.
    SameDirectionBoost,
    /// Open same-direction position is at least as confident and outlives
    /// the candidate.
    WeakerThanOpen,
    /// Per-symbol risk budget exhausted.
    RiskBudgetExhausted,
    /// A REPLACE fired for this symbol inside the cooldown window.
    ReplaceCooldown,
    /// Per-symbol lock could not be acquired inside the bounded wait, or the
    /// target position was already CLOSING.
    Contention,
    /// Risk/reward fell below the floor after volatility clamping.
    RewardFloor,
    /// Symbol-level or global position count cap reached.
    PositionCapReached,
    /// Hedged exposure requested while hedging is disabled.
    HedgingDisabled,
}

impl std::fmt::Display for RationaleCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FreshSymbol => "FRESH_SYMBOL",
            Self::OppositeOutscored => "OPPOSITE_OUTSCORED",
            Self::SameDirectionBoost => "SAME_DIRECTION_BOOST",
            Self::WeakerThanOpen => "WEAKER_THAN_OPEN",
            Self::RiskBudgetExhausted => "RISK_BUDGET_EXHAUSTED",
            Self::ReplaceCooldown => "REPLACE_COOLDOWN",
            Self::Contention => "CONTENTION",
            Self::RewardFloor => "REWARD_FLOOR",
            Self::PositionCapReached => "POSITION_CAP_REACHED",
            Self::HedgingDisabled => "HEDGING_DISABLED",
        };
        write!(f, "{s}")
    }
}

/// Produced by P3 for every vetted candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDecision {
    /// UUID v4.
    pub id: String,
    pub candidate_id: String,
    pub symbol: String,
    pub verdict: Verdict,
    /// Target open position for REPLACE / STRENGTHEN; `None` for NEW.
    pub target_position: Option<String>,
    pub rationale: RationaleCode,
    /// Expected risk/reward after volatility clamping.
    pub risk_reward: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub decided_at_ms: i64,
}

// ---------------------------------------------------------------------------
// Outcomes and position events
// ---------------------------------------------------------------------------

/// Why a position closed (or a candidate timed out without activation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClosureReason {
    TakeProfit,
    StopLoss,
    Timeout,
    Manual,
    Replaced,
}

impl std::fmt::Display for ClosureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TakeProfit => "TAKE_PROFIT",
            Self::StopLoss => "STOP_LOSS",
            Self::Timeout => "TIMEOUT",
            Self::Manual => "MANUAL",
            Self::Replaced => "REPLACED",
        };
        write!(f, "{s}")
    }
}

/// Produced when a position closes or a candidate times out unactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub candidate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    pub reason: ClosureReason,
    /// Realized PnL as a percentage of entry (positive = win).
    pub pnl_pct: f64,
    pub hold_duration_ms: i64,
    /// Feature snapshot carried forward from the originating candidate.
    pub features: HashMap<String, f64>,
    /// Regime label at entry.
    pub regime: RegimeLabel,
    pub strategy: String,
    pub symbol: String,
    pub closed_at_ms: i64,
}

/// External lifecycle events delivered to P3 by the execution collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PositionEvent {
    /// The collaborator confirmed the order filled; the position is live.
    Activated { position_id: String },
    /// The collaborator began closing the position.
    Closing { position_id: String },
    /// The position fully closed at `price`.
    Closed {
        position_id: String,
        reason: ClosureReason,
        price: f64,
        ts_ms: i64,
    },
    /// Mark price update for stop/take-profit evaluation.
    PriceUpdate {
        symbol: String,
        price: f64,
        ts_ms: i64,
    },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// UTC calendar day ("YYYY-MM-DD") for a millisecond timestamp. Used by the
/// P4 per-day notification dedup.
pub fn utc_day(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "invalid".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candidate() -> SignalCandidate {
        SignalCandidate {
            id: SignalCandidate::compose_id("BTCUSDT", Timeframe::M5, 300_000, "rsi_reversal"),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M5,
            close_time_ms: 300_000,
            direction: Direction::Long,
            strength: 0.82,
            confidence: 0.75,
            entry_price: 37_000.0,
            stop_loss: 36_700.0,
            take_profit: 37_600.0,
            expires_at_ms: 1_200_000,
            strategy: "rsi_reversal".into(),
            features: HashMap::new(),
            quality: QualityScores {
                data_completeness: 1.0,
                signal_clarity: 0.8,
                confidence: 0.75,
                volatility_fit: 0.7,
                liquidity_fit: 0.9,
            },
            band: PriorityBand::Medium,
            regime: RegimeLabel::RangeBound,
            emitted_at_ms: 300_000,
        }
    }

    #[test]
    fn valid_candidate_passes() {
        assert!(sample_candidate().validate().is_ok());
    }

    #[test]
    fn strength_out_of_range_rejected() {
        let mut c = sample_candidate();
        c.strength = 1.2;
        assert!(c.validate().is_err());
        c.strength = f64::NAN;
        assert!(c.validate().is_err());
    }

    #[test]
    fn quality_subscore_out_of_range_rejected() {
        let mut c = sample_candidate();
        c.quality.volatility_fit = -0.1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn long_stop_above_entry_rejected() {
        let mut c = sample_candidate();
        c.stop_loss = 37_500.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn short_stop_below_entry_rejected() {
        let mut c = sample_candidate();
        c.direction = Direction::Short;
        c.stop_loss = 36_000.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn expired_at_emission_rejected() {
        let mut c = sample_candidate();
        c.expires_at_ms = c.emitted_at_ms;
        assert!(c.validate().is_err());
    }

    #[test]
    fn tick_validation() {
        let tick = MarketTick {
            source: "binance".into(),
            symbol: "BTCUSDT".into(),
            sequence: 1,
            ts_ms: 1_700_000_000_000,
            bid: 37_000.0,
            ask: 37_001.0,
            last: 37_000.5,
            volume: 1.25,
            book_bids: None,
            book_asks: None,
        };
        assert!(tick.validate().is_ok());
        assert!((tick.mid() - 37_000.5).abs() < 1e-9);

        let mut crossed = tick.clone();
        crossed.bid = 37_010.0;
        assert!(crossed.validate().is_err());

        let mut nan = tick;
        nan.last = f64::NAN;
        assert!(nan.validate().is_err());
    }

    #[test]
    fn bar_boundaries() {
        let tf = Timeframe::M5;
        assert_eq!(tf.bar_open(301_000), 300_000);
        assert_eq!(tf.bar_close(301_000), 600_000);
        assert_eq!(tf.bar_open(300_000), 300_000);
        assert_eq!(Timeframe::M1.bar_close(0), 60_000);
    }

    #[test]
    fn bar_fold() {
        let mut bar = OhlcvBar::seed(0, 60_000, 100.0, 2.0);
        bar.apply(103.0, 1.0);
        bar.apply(99.0, 0.5);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 103.0);
        assert_eq!(bar.low, 99.0);
        assert_eq!(bar.close, 99.0);
        assert!((bar.volume - 3.5).abs() < 1e-12);
        assert_eq!(bar.tick_count, 3);
    }

    #[test]
    fn priority_band_rank_order() {
        assert!(PriorityBand::Critical.rank() < PriorityBand::High.rank());
        assert!(PriorityBand::High.rank() < PriorityBand::Medium.rank());
        assert!(PriorityBand::Medium.rank() < PriorityBand::Low.rank());
    }

    #[test]
    fn utc_day_buckets() {
        // 2023-11-14T22:13:20Z
        assert_eq!(utc_day(1_700_000_000_000), "2023-11-14");
        // One ms before the next midnight stays in the same bucket.
        assert_eq!(utc_day(1_700_006_399_999), "2023-11-14");
    }

    #[test]
    fn direction_opposite() {
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Short.opposite(), Direction::Long);
    }

    #[test]
    fn timeframe_parse_roundtrip() {
        for tf in [Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1] {
            let s = tf.to_string();
            assert_eq!(s.parse::<Timeframe>().unwrap(), tf);
        }
        assert!("7m".parse::<Timeframe>().is_err());
    }
}
