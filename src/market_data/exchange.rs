// =============================================================================
// Exchange feeds — streaming ingestion with dedup, heartbeat, and failover
// =============================================================================
//
// One connection supervisor per exchange: it (a) keeps the streaming
// connection alive with jittered exponential backoff, (b) deduplicates
// against a sliding window of recent (source, symbol, sequence) triples, and
// (c) fans validated ticks into the bounded P1 channel.
//
// The network receive path never blocks: a full downstream queue drops the
// tick and bumps a counter.
//
// Failover: for each symbol only the exchange with the most recent valid
// tick is forwarded. An exchange silent past the heartbeat window falls out
// of consensus until it speaks again.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::errors::NoHealthyExchange;
use crate::metrics::PipelineMetrics;
use crate::types::MarketTick;

// ---------------------------------------------------------------------------
// Feed trait + WebSocket implementation
// ---------------------------------------------------------------------------

/// One upstream streaming connection. `run` drives the connection until it
/// drops, sending every parsed tick into `out`; the supervisor handles
/// reconnection.
#[async_trait]
pub trait ExchangeFeed: Send + Sync {
    fn id(&self) -> &str;

    async fn run(&self, out: mpsc::Sender<MarketTick>) -> Result<()>;
}

/// WebSocket tick feed speaking the normalized book-ticker shape:
///
/// ```json
/// { "s": "BTCUSDT", "u": 12345, "E": 1700000000000,
///   "b": "37000.10", "a": "37000.60", "c": "37000.30", "v": "1.25" }
/// ```
pub struct WsTickFeed {
    id: String,
    url: String,
    symbols: Vec<String>,
}

impl WsTickFeed {
    pub fn new(id: impl Into<String>, url: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            symbols,
        }
    }
}

#[async_trait]
impl ExchangeFeed for WsTickFeed {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, out: mpsc::Sender<MarketTick>) -> Result<()> {
        let streams = self
            .symbols
            .iter()
            .map(|s| s.to_lowercase())
            .collect::<Vec<_>>()
            .join("/");
        let url = format!("{}/{streams}", self.url);
        info!(exchange = %self.id, url = %url, "connecting tick WebSocket");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect tick WebSocket")?;

        info!(exchange = %self.id, "tick WebSocket connected");
        let (_write, mut read) = ws_stream.split();

        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_tick_message(&self.id, &text) {
                            Ok(tick) => {
                                debug!(exchange = %self.id, symbol = %tick.symbol, seq = tick.sequence, "tick");
                                if out.send(tick).await.is_err() {
                                    // Supervisor is gone; stop cleanly.
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                warn!(exchange = %self.id, error = %e, "failed to parse tick message");
                            }
                        }
                    }
                    // Ping/Pong/Binary/Close frames are handled by tungstenite.
                }
                Some(Err(e)) => {
                    error!(exchange = %self.id, error = %e, "tick WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(exchange = %self.id, "tick WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

/// Parse one tick message into a `MarketTick`.
pub fn parse_tick_message(source: &str, text: &str) -> Result<MarketTick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse tick JSON")?;

    // Support a combined-stream envelope as well as the direct payload.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();
    let sequence = data["u"].as_u64().context("missing field u")?;
    let ts_ms = data["E"].as_i64().context("missing field E")?;

    let bid = parse_string_f64(&data["b"], "b")?;
    let ask = parse_string_f64(&data["a"], "a")?;
    let last = parse_string_f64(&data["c"], "c")?;
    let volume = parse_string_f64(&data["v"], "v")?;

    Ok(MarketTick {
        source: source.to_string(),
        symbol,
        sequence,
        ts_ms,
        bid,
        ask,
        last,
        volume,
        book_bids: None,
        book_asks: None,
    })
}

/// Exchanges send numeric values as JSON strings inside tick objects.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Dedup window
// ---------------------------------------------------------------------------

/// Sliding-window set of recently seen (source, symbol, sequence) triples.
struct DedupWindow {
    seen: HashSet<(String, String, u64)>,
    order: VecDeque<(String, String, u64)>,
    cap: usize,
}

impl DedupWindow {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Returns true when the triple was already present.
    fn check_and_insert(&mut self, source: &str, symbol: &str, sequence: u64) -> bool {
        let key = (source.to_string(), symbol.to_string(), sequence);
        if self.seen.contains(&key) {
            return true;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Health board
// ---------------------------------------------------------------------------

/// Last-tick bookkeeping per exchange and per (exchange, symbol). Drives the
/// heartbeat exclusion and the per-symbol failover choice.
pub struct HealthBoard {
    last_by_exchange: RwLock<HashMap<String, i64>>,
    last_by_pair: RwLock<HashMap<(String, String), i64>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self {
            last_by_exchange: RwLock::new(HashMap::new()),
            last_by_pair: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, source: &str, symbol: &str, ts_ms: i64) {
        let mut by_ex = self.last_by_exchange.write();
        let entry = by_ex.entry(source.to_string()).or_insert(ts_ms);
        if ts_ms > *entry {
            *entry = ts_ms;
        }
        drop(by_ex);

        let mut by_pair = self.last_by_pair.write();
        let entry = by_pair
            .entry((source.to_string(), symbol.to_string()))
            .or_insert(ts_ms);
        if ts_ms > *entry {
            *entry = ts_ms;
        }
    }

    /// Exchanges with a tick inside the heartbeat window.
    pub fn healthy(&self, now_ms: i64, heartbeat_ms: i64) -> Vec<String> {
        self.last_by_exchange
            .read()
            .iter()
            .filter(|(_, &last)| now_ms - last <= heartbeat_ms)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether a specific exchange is inside the heartbeat window.
    pub fn is_healthy(&self, source: &str, now_ms: i64, heartbeat_ms: i64) -> bool {
        self.last_by_exchange
            .read()
            .get(source)
            .is_some_and(|&last| now_ms - last <= heartbeat_ms)
    }

    /// The healthy exchange with the most recent valid tick for `symbol`.
    pub fn best_source(&self, symbol: &str, now_ms: i64, heartbeat_ms: i64) -> Option<String> {
        let by_pair = self.last_by_pair.read();
        by_pair
            .iter()
            .filter(|((src, sym), &last)| {
                sym == symbol
                    && now_ms - last <= heartbeat_ms
                    && self.is_healthy(src, now_ms, heartbeat_ms)
            })
            .max_by_key(|(_, &last)| last)
            .map(|((src, _), _)| src.clone())
    }
}

impl Default for HealthBoard {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Full-jitter exponential backoff: `min(cap, initial * 2^attempt)` scaled
/// by a uniform factor in [0.5, 1.0].
pub fn backoff_delay(attempt: u32, initial_ms: u64, cap_ms: u64) -> Duration {
    let exp = initial_ms.saturating_mul(1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX));
    let base = exp.min(cap_ms).max(1);
    let factor = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_millis((base as f64 * factor) as u64)
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns every exchange feed, the dedup window, and the health board; fans
/// validated ticks into the bounded P1 channel.
pub struct FeedSupervisor {
    feeds: Vec<Arc<dyn ExchangeFeed>>,
    cfg: IngestConfig,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthBoard>,
    dedup: Mutex<DedupWindow>,
}

impl FeedSupervisor {
    pub fn new(
        feeds: Vec<Arc<dyn ExchangeFeed>>,
        cfg: IngestConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let dedup = Mutex::new(DedupWindow::new(cfg.tick_dedup_window));
        Self {
            feeds,
            cfg,
            metrics,
            health: Arc::new(HealthBoard::new()),
            dedup,
        }
    }

    pub fn health(&self) -> Arc<HealthBoard> {
        self.health.clone()
    }

    /// Spawn one reconnect-supervised task per feed plus the fan-in task.
    /// Ticks that survive validation, dedup, and failover land in `out`.
    pub fn spawn(
        self: Arc<Self>,
        out: mpsc::Sender<MarketTick>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<MarketTick>(self.cfg.tick_dedup_window.max(64));
        let mut handles = Vec::new();

        for feed in &self.feeds {
            let feed = feed.clone();
            let raw_tx = raw_tx.clone();
            let metrics = self.metrics.clone();
            let mut shutdown = shutdown.clone();
            let initial_ms = self.cfg.reconnect_initial_ms;
            let cap_ms = self.cfg.reconnect_cap_ms;

            handles.push(tokio::spawn(async move {
                let mut attempt: u32 = 0;
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match feed.run(raw_tx.clone()).await {
                        Ok(()) => {
                            warn!(exchange = %feed.id(), "feed ended; reconnecting");
                            attempt = 0;
                        }
                        Err(e) => {
                            error!(exchange = %feed.id(), error = %e, "feed error; reconnecting");
                        }
                    }
                    metrics
                        .exchange_reconnects
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                    let delay = backoff_delay(attempt, initial_ms, cap_ms);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }
        drop(raw_tx);

        // Fan-in: validate, dedup, health, failover, forward.
        let supervisor = self.clone();
        let mut shutdown_rx = shutdown;
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = raw_rx.recv() => {
                        match maybe {
                            Some(tick) => {
                                let now_ms = Utc::now().timestamp_millis();
                                supervisor.process_tick(tick, now_ms, &out);
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        handles
    }

    /// Validate, dedup, record health, apply failover, and forward without
    /// blocking. Exposed at this granularity so tests can drive it with a
    /// pinned clock.
    pub fn process_tick(&self, tick: MarketTick, now_ms: i64, out: &mpsc::Sender<MarketTick>) {
        use std::sync::atomic::Ordering::Relaxed;

        if let Err(reason) = tick.validate() {
            self.metrics.ticks_dropped_invalid.fetch_add(1, Relaxed);
            self.metrics.bump_reason("invalid_tick");
            debug!(source = %tick.source, symbol = %tick.symbol, %reason, "tick rejected");
            return;
        }

        if self
            .dedup
            .lock()
            .check_and_insert(&tick.source, &tick.symbol, tick.sequence)
        {
            self.metrics.ticks_deduplicated.fetch_add(1, Relaxed);
            return;
        }

        self.health.record(&tick.source, &tick.symbol, tick.ts_ms);

        let heartbeat_ms = self.cfg.heartbeat_secs as i64 * 1_000;
        match self.health.best_source(&tick.symbol, now_ms, heartbeat_ms) {
            Some(best) if best == tick.source => {}
            Some(_) => {
                // Another exchange is fresher for this symbol.
                self.metrics.bump_reason("non_preferred_source");
                return;
            }
            None => {
                // The tick itself is outside the heartbeat window.
                self.metrics.bump_reason("stale_tick");
                return;
            }
        }

        self.metrics.ticks_ingested.fetch_add(1, Relaxed);
        if out.try_send(tick).is_err() {
            // Bounded queue full (or receiver gone): drop, never block.
            self.metrics.ticks_dropped_overflow.fetch_add(1, Relaxed);
        }
    }

    /// Block until at least `quorum` exchanges look healthy, or the bounded
    /// retry window elapses.
    pub async fn await_quorum(&self) -> Result<(), NoHealthyExchange> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.cfg.subscribe_retry_window_secs);
        let heartbeat_ms = self.cfg.heartbeat_secs as i64 * 1_000;

        loop {
            let now_ms = Utc::now().timestamp_millis();
            let healthy = self.health.healthy(now_ms, heartbeat_ms).len();
            if healthy >= self.cfg.quorum {
                info!(healthy, quorum = self.cfg.quorum, "exchange quorum reached");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NoHealthyExchange {
                    healthy,
                    required: self.cfg.quorum,
                });
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;

    fn tick(source: &str, symbol: &str, seq: u64, ts_ms: i64) -> MarketTick {
        MarketTick {
            source: source.into(),
            symbol: symbol.into(),
            sequence: seq,
            ts_ms,
            bid: 100.0,
            ask: 100.1,
            last: 100.05,
            volume: 1.0,
            book_bids: None,
            book_asks: None,
        }
    }

    fn supervisor() -> Arc<FeedSupervisor> {
        Arc::new(FeedSupervisor::new(
            Vec::new(),
            IngestConfig::default(),
            Arc::new(PipelineMetrics::new()),
        ))
    }

    #[test]
    fn parse_tick_ok() {
        let json = r#"{
            "s": "BTCUSDT", "u": 42, "E": 1700000000000,
            "b": "37000.10", "a": "37000.60", "c": "37000.30", "v": "1.25"
        }"#;
        let t = parse_tick_message("binance", json).unwrap();
        assert_eq!(t.source, "binance");
        assert_eq!(t.symbol, "BTCUSDT");
        assert_eq!(t.sequence, 42);
        assert!((t.bid - 37_000.10).abs() < 1e-9);
        assert!((t.volume - 1.25).abs() < 1e-9);
    }

    #[test]
    fn parse_tick_envelope_and_missing_field() {
        let wrapped = r#"{"stream":"btcusdt@ticker","data":{
            "s":"BTCUSDT","u":7,"E":1700000000000,
            "b":"1.0","a":"1.1","c":"1.05","v":"3"
        }}"#;
        assert!(parse_tick_message("x", wrapped).is_ok());

        let broken = r#"{"s":"BTCUSDT","u":7,"b":"1.0","a":"1.1","c":"1.05","v":"3"}"#;
        assert!(parse_tick_message("x", broken).is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..20 {
            let d0 = backoff_delay(0, 1_000, 60_000);
            assert!(d0 >= Duration::from_millis(500) && d0 <= Duration::from_millis(1_000));

            let d_big = backoff_delay(12, 1_000, 60_000);
            assert!(d_big <= Duration::from_millis(60_000));
            assert!(d_big >= Duration::from_millis(30_000));
        }
    }

    #[tokio::test]
    async fn duplicate_tick_is_filtered() {
        let sup = supervisor();
        let (tx, mut rx) = mpsc::channel(16);
        let now = 1_700_000_000_000;

        sup.process_tick(tick("binance", "BTCUSDT", 1, now), now, &tx);
        sup.process_tick(tick("binance", "BTCUSDT", 1, now), now, &tx);

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        let snap = sup.metrics.snapshot();
        assert_eq!(snap.ticks_ingested, 1);
        assert_eq!(snap.ticks_deduplicated, 1);
    }

    #[tokio::test]
    async fn invalid_tick_is_dropped() {
        let sup = supervisor();
        let (tx, mut rx) = mpsc::channel(16);
        let now = 1_700_000_000_000;

        let mut bad = tick("binance", "BTCUSDT", 1, now);
        bad.last = f64::NAN;
        sup.process_tick(bad, now, &tx);

        assert!(rx.try_recv().is_err());
        assert_eq!(sup.metrics.snapshot().ticks_dropped_invalid, 1);
    }

    #[tokio::test]
    async fn failover_prefers_freshest_source() {
        let sup = supervisor();
        let (tx, mut rx) = mpsc::channel(16);
        let now = 1_700_000_000_000;

        // Exchange A speaks first, then B with a fresher event time.
        sup.process_tick(tick("a", "BTCUSDT", 1, now - 5_000), now, &tx);
        sup.process_tick(tick("b", "BTCUSDT", 1, now - 1_000), now, &tx);
        // A's next tick is still older than B's freshest: filtered.
        sup.process_tick(tick("a", "BTCUSDT", 2, now - 4_000), now, &tx);
        // B keeps flowing.
        sup.process_tick(tick("b", "BTCUSDT", 2, now), now, &tx);

        let mut forwarded = Vec::new();
        while let Ok(t) = rx.try_recv() {
            forwarded.push((t.source.clone(), t.sequence));
        }
        assert_eq!(
            forwarded,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 1),
                ("b".to_string(), 2)
            ]
        );
        assert_eq!(sup.metrics.reason_count("non_preferred_source"), 1);
    }

    #[tokio::test]
    async fn silent_exchange_excluded_from_consensus() {
        let sup = supervisor();
        let (tx, _rx) = mpsc::channel(16);
        let heartbeat_ms = IngestConfig::default().heartbeat_secs as i64 * 1_000;
        let t0 = 1_700_000_000_000;

        sup.process_tick(tick("a", "BTCUSDT", 1, t0), t0, &tx);
        sup.process_tick(tick("b", "BTCUSDT", 1, t0 + 1_000), t0 + 1_000, &tx);

        // 120 s later only exchange B has spoken recently.
        let later = t0 + 120_000;
        sup.health().record("b", "BTCUSDT", later - 1_000);
        let healthy = sup.health().healthy(later, heartbeat_ms);
        assert_eq!(healthy, vec!["b".to_string()]);
        assert!(sup
            .health()
            .best_source("BTCUSDT", later, heartbeat_ms)
            .is_some_and(|s| s == "b"));
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let sup = supervisor();
        let (tx, mut rx) = mpsc::channel(1);
        let now = 1_700_000_000_000;

        sup.process_tick(tick("binance", "BTCUSDT", 1, now), now, &tx);
        sup.process_tick(tick("binance", "BTCUSDT", 2, now), now, &tx);

        assert_eq!(sup.metrics.snapshot().ticks_dropped_overflow, 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn quorum_gate_times_out() {
        let mut cfg = IngestConfig::default();
        cfg.quorum = 2;
        cfg.subscribe_retry_window_secs = 0;
        let sup = Arc::new(FeedSupervisor::new(
            Vec::new(),
            cfg,
            Arc::new(PipelineMetrics::new()),
        ));
        let err = sup.await_quorum().await.unwrap_err();
        assert_eq!(err.required, 2);
        assert_eq!(err.healthy, 0);
    }
}
