// =============================================================================
// Position book — the authoritative symbol -> {LONG?, SHORT?} map
// =============================================================================
//
// The only cross-phase mutable state in the pipeline. Guarded by striped
// per-symbol locks: a symbol hashes to a stripe, decisions acquire the
// stripe with a bounded wait, and no I/O ever happens while a stripe is
// held (the journal is appended after release).
//
// Recovery: decisions and position events are appended to a JSONL journal;
// replaying it reconstructs the open-position map after a restart.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{ClosureReason, Direction, Position, PositionEvent, PositionStatus};

const STRIPES: usize = 16;

/// Open exposure for one symbol: at most one position per direction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolPositions {
    pub long: Option<Position>,
    pub short: Option<Position>,
}

impl SymbolPositions {
    pub fn get(&self, direction: Direction) -> Option<&Position> {
        match direction {
            Direction::Long => self.long.as_ref(),
            Direction::Short => self.short.as_ref(),
        }
    }

    pub fn get_mut(&mut self, direction: Direction) -> Option<&mut Position> {
        match direction {
            Direction::Long => self.long.as_mut(),
            Direction::Short => self.short.as_mut(),
        }
    }

    pub fn set(&mut self, position: Position) {
        match position.direction {
            Direction::Long => self.long = Some(position),
            Direction::Short => self.short = Some(position),
        }
    }

    pub fn clear(&mut self, direction: Direction) -> Option<Position> {
        match direction {
            Direction::Long => self.long.take(),
            Direction::Short => self.short.take(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.long.is_some() as usize + self.short.is_some() as usize
    }

    /// Cumulative at-risk percentage across open positions: distance to
    /// stop as a percent of entry, weighted by size.
    pub fn risk_pct(&self) -> f64 {
        [&self.long, &self.short]
            .into_iter()
            .flatten()
            .map(|p| {
                if p.entry_price > 0.0 {
                    (p.entry_price - p.stop_loss).abs() / p.entry_price * 100.0 * p.size
                } else {
                    0.0
                }
            })
            .sum()
    }
}

/// One line of the recovery journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalEntry {
    Opened(Position),
    Event(PositionEvent),
}

/// Striped, journaled position book.
pub struct PositionBook {
    stripes: Vec<Mutex<HashMap<String, SymbolPositions>>>,
    /// Global open-position count, kept in lockstep with the stripes.
    open_count: AtomicU64,
    journal_path: Option<PathBuf>,
    journal: Mutex<Option<std::fs::File>>,
}

impl PositionBook {
    pub fn in_memory() -> Self {
        Self::build(None)
    }

    /// Book journaled under `dir/positions.jsonl`, replaying any existing
    /// journal to reconstruct the open map.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())
            .with_context(|| format!("failed to create {}", dir.as_ref().display()))?;
        let path = dir.as_ref().join("positions.jsonl");
        let book = Self::build(Some(path.clone()));

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read journal {}", path.display()))?;
            let mut replayed = 0usize;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<JournalEntry>(line) {
                    Ok(entry) => {
                        book.apply_entry(entry);
                        replayed += 1;
                    }
                    Err(e) => warn!(error = %e, "skipping corrupt journal line"),
                }
            }
            info!(replayed, open = book.total_open(), "position journal replayed");
        }

        Ok(book)
    }

    fn build(journal_path: Option<PathBuf>) -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
            open_count: AtomicU64::new(0),
            journal_path,
            journal: Mutex::new(None),
        }
    }

    fn stripe_for(&self, symbol: &str) -> &Mutex<HashMap<String, SymbolPositions>> {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % STRIPES]
    }

    /// Run `f` under the symbol's stripe lock, waiting at most `timeout`.
    /// Returns `None` on lock timeout (the CONTENTION path).
    pub fn with_symbol<R>(
        &self,
        symbol: &str,
        timeout: Duration,
        f: impl FnOnce(&mut SymbolPositions) -> R,
    ) -> Option<R> {
        let stripe = self.stripe_for(symbol);
        let mut guard = stripe.try_lock_for(timeout)?;
        let before = guard.get(symbol).map_or(0, SymbolPositions::open_count);
        let entry = guard.entry(symbol.to_string()).or_default();
        let result = f(entry);
        let after = entry.open_count();
        drop(guard);

        // Keep the global gauge in lockstep.
        if after > before {
            self.open_count
                .fetch_add((after - before) as u64, Ordering::Relaxed);
        } else if before > after {
            self.open_count
                .fetch_sub((before - after) as u64, Ordering::Relaxed);
        }
        Some(result)
    }

    pub fn total_open(&self) -> usize {
        self.open_count.load(Ordering::Relaxed) as usize
    }

    /// Read-only copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, SymbolPositions> {
        let mut out = HashMap::new();
        for stripe in &self.stripes {
            for (symbol, positions) in stripe.lock().iter() {
                if positions.open_count() > 0 {
                    out.insert(symbol.clone(), positions.clone());
                }
            }
        }
        out
    }

    /// Find a position by id across all stripes.
    pub fn find(&self, position_id: &str) -> Option<Position> {
        for stripe in &self.stripes {
            for positions in stripe.lock().values() {
                for p in [&positions.long, &positions.short].into_iter().flatten() {
                    if p.id == position_id {
                        return Some(p.clone());
                    }
                }
            }
        }
        None
    }

    /// Apply an external lifecycle event. Returns the affected position
    /// (post-transition) when one was found.
    pub fn apply_event(&self, event: &PositionEvent) -> Option<Position> {
        let result = self.apply_event_inner(event);
        self.append_journal(&JournalEntry::Event(event.clone()));
        result
    }

    fn apply_event_inner(&self, event: &PositionEvent) -> Option<Position> {
        match event {
            PositionEvent::Activated { position_id } | PositionEvent::Closing { position_id } => {
                let closing = matches!(event, PositionEvent::Closing { .. });
                self.update_by_id(position_id, |p| {
                    if closing {
                        p.status = PositionStatus::Closing;
                    }
                })
            }
            PositionEvent::Closed { position_id, .. } => self.remove_by_id(position_id),
            PositionEvent::PriceUpdate { .. } => None,
        }
    }

    fn update_by_id(
        &self,
        position_id: &str,
        f: impl Fn(&mut Position),
    ) -> Option<Position> {
        for stripe in &self.stripes {
            let mut guard = stripe.lock();
            for positions in guard.values_mut() {
                for slot in [&mut positions.long, &mut positions.short] {
                    if let Some(p) = slot.as_mut() {
                        if p.id == position_id {
                            f(p);
                            return Some(p.clone());
                        }
                    }
                }
            }
        }
        None
    }

    fn remove_by_id(&self, position_id: &str) -> Option<Position> {
        for stripe in &self.stripes {
            let mut guard = stripe.lock();
            let mut found: Option<(String, Direction)> = None;
            'search: for (symbol, positions) in guard.iter() {
                for direction in [Direction::Long, Direction::Short] {
                    if positions
                        .get(direction)
                        .is_some_and(|p| p.id == position_id)
                    {
                        found = Some((symbol.clone(), direction));
                        break 'search;
                    }
                }
            }
            if let Some((symbol, direction)) = found {
                let removed = guard.get_mut(&symbol).and_then(|sp| sp.clear(direction));
                drop(guard);
                return removed.map(|mut p| {
                    p.status = PositionStatus::Closed;
                    self.open_count.fetch_sub(1, Ordering::Relaxed);
                    p
                });
            }
        }
        None
    }

    /// Journal a freshly opened position. Called after the stripe lock is
    /// released.
    pub fn journal_open(&self, position: &Position) {
        self.append_journal(&JournalEntry::Opened(position.clone()));
    }

    fn apply_entry(&self, entry: JournalEntry) {
        match entry {
            JournalEntry::Opened(position) => {
                let stripe = self.stripe_for(&position.symbol);
                let mut guard = stripe.lock();
                let slot = guard.entry(position.symbol.clone()).or_default();
                let before = slot.open_count();
                slot.set(position);
                let after = slot.open_count();
                drop(guard);
                if after > before {
                    self.open_count.fetch_add(1, Ordering::Relaxed);
                }
            }
            JournalEntry::Event(event) => {
                self.apply_event_inner(&event);
            }
        }
    }

    fn append_journal(&self, entry: &JournalEntry) {
        let Some(path) = &self.journal_path else {
            return;
        };
        let mut guard = self.journal.lock();
        if guard.is_none() {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to open position journal");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            match serde_json::to_string(entry) {
                Ok(line) => {
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!(error = %e, "failed to append position journal");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialise journal entry"),
            }
        }
    }
}

/// PnL percentage for a closed position at `close_price`.
pub fn realized_pnl_pct(position: &Position, close_price: f64) -> f64 {
    if position.entry_price <= 0.0 {
        return 0.0;
    }
    let signed = match position.direction {
        Direction::Long => close_price - position.entry_price,
        Direction::Short => position.entry_price - close_price,
    };
    signed / position.entry_price * 100.0
}

/// Closure reason implied by a close price relative to the exits; used when
/// the collaborator omits one.
pub fn infer_closure_reason(position: &Position, close_price: f64) -> ClosureReason {
    match position.direction {
        Direction::Long if close_price >= position.take_profit => ClosureReason::TakeProfit,
        Direction::Long if close_price <= position.stop_loss => ClosureReason::StopLoss,
        Direction::Short if close_price <= position.take_profit => ClosureReason::TakeProfit,
        Direction::Short if close_price >= position.stop_loss => ClosureReason::StopLoss,
        _ => ClosureReason::Manual,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn position(id: &str, symbol: &str, direction: Direction) -> Position {
        Position {
            id: id.into(),
            symbol: symbol.into(),
            direction,
            entry_price: 100.0,
            entry_time_ms: 0,
            stop_loss: if direction == Direction::Long { 98.0 } else { 102.0 },
            take_profit: if direction == Direction::Long { 105.0 } else { 95.0 },
            size: 1.0,
            origin_candidate: format!("{id}-candidate"),
            origin_composite: 0.6,
            origin_confidence: 0.7,
            origin_expires_at_ms: 1_000_000,
            status: PositionStatus::Open,
        }
    }

    #[test]
    fn open_and_count() {
        let book = PositionBook::in_memory();
        book.with_symbol("BTCUSDT", Duration::from_millis(10), |sp| {
            sp.set(position("p1", "BTCUSDT", Direction::Long));
        });
        book.with_symbol("ETHUSDT", Duration::from_millis(10), |sp| {
            sp.set(position("p2", "ETHUSDT", Direction::Short));
        });
        assert_eq!(book.total_open(), 2);

        let snap = book.snapshot();
        assert!(snap["BTCUSDT"].long.is_some());
        assert!(snap["ETHUSDT"].short.is_some());
    }

    #[test]
    fn one_open_per_direction() {
        let book = PositionBook::in_memory();
        book.with_symbol("BTCUSDT", Duration::from_millis(10), |sp| {
            sp.set(position("p1", "BTCUSDT", Direction::Long));
            sp.set(position("p2", "BTCUSDT", Direction::Long));
        });
        // The second set replaced the first; still one open.
        assert_eq!(book.total_open(), 1);
        assert_eq!(book.snapshot()["BTCUSDT"].long.as_ref().unwrap().id, "p2");
    }

    #[test]
    fn closing_then_closed_lifecycle() {
        let book = PositionBook::in_memory();
        book.with_symbol("BTCUSDT", Duration::from_millis(10), |sp| {
            sp.set(position("p1", "BTCUSDT", Direction::Long));
        });

        let after = book
            .apply_event(&PositionEvent::Closing {
                position_id: "p1".into(),
            })
            .unwrap();
        assert_eq!(after.status, PositionStatus::Closing);
        assert_eq!(book.total_open(), 1);

        let closed = book
            .apply_event(&PositionEvent::Closed {
                position_id: "p1".into(),
                reason: ClosureReason::TakeProfit,
                price: 105.0,
                ts_ms: 1_000,
            })
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(book.total_open(), 0);
        assert!(book.find("p1").is_none());
    }

    #[test]
    fn unknown_event_is_noop() {
        let book = PositionBook::in_memory();
        assert!(book
            .apply_event(&PositionEvent::Closing {
                position_id: "ghost".into()
            })
            .is_none());
        assert_eq!(book.total_open(), 0);
    }

    #[test]
    fn lock_timeout_yields_none() {
        let book = std::sync::Arc::new(PositionBook::in_memory());
        let stripe = book.stripe_for("BTCUSDT");
        let _held = stripe.lock();
        let result = book.with_symbol("BTCUSDT", Duration::from_millis(20), |_| ());
        assert!(result.is_none());
    }

    #[test]
    fn risk_pct_sums_open_exposure() {
        let mut sp = SymbolPositions::default();
        sp.set(position("p1", "BTCUSDT", Direction::Long)); // 2% to stop
        assert!((sp.risk_pct() - 2.0).abs() < 1e-9);
        sp.set(position("p2", "BTCUSDT", Direction::Short)); // another 2%
        assert!((sp.risk_pct() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_and_reason_inference() {
        let long = position("p1", "BTCUSDT", Direction::Long);
        assert!((realized_pnl_pct(&long, 105.0) - 5.0).abs() < 1e-9);
        assert!((realized_pnl_pct(&long, 98.0) + 2.0).abs() < 1e-9);
        assert_eq!(infer_closure_reason(&long, 105.5), ClosureReason::TakeProfit);
        assert_eq!(infer_closure_reason(&long, 97.0), ClosureReason::StopLoss);
        assert_eq!(infer_closure_reason(&long, 101.0), ClosureReason::Manual);

        let short = position("p2", "BTCUSDT", Direction::Short);
        assert!((realized_pnl_pct(&short, 95.0) - 5.0).abs() < 1e-9);
        assert_eq!(infer_closure_reason(&short, 94.0), ClosureReason::TakeProfit);
    }

    #[test]
    fn journal_replay_reconstructs_map() {
        let dir = tempfile::tempdir().unwrap();
        {
            let book = PositionBook::open(dir.path()).unwrap();
            let p1 = position("p1", "BTCUSDT", Direction::Long);
            let p2 = position("p2", "ETHUSDT", Direction::Short);
            book.with_symbol("BTCUSDT", Duration::from_millis(10), |sp| sp.set(p1.clone()));
            book.journal_open(&p1);
            book.with_symbol("ETHUSDT", Duration::from_millis(10), |sp| sp.set(p2.clone()));
            book.journal_open(&p2);
            // p2 closes before the restart.
            book.apply_event(&PositionEvent::Closed {
                position_id: "p2".into(),
                reason: ClosureReason::StopLoss,
                price: 102.0,
                ts_ms: 5_000,
            });
        }

        let recovered = PositionBook::open(dir.path()).unwrap();
        assert_eq!(recovered.total_open(), 1);
        assert!(recovered.find("p1").is_some());
        assert!(recovered.find("p2").is_none());
    }
}
