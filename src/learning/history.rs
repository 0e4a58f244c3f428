// =============================================================================
// Signal history store — append-only outcome log with indexes
// =============================================================================
//
// Records are immutable once appended and idempotent by candidate id: the
// same outcome delivered twice leaves the store (and therefore every
// parameter transition derived from it) unchanged.
//
// Persisted as JSONL under `<data_dir>/outcomes.jsonl`, replayed on open.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::types::{OutcomeRecord, RegimeLabel};

struct Inner {
    records: Vec<OutcomeRecord>,
    seen: HashSet<String>,
    by_symbol: HashMap<String, Vec<usize>>,
    by_regime: HashMap<RegimeLabel, Vec<usize>>,
    by_strategy: HashMap<String, Vec<usize>>,
}

impl Inner {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            seen: HashSet::new(),
            by_symbol: HashMap::new(),
            by_regime: HashMap::new(),
            by_strategy: HashMap::new(),
        }
    }

    fn insert(&mut self, record: OutcomeRecord) -> bool {
        if !self.seen.insert(record.candidate_id.clone()) {
            return false;
        }
        let idx = self.records.len();
        self.by_symbol
            .entry(record.symbol.clone())
            .or_default()
            .push(idx);
        self.by_regime.entry(record.regime).or_default().push(idx);
        self.by_strategy
            .entry(record.strategy.clone())
            .or_default()
            .push(idx);
        self.records.push(record);
        true
    }
}

/// Append-only outcome log shared by the learning stages.
pub struct SignalHistory {
    inner: RwLock<Inner>,
    log_path: Option<PathBuf>,
    log_file: parking_lot::Mutex<Option<std::fs::File>>,
}

impl SignalHistory {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::empty()),
            log_path: None,
            log_file: parking_lot::Mutex::new(None),
        }
    }

    /// Open (or create) the persisted log under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())
            .with_context(|| format!("failed to create {}", dir.as_ref().display()))?;
        let path = dir.as_ref().join("outcomes.jsonl");

        let mut inner = Inner::empty();
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<OutcomeRecord>(line) {
                    Ok(record) => {
                        inner.insert(record);
                    }
                    Err(e) => warn!(error = %e, "skipping corrupt outcome line"),
                }
            }
            info!(count = inner.records.len(), "outcome log replayed");
        }

        Ok(Self {
            inner: RwLock::new(inner),
            log_path: Some(path),
            log_file: parking_lot::Mutex::new(None),
        })
    }

    /// Append one outcome. Returns false for a duplicate candidate id (the
    /// record is ignored).
    pub fn append(&self, record: OutcomeRecord) -> bool {
        let fresh = self.inner.write().insert(record.clone());
        if fresh {
            self.persist(&record);
        }
        fresh
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent `count` records, oldest first.
    pub fn recent(&self, count: usize) -> Vec<OutcomeRecord> {
        let inner = self.inner.read();
        let start = inner.records.len().saturating_sub(count);
        inner.records[start..].to_vec()
    }

    pub fn for_symbol(&self, symbol: &str) -> Vec<OutcomeRecord> {
        let inner = self.inner.read();
        inner
            .by_symbol
            .get(symbol)
            .map(|idxs| idxs.iter().map(|&i| inner.records[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn for_regime(&self, regime: RegimeLabel) -> Vec<OutcomeRecord> {
        let inner = self.inner.read();
        inner
            .by_regime
            .get(&regime)
            .map(|idxs| idxs.iter().map(|&i| inner.records[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn for_strategy(&self, strategy: &str) -> Vec<OutcomeRecord> {
        let inner = self.inner.read();
        inner
            .by_strategy
            .get(strategy)
            .map(|idxs| idxs.iter().map(|&i| inner.records[i].clone()).collect())
            .unwrap_or_default()
    }

    fn persist(&self, record: &OutcomeRecord) {
        let Some(path) = &self.log_path else {
            return;
        };
        let mut guard = self.log_file.lock();
        if guard.is_none() {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to open outcome log");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            match serde_json::to_string(record) {
                Ok(line) => {
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!(error = %e, "failed to append outcome log");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialise outcome"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
