// =============================================================================
// Versioned parameter store — copy-on-write, one ACTIVE set per consumer
// =============================================================================
//
// Learned tunables live here, NOT in PipelineConfig. Publishers swap an
// atomic pointer; readers capture the pointer at operation entry, so a
// candidate that started under version N finishes under version N even if
// N+1 lands mid-flight.
//
// Persistence: one JSON document per version under `<data_dir>/params/`,
// written with the atomic tmp + rename pattern.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::types::RegimeLabel;

// =============================================================================
// Canonical parameter names
// =============================================================================

/// Minimum strategy strength for a candidate to be emitted (P1).
pub const MIN_STRENGTH: &str = "min_strength";
/// Minimum strategy confidence for a candidate to be emitted (P1).
pub const CONFIDENCE_THRESHOLD: &str = "confidence_threshold";

/// Quality-gate weights over the five sub-scores (P2).
pub const QUALITY_W_COMPLETENESS: &str = "quality_w_completeness";
pub const QUALITY_W_CLARITY: &str = "quality_w_clarity";
pub const QUALITY_W_CONFIDENCE: &str = "quality_w_confidence";
pub const QUALITY_W_VOLATILITY: &str = "quality_w_volatility";
pub const QUALITY_W_LIQUIDITY: &str = "quality_w_liquidity";
/// Composite score below which a candidate is dropped (P2).
pub const QUALITY_FLOOR: &str = "quality_floor";

/// Composite advantage required for a REPLACE verdict (P3).
pub const REPLACE_MARGIN: &str = "replace_margin";
/// Smaller advantage required for a STRENGTHEN verdict (P3).
pub const STRENGTHEN_MARGIN: &str = "strengthen_margin";
/// Risk/reward floor after volatility clamping (P3).
pub const RR_FLOOR: &str = "rr_floor";
/// ATR multipliers bounding stop-loss / take-profit distance (P3).
pub const ATR_SL_MULT: &str = "atr_sl_mult";
pub const ATR_TP_MULT: &str = "atr_tp_mult";
/// STRENGTHEN effect: "widen_tp" or "tighten_sl".
pub const STRENGTHEN_MODE: &str = "strengthen_mode";

// =============================================================================
// Values, overlays, sets
// =============================================================================

/// A parameter value: numeric or an enumerated string. No free-form code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Choice(String),
}

impl ParamValue {
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Choice(_) => None,
        }
    }

    pub fn as_choice(&self) -> Option<&str> {
        match self {
            Self::Choice(s) => Some(s),
            Self::Number(_) => None,
        }
    }
}

/// Overlay scope: `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<RegimeLabel>,
}

impl OverlayScope {
    pub fn matches(&self, category: Option<&str>, regime: Option<RegimeLabel>) -> bool {
        let cat_ok = match &self.category {
            Some(want) => category == Some(want.as_str()),
            None => true,
        };
        let regime_ok = match self.regime {
            Some(want) => regime == Some(want),
            None => true,
        };
        cat_ok && regime_ok
    }
}

/// Category- or regime-scoped parameter overrides carried by a set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamOverlay {
    pub scope: OverlayScope,
    pub parameters: HashMap<String, ParamValue>,
}

/// A versioned mapping from parameter name to value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSet {
    pub version: u64,
    pub created_at_ms: i64,
    pub parameters: HashMap<String, ParamValue>,
    #[serde(default)]
    pub overlays: Vec<ParamOverlay>,
}

impl ParameterSet {
    /// The built-in version-0 baseline every deployment starts from.
    pub fn baseline() -> Self {
        let mut parameters = HashMap::new();
        let mut num = |name: &str, v: f64| {
            parameters.insert(name.to_string(), ParamValue::Number(v));
        };
        num(MIN_STRENGTH, 0.55);
        num(CONFIDENCE_THRESHOLD, 0.60);
        num(QUALITY_W_COMPLETENESS, 0.25);
        num(QUALITY_W_CLARITY, 0.25);
        num(QUALITY_W_CONFIDENCE, 0.20);
        num(QUALITY_W_VOLATILITY, 0.15);
        num(QUALITY_W_LIQUIDITY, 0.15);
        num(QUALITY_FLOOR, 0.40);
        num(REPLACE_MARGIN, 0.15);
        num(STRENGTHEN_MARGIN, 0.05);
        num(RR_FLOOR, 1.2);
        num(ATR_SL_MULT, 1.5);
        num(ATR_TP_MULT, 2.5);
        parameters.insert(
            STRENGTHEN_MODE.to_string(),
            ParamValue::Choice("widen_tp".to_string()),
        );

        Self {
            version: 0,
            created_at_ms: 0,
            parameters,
            overlays: Vec::new(),
        }
    }

    /// Base numeric lookup (no overlays).
    pub fn num(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).and_then(ParamValue::as_num)
    }

    /// Base numeric lookup with a fallback.
    pub fn num_or(&self, name: &str, default: f64) -> f64 {
        self.num(name).unwrap_or(default)
    }

    /// Enumerated-string lookup.
    pub fn choice<'a>(&'a self, name: &str) -> Option<&'a str> {
        self.parameters.get(name).and_then(ParamValue::as_choice)
    }

    /// Numeric lookup with overlay resolution: the last matching overlay
    /// wins, otherwise the base value.
    pub fn num_scoped(
        &self,
        name: &str,
        category: Option<&str>,
        regime: Option<RegimeLabel>,
    ) -> Option<f64> {
        let mut value = self.num(name);
        for overlay in &self.overlays {
            if overlay.scope.matches(category, regime) {
                if let Some(v) = overlay.parameters.get(name).and_then(ParamValue::as_num) {
                    value = Some(v);
                }
            }
        }
        value
    }

    /// Copy with one numeric parameter replaced. Used by the optimizer to
    /// build perturbations.
    pub fn with_num(&self, name: &str, value: f64) -> Self {
        let mut next = self.clone();
        next.parameters
            .insert(name.to_string(), ParamValue::Number(value));
        next
    }
}

// =============================================================================
// Consumers and the store
// =============================================================================

/// Pipeline phases that read an ACTIVE parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Consumer {
    SignalGen,
    Policy,
}

impl Consumer {
    pub const ALL: [Consumer; 2] = [Consumer::SignalGen, Consumer::Policy];
}

impl std::fmt::Display for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SignalGen => write!(f, "signal_gen"),
            Self::Policy => write!(f, "policy"),
        }
    }
}

struct ConsumerSlot {
    active: ArcSwap<ParameterSet>,
    version_tx: watch::Sender<u64>,
}

/// The versioned key-value store. Exactly one ACTIVE set per consumer at any
/// instant; replacement is a single pointer swap.
pub struct ParameterStore {
    signal_gen: ConsumerSlot,
    policy: ConsumerSlot,
    /// All versions ever published this run (plus any loaded from disk).
    history: RwLock<HashMap<u64, Arc<ParameterSet>>>,
    next_version: AtomicU64,
    /// Directory for persisted version documents, when persistence is on.
    dir: Option<PathBuf>,
}

impl ParameterStore {
    /// In-memory store seeded with the baseline set. Used by tests and by
    /// deployments that have not configured a data dir.
    pub fn in_memory() -> Self {
        Self::build(ParameterSet::baseline(), None)
    }

    /// Store persisting version documents under `dir/params`. Existing
    /// documents are loaded; the highest version becomes ACTIVE.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let params_dir = dir.as_ref().join("params");
        std::fs::create_dir_all(&params_dir)
            .with_context(|| format!("failed to create {}", params_dir.display()))?;

        let mut latest = ParameterSet::baseline();
        let mut loaded: Vec<ParameterSet> = Vec::new();
        for entry in std::fs::read_dir(&params_dir)
            .with_context(|| format!("failed to read {}", params_dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|s| serde_json::from_str::<ParameterSet>(&s).map_err(Into::into))
            {
                Ok(set) => loaded.push(set),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable parameter document"),
            }
        }
        loaded.sort_by_key(|s| s.version);
        if let Some(last) = loaded.last() {
            latest = last.clone();
        }

        let store = Self::build(latest, Some(params_dir));
        {
            let mut history = store.history.write();
            for set in loaded {
                history.insert(set.version, Arc::new(set));
            }
        }
        Ok(store)
    }

    fn build(initial: ParameterSet, dir: Option<PathBuf>) -> Self {
        let initial_version = initial.version;
        let initial = Arc::new(initial);
        let mut history = HashMap::new();
        history.insert(initial_version, initial.clone());

        let slot = |set: &Arc<ParameterSet>| ConsumerSlot {
            active: ArcSwap::from(set.clone()),
            version_tx: watch::channel(set.version).0,
        };

        Self {
            signal_gen: slot(&initial),
            policy: slot(&initial),
            history: RwLock::new(history),
            next_version: AtomicU64::new(initial_version + 1),
            dir,
        }
    }

    fn slot(&self, consumer: Consumer) -> &ConsumerSlot {
        match consumer {
            Consumer::SignalGen => &self.signal_gen,
            Consumer::Policy => &self.policy,
        }
    }

    /// Capture the ACTIVE set for `consumer`. The returned Arc stays valid
    /// for the whole operation even if a publish lands mid-flight.
    pub fn get(&self, consumer: Consumer) -> (u64, Arc<ParameterSet>) {
        let set = self.slot(consumer).active.load_full();
        (set.version, set)
    }

    /// Publish a new set: assigns the next version, persists, activates for
    /// every consumer, and notifies subscribers. Returns the new version.
    pub fn put(&self, mut set: ParameterSet) -> Result<u64> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        set.version = version;
        let set = Arc::new(set);

        self.persist(&set)?;
        self.history.write().insert(version, set.clone());
        self.activate_arc(&set);

        info!(version, "parameter set published");
        Ok(version)
    }

    /// Re-activate a previously published version (operator rollback).
    pub fn rollback(&self, version: u64) -> Result<()> {
        let set = self
            .history
            .read()
            .get(&version)
            .cloned()
            .with_context(|| format!("unknown parameter version {version}"))?;
        self.activate_arc(&set);
        info!(version, "parameter set rolled back");
        Ok(())
    }

    fn activate_arc(&self, set: &Arc<ParameterSet>) {
        for consumer in Consumer::ALL {
            let slot = self.slot(consumer);
            slot.active.store(set.clone());
            // Receivers may be gone; a lagging consumer is not an error.
            let _ = slot.version_tx.send(set.version);
        }
    }

    /// Version-change notifications for `consumer`.
    pub fn subscribe(&self, consumer: Consumer) -> watch::Receiver<u64> {
        self.slot(consumer).version_tx.subscribe()
    }

    /// All published versions, ascending.
    pub fn versions(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.history.read().keys().copied().collect();
        v.sort_unstable();
        v
    }

    fn persist(&self, set: &ParameterSet) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(format!("v{}.json", set.version));
        let content = serde_json::to_string_pretty(set)
            .context("failed to serialise parameter set")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {}", path.display()))?;
        Ok(())
    }
}
