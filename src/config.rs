// =============================================================================
// Pipeline configuration — hot-loadable settings with atomic save
// =============================================================================
//
// Every tunable that is NOT learned by the adaptive layer lives here. Learned
// parameters (thresholds, weights, margins) live in the versioned
// ParameterStore instead, so the two never fight over the same knob.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::M1, Timeframe::M5]
}

fn default_exchanges() -> Vec<ExchangeEndpoint> {
    vec![
        ExchangeEndpoint {
            id: "binance".to_string(),
            url: "wss://stream.binance.com:9443/ws".to_string(),
        },
        ExchangeEndpoint {
            id: "bybit".to_string(),
            url: "wss://stream.bybit.com/v5/public/spot".to_string(),
        },
    ]
}

fn default_quorum() -> usize {
    1
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_cap_ms() -> u64 {
    60_000
}

fn default_subscribe_retry_window_secs() -> u64 {
    30
}

fn default_tick_dedup_window() -> usize {
    4_096
}

fn default_bar_grace_ms() -> i64 {
    2_000
}

fn default_frame_ring_bars() -> usize {
    500
}

fn default_warmup_bars() -> usize {
    30
}

fn default_candidate_ttl_secs() -> i64 {
    900
}

fn default_dedup_window_secs() -> i64 {
    900
}

fn default_cosine_threshold() -> f64 {
    0.85
}

fn default_diversity_min_strategies() -> usize {
    3
}

fn default_correlation_threshold() -> f64 {
    0.8
}

fn default_correlation_bars() -> usize {
    50
}

fn default_confidence_bump_cap() -> f64 {
    0.10
}

fn default_express_subscore_floor() -> f64 {
    0.80
}

fn default_express_load_target() -> f64 {
    0.50
}

fn default_stress_threshold() -> f64 {
    0.70
}

fn default_queue_high_watermark() -> f64 {
    0.80
}

fn default_degrade_max_fraction() -> f64 {
    0.50
}

fn default_band_critical() -> f64 {
    0.85
}

fn default_band_high() -> f64 {
    0.70
}

fn default_band_medium() -> f64 {
    0.50
}

fn default_reinforce_window_secs() -> i64 {
    300
}

fn default_reinforce_move_pct() -> f64 {
    0.3
}

fn default_phase_budget_ms() -> u64 {
    1_000
}

fn default_workers() -> usize {
    8
}

fn default_contention_timeout_ms() -> u64 {
    500
}

fn default_replace_cooldown_secs() -> i64 {
    300
}

fn default_max_positions_global() -> usize {
    10
}

fn default_max_positions_per_symbol() -> usize {
    1
}

fn default_symbol_risk_budget_pct() -> f64 {
    2.0
}

fn default_activation_grace_secs() -> i64 {
    120
}

fn default_dispatch_retry_cap() -> u32 {
    5
}

fn default_dispatch_retry_initial_ms() -> u64 {
    1_000
}

fn default_dispatch_retry_cap_ms() -> u64 {
    60_000
}

fn default_min_signals_for_learning() -> usize {
    50
}

fn default_pattern_discovery_interval() -> usize {
    50
}

fn default_optimization_interval() -> usize {
    200
}

fn default_half_life_hours() -> f64 {
    12.0
}

fn default_min_improvement() -> f64 {
    0.03
}

fn default_pattern_min_samples() -> usize {
    8
}

fn default_pattern_min_success() -> f64 {
    0.60
}

fn default_tick_queue() -> usize {
    1_024
}

fn default_stage_queue() -> usize {
    256
}

fn default_outcome_queue() -> usize {
    512
}

fn default_data_dir() -> String {
    "meridian-data".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// One upstream exchange connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeEndpoint {
    pub id: String,
    pub url: String,
}

/// Market-data ingestion and signal-generation settings (P1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<ExchangeEndpoint>,

    /// Minimum healthy exchange connections required by `subscribe`.
    #[serde(default = "default_quorum")]
    pub quorum: usize,

    /// Silence longer than this excludes an exchange from consensus.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Reconnect backoff: initial delay and cap (jittered).
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,

    /// Bounded retry window for the initial `subscribe` health gate.
    #[serde(default = "default_subscribe_retry_window_secs")]
    pub subscribe_retry_window_secs: u64,

    /// Sliding-window size of the per-exchange (symbol, sequence) dedup set.
    #[serde(default = "default_tick_dedup_window")]
    pub tick_dedup_window: usize,

    /// Out-of-order ticks older than this past a bar boundary are dropped.
    #[serde(default = "default_bar_grace_ms")]
    pub bar_grace_ms: i64,

    /// Closed bars retained per (symbol, timeframe) ring.
    #[serde(default = "default_frame_ring_bars")]
    pub frame_ring_bars: usize,

    /// Bars required before a stream leaves WARMUP.
    #[serde(default = "default_warmup_bars")]
    pub warmup_bars: usize,

    /// Candidate expiry horizon past its close time.
    #[serde(default = "default_candidate_ttl_secs")]
    pub candidate_ttl_secs: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            exchanges: default_exchanges(),
            quorum: default_quorum(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            subscribe_retry_window_secs: default_subscribe_retry_window_secs(),
            tick_dedup_window: default_tick_dedup_window(),
            bar_grace_ms: default_bar_grace_ms(),
            frame_ring_bars: default_frame_ring_bars(),
            warmup_bars: default_warmup_bars(),
            candidate_ttl_secs: default_candidate_ttl_secs(),
        }
    }
}

/// Pre-evaluation settings (P2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreEvalConfig {
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: i64,

    /// Feature-vector cosine similarity at or above which two same-symbol,
    /// same-direction candidates are duplicates.
    #[serde(default = "default_cosine_threshold")]
    pub cosine_threshold: f64,

    /// Distinct source strategies at or above which the diversity guard
    /// preserves near-duplicates.
    #[serde(default = "default_diversity_min_strategies")]
    pub diversity_min_strategies: usize,

    /// Cross-symbol correlation above which candidates interact.
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,

    /// Rolling window length for the correlation estimate, in bars.
    #[serde(default = "default_correlation_bars")]
    pub correlation_bars: usize,

    /// Cap on the same-direction correlation confidence bump.
    #[serde(default = "default_confidence_bump_cap")]
    pub confidence_bump_cap: f64,

    /// Express lane entry: every sub-score must clear this floor.
    #[serde(default = "default_express_subscore_floor")]
    pub express_subscore_floor: f64,

    /// Express lane entry: system load must sit below this target.
    #[serde(default = "default_express_load_target")]
    pub express_load_target: f64,

    /// Market stress at or above which candidates go to the deep lane.
    #[serde(default = "default_stress_threshold")]
    pub stress_threshold: f64,

    /// Queue-depth fraction above which lanes degrade.
    #[serde(default = "default_queue_high_watermark")]
    pub queue_high_watermark: f64,

    /// Ceiling on the fraction of routed candidates that may be degraded.
    #[serde(default = "default_degrade_max_fraction")]
    pub degrade_max_fraction: f64,

    /// Fixed composite thresholds for priority banding.
    #[serde(default = "default_band_critical")]
    pub band_critical: f64,
    #[serde(default = "default_band_high")]
    pub band_high: f64,
    #[serde(default = "default_band_medium")]
    pub band_medium: f64,

    /// Delayed-observation reinforcement window and the favourable move (as
    /// percent of entry) that re-promotes a tracked candidate.
    #[serde(default = "default_reinforce_window_secs")]
    pub reinforce_window_secs: i64,
    #[serde(default = "default_reinforce_move_pct")]
    pub reinforce_move_pct: f64,

    /// Hard per-candidate budget in this phase.
    #[serde(default = "default_phase_budget_ms")]
    pub phase_budget_ms: u64,

    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PreEvalConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
            cosine_threshold: default_cosine_threshold(),
            diversity_min_strategies: default_diversity_min_strategies(),
            correlation_threshold: default_correlation_threshold(),
            correlation_bars: default_correlation_bars(),
            confidence_bump_cap: default_confidence_bump_cap(),
            express_subscore_floor: default_express_subscore_floor(),
            express_load_target: default_express_load_target(),
            stress_threshold: default_stress_threshold(),
            queue_high_watermark: default_queue_high_watermark(),
            degrade_max_fraction: default_degrade_max_fraction(),
            band_critical: default_band_critical(),
            band_high: default_band_high(),
            band_medium: default_band_medium(),
            reinforce_window_secs: default_reinforce_window_secs(),
            reinforce_move_pct: default_reinforce_move_pct(),
            phase_budget_ms: default_phase_budget_ms(),
            workers: default_workers(),
        }
    }
}

/// Execution-policy settings (P3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bounded wait for the per-symbol lock before yielding CONTENTION.
    #[serde(default = "default_contention_timeout_ms")]
    pub contention_timeout_ms: u64,

    /// No further REPLACE for a symbol inside this window.
    #[serde(default = "default_replace_cooldown_secs")]
    pub replace_cooldown_secs: i64,

    #[serde(default = "default_max_positions_global")]
    pub max_positions_global: usize,

    #[serde(default = "default_max_positions_per_symbol")]
    pub max_positions_per_symbol: usize,

    /// Whether (symbol, LONG) and (symbol, SHORT) may coexist.
    #[serde(default)]
    pub allow_hedging: bool,

    /// Cumulative at-risk percentage allowed per symbol.
    #[serde(default = "default_symbol_risk_budget_pct")]
    pub symbol_risk_budget_pct: f64,

    /// A decided-but-never-opened position expires from tracking after this.
    #[serde(default = "default_activation_grace_secs")]
    pub activation_grace_secs: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            contention_timeout_ms: default_contention_timeout_ms(),
            replace_cooldown_secs: default_replace_cooldown_secs(),
            max_positions_global: default_max_positions_global(),
            max_positions_per_symbol: default_max_positions_per_symbol(),
            allow_hedging: false,
            symbol_risk_budget_pct: default_symbol_risk_budget_pct(),
            activation_grace_secs: default_activation_grace_secs(),
        }
    }
}

/// Output and dispatch settings (P4). Band delay/cooldown/budget numbers are
/// fixed by the dispatch table in `output::queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_dispatch_retry_cap")]
    pub retry_cap: u32,
    #[serde(default = "default_dispatch_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_dispatch_retry_cap_ms")]
    pub retry_cap_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            retry_cap: default_dispatch_retry_cap(),
            retry_initial_ms: default_dispatch_retry_initial_ms(),
            retry_cap_ms: default_dispatch_retry_cap_ms(),
        }
    }
}

/// Adaptive-learning cadence (P5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_min_signals_for_learning")]
    pub min_signals_for_learning: usize,

    #[serde(default = "default_pattern_discovery_interval")]
    pub pattern_discovery_interval: usize,

    #[serde(default = "default_optimization_interval")]
    pub optimization_interval: usize,

    /// Half-life of the outcome time-decay weighting, in hours.
    #[serde(default = "default_half_life_hours")]
    pub half_life_hours: f64,

    /// Minimum simulated improvement before a perturbation is adopted.
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,

    #[serde(default = "default_pattern_min_samples")]
    pub pattern_min_samples: usize,

    #[serde(default = "default_pattern_min_success")]
    pub pattern_min_success: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_signals_for_learning: default_min_signals_for_learning(),
            pattern_discovery_interval: default_pattern_discovery_interval(),
            optimization_interval: default_optimization_interval(),
            half_life_hours: default_half_life_hours(),
            min_improvement: default_min_improvement(),
            pattern_min_samples: default_pattern_min_samples(),
            pattern_min_success: default_pattern_min_success(),
        }
    }
}

/// Bounded inter-phase queue capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_tick_queue")]
    pub ticks: usize,
    #[serde(default = "default_stage_queue")]
    pub candidates: usize,
    #[serde(default = "default_stage_queue")]
    pub vetted: usize,
    #[serde(default = "default_stage_queue")]
    pub decisions: usize,
    #[serde(default = "default_stage_queue")]
    pub notifications: usize,
    #[serde(default = "default_outcome_queue")]
    pub outcomes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ticks: default_tick_queue(),
            candidates: default_stage_queue(),
            vetted: default_stage_queue(),
            decisions: default_stage_queue(),
            notifications: default_stage_queue(),
            outcomes: default_outcome_queue(),
        }
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for the Meridian pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Symbols the pipeline watches.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Timeframes bars are aggregated on.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub preeval: PreEvalConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub learning: LearningConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    /// Directory for parameter versions, journals, and the outcome log.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframes: default_timeframes(),
            ingest: IngestConfig::default(),
            preeval: PreEvalConfig::default(),
            policy: PolicyConfig::default(),
            output: OutputConfig::default(),
            learning: LearningConfig::default(),
            queues: QueueConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            timeframes = ?config.timeframes,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }

    /// Apply `MERIDIAN_SYMBOLS` env override (comma-separated).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.timeframes, vec![Timeframe::M1, Timeframe::M5]);
        assert_eq!(cfg.ingest.quorum, 1);
        assert_eq!(cfg.ingest.heartbeat_secs, 60);
        assert_eq!(cfg.ingest.reconnect_initial_ms, 1_000);
        assert_eq!(cfg.ingest.reconnect_cap_ms, 60_000);
        assert_eq!(cfg.preeval.workers, 8);
        assert!((cfg.preeval.cosine_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(cfg.policy.contention_timeout_ms, 500);
        assert!(!cfg.policy.allow_hedging);
        assert_eq!(cfg.learning.min_signals_for_learning, 50);
        assert_eq!(cfg.learning.optimization_interval, 200);
        assert!((cfg.learning.half_life_hours - 12.0).abs() < f64::EPSILON);
        assert!((cfg.learning.min_improvement - 0.03).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.ingest.exchanges.len(), 2);
        assert_eq!(cfg.queues.ticks, 1_024);
        assert_eq!(cfg.queues.candidates, 256);
        assert_eq!(cfg.output.retry_cap, 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "symbols": ["ETHUSDT"],
            "policy": { "allow_hedging": true, "max_positions_global": 3 }
        }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert!(cfg.policy.allow_hedging);
        assert_eq!(cfg.policy.max_positions_global, 3);
        assert_eq!(cfg.policy.contention_timeout_ms, 500);
        assert_eq!(cfg.preeval.dedup_window_secs, 900);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = PipelineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.policy.max_positions_global, cfg2.policy.max_positions_global);
        assert_eq!(cfg.queues.outcomes, cfg2.queues.outcomes);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = PipelineConfig::default();
        cfg.symbols = vec!["BTCUSDT".into()];
        cfg.save(&path).unwrap();
        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["BTCUSDT"]);
    }
}
