// =============================================================================
// Indicator graph — declared dependencies, layered evaluation, memo cache
// =============================================================================
//
// Indicators form a DAG keyed by name. Each node declares the indicators it
// reads and the minimum bar history it needs. Evaluation is layered: every
// node whose dependencies are satisfied computes in parallel (rayon) before
// the next layer starts.
//
// A node that cannot produce a value (insufficient history, NaN inputs, a
// failed dependency) yields NaN. The frame is still published; its
// `data_completeness` drops proportionally.
// =============================================================================

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod roc;
pub mod rsi;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::errors::PipelineError;
use crate::types::{OhlcvBar, StreamKey};

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// Everything a compute closure may read.
pub struct IndicatorInput<'a> {
    /// Closed bars, oldest first, ending with the bar being evaluated.
    pub bars: &'a [OhlcvBar],
    /// Convenience copy of the close series.
    pub closes: &'a [f64],
    /// Values from earlier layers. May contain NaN for failed nodes.
    pub computed: &'a HashMap<String, f64>,
}

pub type ComputeFn = dyn Fn(&IndicatorInput<'_>) -> Option<f64> + Send + Sync;

/// A registered indicator node.
pub struct IndicatorSpec {
    pub name: String,
    /// Names of indicators this node reads from `computed`.
    pub depends_on: Vec<String>,
    /// Bars required before the node can produce a value.
    pub min_bars: usize,
    compute: Arc<ComputeFn>,
}

impl std::fmt::Debug for IndicatorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorSpec")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("min_bars", &self.min_bars)
            .finish()
    }
}

impl IndicatorSpec {
    pub fn new(
        name: impl Into<String>,
        depends_on: Vec<&str>,
        min_bars: usize,
        compute: impl Fn(&IndicatorInput<'_>) -> Option<f64> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            min_bars,
            compute: Arc::new(compute),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A validated indicator DAG ready for layered evaluation.
pub struct IndicatorGraph {
    specs: Vec<IndicatorSpec>,
    /// Indices into `specs`, one Vec per layer in evaluation order.
    layers: Vec<Vec<usize>>,
}

impl std::fmt::Debug for IndicatorGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorGraph")
            .field("specs", &self.specs)
            .field("layers", &self.layers)
            .finish()
    }
}

impl IndicatorGraph {
    /// Validate declarations and compute the layering. Duplicate names,
    /// unknown dependencies, and cycles are startup-fatal.
    pub fn build(specs: Vec<IndicatorSpec>) -> Result<Self, PipelineError> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.as_str(), i).is_some() {
                return Err(PipelineError::Fatal(format!(
                    "duplicate indicator name: {}",
                    spec.name
                )));
            }
        }
        for spec in &specs {
            for dep in &spec.depends_on {
                if !index.contains_key(dep.as_str()) {
                    return Err(PipelineError::Fatal(format!(
                        "indicator {} depends on unknown indicator {dep}",
                        spec.name
                    )));
                }
            }
        }

        // Kahn layering: peel off nodes whose dependencies are all resolved.
        let mut resolved: HashSet<usize> = HashSet::new();
        let mut layers: Vec<Vec<usize>> = Vec::new();
        while resolved.len() < specs.len() {
            let mut layer: Vec<usize> = Vec::new();
            for (i, spec) in specs.iter().enumerate() {
                if resolved.contains(&i) {
                    continue;
                }
                let ready = spec
                    .depends_on
                    .iter()
                    .all(|dep| resolved.contains(&index[dep.as_str()]));
                if ready {
                    layer.push(i);
                }
            }
            if layer.is_empty() {
                let stuck: Vec<&str> = specs
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !resolved.contains(i))
                    .map(|(_, s)| s.name.as_str())
                    .collect();
                return Err(PipelineError::Fatal(format!(
                    "indicator dependency cycle among: {}",
                    stuck.join(", ")
                )));
            }
            resolved.extend(layer.iter().copied());
            layers.push(layer);
        }

        Ok(Self { specs, layers })
    }

    /// The default catalog used when no custom graph is configured.
    pub fn standard() -> Self {
        let specs = vec![
            IndicatorSpec::new("rsi_14", vec![], 15, |input| rsi::last(input.closes, 14)),
            IndicatorSpec::new("ema_9", vec![], 9, |input| ema::last(input.closes, 9)),
            IndicatorSpec::new("ema_21", vec![], 21, |input| ema::last(input.closes, 21)),
            IndicatorSpec::new("ema_55", vec![], 55, |input| ema::last(input.closes, 55)),
            IndicatorSpec::new(
                "ema_trend",
                vec!["ema_9", "ema_21", "ema_55"],
                55,
                |input| {
                    let e9 = finite(input.computed, "ema_9")?;
                    let e21 = finite(input.computed, "ema_21")?;
                    let e55 = finite(input.computed, "ema_55")?;
                    Some(if e9 > e21 && e21 > e55 {
                        1.0
                    } else if e9 < e21 && e21 < e55 {
                        -1.0
                    } else {
                        0.0
                    })
                },
            ),
            IndicatorSpec::new("atr_14", vec![], 15, |input| atr::wilder(input.bars, 14)),
            IndicatorSpec::new("atr_pct_14", vec!["atr_14"], 15, |input| {
                let atr = finite(input.computed, "atr_14")?;
                let close = input.bars.last()?.close;
                (close != 0.0).then(|| atr / close * 100.0)
            }),
            IndicatorSpec::new("adx_14", vec![], 29, |input| adx::last(input.bars, 14)),
            IndicatorSpec::new("bb_upper_20", vec![], 20, |input| {
                bollinger::bands(input.closes, 20, 2.0).map(|b| b.upper)
            }),
            IndicatorSpec::new("bb_lower_20", vec![], 20, |input| {
                bollinger::bands(input.closes, 20, 2.0).map(|b| b.lower)
            }),
            IndicatorSpec::new("bb_width_20", vec![], 20, |input| {
                bollinger::bands(input.closes, 20, 2.0).map(|b| b.width)
            }),
            IndicatorSpec::new("roc_14", vec![], 15, |input| roc::last(input.closes, 14)),
            IndicatorSpec::new("ema_slope_9", vec![], 20, |input| {
                ema::slope(input.closes, 9, 5)
            }),
        ];
        // The standard catalog is statically valid.
        match Self::build(specs) {
            Ok(graph) => graph,
            Err(_) => unreachable!("standard indicator catalog is acyclic"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }

    /// Evaluate every node against `bars` (oldest-first, ending at the bar
    /// being closed).
    ///
    /// Returns the value map (NaN for failed nodes) and the resulting
    /// data-completeness in [0, 1]. An empty graph reads complete.
    pub fn evaluate(&self, bars: &[OhlcvBar]) -> (HashMap<String, f64>, f64) {
        if self.specs.is_empty() {
            return (HashMap::new(), 1.0);
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let mut computed: HashMap<String, f64> = HashMap::with_capacity(self.specs.len());

        for layer in &self.layers {
            let input = IndicatorInput {
                bars,
                closes: &closes,
                computed: &computed,
            };

            let results: Vec<(usize, f64)> = layer
                .par_iter()
                .map(|&idx| {
                    let spec = &self.specs[idx];
                    let value = if bars.len() < spec.min_bars {
                        None
                    } else if spec
                        .depends_on
                        .iter()
                        .any(|dep| finite(input.computed, dep).is_none())
                    {
                        // A failed dependency poisons the node.
                        None
                    } else {
                        (spec.compute)(&input).filter(|v| v.is_finite())
                    };
                    (idx, value.unwrap_or(f64::NAN))
                })
                .collect();

            for (idx, value) in results {
                computed.insert(self.specs[idx].name.clone(), value);
            }
        }

        let finite_count = computed.values().filter(|v| v.is_finite()).count();
        let completeness = finite_count as f64 / self.specs.len() as f64;
        (computed, completeness)
    }
}

fn finite(map: &HashMap<String, f64>, name: &str) -> Option<f64> {
    map.get(name).copied().filter(|v| v.is_finite())
}

// ---------------------------------------------------------------------------
// Memo cache
// ---------------------------------------------------------------------------

/// Memoized indicator values keyed by (stream, close_time). Entries expire
/// when the frame ring evicts the corresponding bar.
pub struct IndicatorCache {
    entries: RwLock<HashMap<StreamKey, BTreeMap<i64, Arc<HashMap<String, f64>>>>>,
}

impl IndicatorCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &StreamKey, close_time_ms: i64) -> Option<Arc<HashMap<String, f64>>> {
        self.entries
            .read()
            .get(key)
            .and_then(|per_bar| per_bar.get(&close_time_ms).cloned())
    }

    pub fn insert(
        &self,
        key: StreamKey,
        close_time_ms: i64,
        values: Arc<HashMap<String, f64>>,
    ) {
        self.entries
            .write()
            .entry(key)
            .or_default()
            .insert(close_time_ms, values);
    }

    /// Drop every entry older than `oldest_kept_close_ms`, mirroring the
    /// frame ring eviction.
    pub fn evict_before(&self, key: &StreamKey, oldest_kept_close_ms: i64) {
        if let Some(per_bar) = self.entries.write().get_mut(key) {
            *per_bar = per_bar.split_off(&oldest_kept_close_ms);
        }
    }

    pub fn len(&self, key: &StreamKey) -> usize {
        self.entries.read().get(key).map_or(0, BTreeMap::len)
    }
}

impl Default for IndicatorCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn trending_bars(n: usize) -> Vec<OhlcvBar> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64;
                OhlcvBar {
                    open_time_ms: i as i64 * 60_000,
                    close_time_ms: (i as i64 + 1) * 60_000,
                    open: base,
                    high: base + 1.5,
                    low: base - 0.5,
                    close: base + 1.0,
                    volume: 10.0,
                    tick_count: 20,
                }
            })
            .collect()
    }

    #[test]
    fn empty_graph_is_fully_complete() {
        let graph = IndicatorGraph::build(Vec::new()).unwrap();
        let (values, completeness) = graph.evaluate(&trending_bars(5));
        assert!(values.is_empty());
        assert!((completeness - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_dependency_is_fatal() {
        let specs = vec![IndicatorSpec::new("a", vec!["ghost"], 1, |_| Some(1.0))];
        let err = IndicatorGraph::build(specs).unwrap_err();
        assert_eq!(err.class(), "fatal");
    }

    #[test]
    fn duplicate_name_is_fatal() {
        let specs = vec![
            IndicatorSpec::new("a", vec![], 1, |_| Some(1.0)),
            IndicatorSpec::new("a", vec![], 1, |_| Some(2.0)),
        ];
        assert!(IndicatorGraph::build(specs).is_err());
    }

    #[test]
    fn cycle_is_fatal() {
        let specs = vec![
            IndicatorSpec::new("a", vec!["b"], 1, |_| Some(1.0)),
            IndicatorSpec::new("b", vec!["a"], 1, |_| Some(2.0)),
        ];
        let err = IndicatorGraph::build(specs).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn layering_respects_dependencies() {
        let specs = vec![
            IndicatorSpec::new("derived", vec!["base"], 1, |input| {
                Some(input.computed["base"] * 2.0)
            }),
            IndicatorSpec::new("base", vec![], 1, |_| Some(21.0)),
        ];
        let graph = IndicatorGraph::build(specs).unwrap();
        let (values, completeness) = graph.evaluate(&trending_bars(3));
        assert!((values["base"] - 21.0).abs() < 1e-12);
        assert!((values["derived"] - 42.0).abs() < 1e-12);
        assert!((completeness - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failed_dependency_poisons_dependent() {
        let specs = vec![
            IndicatorSpec::new("broken", vec![], 1, |_| None),
            IndicatorSpec::new("child", vec!["broken"], 1, |_| Some(1.0)),
            IndicatorSpec::new("healthy", vec![], 1, |_| Some(5.0)),
        ];
        let graph = IndicatorGraph::build(specs).unwrap();
        let (values, completeness) = graph.evaluate(&trending_bars(3));
        assert!(values["broken"].is_nan());
        assert!(values["child"].is_nan());
        assert!((values["healthy"] - 5.0).abs() < 1e-12);
        // 1 of 3 finite.
        assert!((completeness - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn insufficient_history_yields_nan() {
        let specs = vec![IndicatorSpec::new("needs_50", vec![], 50, |_| Some(1.0))];
        let graph = IndicatorGraph::build(specs).unwrap();
        let (values, completeness) = graph.evaluate(&trending_bars(10));
        assert!(values["needs_50"].is_nan());
        assert_eq!(completeness, 0.0);
    }

    #[test]
    fn standard_catalog_fills_on_deep_history() {
        let graph = IndicatorGraph::standard();
        let bars = trending_bars(120);
        let (values, completeness) = graph.evaluate(&bars);
        assert_eq!(values.len(), graph.len());
        assert!((completeness - 1.0).abs() < f64::EPSILON, "completeness {completeness}");
        // Uptrend: aligned EMAs and meaningful ADX.
        assert!((values["ema_trend"] - 1.0).abs() < 1e-12);
        assert!(values["adx_14"] > 25.0);
        assert!(values["rsi_14"] > 50.0);
    }

    #[test]
    fn cache_eviction_mirrors_ring() {
        let cache = IndicatorCache::new();
        let key = StreamKey::new("BTCUSDT", Timeframe::M1);
        for close in [60_000_i64, 120_000, 180_000] {
            cache.insert(key.clone(), close, Arc::new(HashMap::new()));
        }
        assert_eq!(cache.len(&key), 3);

        cache.evict_before(&key, 120_000);
        assert_eq!(cache.len(&key), 2);
        assert!(cache.get(&key, 60_000).is_none());
        assert!(cache.get(&key, 120_000).is_some());
    }
}
