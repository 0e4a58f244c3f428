// =============================================================================
// Pipeline metrics — per-counter atomics, lock-free on the fast path
// =============================================================================
//
// Hot counters are plain `AtomicU64` fields bumped with `Ordering::Relaxed`.
// Reason-labeled counters live behind an RwLock'd map; the lock is only
// written on first use of a label, after which callers hold the Arc'd counter.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Latency histogram
// ---------------------------------------------------------------------------

/// Upper bucket bounds in milliseconds for the end-to-end latency histogram.
/// The final implicit bucket is +inf.
const LATENCY_BOUNDS_MS: [u64; 8] = [1, 5, 10, 25, 50, 100, 500, 2_000];

/// Fixed-bucket histogram with atomic counters.
pub struct LatencyHistogram {
    buckets: [AtomicU64; 9],
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one observation in milliseconds.
    pub fn observe_ms(&self, ms: u64) {
        let idx = LATENCY_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_ms: LATENCY_BOUNDS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub bounds_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub sum_ms: u64,
    pub count: u64,
}

// ---------------------------------------------------------------------------
// PipelineMetrics
// ---------------------------------------------------------------------------

/// All counters and gauges exposed by the pipeline. One instance is shared
/// via `Arc` across every phase.
pub struct PipelineMetrics {
    // ── P1 ──────────────────────────────────────────────────────────────
    pub ticks_ingested: AtomicU64,
    pub ticks_deduplicated: AtomicU64,
    pub ticks_dropped_late: AtomicU64,
    pub ticks_dropped_invalid: AtomicU64,
    pub ticks_dropped_overflow: AtomicU64,
    pub exchange_reconnects: AtomicU64,
    pub exchange_heartbeat_losses: AtomicU64,
    pub bars_closed: AtomicU64,
    pub frames_published: AtomicU64,
    pub indicator_failures: AtomicU64,
    pub strategy_failures: AtomicU64,
    pub candidates_emitted: AtomicU64,
    pub candidates_below_threshold: AtomicU64,

    // ── P2 ──────────────────────────────────────────────────────────────
    pub lane_express: AtomicU64,
    pub lane_standard: AtomicU64,
    pub lane_deep: AtomicU64,
    pub lane_degradations: AtomicU64,
    pub dedup_suppressions: AtomicU64,
    pub correlation_conflicts: AtomicU64,
    pub correlation_reinforcements: AtomicU64,
    pub reinforced_promotions: AtomicU64,
    pub dead_lettered: AtomicU64,

    // ── P3 ──────────────────────────────────────────────────────────────
    pub verdict_new: AtomicU64,
    pub verdict_replace: AtomicU64,
    pub verdict_strengthen: AtomicU64,
    pub verdict_ignore: AtomicU64,
    pub contention_timeouts: AtomicU64,
    pub positions_open: AtomicU64,

    // ── P4 ──────────────────────────────────────────────────────────────
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub notifications_expired: AtomicU64,
    pub notifications_suppressed_low: AtomicU64,
    pub notification_retries: AtomicU64,

    // ── P5 ──────────────────────────────────────────────────────────────
    pub outcomes_recorded: AtomicU64,
    pub outcomes_duplicate: AtomicU64,
    pub patterns_discovered: AtomicU64,
    pub parameter_versions_published: AtomicU64,

    // ── Queue depth gauges ──────────────────────────────────────────────
    pub depth_candidates: AtomicU64,
    pub depth_vetted: AtomicU64,
    pub depth_decisions: AtomicU64,
    pub depth_notifications: AtomicU64,

    // ── Shed / deadline ─────────────────────────────────────────────────
    pub deadline_shed: AtomicU64,

    /// End-to-end latency from candidate emission to notification SENT.
    pub e2e_latency: LatencyHistogram,

    /// Labeled drop/error reason counters; write lock only on first use of
    /// a label.
    reasons: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            ticks_ingested: AtomicU64::new(0),
            ticks_deduplicated: AtomicU64::new(0),
            ticks_dropped_late: AtomicU64::new(0),
            ticks_dropped_invalid: AtomicU64::new(0),
            ticks_dropped_overflow: AtomicU64::new(0),
            exchange_reconnects: AtomicU64::new(0),
            exchange_heartbeat_losses: AtomicU64::new(0),
            bars_closed: AtomicU64::new(0),
            frames_published: AtomicU64::new(0),
            indicator_failures: AtomicU64::new(0),
            strategy_failures: AtomicU64::new(0),
            candidates_emitted: AtomicU64::new(0),
            candidates_below_threshold: AtomicU64::new(0),
            lane_express: AtomicU64::new(0),
            lane_standard: AtomicU64::new(0),
            lane_deep: AtomicU64::new(0),
            lane_degradations: AtomicU64::new(0),
            dedup_suppressions: AtomicU64::new(0),
            correlation_conflicts: AtomicU64::new(0),
            correlation_reinforcements: AtomicU64::new(0),
            reinforced_promotions: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            verdict_new: AtomicU64::new(0),
            verdict_replace: AtomicU64::new(0),
            verdict_strengthen: AtomicU64::new(0),
            verdict_ignore: AtomicU64::new(0),
            contention_timeouts: AtomicU64::new(0),
            positions_open: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            notifications_expired: AtomicU64::new(0),
            notifications_suppressed_low: AtomicU64::new(0),
            notification_retries: AtomicU64::new(0),
            outcomes_recorded: AtomicU64::new(0),
            outcomes_duplicate: AtomicU64::new(0),
            patterns_discovered: AtomicU64::new(0),
            parameter_versions_published: AtomicU64::new(0),
            depth_candidates: AtomicU64::new(0),
            depth_vetted: AtomicU64::new(0),
            depth_decisions: AtomicU64::new(0),
            depth_notifications: AtomicU64::new(0),
            deadline_shed: AtomicU64::new(0),
            e2e_latency: LatencyHistogram::new(),
            reasons: RwLock::new(HashMap::new()),
        }
    }

    /// Increment a labeled reason counter. Fast path is a read lock + atomic
    /// add; the write lock is taken once per label lifetime.
    pub fn bump_reason(&self, label: &str) {
        if let Some(counter) = self.reasons.read().get(label) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut map = self.reasons.write();
        map.entry(label.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a labeled reason counter.
    pub fn reason_count(&self, label: &str) -> u64 {
        self.reasons
            .read()
            .get(label)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a verdict for the distribution counters.
    pub fn record_verdict(&self, verdict: crate::types::Verdict) {
        use crate::types::Verdict;
        match verdict {
            Verdict::New => &self.verdict_new,
            Verdict::Replace => &self.verdict_replace,
            Verdict::Strengthen => &self.verdict_strengthen,
            Verdict::Ignore => &self.verdict_ignore,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    /// Serialisable snapshot for the operator CLI.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            ticks_ingested: load(&self.ticks_ingested),
            ticks_deduplicated: load(&self.ticks_deduplicated),
            ticks_dropped_late: load(&self.ticks_dropped_late),
            ticks_dropped_invalid: load(&self.ticks_dropped_invalid),
            ticks_dropped_overflow: load(&self.ticks_dropped_overflow),
            exchange_reconnects: load(&self.exchange_reconnects),
            exchange_heartbeat_losses: load(&self.exchange_heartbeat_losses),
            bars_closed: load(&self.bars_closed),
            frames_published: load(&self.frames_published),
            indicator_failures: load(&self.indicator_failures),
            strategy_failures: load(&self.strategy_failures),
            candidates_emitted: load(&self.candidates_emitted),
            candidates_below_threshold: load(&self.candidates_below_threshold),
            lane_express: load(&self.lane_express),
            lane_standard: load(&self.lane_standard),
            lane_deep: load(&self.lane_deep),
            lane_degradations: load(&self.lane_degradations),
            dedup_suppressions: load(&self.dedup_suppressions),
            correlation_conflicts: load(&self.correlation_conflicts),
            correlation_reinforcements: load(&self.correlation_reinforcements),
            reinforced_promotions: load(&self.reinforced_promotions),
            dead_lettered: load(&self.dead_lettered),
            verdict_new: load(&self.verdict_new),
            verdict_replace: load(&self.verdict_replace),
            verdict_strengthen: load(&self.verdict_strengthen),
            verdict_ignore: load(&self.verdict_ignore),
            contention_timeouts: load(&self.contention_timeouts),
            positions_open: load(&self.positions_open),
            notifications_sent: load(&self.notifications_sent),
            notifications_failed: load(&self.notifications_failed),
            notifications_expired: load(&self.notifications_expired),
            notifications_suppressed_low: load(&self.notifications_suppressed_low),
            notification_retries: load(&self.notification_retries),
            outcomes_recorded: load(&self.outcomes_recorded),
            outcomes_duplicate: load(&self.outcomes_duplicate),
            patterns_discovered: load(&self.patterns_discovered),
            parameter_versions_published: load(&self.parameter_versions_published),
            depth_candidates: load(&self.depth_candidates),
            depth_vetted: load(&self.depth_vetted),
            depth_decisions: load(&self.depth_decisions),
            depth_notifications: load(&self.depth_notifications),
            deadline_shed: load(&self.deadline_shed),
            e2e_latency: self.e2e_latency.snapshot(),
            reasons: self
                .reasons
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter, serialised for the CLI `inspect`
/// command.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub ticks_ingested: u64,
    pub ticks_deduplicated: u64,
    pub ticks_dropped_late: u64,
    pub ticks_dropped_invalid: u64,
    pub ticks_dropped_overflow: u64,
    pub exchange_reconnects: u64,
    pub exchange_heartbeat_losses: u64,
    pub bars_closed: u64,
    pub frames_published: u64,
    pub indicator_failures: u64,
    pub strategy_failures: u64,
    pub candidates_emitted: u64,
    pub candidates_below_threshold: u64,
    pub lane_express: u64,
    pub lane_standard: u64,
    pub lane_deep: u64,
    pub lane_degradations: u64,
    pub dedup_suppressions: u64,
    pub correlation_conflicts: u64,
    pub correlation_reinforcements: u64,
    pub reinforced_promotions: u64,
    pub dead_lettered: u64,
    pub verdict_new: u64,
    pub verdict_replace: u64,
    pub verdict_strengthen: u64,
    pub verdict_ignore: u64,
    pub contention_timeouts: u64,
    pub positions_open: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub notifications_expired: u64,
    pub notifications_suppressed_low: u64,
    pub notification_retries: u64,
    pub outcomes_recorded: u64,
    pub outcomes_duplicate: u64,
    pub patterns_discovered: u64,
    pub parameter_versions_published: u64,
    pub depth_candidates: u64,
    pub depth_vetted: u64,
    pub depth_decisions: u64,
    pub depth_notifications: u64,
    pub deadline_shed: u64,
    pub e2e_latency: LatencySnapshot,
    pub reasons: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Verdict;

    #[test]
    fn histogram_bucketing() {
        let h = LatencyHistogram::new();
        h.observe_ms(0);
        h.observe_ms(1);
        h.observe_ms(7);
        h.observe_ms(3_000);
        let snap = h.snapshot();
        assert_eq!(snap.count, 4);
        assert_eq!(snap.sum_ms, 3_008);
        // 0 and 1 land in the <=1 bucket; 7 in <=10; 3000 in +inf.
        assert_eq!(snap.counts[0], 2);
        assert_eq!(snap.counts[2], 1);
        assert_eq!(snap.counts[8], 1);
    }

    #[test]
    fn reason_counters_accumulate() {
        let m = PipelineMetrics::new();
        m.bump_reason("quality_floor");
        m.bump_reason("quality_floor");
        m.bump_reason("duplicate");
        assert_eq!(m.reason_count("quality_floor"), 2);
        assert_eq!(m.reason_count("duplicate"), 1);
        assert_eq!(m.reason_count("missing"), 0);
    }

    #[test]
    fn verdict_distribution() {
        let m = PipelineMetrics::new();
        m.record_verdict(Verdict::New);
        m.record_verdict(Verdict::Ignore);
        m.record_verdict(Verdict::Ignore);
        let snap = m.snapshot();
        assert_eq!(snap.verdict_new, 1);
        assert_eq!(snap.verdict_ignore, 2);
        assert_eq!(snap.verdict_replace, 0);
    }

    #[test]
    fn snapshot_contains_reasons() {
        let m = PipelineMetrics::new();
        m.bump_reason("expired");
        let snap = m.snapshot();
        assert_eq!(snap.reasons.get("expired"), Some(&1));
    }
}
