// =============================================================================
// Notification queue — bands, cooldowns, hourly budgets, daily dedup
// =============================================================================
//
// State machine per notification:
//
//   QUEUED -> READY -> SENDING -> SENT | FAILED | EXPIRED
//
// Band rules:
//
//   | Band     | Delay  | Cooldown/symbol | Max/hour |
//   |----------|--------|-----------------|----------|
//   | CRITICAL | 0 s    | 60 s            | 10       |
//   | HIGH     | 300 s  | 900 s           | 6        |
//   | MEDIUM   | 1800 s | 3600 s          | 3        |
//   | LOW      | suppressed (metrics only)           |
//
// Dedup: for each (symbol, band) and UTC calendar day at most one
// notification reaches SENT. A stronger arrival replaces the waiting one;
// an already-sent one is never recalled, and later arrivals that day are
// suppressed.
//
// Dispatch order: (band priority, ready time); within a band, higher
// strength first, earlier emission breaking ties.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::PipelineMetrics;
use crate::types::{utc_day, PriorityBand};

use super::NotificationEnvelope;

// ---------------------------------------------------------------------------
// Band rules
// ---------------------------------------------------------------------------

/// Rate rule for one band. `None` for LOW (suppressed).
#[derive(Debug, Clone, Copy)]
pub struct BandRule {
    pub delay_secs: i64,
    pub cooldown_secs: i64,
    pub max_per_hour: usize,
}

impl BandRule {
    pub fn for_band(band: PriorityBand) -> Option<Self> {
        match band {
            PriorityBand::Critical => Some(Self {
                delay_secs: 0,
                cooldown_secs: 60,
                max_per_hour: 10,
            }),
            PriorityBand::High => Some(Self {
                delay_secs: 300,
                cooldown_secs: 900,
                max_per_hour: 6,
            }),
            PriorityBand::Medium => Some(Self {
                delay_secs: 1_800,
                cooldown_secs: 3_600,
                max_per_hour: 3,
            }),
            PriorityBand::Low => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Notification record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationState {
    Queued,
    Ready,
    Sending,
    Sent,
    Failed,
    Expired,
}

/// One queued notification.
#[derive(Debug, Clone)]
pub struct QueuedNotification {
    pub id: String,
    pub candidate_id: String,
    pub symbol: String,
    pub band: PriorityBand,
    pub strength: f64,
    pub emitted_at_ms: i64,
    pub expires_at_ms: i64,
    pub ready_at_ms: i64,
    pub state: NotificationState,
    pub attempts: u32,
    pub envelope: NotificationEnvelope,
}

/// Why an enqueue did not produce a waiting notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Replaced a weaker waiting notification for the same (symbol, band).
    ReplacedWaiting,
    /// A waiting notification for the slot is already stronger.
    WeakerThanWaiting,
    /// The day's slot for (symbol, band) already reached SENT.
    SuppressedDaily,
    /// LOW band: metrics only.
    SuppressedLow,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct Inner {
    waiting: Vec<QueuedNotification>,
    /// (symbol, band) -> last SENT timestamp, for cooldowns.
    cooldowns: HashMap<(String, PriorityBand), i64>,
    /// band -> SENT timestamps in the trailing hour.
    hourly: HashMap<PriorityBand, VecDeque<i64>>,
    /// (symbol, band, day) slots that already reached SENT.
    sent_today: HashSet<(String, PriorityBand, String)>,
}

/// Thread-safe notification queue for the P4 dispatcher.
pub struct NotificationQueue {
    inner: Mutex<Inner>,
    metrics: Arc<PipelineMetrics>,
}

impl NotificationQueue {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiting: Vec::new(),
                cooldowns: HashMap::new(),
                hourly: HashMap::new(),
                sent_today: HashSet::new(),
            }),
            metrics,
        }
    }

    /// Enqueue a notification for `envelope`, applying band suppression and
    /// the per-day dedup.
    pub fn enqueue(
        &self,
        candidate_id: &str,
        strength: f64,
        emitted_at_ms: i64,
        expires_at_ms: i64,
        envelope: NotificationEnvelope,
        now_ms: i64,
    ) -> EnqueueOutcome {
        use std::sync::atomic::Ordering::Relaxed;

        let band = envelope.band;
        let Some(rule) = BandRule::for_band(band) else {
            self.metrics.notifications_suppressed_low.fetch_add(1, Relaxed);
            debug!(candidate = %candidate_id, "LOW band notification suppressed");
            return EnqueueOutcome::SuppressedLow;
        };

        let symbol = envelope.body.symbol.clone();
        let day = utc_day(now_ms);
        let mut inner = self.inner.lock();

        if inner
            .sent_today
            .contains(&(symbol.clone(), band, day.clone()))
        {
            self.metrics.bump_reason("notification_daily_dedup");
            return EnqueueOutcome::SuppressedDaily;
        }

        let notification = QueuedNotification {
            id: Uuid::new_v4().to_string(),
            candidate_id: candidate_id.to_string(),
            symbol: symbol.clone(),
            band,
            strength,
            emitted_at_ms,
            expires_at_ms,
            ready_at_ms: now_ms + rule.delay_secs * 1_000,
            state: NotificationState::Queued,
            attempts: 0,
            envelope,
        };

        // Same-day slot already waiting: the stronger one keeps it.
        if let Some(existing) = inner.waiting.iter_mut().find(|n| {
            n.symbol == symbol
                && n.band == band
                && utc_day(n.emitted_at_ms) == utc_day(emitted_at_ms)
                && matches!(n.state, NotificationState::Queued | NotificationState::Ready)
        }) {
            if strength > existing.strength {
                debug!(
                    slot = %format!("{symbol}/{band}"),
                    old = %existing.candidate_id,
                    new = %candidate_id,
                    "stronger notification replaced waiting one"
                );
                *existing = notification;
                self.update_depth(&inner);
                return EnqueueOutcome::ReplacedWaiting;
            }
            self.metrics.bump_reason("notification_weaker_duplicate");
            return EnqueueOutcome::WeakerThanWaiting;
        }

        inner.waiting.push(notification);
        self.update_depth(&inner);
        EnqueueOutcome::Queued
    }

    /// Pick the highest-priority eligible notification, mark it SENDING, and
    /// return it. Expired entries are terminal-ised along the way.
    pub fn next_ready(&self, now_ms: i64) -> Option<QueuedNotification> {
        use std::sync::atomic::Ordering::Relaxed;

        let mut inner = self.inner.lock();

        // Expiry pass: EXPIRED occurs when expiry passes before READY.
        let mut expired = 0u64;
        inner.waiting.retain(|n| {
            if n.state != NotificationState::Sending && now_ms > n.expires_at_ms {
                expired += 1;
                debug!(candidate = %n.candidate_id, "notification expired before READY");
                false
            } else {
                true
            }
        });
        if expired > 0 {
            self.metrics.notifications_expired.fetch_add(expired, Relaxed);
        }

        // QUEUED -> READY on delay elapse.
        for n in inner.waiting.iter_mut() {
            if n.state == NotificationState::Queued && now_ms >= n.ready_at_ms {
                n.state = NotificationState::Ready;
            }
        }

        // Eligibility: cooldown elapsed, hourly budget available.
        let mut best: Option<usize> = None;
        for (idx, n) in inner.waiting.iter().enumerate() {
            if n.state != NotificationState::Ready {
                continue;
            }
            let Some(rule) = BandRule::for_band(n.band) else {
                continue;
            };
            let cooldown_ok = inner
                .cooldowns
                .get(&(n.symbol.clone(), n.band))
                .map_or(true, |&last| now_ms - last >= rule.cooldown_secs * 1_000);
            if !cooldown_ok {
                continue;
            }
            let hour_count = inner
                .hourly
                .get(&n.band)
                .map_or(0, |v| v.iter().filter(|&&t| now_ms - t < 3_600_000).count());
            if hour_count >= rule.max_per_hour {
                continue;
            }

            let better = match best {
                None => true,
                Some(b) => {
                    let cur = &inner.waiting[b];
                    let key_new = (n.band.rank(), std::cmp::Reverse(ordered(n.strength)), n.emitted_at_ms);
                    let key_cur = (
                        cur.band.rank(),
                        std::cmp::Reverse(ordered(cur.strength)),
                        cur.emitted_at_ms,
                    );
                    key_new < key_cur
                }
            };
            if better {
                best = Some(idx);
            }
        }

        let idx = best?;
        inner.waiting[idx].state = NotificationState::Sending;
        inner.waiting[idx].attempts += 1;
        let picked = inner.waiting[idx].clone();
        self.update_depth(&inner);
        Some(picked)
    }

    /// Terminal SENT: stamps cooldown, hourly budget, and the daily slot.
    pub fn mark_sent(&self, id: &str, now_ms: i64) {
        use std::sync::atomic::Ordering::Relaxed;

        let mut inner = self.inner.lock();
        let Some(pos) = inner.waiting.iter().position(|n| n.id == id) else {
            return;
        };
        let n = inner.waiting.remove(pos);

        inner
            .cooldowns
            .insert((n.symbol.clone(), n.band), now_ms);
        let hour = inner.hourly.entry(n.band).or_default();
        hour.push_back(now_ms);
        while hour
            .front()
            .is_some_and(|&t| now_ms - t >= 3_600_000)
        {
            hour.pop_front();
        }
        inner
            .sent_today
            .insert((n.symbol.clone(), n.band, utc_day(now_ms)));

        self.metrics.notifications_sent.fetch_add(1, Relaxed);
        let latency = (now_ms - n.emitted_at_ms).max(0) as u64;
        self.metrics.e2e_latency.observe_ms(latency);
        self.update_depth(&inner);
        info!(candidate = %n.candidate_id, band = %n.band, latency_ms = latency, "notification sent");
    }

    /// Transient failure: push the notification back to QUEUED with a new
    /// ready time.
    pub fn requeue_after_failure(&self, id: &str, retry_at_ms: i64) {
        use std::sync::atomic::Ordering::Relaxed;
        let mut inner = self.inner.lock();
        if let Some(n) = inner.waiting.iter_mut().find(|n| n.id == id) {
            n.state = NotificationState::Queued;
            n.ready_at_ms = retry_at_ms;
            self.metrics.notification_retries.fetch_add(1, Relaxed);
        }
    }

    /// Terminal FAILED after the retry cap (or a permanent sink error).
    pub fn mark_failed(&self, id: &str) {
        use std::sync::atomic::Ordering::Relaxed;
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.waiting.iter().position(|n| n.id == id) {
            let n = inner.waiting.remove(pos);
            self.metrics.notifications_failed.fetch_add(1, Relaxed);
            self.update_depth(&inner);
            warn!(candidate = %n.candidate_id, attempts = n.attempts, "notification FAILED");
        }
    }

    /// Number of waiting (non-terminal) notifications.
    pub fn depth(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Current attempt count for a queued notification, if present.
    pub fn attempts(&self, id: &str) -> Option<u32> {
        self.inner
            .lock()
            .waiting
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.attempts)
    }

    fn update_depth(&self, inner: &Inner) {
        self.metrics
            .depth_notifications
            .store(inner.waiting.len() as u64, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Total order for f64 strengths (NaN sorts last).
fn ordered(v: f64) -> i64 {
    if v.is_nan() {
        i64::MIN
    } else {
        (v * 1e9) as i64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
