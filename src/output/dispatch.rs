// =============================================================================
// Dispatcher — pluggable sink with bounded retry
// =============================================================================
//
// The sink contract is `dispatch(envelope) -> Ok | Transient | Permanent`.
// Transient errors retry with jittered exponential backoff up to the cap,
// then the notification is FAILED. Sink I/O happens outside the queue lock.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::OutputConfig;
use crate::market_data::exchange::backoff_delay;
use crate::metrics::PipelineMetrics;

use super::queue::NotificationQueue;
use super::NotificationEnvelope;

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ok,
    /// Expected to recover; retried with backoff.
    Transient(String),
    /// Will never succeed; terminal.
    Permanent(String),
}

/// The pluggable delivery transport.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn dispatch(&self, envelope: &NotificationEnvelope) -> DispatchOutcome;
}

/// Default sink: renders the envelope into the structured log. Production
/// deployments plug a real transport behind the same trait.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn dispatch(&self, envelope: &NotificationEnvelope) -> DispatchOutcome {
        tracing::info!(
            recipient = %envelope.recipient,
            subject = %envelope.subject,
            symbol = %envelope.body.symbol,
            direction = %envelope.body.direction,
            entry = envelope.body.entry,
            stop_loss = envelope.body.stop_loss,
            take_profit = envelope.body.take_profit,
            confidence = envelope.body.confidence,
            band = %envelope.band,
            "notification dispatched"
        );
        DispatchOutcome::Ok
    }
}

/// Drives one sink from the shared notification queue.
pub struct Dispatcher {
    cfg: OutputConfig,
    queue: Arc<NotificationQueue>,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<PipelineMetrics>,
}

impl Dispatcher {
    pub fn new(
        cfg: OutputConfig,
        queue: Arc<NotificationQueue>,
        sink: Arc<dyn NotificationSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            cfg,
            queue,
            sink,
            metrics,
        }
    }

    /// One dispatch step at `now_ms`: pick the best eligible notification
    /// and deliver it. Returns whether anything was attempted.
    pub async fn step(&self, now_ms: i64) -> bool {
        let Some(notification) = self.queue.next_ready(now_ms) else {
            return false;
        };

        let outcome = self.sink.dispatch(&notification.envelope).await;
        match outcome {
            DispatchOutcome::Ok => {
                self.queue.mark_sent(&notification.id, now_ms);
            }
            DispatchOutcome::Transient(reason) => {
                if notification.attempts >= self.cfg.retry_cap {
                    warn!(
                        candidate = %notification.candidate_id,
                        attempts = notification.attempts,
                        %reason,
                        "retry cap reached; notification failed"
                    );
                    self.queue.mark_failed(&notification.id);
                } else {
                    let delay = backoff_delay(
                        notification.attempts.saturating_sub(1),
                        self.cfg.retry_initial_ms,
                        self.cfg.retry_cap_ms,
                    );
                    debug!(
                        candidate = %notification.candidate_id,
                        attempt = notification.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        %reason,
                        "transient sink error; retrying"
                    );
                    self.queue
                        .requeue_after_failure(&notification.id, now_ms + delay.as_millis() as i64);
                }
            }
            DispatchOutcome::Permanent(reason) => {
                warn!(
                    candidate = %notification.candidate_id,
                    %reason,
                    "permanent sink error; notification failed"
                );
                self.metrics.bump_reason("sink_permanent_error");
                self.queue.mark_failed(&notification.id);
            }
        }
        true
    }

    /// Run until shutdown: poll the queue, deliver, sleep briefly when idle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now_ms = Utc::now().timestamp_millis();
            let worked = self.step(now_ms).await;
            if !worked {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
