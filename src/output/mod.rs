// =============================================================================
// Output & monitoring (P4) — prioritized notifications under rate control
// =============================================================================

pub mod dispatch;
pub mod queue;

pub use dispatch::{DispatchOutcome, Dispatcher, NotificationSink};
pub use queue::{NotificationQueue, NotificationState};

use serde::{Deserialize, Serialize};

use crate::types::{Direction, PriorityBand};

/// Structured notification body. Diagnostic detail stays in metrics and
/// logs; the body carries only the trade picture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationBody {
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: f64,
    pub rationale: String,
    pub emitted_at_ms: i64,
}

/// What the sink receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub recipient: String,
    pub subject: String,
    pub body: NotificationBody,
    pub band: PriorityBand,
}
