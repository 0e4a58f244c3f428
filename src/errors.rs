// =============================================================================
// Error taxonomy — classify, count, decide; never leak across phase boundaries
// =============================================================================
//
// Policies per class:
//   Transient  — retry with backoff, count, continue.
//   Validation — drop the offending item, count the reason, no retry.
//   Contention — per-symbol lock timeout; yield IGNORE with rationale.
//   Deadline   — per-phase budget exceeded; shed the item, count.
//   Fatal      — refuse to start; the only error allowed to halt the process.
// =============================================================================

use thiserror::Error;

/// Classified pipeline error. Phases catch, classify, count, and decide;
/// only `Fatal` during startup escapes.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("contention: {0}")]
    Contention(String),

    #[error("deadline exceeded: {0}")]
    Deadline(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    /// Metrics label for the class.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Validation(_) => "validation",
            Self::Contention(_) => "contention",
            Self::Deadline(_) => "deadline",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Whether the failed operation may be retried.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Fewer healthy exchange connections than the configured quorum after the
/// bounded retry window. Raised by `subscribe`; fatal at startup.
#[derive(Debug, Error)]
#[error("no healthy exchange: {healthy} of {required} required connections up")]
pub struct NoHealthyExchange {
    pub healthy: usize,
    pub required: usize,
}

/// Why the pre-evaluation stage refused a candidate. Carried to the metrics
/// reason counters; `label()` is the counter key.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// Duplicate of `kept_candidate` within the dedup window.
    Duplicate { kept_candidate: String },
    /// Composite quality below the configured floor.
    BelowQualityFloor { composite: f64 },
    /// Field-level validation failure.
    Invalid { detail: String },
    /// A pre-evaluation step errored; candidate routed to the dead-letter
    /// channel.
    DeadLetter { stage: &'static str },
    /// Expiry timestamp passed before processing.
    Expired,
    /// Per-phase time budget exceeded.
    DeadlineExceeded,
}

impl DropReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Duplicate { .. } => "duplicate",
            Self::BelowQualityFloor { .. } => "quality_floor",
            Self::Invalid { .. } => "invalid",
            Self::DeadLetter { .. } => "dead_letter",
            Self::Expired => "expired",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate { kept_candidate } => {
                write!(f, "duplicate of {kept_candidate}")
            }
            Self::BelowQualityFloor { composite } => {
                write!(f, "composite {composite:.3} below quality floor")
            }
            Self::Invalid { detail } => write!(f, "invalid: {detail}"),
            Self::DeadLetter { stage } => write!(f, "dead-letter from {stage}"),
            Self::Expired => write!(f, "expired before processing"),
            Self::DeadlineExceeded => write!(f, "phase deadline exceeded"),
        }
    }
}
