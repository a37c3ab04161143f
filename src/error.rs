//! Pipeline error taxonomy
//!
//! Transient conditions (queue timeouts, momentary pool exhaustion) are kept
//! distinct from per-frame failures and from hard configuration/allocation
//! errors so callers can apply the right recovery: retry, fail-forward, or
//! abort stream start.

use thiserror::Error;

use crate::frame::{Direction, StageId};

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Inconsistent pool/pipeline configuration, rejected at configure time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Backing memory allocation failed after the bounded retry budget.
    #[error("buffer allocation failed after {attempts} attempt(s): {reason}")]
    Allocation { attempts: u32, reason: String },

    /// No free slot in the pool right now. Transient; callers poll/backoff.
    #[error("buffer pool '{pool}' exhausted")]
    Exhausted { pool: String },

    /// No BufferManager is registered for this (stage, direction).
    /// Fatal for the affected frame only.
    #[error("no buffer manager for stage {stage:?} direction {direction:?}")]
    BufferBind { stage: StageId, direction: Direction },

    /// A buffer slot was returned twice, or returned without being acquired.
    #[error("invalid release of buffer {index} in pool '{pool}': {reason}")]
    InvalidRelease {
        pool: String,
        index: usize,
        reason: &'static str,
    },

    /// Lookup by frame count found nothing.
    #[error("frame {0} not found")]
    FrameNotFound(u32),

    /// The frame has no entity for the requested stage.
    #[error("frame {frame_count} has no entity for stage {stage:?}")]
    MissingEntity { frame_count: u32, stage: StageId },

    /// Capture selection gave up after its retry budget.
    #[error("no selectable frame after {retries} retries")]
    SelectExhausted { retries: u32 },

    /// The queue (or the whole pipeline) was stopped while waiting.
    #[error("stopped")]
    Stopped,

    /// A state transition the frame state machine forbids.
    #[error("invalid state transition on frame {frame_count} stage {stage:?}: {detail}")]
    InvalidTransition {
        frame_count: u32,
        stage: StageId,
        detail: &'static str,
    },

    /// Programming invariant violation. Logged and degraded, never a crash
    /// in release builds.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

impl PipelineError {
    /// Transient conditions are retried or skipped by the calling loop;
    /// they never tear the pipeline down.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Exhausted { .. })
    }
}
