//! Typed error hierarchy for the lead lifecycle core.
//!
//! Every operation returns `CrmError` to its immediate caller unmodified;
//! nothing is silently recovered and nothing is retried internally.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Stage {stage_id} does not belong to board {board_id}")]
    InvalidStage { stage_id: i64, board_id: i64 },

    #[error("Stage {stage_id} still holds {lead_count} lead(s)")]
    StageInUse { stage_id: i64, lead_count: i64 },

    #[error("Lead {lead_id} already has a pending handoff ({handoff_id})")]
    HandoffAlreadyPending { lead_id: i64, handoff_id: i64 },

    #[error("Handoff {id} is not pending")]
    HandoffNotPending { id: i64 },

    #[error("Lead {lead_id} has a pending handoff and cannot be deleted")]
    LeadHandoffPending { lead_id: i64 },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrmError {
    /// Expected, recoverable conflicts the caller should surface as a
    /// 4xx-equivalent response rather than a generic failure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::HandoffAlreadyPending { .. }
                | Self::HandoffNotPending { .. }
                | Self::LeadHandoffPending { .. }
                | Self::StageInUse { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CrmError>;
