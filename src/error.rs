use thiserror::Error;

use crate::claim::model::{ClaimId, ClaimStatus, WorkItemId};

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("lock on {resource} unavailable after {attempts} attempts")]
    LockUnavailable { resource: WorkItemId, attempts: u32 },

    #[error("stale write on {resource}: token {token} is older than {current}")]
    StaleWrite {
        resource: WorkItemId,
        token: u64,
        current: u64,
    },

    #[error("invalid transition for {target}: {reason}")]
    InvalidTransition { target: String, reason: String },

    #[error("confidence {confidence} below threshold {threshold}")]
    ScoringAmbiguous { confidence: u8, threshold: u8 },

    #[error("commit failed: {0}")]
    CommitFailure(String),

    #[error("action {action} dead-lettered after {attempts} attempts: {last_error}")]
    DeadLetter {
        action: String,
        attempts: u32,
        last_error: String,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

impl ClaimError {
    pub fn invalid_status(claim: &ClaimId, from: ClaimStatus, to: ClaimStatus) -> Self {
        ClaimError::InvalidTransition {
            target: claim.to_string(),
            reason: format!("{} -> {} not allowed", from.as_str(), to.as_str()),
        }
    }

    pub fn missing_claim(claim: &ClaimId) -> Self {
        ClaimError::InvalidTransition {
            target: claim.to_string(),
            reason: "claim does not exist".to_string(),
        }
    }

    /// Resource errors the caller should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClaimError::LockUnavailable { .. }
                | ClaimError::StaleWrite { .. }
                | ClaimError::CommitFailure(_)
                | ClaimError::Backend(_)
        )
    }

    /// Component-local errors that are logged and dropped.
    pub fn is_absorbed(&self) -> bool {
        matches!(
            self,
            ClaimError::InvalidTransition { .. } | ClaimError::ScoringAmbiguous { .. }
        )
    }
}

impl From<std::io::Error> for ClaimError {
    fn from(err: std::io::Error) -> Self {
        ClaimError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for ClaimError {
    fn from(err: serde_json::Error) -> Self {
        ClaimError::Backend(err.to_string())
    }
}

pub type ClaimResult<T> = std::result::Result<T, ClaimError>;
