//! Errors - エラー型と分類
//!
//! - `CaptureError`: 呼び出し元へ伝播するエラー（quota / storage / not found）
//! - `UploadError`: 1 件のアップロード失敗。drain の外には出さず、レコードの状態として残す

use std::time::Duration;

use thiserror::Error;

use super::events::StorageWarning;
use super::{CaptureId, CaptureStatus};

/// Which ceiling a save would have breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Count { limit: usize },
    Bytes { limit: u64, current: u64, requested: u64 },
}

impl QuotaKind {
    pub fn warning(&self) -> StorageWarning {
        match self {
            QuotaKind::Count { .. } => StorageWarning::CountLimit,
            QuotaKind::Bytes { .. } => StorageWarning::BytesLimit,
        }
    }
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaKind::Count { limit } => write!(f, "capture count limit of {limit} reached"),
            QuotaKind::Bytes {
                limit,
                current,
                requested,
            } => write!(
                f,
                "storage limit of {limit} bytes would be exceeded ({current} stored + {requested} requested)"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaKind),

    #[error("offline storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage transaction failed: {0}")]
    Transaction(String),

    #[error("capture not found: {0}")]
    NotFound(CaptureId),

    /// The record is not in a state the change can start from.
    #[error("capture {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: CaptureId,
        from: CaptureStatus,
        to: CaptureStatus,
    },
}

impl CaptureError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CaptureError::NotFound(_))
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, CaptureError::QuotaExceeded(_))
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, CaptureError::InvalidTransition { .. })
    }
}

impl From<rusqlite::Error> for CaptureError {
    fn from(err: rusqlite::Error) -> Self {
        CaptureError::Transaction(err.to_string())
    }
}

/// One failed upload attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("upload transport error: {0}")]
    Transport(String),

    #[error("upload rejected with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upload timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid upload payload: {0}")]
    InvalidPayload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_messages_name_the_ceiling() {
        let err = CaptureError::QuotaExceeded(QuotaKind::Bytes {
            limit: 10,
            current: 8,
            requested: 4,
        });
        let msg = err.to_string();
        assert!(msg.contains("10 bytes"));
        assert!(err.is_quota());
        assert!(!err.is_not_found());
    }

    #[test]
    fn refused_transition_names_both_states() {
        let err = CaptureError::InvalidTransition {
            id: CaptureId::from_ulid(ulid::Ulid::nil()),
            from: CaptureStatus::Syncing,
            to: CaptureStatus::Syncing,
        };
        assert!(err.is_invalid_transition());
        assert!(err.to_string().contains("from syncing to syncing"));
    }

    #[test]
    fn quota_kind_maps_to_warning() {
        assert_eq!(
            QuotaKind::Count { limit: 1 }.warning(),
            StorageWarning::CountLimit
        );
    }
}
