//! Events - 同期エンジンが通知するイベント
//!
//! 購読者（ステータス表示など）はこの型だけを見ればよい。

use serde::{Deserialize, Serialize};

use super::{CaptureId, TaskId};

/// Why a capture was refused at save time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageWarning {
    /// The record-count ceiling is reached.
    CountLimit,
    /// The aggregate byte ceiling would be exceeded.
    BytesLimit,
}

/// SyncEvent は購読者に配送される通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted,
    SyncCompleted { success: usize, failed: usize },
    SyncError { message: String },

    CaptureAdded { id: CaptureId, task_id: TaskId },
    CaptureDeleted { id: CaptureId },
    StorageWarning { reason: StorageWarning },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::SyncStarted => "sync_started",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::SyncError { .. } => "sync_error",
            SyncEvent::CaptureAdded { .. } => "capture_added",
            SyncEvent::CaptureDeleted { .. } => "capture_deleted",
            SyncEvent::StorageWarning { .. } => "storage_warning",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_event_is_tagged() {
        let ev = SyncEvent::SyncCompleted {
            success: 3,
            failed: 1,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], ev.kind());
        assert_eq!(json["success"], 3);
        assert_eq!(json["failed"], 1);
    }

    #[test]
    fn warning_reason_uses_snake_case() {
        let ev = SyncEvent::StorageWarning {
            reason: StorageWarning::BytesLimit,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["reason"], "bytes_limit");
    }
}
