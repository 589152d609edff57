//! CaptureStore port - オフライン撮影データの永続ストア
//!
//! CaptureStore は以下を管理します：
//! - PendingCapture レコード（id が主キー）
//! - task / status / timestamp / assign による検索
//! - 件数・容量の上限（保存時にチェック）
//!
//! ネットワークには一切依存しない。
//!
//! # 送信の所有権
//! `syncing` は「この drain が今送っている」という印。複数のハンドル・プロセスが
//! 同じストアを開いても、送信（claim と復旧）は `claim_drain` を取れた 1 者だけが行う。
//!
//! # 実装
//! - `impls::InMemoryCaptureStore`（テスト・一時利用）
//! - `impls::SqliteCaptureStore`（本番用、クラッシュ耐性あり）

use async_trait::async_trait;

use crate::domain::{
    AssignId, Blob, CaptureError, CaptureId, CaptureStatus, PendingCapture, StorageState, TaskId,
};

/// Message stored on captures whose upload was cut short before it was
/// acknowledged (crash, or a store error right after the attempt).
pub const INTERRUPTED_ERROR: &str = "upload interrupted before acknowledgement";

/// Write-time ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Maximum number of stored records.
    pub max_captures: usize,
    /// Maximum aggregate payload size in bytes.
    pub max_bytes: u64,
}

impl StoreLimits {
    /// Reject the save if it would push either aggregate past its ceiling.
    pub fn check(&self, state: &StorageState, incoming: u64) -> Result<(), CaptureError> {
        use crate::domain::QuotaKind;

        if state.total_count >= self.max_captures {
            return Err(CaptureError::QuotaExceeded(QuotaKind::Count {
                limit: self.max_captures,
            }));
        }
        if state.total_bytes.saturating_add(incoming) > self.max_bytes {
            return Err(CaptureError::QuotaExceeded(QuotaKind::Bytes {
                limit: self.max_bytes,
                current: state.total_bytes,
                requested: incoming,
            }));
        }
        Ok(())
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_captures: 50,
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// CaptureStore は撮影データの正本（source of truth）
///
/// # 設計原則
/// - 1 操作 = 1 トランザクション（レコード単位で原子的）
/// - レコードをまたぐトランザクションは使わない
/// - quota チェックと書き込みは同じトランザクション内（部分書き込みなし）
/// - `initialize` 前の操作は内部で `initialize` を呼ぶ
#[async_trait]
pub trait CaptureStore: Send + Sync {
    /// Open/create the backing store and its indexes. Idempotent.
    async fn initialize(&self) -> Result<(), CaptureError>;

    /// Persist a new `Pending` capture and return its id.
    ///
    /// Fails with `QuotaExceeded` and writes nothing when a ceiling would be
    /// breached.
    async fn save(
        &self,
        task_id: TaskId,
        assign_id: AssignId,
        blob: Blob,
        stage: &str,
    ) -> Result<CaptureId, CaptureError>;

    /// All captures of a task, in no particular order.
    async fn get_by_task(&self, task_id: &TaskId) -> Result<Vec<PendingCapture>, CaptureError>;

    /// All captures of an assignment, in no particular order.
    async fn get_by_assign(&self, assign_id: &AssignId)
    -> Result<Vec<PendingCapture>, CaptureError>;

    /// Captures in `status`. `Pending` comes back oldest first.
    async fn get_by_status(
        &self,
        status: CaptureStatus,
    ) -> Result<Vec<PendingCapture>, CaptureError>;

    async fn get_by_id(&self, id: CaptureId) -> Result<Option<PendingCapture>, CaptureError>;

    /// Change status; entering `Failed` bumps `retry_count` and stores `error`.
    ///
    /// The check and the write are atomic. Fails with `NotFound` when `id` is
    /// absent and with `InvalidTransition` when the stored status does not
    /// allow the move, so two claimers can never both get `Syncing`.
    async fn update_status(
        &self,
        id: CaptureId,
        status: CaptureStatus,
        error: Option<String>,
    ) -> Result<(), CaptureError>;

    /// Take the right to upload from this store, then turn every `Syncing`
    /// record left behind by an earlier attempt into `Failed` (retry count
    /// bumped, `INTERRUPTED_ERROR` stored). Returns how many were recovered.
    ///
    /// Returns `None` when another owner (another process on the same
    /// database) holds the store; the caller must not claim records then.
    /// Once taken, ownership lasts as long as this handle. Callers must not
    /// have an upload in flight on this handle while calling it.
    async fn claim_drain(&self) -> Result<Option<usize>, CaptureError>;

    /// Move every `Failed` capture back to `Pending` with `retry_count = 0`.
    /// Returns the ids that were reset.
    async fn reset_failed(&self) -> Result<Vec<CaptureId>, CaptureError>;

    /// Remove one capture. Absent ids are not an error; returns whether a
    /// record was removed.
    async fn delete(&self, id: CaptureId) -> Result<bool, CaptureError>;

    /// Remove every capture of a task; returns how many were removed.
    async fn delete_by_task(&self, task_id: &TaskId) -> Result<usize, CaptureError>;

    async fn aggregate_state(&self) -> Result<StorageState, CaptureError>;

    /// Delete every capture created before `now - retention_days`, whatever
    /// its status. Returns the count removed.
    async fn purge_older_than(&self, retention_days: u32) -> Result<usize, CaptureError>;

    /// Empty the store.
    async fn clear(&self) -> Result<(), CaptureError>;
}

/// Cutoff (epoch millis) for a retention window ending at `now_ms`.
pub fn retention_cutoff(now_ms: i64, retention_days: u32) -> i64 {
    now_ms - i64::from(retention_days) * 24 * 60 * 60 * 1000
}
