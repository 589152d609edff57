//! CaptureEngine - 撮影側が呼ぶファサード
//!
//! ストアへの保存・削除と、その結果の通知、オンライン時の自動 drain を
//! 1 か所にまとめる。オフライン判定はここで行い、orchestrator には
//! オンライン時だけ委譲する。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::notifier::EventNotifier;
use crate::app::retention::{RetentionSweep, spawn_retention_sweep, sweep_once};
use crate::app::sync::SyncOrchestrator;
use crate::domain::{
    AssignId, Blob, CaptureError, CaptureId, CaptureStatus, PendingCapture, StorageState,
    SyncEvent, SyncReport, TaskId,
};
use crate::ports::CaptureStore;

/// Result of a user-requested sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Refused without touching the store.
    Offline,
}

/// Snapshot for a status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub storage: StorageState,
    pub online: bool,
    pub syncing: bool,
    pub auto_sync: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

pub struct CaptureEngine {
    store: Arc<dyn CaptureStore>,
    orchestrator: SyncOrchestrator,
    retention_days: u32,
    sync_interval: Duration,
    sweep_interval: Duration,
}

impl CaptureEngine {
    pub(crate) fn new(
        store: Arc<dyn CaptureStore>,
        orchestrator: SyncOrchestrator,
        retention_days: u32,
        sync_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            retention_days,
            sync_interval,
            sweep_interval,
        }
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn notifier(&self) -> &Arc<EventNotifier> {
        self.orchestrator.notifier()
    }

    pub fn store(&self) -> &Arc<dyn CaptureStore> {
        &self.store
    }

    pub fn is_online(&self) -> bool {
        self.orchestrator.network().is_online()
    }

    /// Open the store and drop anything past the retention window.
    pub async fn initialize(&self) -> Result<usize, CaptureError> {
        self.store.initialize().await?;
        sweep_once(self.store.as_ref(), self.retention_days).await
    }

    /// Persist one capture. When online a drain is started in the background.
    ///
    /// Quota rejections are reported as a `StorageWarning` event and returned
    /// unchanged.
    pub async fn capture(
        &self,
        task_id: TaskId,
        assign_id: AssignId,
        blob: Blob,
        stage: Option<&str>,
    ) -> Result<CaptureId, CaptureError> {
        let id = self.save_capture(task_id, assign_id, blob, stage).await?;
        if self.is_online() {
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator.process_queue().await;
            });
        }
        Ok(id)
    }

    /// Like [`capture`](Self::capture), but the drain runs inline and its
    /// report is returned. `None` when offline.
    ///
    /// If a drain is already running this returns at once with an empty
    /// report; the new record waits for the next one.
    pub async fn capture_and_sync(
        &self,
        task_id: TaskId,
        assign_id: AssignId,
        blob: Blob,
        stage: Option<&str>,
    ) -> Result<(CaptureId, Option<SyncReport>), CaptureError> {
        let id = self.save_capture(task_id, assign_id, blob, stage).await?;
        if !self.is_online() {
            return Ok((id, None));
        }
        Ok((id, Some(self.orchestrator.process_queue().await)))
    }

    async fn save_capture(
        &self,
        task_id: TaskId,
        assign_id: AssignId,
        blob: Blob,
        stage: Option<&str>,
    ) -> Result<CaptureId, CaptureError> {
        let stage = stage.unwrap_or_default();
        match self
            .store
            .save(task_id.clone(), assign_id, blob, stage)
            .await
        {
            Ok(id) => {
                self.notifier().emit(SyncEvent::CaptureAdded { id, task_id });
                Ok(id)
            }
            Err(CaptureError::QuotaExceeded(kind)) => {
                warn!(%kind, "capture refused");
                self.notifier().emit(SyncEvent::StorageWarning {
                    reason: kind.warning(),
                });
                Err(CaptureError::QuotaExceeded(kind))
            }
            Err(e) => Err(e),
        }
    }

    /// Returns whether a capture was removed.
    pub async fn discard(&self, id: CaptureId) -> Result<bool, CaptureError> {
        let removed = self.store.delete(id).await?;
        if removed {
            self.notifier().emit(SyncEvent::CaptureDeleted { id });
        }
        Ok(removed)
    }

    pub async fn discard_task(&self, task_id: &TaskId) -> Result<usize, CaptureError> {
        let ids: Vec<CaptureId> = self
            .store
            .get_by_task(task_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let removed = self.store.delete_by_task(task_id).await?;
        for id in ids {
            self.notifier().emit(SyncEvent::CaptureDeleted { id });
        }
        debug!(task_id = %task_id, removed, "task captures discarded");
        Ok(removed)
    }

    /// A task's captures, oldest first.
    pub async fn task_captures(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<PendingCapture>, CaptureError> {
        let mut captures = self.store.get_by_task(task_id).await?;
        captures.sort_by_key(|c| (c.timestamp, c.id));
        Ok(captures)
    }

    pub async fn captures_with_status(
        &self,
        status: CaptureStatus,
    ) -> Result<Vec<PendingCapture>, CaptureError> {
        self.store.get_by_status(status).await
    }

    pub async fn sync_now(&self) -> SyncOutcome {
        if !self.is_online() {
            info!("sync requested while offline");
            return SyncOutcome::Offline;
        }
        SyncOutcome::Completed(self.orchestrator.process_queue().await)
    }

    pub async fn retry_failed(&self) -> Result<SyncOutcome, CaptureError> {
        if !self.is_online() {
            info!("retry requested while offline");
            return Ok(SyncOutcome::Offline);
        }
        Ok(SyncOutcome::Completed(
            self.orchestrator.retry_all_failed().await?,
        ))
    }

    /// Purge captures older than `days` (the configured window when `None`).
    pub async fn purge(&self, days: Option<u32>) -> Result<usize, CaptureError> {
        sweep_once(self.store.as_ref(), days.unwrap_or(self.retention_days)).await
    }

    pub async fn clear(&self) -> Result<(), CaptureError> {
        self.store.clear().await?;
        info!("capture store cleared");
        Ok(())
    }

    pub async fn status(&self) -> Result<EngineStatus, CaptureError> {
        Ok(EngineStatus {
            storage: self.store.aggregate_state().await?,
            online: self.is_online(),
            syncing: self.orchestrator.is_syncing(),
            auto_sync: self.orchestrator.is_auto_sync_running(),
            last_sync_at: self.orchestrator.last_sync_at(),
        })
    }

    /// Auto-sync at the configured interval.
    pub fn start_auto_sync(&self) {
        self.orchestrator.start_auto_sync(self.sync_interval);
    }

    pub fn stop_auto_sync(&self) {
        self.orchestrator.stop_auto_sync();
    }

    /// Periodic retention sweep at the configured interval.
    pub fn spawn_retention_sweep(&self) -> RetentionSweep {
        spawn_retention_sweep(
            Arc::clone(&self.store),
            self.retention_days,
            self.sweep_interval,
        )
    }
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("orchestrator", &self.orchestrator)
            .field("retention_days", &self.retention_days)
            .field("sync_interval", &self.sync_interval)
            .finish()
    }
}
