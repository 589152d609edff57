//! Test doubles shared by the app-layer tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::domain::{
    AssignId, Blob, CaptureError, CaptureId, CaptureStatus, PendingCapture, StorageState, TaskId,
    UploadError,
};
use crate::impls::InMemoryCaptureStore;
use crate::ports::{CaptureStore, UploadClient};

pub fn blob(len: usize) -> Blob {
    Blob::jpeg(vec![7u8; len])
}

/// Uploader that replays queued outcomes, then falls back to a default one.
pub struct ScriptedUploader {
    script: Mutex<VecDeque<Result<(), UploadError>>>,
    fallback: Result<(), UploadError>,
    calls: Mutex<Vec<CaptureId>>,
}

impl ScriptedUploader {
    pub fn succeeding() -> Self {
        Self::with_fallback(Ok(()))
    }

    pub fn failing() -> Self {
        Self::with_fallback(Err(UploadError::Status {
            status: 503,
            body: "unavailable".into(),
        }))
    }

    fn with_fallback(fallback: Result<(), UploadError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, outcome: Result<(), UploadError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<CaptureId> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl UploadClient for ScriptedUploader {
    async fn upload(&self, capture: &PendingCapture) -> Result<(), UploadError> {
        self.calls.lock().unwrap().push(capture.id);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Uploader that parks every call until the test opens the gate.
pub struct GatedUploader {
    gate: Semaphore,
    entered: Notify,
    calls: AtomicUsize,
}

impl GatedUploader {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            entered: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Wait until some upload is parked at the gate.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Let `n` parked (or future) uploads through.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadClient for GatedUploader {
    async fn upload(&self, _capture: &PendingCapture) -> Result<(), UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.gate.acquire().await.unwrap().forget();
        Ok(())
    }
}

/// Store whose backing mechanism is gone.
pub struct BrokenStore;

fn broken<T>() -> Result<T, CaptureError> {
    Err(CaptureError::Transaction("disk I/O error".into()))
}

#[async_trait]
impl CaptureStore for BrokenStore {
    async fn initialize(&self) -> Result<(), CaptureError> {
        Err(CaptureError::StorageUnavailable("no database".into()))
    }

    async fn save(
        &self,
        _task_id: TaskId,
        _assign_id: AssignId,
        _blob: Blob,
        _stage: &str,
    ) -> Result<CaptureId, CaptureError> {
        broken()
    }

    async fn get_by_task(&self, _task_id: &TaskId) -> Result<Vec<PendingCapture>, CaptureError> {
        broken()
    }

    async fn get_by_assign(
        &self,
        _assign_id: &AssignId,
    ) -> Result<Vec<PendingCapture>, CaptureError> {
        broken()
    }

    async fn get_by_status(
        &self,
        _status: CaptureStatus,
    ) -> Result<Vec<PendingCapture>, CaptureError> {
        broken()
    }

    async fn get_by_id(&self, _id: CaptureId) -> Result<Option<PendingCapture>, CaptureError> {
        broken()
    }

    async fn update_status(
        &self,
        _id: CaptureId,
        _status: CaptureStatus,
        _error: Option<String>,
    ) -> Result<(), CaptureError> {
        broken()
    }

    async fn claim_drain(&self) -> Result<Option<usize>, CaptureError> {
        broken()
    }

    async fn reset_failed(&self) -> Result<Vec<CaptureId>, CaptureError> {
        broken()
    }

    async fn delete(&self, _id: CaptureId) -> Result<bool, CaptureError> {
        broken()
    }

    async fn delete_by_task(&self, _task_id: &TaskId) -> Result<usize, CaptureError> {
        broken()
    }

    async fn aggregate_state(&self) -> Result<StorageState, CaptureError> {
        broken()
    }

    async fn purge_older_than(&self, _retention_days: u32) -> Result<usize, CaptureError> {
        broken()
    }

    async fn clear(&self) -> Result<(), CaptureError> {
        broken()
    }
}

/// In-memory store whose next few `Failed` writes or deletes hit a busy
/// database.
pub struct FlakyStore {
    inner: InMemoryCaptureStore,
    failed_writes_to_break: AtomicUsize,
    deletes_to_break: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryCaptureStore::default(),
            failed_writes_to_break: AtomicUsize::new(0),
            deletes_to_break: AtomicUsize::new(0),
        }
    }

    pub fn break_failed_writes(&self, n: usize) {
        self.failed_writes_to_break.store(n, Ordering::SeqCst);
    }

    pub fn break_deletes(&self, n: usize) {
        self.deletes_to_break.store(n, Ordering::SeqCst);
    }

    fn trips(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn locked<T>() -> Result<T, CaptureError> {
    Err(CaptureError::Transaction("database is locked".into()))
}

#[async_trait]
impl CaptureStore for FlakyStore {
    async fn initialize(&self) -> Result<(), CaptureError> {
        self.inner.initialize().await
    }

    async fn save(
        &self,
        task_id: TaskId,
        assign_id: AssignId,
        blob: Blob,
        stage: &str,
    ) -> Result<CaptureId, CaptureError> {
        self.inner.save(task_id, assign_id, blob, stage).await
    }

    async fn get_by_task(&self, task_id: &TaskId) -> Result<Vec<PendingCapture>, CaptureError> {
        self.inner.get_by_task(task_id).await
    }

    async fn get_by_assign(
        &self,
        assign_id: &AssignId,
    ) -> Result<Vec<PendingCapture>, CaptureError> {
        self.inner.get_by_assign(assign_id).await
    }

    async fn get_by_status(
        &self,
        status: CaptureStatus,
    ) -> Result<Vec<PendingCapture>, CaptureError> {
        self.inner.get_by_status(status).await
    }

    async fn get_by_id(&self, id: CaptureId) -> Result<Option<PendingCapture>, CaptureError> {
        self.inner.get_by_id(id).await
    }

    async fn update_status(
        &self,
        id: CaptureId,
        status: CaptureStatus,
        error: Option<String>,
    ) -> Result<(), CaptureError> {
        if status == CaptureStatus::Failed && Self::trips(&self.failed_writes_to_break) {
            return locked();
        }
        self.inner.update_status(id, status, error).await
    }

    async fn claim_drain(&self) -> Result<Option<usize>, CaptureError> {
        self.inner.claim_drain().await
    }

    async fn reset_failed(&self) -> Result<Vec<CaptureId>, CaptureError> {
        self.inner.reset_failed().await
    }

    async fn delete(&self, id: CaptureId) -> Result<bool, CaptureError> {
        if Self::trips(&self.deletes_to_break) {
            return locked();
        }
        self.inner.delete(id).await
    }

    async fn delete_by_task(&self, task_id: &TaskId) -> Result<usize, CaptureError> {
        self.inner.delete_by_task(task_id).await
    }

    async fn aggregate_state(&self) -> Result<StorageState, CaptureError> {
        self.inner.aggregate_state().await
    }

    async fn purge_older_than(&self, retention_days: u32) -> Result<usize, CaptureError> {
        self.inner.purge_older_than(retention_days).await
    }

    async fn clear(&self) -> Result<(), CaptureError> {
        self.inner.clear().await
    }
}
