//! SyncOrchestrator - ローカルキューをリモートへ排出する
//!
//! # フロー（process_queue = 1 回の drain）
//! 1. drain 実行中なら何もせず 0/0 を返す（唯一の排他制御）
//! 2. オフラインなら 0/0
//! 3. running フラグを立て、ストアの送信権を取る（`claim_drain`）。
//!    別プロセスが持っていれば何も通知せず 0/0。
//!    前回の drain が残した `syncing` はここで `failed` に戻る
//! 4. SyncStarted を通知
//! 5. pending を古い順に 1 件ずつアップロード
//! 6. retry_count < 上限 の failed を 1 件ずつアップロード
//! 7. フラグを下ろし SyncCompleted（ストア障害時は SyncError）を通知
//!
//! # 設計原則
//! - 1 件の失敗は drain を止めない（失敗はレコードの状態として残す）
//! - ストア自体の障害だけが drain の外へ出る（SyncError として通知）
//! - 上限に達した failed を自動で戻すことはない（retry_all_failed のみ）
//! - `syncing` のまま drain を抜けない。書き戻しに失敗したレコードも
//!   次の drain の開始時に `failed` として拾い直す

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::app::auto_sync::AutoSync;
use crate::app::notifier::EventNotifier;
use crate::domain::{
    CaptureError, CaptureStatus, PendingCapture, QueueState, RetryPolicy, SyncEvent, SyncReport,
    TaskId, UploadError,
};
use crate::ports::{CaptureStore, Clock, INTERRUPTED_ERROR, NetworkMonitor, UploadClient};

/// Default bound on one upload attempt.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one record's attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Uploaded,
    Failed,
    /// The record disappeared or changed hands before it could be claimed.
    Gone,
}

/// Clears the running flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    store: Arc<dyn CaptureStore>,
    uploader: Arc<dyn UploadClient>,
    network: Arc<dyn NetworkMonitor>,
    notifier: Arc<EventNotifier>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    upload_timeout: Duration,

    running: AtomicBool,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    auto_sync: Mutex<Option<AutoSync>>,
}

/// SyncOrchestrator は drain とその排他を管理する
///
/// `Clone` は同じインスタンスへのハンドルを複製する。
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

/// Handle held by background loops so they do not keep the orchestrator alive.
#[derive(Clone)]
pub(crate) struct WeakOrchestrator(Weak<Inner>);

impl WeakOrchestrator {
    pub(crate) fn upgrade(&self) -> Option<SyncOrchestrator> {
        self.0.upgrade().map(|inner| SyncOrchestrator { inner })
    }
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn CaptureStore>,
        uploader: Arc<dyn UploadClient>,
        network: Arc<dyn NetworkMonitor>,
        notifier: Arc<EventNotifier>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                uploader,
                network,
                notifier,
                clock,
                policy,
                upload_timeout,
                running: AtomicBool::new(false),
                last_sync_at: Mutex::new(None),
                auto_sync: Mutex::new(None),
            }),
        }
    }

    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.inner.notifier
    }

    pub fn network(&self) -> &Arc<dyn NetworkMonitor> {
        &self.inner.network
    }

    pub fn policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// When the most recent drain finished.
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .last_sync_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn downgrade(&self) -> WeakOrchestrator {
        WeakOrchestrator(Arc::downgrade(&self.inner))
    }

    pub(crate) fn auto_sync_slot(&self) -> std::sync::MutexGuard<'_, Option<AutoSync>> {
        self.inner
            .auto_sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one drain. Never fails: per-record failures become record state,
    /// store failures become a `SyncError` event.
    pub async fn process_queue(&self) -> SyncReport {
        let inner = &self.inner;
        if inner.running.load(Ordering::Acquire) {
            debug!("drain already in progress");
            return SyncReport::default();
        }
        if !inner.network.is_online() {
            debug!("offline, skipping drain");
            return SyncReport::default();
        }
        let Some(guard) = DrainGuard::acquire(&inner.running) else {
            debug!("drain already in progress");
            return SyncReport::default();
        };

        let claim = inner.store.claim_drain().await;
        if let Ok(None) = claim {
            info!("capture store is owned by another process, skipping drain");
            return SyncReport::default();
        }

        inner.notifier.emit(SyncEvent::SyncStarted);

        let mut report = SyncReport::default();
        let result = match claim {
            Ok(_) => self.drain(&mut report).await,
            Err(e) => Err(e),
        };

        *inner
            .last_sync_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(inner.clock.now());
        drop(guard);

        match result {
            Ok(()) => {
                info!(success = report.success, failed = report.failed, "drain finished");
                inner.notifier.emit(SyncEvent::SyncCompleted {
                    success: report.success,
                    failed: report.failed,
                });
            }
            Err(e) => {
                error!(error = %e, success = report.success, failed = report.failed, "drain aborted by store error");
                inner.notifier.emit(SyncEvent::SyncError {
                    message: e.to_string(),
                });
            }
        }
        report
    }

    async fn drain(&self, report: &mut SyncReport) -> Result<(), CaptureError> {
        let store = &self.inner.store;

        let pending = store.get_by_status(CaptureStatus::Pending).await?;
        let mut per_task: BTreeMap<&TaskId, usize> = BTreeMap::new();
        for capture in &pending {
            *per_task.entry(&capture.task_id).or_default() += 1;
        }
        info!(pending = pending.len(), tasks = per_task.len(), "drain started");
        for (task_id, count) in &per_task {
            debug!(task_id = %task_id, count, "pending captures for task");
        }

        let mut attempted = HashSet::with_capacity(pending.len());
        for capture in &pending {
            attempted.insert(capture.id);
            self.tally(report, self.attempt_upload(capture).await?);
        }

        // 今回の drain で既に試したレコードは対象外（1 drain につき 1 回まで）
        let retryable: Vec<PendingCapture> = store
            .get_by_status(CaptureStatus::Failed)
            .await?
            .into_iter()
            .filter(|c| !attempted.contains(&c.id) && self.inner.policy.allows(c.retry_count))
            .collect();
        if !retryable.is_empty() {
            debug!(count = retryable.len(), "retrying failed captures");
        }
        for capture in &retryable {
            self.tally(report, self.attempt_upload(capture).await?);
        }
        Ok(())
    }

    fn tally(&self, report: &mut SyncReport, attempt: Attempt) {
        match attempt {
            Attempt::Uploaded => report.record(true),
            Attempt::Failed => report.record(false),
            Attempt::Gone => {}
        }
    }

    /// One upload attempt. Only store errors other than `NotFound` and
    /// `InvalidTransition` escape.
    async fn attempt_upload(&self, capture: &PendingCapture) -> Result<Attempt, CaptureError> {
        let inner = &self.inner;
        match inner
            .store
            .update_status(capture.id, CaptureStatus::Syncing, None)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() || e.is_invalid_transition() => {
                debug!(capture_id = %capture.id, error = %e, "capture no longer claimable");
                return Ok(Attempt::Gone);
            }
            Err(e) => return Err(e),
        }

        let outcome = match tokio::time::timeout(inner.upload_timeout, inner.uploader.upload(capture))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(UploadError::Timeout(inner.upload_timeout)),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = inner.store.delete(capture.id).await {
                    // delivered but still stored: it goes out again rather than being lost
                    if let Err(revert) = self.mark_failed(capture, INTERRUPTED_ERROR).await {
                        warn!(capture_id = %capture.id, error = %revert, "capture left syncing until the next drain");
                    }
                    return Err(e);
                }
                info!(capture_id = %capture.id, task_id = %capture.task_id, "capture uploaded");
                Ok(Attempt::Uploaded)
            }
            Err(upload_err) => {
                let retry_count = capture.retry_count + 1;
                warn!(
                    capture_id = %capture.id,
                    retry_count,
                    error = %upload_err,
                    "capture upload failed"
                );
                if inner.policy.is_exhausted(retry_count) {
                    warn!(
                        capture_id = %capture.id,
                        retry_count,
                        "retry ceiling reached, waiting for a manual retry"
                    );
                }
                let message = upload_err.to_string();
                if let Err(e) = self.mark_failed(capture, &message).await {
                    warn!(capture_id = %capture.id, error = %e, "marking capture failed, trying once more");
                    self.mark_failed(capture, &message).await?;
                }
                Ok(Attempt::Failed)
            }
        }
    }

    /// `Syncing` -> `Failed`. A record that is already gone or no longer
    /// `Syncing` is left alone.
    async fn mark_failed(&self, capture: &PendingCapture, message: &str) -> Result<(), CaptureError> {
        match self
            .inner
            .store
            .update_status(capture.id, CaptureStatus::Failed, Some(message.to_string()))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_invalid_transition() => {
                debug!(capture_id = %capture.id, error = %e, "capture changed during upload");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Manual recovery: every `Failed` record goes back to `Pending` with a
    /// zero retry count, then one drain runs.
    ///
    /// A no-op (0/0) while a drain is in progress.
    pub async fn retry_all_failed(&self) -> Result<SyncReport, CaptureError> {
        if self.is_syncing() {
            debug!("drain already in progress, retry ignored");
            return Ok(SyncReport::default());
        }
        let reset = self.inner.store.reset_failed().await?;
        info!(count = reset.len(), "failed captures reset for retry");
        Ok(self.process_queue().await)
    }

    pub async fn queue_state(&self) -> Result<QueueState, CaptureError> {
        let state = self.inner.store.aggregate_state().await?;
        Ok(QueueState {
            pending: state.pending_count,
            failed: state.failed_count,
            syncing: self.is_syncing(),
            total_bytes: state.total_bytes,
            last_sync_at: self.last_sync_at(),
        })
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("policy", &self.inner.policy)
            .field("upload_timeout", &self.inner.upload_timeout)
            .field("syncing", &self.is_syncing())
            .finish()
    }
}
