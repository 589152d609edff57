//! In-memory capture store.
//!
//! Same contract as the SQLite store minus crash durability. Used by tests and
//! by hosts that only need a process-lifetime buffer. The data lives and dies
//! with this handle, so `claim_drain` never has a competing owner.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{
    AssignId, Blob, CaptureError, CaptureId, CaptureStatus, PendingCapture, StorageState, TaskId,
};
use crate::ports::{
    CaptureStore, Clock, INTERRUPTED_ERROR, IdGenerator, StoreLimits, SystemClock, UlidGenerator,
    retention_cutoff,
};

/// In-memory store state.
///
/// `records` is the single source of truth; the two indexes hold ids only and
/// are kept in step inside the same lock.
#[derive(Default)]
struct MemoryState {
    records: HashMap<CaptureId, PendingCapture>,

    /// task id -> capture ids
    by_task: HashMap<TaskId, BTreeSet<CaptureId>>,

    /// (timestamp, id), ascending
    by_time: BTreeSet<(i64, CaptureId)>,
}

impl MemoryState {
    fn insert(&mut self, capture: PendingCapture) {
        self.by_task
            .entry(capture.task_id.clone())
            .or_default()
            .insert(capture.id);
        self.by_time.insert((capture.timestamp, capture.id));
        self.records.insert(capture.id, capture);
    }

    fn remove(&mut self, id: CaptureId) -> Option<PendingCapture> {
        let capture = self.records.remove(&id)?;
        if let Some(ids) = self.by_task.get_mut(&capture.task_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_task.remove(&capture.task_id);
            }
        }
        self.by_time.remove(&(capture.timestamp, id));
        Some(capture)
    }

    fn aggregate(&self) -> StorageState {
        let mut state = StorageState::default();
        for record in self.records.values() {
            state.total_count += 1;
            state.total_bytes += record.size();
            match record.status {
                CaptureStatus::Pending => state.pending_count += 1,
                CaptureStatus::Syncing => state.syncing_count += 1,
                CaptureStatus::Failed => state.failed_count += 1,
            }
        }
        state
    }

    /// Records in ascending timestamp order.
    fn ordered(&self) -> impl Iterator<Item = &PendingCapture> {
        self.by_time
            .iter()
            .filter_map(|(_, id)| self.records.get(id))
    }
}

pub struct InMemoryCaptureStore {
    state: Arc<Mutex<MemoryState>>,
    limits: StoreLimits,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    initialized: AtomicBool,
}

impl InMemoryCaptureStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock))
    }

    /// Use `clock` for record timestamps, id generation and retention.
    pub fn with_clock(limits: StoreLimits, clock: Arc<dyn Clock>) -> Self {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            limits,
            clock,
            ids,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }
}

impl Default for InMemoryCaptureStore {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}

#[async_trait]
impl CaptureStore for InMemoryCaptureStore {
    async fn initialize(&self) -> Result<(), CaptureError> {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            debug!("in-memory capture store initialized");
        }
        Ok(())
    }

    async fn save(
        &self,
        task_id: TaskId,
        assign_id: AssignId,
        blob: Blob,
        stage: &str,
    ) -> Result<CaptureId, CaptureError> {
        self.initialize().await?;
        let mut state = self.state.lock().await;

        // Quota check and insert happen under the same lock.
        if let Err(err) = self.limits.check(&state.aggregate(), blob.len()) {
            warn!(task_id = %task_id, bytes = blob.len(), "capture rejected: {err}");
            return Err(err);
        }

        let id = self.ids.generate_capture_id();
        let capture = PendingCapture::new(id, task_id, assign_id, blob, stage, self.clock.now());
        info!(capture_id = %id, task_id = %capture.task_id, bytes = capture.size(), "capture saved");
        state.insert(capture);
        Ok(id)
    }

    async fn get_by_task(&self, task_id: &TaskId) -> Result<Vec<PendingCapture>, CaptureError> {
        self.initialize().await?;
        let state = self.state.lock().await;
        let Some(ids) = state.by_task.get(task_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn get_by_assign(
        &self,
        assign_id: &AssignId,
    ) -> Result<Vec<PendingCapture>, CaptureError> {
        self.initialize().await?;
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|c| &c.assign_id == assign_id)
            .cloned()
            .collect())
    }

    async fn get_by_status(
        &self,
        status: CaptureStatus,
    ) -> Result<Vec<PendingCapture>, CaptureError> {
        self.initialize().await?;
        let state = self.state.lock().await;
        Ok(state
            .ordered()
            .filter(|c| c.status == status)
            .cloned()
            .collect())
    }

    async fn get_by_id(&self, id: CaptureId) -> Result<Option<PendingCapture>, CaptureError> {
        self.initialize().await?;
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: CaptureId,
        status: CaptureStatus,
        error: Option<String>,
    ) -> Result<(), CaptureError> {
        self.initialize().await?;
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&id)
            .ok_or(CaptureError::NotFound(id))?;

        if !record.status.can_transition_to(status) {
            warn!(capture_id = %id, from = %record.status, to = %status, "status transition refused");
            return Err(CaptureError::InvalidTransition {
                id,
                from: record.status,
                to: status,
            });
        }
        record.apply_status(status, error);
        debug!(capture_id = %id, status = %status, retry_count = record.retry_count, "capture status updated");
        Ok(())
    }

    async fn claim_drain(&self) -> Result<Option<usize>, CaptureError> {
        self.initialize().await?;
        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for record in state.records.values_mut() {
            if record.status == CaptureStatus::Syncing {
                record.apply_status(CaptureStatus::Failed, Some(INTERRUPTED_ERROR.to_string()));
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(recovered, "marked interrupted uploads as failed");
        }
        Ok(Some(recovered))
    }

    async fn reset_failed(&self) -> Result<Vec<CaptureId>, CaptureError> {
        self.initialize().await?;
        let mut state = self.state.lock().await;
        let mut reset = Vec::new();
        for record in state.records.values_mut() {
            if record.status == CaptureStatus::Failed {
                record.reset_for_retry();
                reset.push(record.id);
            }
        }
        reset.sort();
        Ok(reset)
    }

    async fn delete(&self, id: CaptureId) -> Result<bool, CaptureError> {
        self.initialize().await?;
        let mut state = self.state.lock().await;
        let removed = state.remove(id).is_some();
        if removed {
            debug!(capture_id = %id, "capture deleted");
        }
        Ok(removed)
    }

    async fn delete_by_task(&self, task_id: &TaskId) -> Result<usize, CaptureError> {
        self.initialize().await?;
        let mut state = self.state.lock().await;
        let ids: Vec<CaptureId> = state
            .by_task
            .get(task_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let mut removed = 0;
        for id in ids {
            if state.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn aggregate_state(&self) -> Result<StorageState, CaptureError> {
        self.initialize().await?;
        let state = self.state.lock().await;
        Ok(state.aggregate())
    }

    async fn purge_older_than(&self, retention_days: u32) -> Result<usize, CaptureError> {
        self.initialize().await?;
        let cutoff = retention_cutoff(self.clock.now_millis(), retention_days);
        let mut state = self.state.lock().await;
        let expired: Vec<CaptureId> = state
            .by_time
            .iter()
            .take_while(|(ts, _)| *ts < cutoff)
            .map(|(_, id)| *id)
            .collect();
        for id in &expired {
            state.remove(*id);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), retention_days, "purged expired captures");
        }
        Ok(expired.len())
    }

    async fn clear(&self) -> Result<(), CaptureError> {
        self.initialize().await?;
        let mut state = self.state.lock().await;
        *state = MemoryState::default();
        info!("capture store cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QuotaKind;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone, Utc};

    fn fixed_clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ))
    }

    fn store_with(limits: StoreLimits) -> (InMemoryCaptureStore, Arc<FixedClock>) {
        let clock = fixed_clock();
        let store = InMemoryCaptureStore::with_clock(limits, clock.clone());
        (store, clock)
    }

    async fn save(store: &InMemoryCaptureStore, task: &str, bytes: usize) -> CaptureId {
        store
            .save(
                TaskId::new(task),
                AssignId::new("A1"),
                Blob::jpeg(vec![0u8; bytes]),
                "after",
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn every_save_is_retrievable() {
        let (store, clock) = store_with(StoreLimits::default());
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(save(&store, "T1", 10 + i).await);
            clock.advance(Duration::seconds(1));
        }

        for id in &ids {
            let c = store.get_by_id(*id).await.unwrap().unwrap();
            assert_eq!(c.status, CaptureStatus::Pending);
            assert_eq!(c.retry_count, 0);
        }
        assert_eq!(store.get_by_task(&TaskId::new("T1")).await.unwrap().len(), 5);
        assert_eq!(store.aggregate_state().await.unwrap().total_count, 5);
    }

    #[tokio::test]
    async fn count_ceiling_leaves_state_unchanged() {
        let (store, _) = store_with(StoreLimits {
            max_captures: 2,
            max_bytes: 1_000,
        });
        save(&store, "T1", 1).await;
        save(&store, "T1", 1).await;
        let before = store.aggregate_state().await.unwrap();

        let err = store
            .save(TaskId::new("T1"), AssignId::new("A1"), Blob::jpeg(vec![1]), "after")
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::QuotaExceeded(QuotaKind::Count { .. })));
        assert_eq!(store.aggregate_state().await.unwrap(), before);
    }

    #[tokio::test]
    async fn pending_comes_back_oldest_first() {
        let (store, clock) = store_with(StoreLimits::default());
        clock.advance(Duration::seconds(30));
        let late = save(&store, "T1", 1).await;
        clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 7, 0, 0).unwrap());
        let early = save(&store, "T2", 1).await;

        let pending = store.get_by_status(CaptureStatus::Pending).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![early, late]);
        assert!(pending.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn update_missing_id_is_not_found() {
        let (store, _) = store_with(StoreLimits::default());
        let ghost = CaptureId::from_ulid(ulid::Ulid::new());
        let err = store
            .update_status(ghost, CaptureStatus::Syncing, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn second_claim_of_the_same_record_is_refused() {
        let (store, _) = store_with(StoreLimits::default());
        let id = save(&store, "T1", 1).await;
        store.update_status(id, CaptureStatus::Syncing, None).await.unwrap();

        let err = store
            .update_status(id, CaptureStatus::Syncing, None)
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());
        let err = store
            .update_status(id, CaptureStatus::Pending, None)
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(store.get_by_id(id).await.unwrap().unwrap().status, CaptureStatus::Syncing);
    }

    #[tokio::test]
    async fn claim_drain_fails_leftover_syncing_records() {
        let (store, _) = store_with(StoreLimits::default());
        let stuck = save(&store, "T1", 1).await;
        let waiting = save(&store, "T1", 1).await;
        store.update_status(stuck, CaptureStatus::Syncing, None).await.unwrap();

        assert_eq!(store.claim_drain().await.unwrap(), Some(1));
        let c = store.get_by_id(stuck).await.unwrap().unwrap();
        assert_eq!((c.status, c.retry_count), (CaptureStatus::Failed, 1));
        assert_eq!(c.last_error.as_deref(), Some(INTERRUPTED_ERROR));
        let w = store.get_by_id(waiting).await.unwrap().unwrap();
        assert_eq!((w.status, w.retry_count), (CaptureStatus::Pending, 0));

        assert_eq!(store.claim_drain().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn delete_by_task_is_unconditional_and_idempotent() {
        let (store, _) = store_with(StoreLimits::default());
        let a = save(&store, "T1", 1).await;
        save(&store, "T1", 1).await;
        let other = save(&store, "T2", 1).await;
        store.update_status(a, CaptureStatus::Syncing, None).await.unwrap();

        assert_eq!(store.delete_by_task(&TaskId::new("T1")).await.unwrap(), 2);
        assert_eq!(store.delete_by_task(&TaskId::new("T1")).await.unwrap(), 0);
        assert!(!store.delete(a).await.unwrap());
        assert!(store.get_by_id(other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reset_failed_zeroes_retry_count() {
        let (store, _) = store_with(StoreLimits::default());
        let id = save(&store, "T1", 1).await;
        store.update_status(id, CaptureStatus::Syncing, None).await.unwrap();
        store
            .update_status(id, CaptureStatus::Failed, Some("nope".into()))
            .await
            .unwrap();

        assert_eq!(store.reset_failed().await.unwrap(), vec![id]);
        let c = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(c.status, CaptureStatus::Pending);
        assert_eq!(c.retry_count, 0);
    }

    #[tokio::test]
    async fn purge_removes_only_strictly_older_records() {
        let (store, clock) = store_with(StoreLimits::default());
        let old = save(&store, "T1", 1).await;
        clock.advance(Duration::days(1));
        let boundary = save(&store, "T1", 1).await;
        clock.advance(Duration::days(1));
        let fresh = save(&store, "T2", 1).await;
        store.update_status(old, CaptureStatus::Syncing, None).await.unwrap();

        // now = start + 8d; cutoff = start + 1d
        clock.advance(Duration::days(6));
        assert_eq!(store.purge_older_than(7).await.unwrap(), 1);
        assert!(store.get_by_id(old).await.unwrap().is_none());
        assert!(store.get_by_id(boundary).await.unwrap().is_some());
        assert!(store.get_by_id(fresh).await.unwrap().is_some());
        assert!(store.get_by_task(&TaskId::new("T1")).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let (store, _) = store_with(StoreLimits::default());
        save(&store, "T1", 4).await;
        store.clear().await.unwrap();
        assert_eq!(store.aggregate_state().await.unwrap(), StorageState::default());
    }
}
