use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate view over every stored capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageState {
    pub pending_count: usize,
    pub failed_count: usize,
    pub syncing_count: usize,
    pub total_count: usize,
    pub total_bytes: u64,
}

/// Tallies of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub success: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.success == 0 && self.failed == 0
    }

    pub fn record(&mut self, uploaded: bool) {
        if uploaded {
            self.success += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// What a status indicator shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub pending: usize,
    pub failed: usize,
    pub syncing: bool,
    pub total_bytes: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}
