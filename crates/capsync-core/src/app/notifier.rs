//! EventNotifier - SyncEvent の配送
//!
//! 2 つの受け取り方を提供します：
//! - `subscribe`: コールバック登録（同期的に呼ばれる）
//! - `listen`: broadcast チャネル（非同期タスク向け）
//!
//! # 設計原則
//! - 1 つの購読者の panic が他の購読者への配送を止めない
//! - 購読者ゼロでも emit は失敗しない

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::SyncEvent;

/// Capacity of the broadcast channel; slow listeners see `Lagged`.
const CHANNEL_CAPACITY: usize = 64;

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Handle returned by [`EventNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

pub struct EventNotifier {
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<SubscriptionId, Callback>>,
    channel: broadcast::Sender<SyncEvent>,
}

impl EventNotifier {
    pub fn new() -> Self {
        let (channel, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(0),
            callbacks: Mutex::new(BTreeMap::new()),
            channel,
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, Arc::new(callback));
        id
    }

    /// Returns `false` when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn listen(&self) -> broadcast::Receiver<SyncEvent> {
        self.channel.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `event` to every callback (in subscription order) and to the
    /// broadcast channel.
    pub fn emit(&self, event: SyncEvent) {
        // 呼び出し中に subscribe/unsubscribe されてもデッドロックしないよう複製してから呼ぶ
        let callbacks: Vec<(SubscriptionId, Callback)> = self
            .lock()
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        for (id, cb) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| cb(&event))).is_err() {
                warn!(subscription = id.0, event = event.kind(), "subscriber panicked");
            }
        }

        // no listeners is fine
        let _ = self.channel.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SubscriptionId, Callback>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
