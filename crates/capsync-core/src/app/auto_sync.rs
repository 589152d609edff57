//! Auto-sync - タイマーと接続復帰で drain を起動する
//!
//! # トリガー
//! - 開始時にオンラインなら即 1 回
//! - `interval` ごと（オンラインかつ drain 中でない場合のみ）
//! - オフライン → オンライン の復帰時
//! - drain 中に接続が切り替わり、終わった時点でオンラインならもう 1 回
//!
//! 再度 start すると前のループを止めて置き換える（加算されない）。
//! ループは orchestrator を弱参照で持つので、orchestrator が破棄されれば終わる。

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::app::sync::{SyncOrchestrator, WeakOrchestrator};
use crate::ports::ConnectivityWatch;

/// Default polling period.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Running auto-sync loop.
/// - `shutdown_tx` に true を送るとループが抜ける（drop でも同様）
/// - 実行中の drain は中断しない
pub(crate) struct AutoSync {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl AutoSync {
    fn spawn(orchestrator: &SyncOrchestrator, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let weak = orchestrator.downgrade();
        let connectivity = orchestrator.network().watch();
        let join = tokio::spawn(async move {
            auto_sync_loop(weak, interval, connectivity, shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Startup,
    Timer,
    Restored,
}

impl SyncOrchestrator {
    /// Start periodic draining, replacing any loop already running.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start_auto_sync(&self, interval: Duration) {
        let mut slot = self.auto_sync_slot();
        if let Some(previous) = slot.take() {
            previous.request_shutdown();
            debug!("previous auto-sync replaced");
        }
        *slot = Some(AutoSync::spawn(self, interval));
        info!(interval_ms = interval.as_millis() as u64, "auto-sync started");
    }

    /// Stop the loop and drop the connectivity subscription. Idempotent.
    pub fn stop_auto_sync(&self) {
        if let Some(running) = self.auto_sync_slot().take() {
            running.request_shutdown();
            info!("auto-sync stopped");
        }
    }

    pub fn is_auto_sync_running(&self) -> bool {
        self.auto_sync_slot()
            .as_ref()
            .is_some_and(|running| !running.is_finished())
    }
}

async fn auto_sync_loop(
    weak: WeakOrchestrator,
    interval: Duration,
    mut connectivity: ConnectivityWatch,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if *shutdown_rx.borrow() {
        return;
    }
    if connectivity.is_online() && !trigger(&weak, Trigger::Startup).await {
        return;
    }

    let mut tick = tokio::time::interval_at(Instant::now() + interval, interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watching = true;

    loop {
        if watching && connectivity.changed_to_online() {
            info!("connectivity changed during drain");
            if !trigger(&weak, Trigger::Restored).await {
                break;
            }
            continue;
        }

        let alive = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                true
            }
            _ = tick.tick() => trigger(&weak, Trigger::Timer).await,
            restored = connectivity.restored(), if watching => {
                if restored {
                    info!("connectivity restored");
                    trigger(&weak, Trigger::Restored).await
                } else {
                    // monitor gone; keep the timer
                    watching = false;
                    true
                }
            }
        };
        if !alive {
            break;
        }
    }
    debug!("auto-sync loop exited");
}

/// Run a drain if the gate allows. Returns `false` once the orchestrator is gone.
async fn trigger(weak: &WeakOrchestrator, trigger: Trigger) -> bool {
    let Some(orchestrator) = weak.upgrade() else {
        return false;
    };
    if !orchestrator.network().is_online() || orchestrator.is_syncing() {
        debug!(?trigger, "auto-sync trigger skipped");
        return true;
    }
    debug!(?trigger, "auto-sync trigger");
    orchestrator.process_queue().await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::app::notifier::EventNotifier;
    use crate::app::sync::DEFAULT_UPLOAD_TIMEOUT;
    use crate::domain::{AssignId, RetryPolicy, SyncEvent, TaskId};
    use crate::impls::{InMemoryCaptureStore, ManualNetworkMonitor};
    use crate::ports::{CaptureStore, StoreLimits, SystemClock};
    use crate::test_support::{GatedUploader, ScriptedUploader, blob};

    struct Harness {
        store: Arc<InMemoryCaptureStore>,
        network: Arc<ManualNetworkMonitor>,
        uploader: Arc<ScriptedUploader>,
        orchestrator: SyncOrchestrator,
        drains: Arc<AtomicUsize>,
    }

    fn harness(online: bool) -> Harness {
        let store = Arc::new(InMemoryCaptureStore::new(StoreLimits::default()));
        let network = Arc::new(ManualNetworkMonitor::new(online));
        let uploader = Arc::new(ScriptedUploader::succeeding());
        let notifier = Arc::new(EventNotifier::new());
        let drains = Arc::new(AtomicUsize::new(0));
        let counter = drains.clone();
        notifier.subscribe(move |ev| {
            if matches!(ev, SyncEvent::SyncCompleted { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            uploader.clone(),
            network.clone(),
            notifier,
            Arc::new(SystemClock),
            RetryPolicy::default(),
            DEFAULT_UPLOAD_TIMEOUT,
        );
        Harness {
            store,
            network,
            uploader,
            orchestrator,
            drains,
        }
    }

    async fn save(store: &InMemoryCaptureStore) {
        store
            .save(TaskId::new("T1"), AssignId::new("A1"), blob(8), "after")
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn online_start_drains_immediately_then_on_every_tick() {
        let h = harness(true);
        save(&h.store).await;

        h.orchestrator.start_auto_sync(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.drains.load(Ordering::SeqCst), 1);
        assert_eq!(h.uploader.call_count(), 1);

        save(&h.store).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.drains.load(Ordering::SeqCst), 2);
        assert_eq!(h.uploader.call_count(), 2);

        h.orchestrator.stop_auto_sync();
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_while_offline_do_nothing_until_restored() {
        let h = harness(false);
        save(&h.store).await;
        h.orchestrator.start_auto_sync(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(h.drains.load(Ordering::SeqCst), 0);

        h.network.set_online(true);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.drains.load(Ordering::SeqCst), 1);
        assert_eq!(h.uploader.call_count(), 1);
        assert_eq!(h.store.aggregate_state().await.unwrap().total_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_flip_during_a_drain_triggers_another() {
        let store = Arc::new(InMemoryCaptureStore::new(StoreLimits::default()));
        let network = Arc::new(ManualNetworkMonitor::new(true));
        let uploader = Arc::new(GatedUploader::new());
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            uploader.clone(),
            network.clone(),
            Arc::new(EventNotifier::new()),
            Arc::new(SystemClock),
            RetryPolicy::default(),
            DEFAULT_UPLOAD_TIMEOUT,
        );
        save(&store).await;

        orchestrator.start_auto_sync(Duration::from_secs(3600));
        uploader.wait_entered().await;

        // captured and reconnected while the startup drain is busy
        save(&store).await;
        network.set_online(false);
        network.set_online(true);
        uploader.release(2);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(uploader.call_count(), 2);
        assert_eq!(store.aggregate_state().await.unwrap().total_count, 0);
        orchestrator.stop_auto_sync();
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_replaces_the_previous_timer() {
        let h = harness(true);
        h.orchestrator.start_auto_sync(Duration::from_secs(10));
        h.orchestrator.start_auto_sync(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(35)).await;

        // one startup drain + ticks at 10s, 20s, 30s
        assert_eq!(h.drains.load(Ordering::SeqCst), 4);
        assert!(h.orchestrator.is_auto_sync_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_unsubscribes_from_connectivity() {
        let h = harness(false);
        h.orchestrator.start_auto_sync(Duration::from_secs(10));
        h.orchestrator.stop_auto_sync();
        h.orchestrator.stop_auto_sync();
        assert!(!h.orchestrator.is_auto_sync_running());

        save(&h.store).await;
        h.network.set_online(true);
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(h.drains.load(Ordering::SeqCst), 0);
        assert_eq!(h.uploader.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_orchestrator_ends_the_loop() {
        let h = harness(false);
        save(&h.store).await;
        h.orchestrator.start_auto_sync(Duration::from_secs(10));
        let network = h.network.clone();
        let uploader = h.uploader.clone();
        drop(h);

        network.set_online(true);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(uploader.call_count(), 0);
    }
}
