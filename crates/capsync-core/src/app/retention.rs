//! Retention sweep - 保存期間を過ぎたキャプチャの定期削除
//!
//! status に関係なく `retention_days` より古いレコードを消す。
//! 1 回の失敗はログに残して次の周期で再試行する。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::CaptureError;
use crate::ports::CaptureStore;

/// Default period between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Running sweep loop.
/// - `request_shutdown()` で止まる（drop でも止まる）
pub struct RetentionSweep {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RetentionSweep {
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

/// One sweep; returns how many captures were purged.
pub async fn sweep_once(
    store: &dyn CaptureStore,
    retention_days: u32,
) -> Result<usize, CaptureError> {
    let purged = store.purge_older_than(retention_days).await?;
    if purged > 0 {
        info!(purged, retention_days, "retention sweep purged captures");
    } else {
        debug!(retention_days, "retention sweep found nothing to purge");
    }
    Ok(purged)
}

/// Sweep every `interval`, first one after one full period.
pub fn spawn_retention_sweep(
    store: Arc<dyn CaptureStore>,
    retention_days: u32,
    interval: Duration,
) -> RetentionSweep {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(Instant::now() + interval, interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = sweep_once(store.as_ref(), retention_days).await {
                        warn!(error = %e, "retention sweep failed");
                    }
                }
            }
        }
        debug!("retention sweep stopped");
    });
    RetentionSweep { shutdown_tx, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AssignId, TaskId};
    use crate::impls::InMemoryCaptureStore;
    use crate::ports::{FixedClock, StoreLimits};
    use crate::test_support::{BrokenStore, blob};
    use chrono::{TimeZone, Utc};

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_purges_expired_captures() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(InMemoryCaptureStore::with_clock(
            StoreLimits::default(),
            clock.clone(),
        ));
        store
            .save(TaskId::new("T1"), AssignId::new("A1"), blob(4), "after")
            .await
            .unwrap();

        let sweep = spawn_retention_sweep(store.clone(), 7, Duration::from_secs(60));
        clock.advance(chrono::Duration::days(8));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.aggregate_state().await.unwrap().total_count, 0);

        sweep.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sweep_keeps_running() {
        let sweep = spawn_retention_sweep(Arc::new(BrokenStore), 7, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!sweep.join.is_finished());
        sweep.shutdown_and_join().await;
    }
}
