//! NetworkMonitor port - 接続状態の抽象化
//!
//! スケジューラは「今オンラインか」と「オフライン→オンラインに戻った」の
//! 2 つだけを知ればよい。テストでは手動で切り替えられる実装を差し込む。

use tokio::sync::watch;

/// NetworkMonitor は接続状態を提供
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;

    /// Subscribe to connectivity changes. Dropping the watch unsubscribes.
    fn watch(&self) -> ConnectivityWatch;
}

/// Subscription to a monitor's online flag.
#[derive(Debug, Clone)]
pub struct ConnectivityWatch {
    rx: watch::Receiver<bool>,
    last: bool,
}

impl ConnectivityWatch {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        let last = *rx.borrow();
        Self { rx, last }
    }

    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next offline -> online edge.
    ///
    /// Returns `false` once the monitor has gone away and no edge can come.
    pub async fn restored(&mut self) -> bool {
        loop {
            if self.rx.changed().await.is_err() {
                return false;
            }
            let now = *self.rx.borrow_and_update();
            let was = std::mem::replace(&mut self.last, now);
            if now && !was {
                return true;
            }
        }
    }

    /// Whether the flag changed since it was last seen and is online now.
    ///
    /// `restored` only sees edges while it is being awaited. An offline ->
    /// online flip that happens in between leaves the latest value `true`
    /// with no edge, so call this after any long piece of work.
    pub fn changed_to_online(&mut self) -> bool {
        if !self.rx.has_changed().unwrap_or(false) {
            return false;
        }
        let now = *self.rx.borrow_and_update();
        self.last = now;
        now
    }
}
