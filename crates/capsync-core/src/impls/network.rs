//! NetworkMonitor 実装
//!
//! - ManualNetworkMonitor: 手動で online/offline を切り替える（テスト・組み込み用）
//! - TcpNetworkMonitor: アップロード先への TCP 接続で到達性を定期確認

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ports::{ConnectivityWatch, NetworkMonitor};

/// Online flag flipped by the host.
#[derive(Debug)]
pub struct ManualNetworkMonitor {
    tx: watch::Sender<bool>,
}

impl ManualNetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            info!(online, "connectivity changed");
        }
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> ConnectivityWatch {
        ConnectivityWatch::new(self.tx.subscribe())
    }
}

/// Reachability of one `host:port`, re-checked every `interval`.
///
/// The background check stops when the monitor is dropped.
pub struct TcpNetworkMonitor {
    addr: String,
    connect_timeout: Duration,
    tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TcpNetworkMonitor {
    /// Start checking `addr`. Starts out offline until the first check lands.
    pub fn spawn(addr: impl Into<String>, interval: Duration, connect_timeout: Duration) -> Self {
        let addr = addr.into();
        let (tx, _rx) = watch::channel(false);
        let check_tx = tx.clone();
        let check_addr = addr.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let reachable = is_reachable(&check_addr, connect_timeout).await;
                publish(&check_tx, &check_addr, reachable);
            }
        });
        Self {
            addr,
            connect_timeout,
            tx,
            task,
        }
    }

    /// Watch the host behind `url` (scheme default port when none is given).
    pub fn for_url(url: &str, interval: Duration, connect_timeout: Duration) -> Option<Self> {
        let parsed = reqwest::Url::parse(url).ok()?;
        let host = parsed.host_str()?.to_string();
        let port = parsed.port_or_known_default()?;
        Some(Self::spawn(format!("{host}:{port}"), interval, connect_timeout))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Check right away instead of waiting for the next tick.
    pub async fn check_now(&self) -> bool {
        let reachable = is_reachable(&self.addr, self.connect_timeout).await;
        publish(&self.tx, &self.addr, reachable);
        reachable
    }
}

async fn is_reachable(addr: &str, connect_timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

fn publish(tx: &watch::Sender<bool>, addr: &str, reachable: bool) {
    let changed = tx.send_if_modified(|current| {
        let changed = *current != reachable;
        *current = reachable;
        changed
    });
    if changed {
        info!(addr, online = reachable, "connectivity changed");
    } else {
        debug!(addr, online = reachable, "connectivity checked");
    }
}

impl NetworkMonitor for TcpNetworkMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> ConnectivityWatch {
        ConnectivityWatch::new(self.tx.subscribe())
    }
}

impl Drop for TcpNetworkMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn manual_monitor_reports_restores() {
        let monitor = ManualNetworkMonitor::new(false);
        let mut watch = monitor.watch();
        assert!(!monitor.is_online());

        monitor.set_online(true);
        assert!(watch.restored().await);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn listening_port_is_reported_online() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let monitor = TcpNetworkMonitor::spawn(
            addr.to_string(),
            Duration::from_millis(10),
            Duration::from_millis(200),
        );
        let mut watch = monitor.watch();
        assert!(watch.restored().await);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn closed_port_is_reported_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let monitor = TcpNetworkMonitor::spawn(
            addr.to_string(),
            Duration::from_secs(60),
            Duration::from_millis(200),
        );
        assert!(!monitor.check_now().await);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn url_without_host_is_rejected() {
        assert!(
            TcpNetworkMonitor::for_url(
                "not a url",
                Duration::from_secs(1),
                Duration::from_secs(1)
            )
            .is_none()
        );
    }
}
