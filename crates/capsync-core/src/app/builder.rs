//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 依存はすべて明示的に渡す（グローバルなシングルトンは持たない）

use std::sync::Arc;
use std::time::Duration;

use crate::app::auto_sync::DEFAULT_SYNC_INTERVAL;
use crate::app::engine::CaptureEngine;
use crate::app::notifier::EventNotifier;
use crate::app::retention::DEFAULT_SWEEP_INTERVAL;
use crate::app::sync::{DEFAULT_UPLOAD_TIMEOUT, SyncOrchestrator};
use crate::config::EngineConfig;
use crate::domain::RetryPolicy;
use crate::ports::{CaptureStore, Clock, NetworkMonitor, SystemClock, UploadClient};

/// EngineBuilder は CaptureEngine を構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .store(Arc::new(SqliteCaptureStore::open(&cfg.storage.db_path, cfg.store_limits())))
///     .uploader(Arc::new(uploader))
///     .network(Arc::new(monitor))
///     .config(&cfg)
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - store / uploader / network のいずれかが欠けていれば BuildError
/// - 0 の間隔・タイムアウトは BuildError（タイマーが組めない）
pub struct EngineBuilder {
    store: Option<Arc<dyn CaptureStore>>,
    uploader: Option<Arc<dyn UploadClient>>,
    network: Option<Arc<dyn NetworkMonitor>>,
    notifier: Option<Arc<EventNotifier>>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    upload_timeout: Duration,
    sync_interval: Duration,
    sweep_interval: Duration,
    retention_days: u32,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing component: {0}")]
    MissingComponent(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            uploader: None,
            network: None,
            notifier: None,
            clock: Arc::new(SystemClock),
            policy: RetryPolicy::default(),
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            retention_days: 7,
        }
    }

    pub fn store(mut self, store: Arc<dyn CaptureStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn UploadClient>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    /// Share a notifier with other components. A fresh one is created otherwise.
    pub fn notifier(mut self, notifier: Arc<EventNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Take retry, timing and retention settings from `config`.
    ///
    /// Store limits are not applied here; they belong to the store itself.
    pub fn config(self, config: &EngineConfig) -> Self {
        self.retry_policy(config.retry_policy())
            .upload_timeout(config.upload_timeout())
            .sync_interval(config.sync_interval())
            .sweep_interval(config.sweep_interval())
            .retention_days(config.storage.retention_days)
    }

    pub fn build(self) -> Result<CaptureEngine, BuildError> {
        let store = self.store.ok_or(BuildError::MissingComponent("store"))?;
        let uploader = self
            .uploader
            .ok_or(BuildError::MissingComponent("uploader"))?;
        let network = self
            .network
            .ok_or(BuildError::MissingComponent("network monitor"))?;

        for (name, value) in [
            ("upload timeout", self.upload_timeout),
            ("sync interval", self.sync_interval),
            ("retention sweep interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(BuildError::ZeroDuration(name));
            }
        }

        let notifier = self.notifier.unwrap_or_default();
        let orchestrator = SyncOrchestrator::new(
            Arc::clone(&store),
            uploader,
            network,
            notifier,
            self.clock,
            self.policy,
            self.upload_timeout,
        );
        Ok(CaptureEngine::new(
            store,
            orchestrator,
            self.retention_days,
            self.sync_interval,
            self.sweep_interval,
        ))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
