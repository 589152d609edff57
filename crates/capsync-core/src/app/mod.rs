//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: ストア・アップローダ・ネットワーク・設定のワイヤリング
//! - **CaptureEngine**: 撮影側が呼ぶファサード
//! - **SyncOrchestrator**: キューの drain（process_queue / retry_all_failed）
//! - **Auto-sync**: タイマーと接続復帰による drain 起動
//! - **RetentionSweep**: 保存期間切れの定期削除
//! - **EventNotifier**: SyncEvent の配送

pub mod auto_sync;
pub mod builder;
pub mod engine;
pub mod notifier;
pub mod retention;
pub mod sync;

// 主要な型を再エクスポート
pub use self::auto_sync::DEFAULT_SYNC_INTERVAL;
pub use self::builder::{BuildError, EngineBuilder};
pub use self::engine::{CaptureEngine, EngineStatus, SyncOutcome};
pub use self::notifier::{EventNotifier, SubscriptionId};
pub use self::retention::{RetentionSweep, spawn_retention_sweep, sweep_once};
pub use self::sync::{DEFAULT_UPLOAD_TIMEOUT, SyncOrchestrator};
