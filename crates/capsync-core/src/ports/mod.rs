//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部（ローカル DB, アップロード API, ネットワーク状態, 時刻）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ローカルストアが source of truth（正本）
//! - アップロードは 1 件 1 リクエスト
//! - スケジューリングの入力（タイマー・接続復帰）は差し替え可能

pub mod capture_store;
pub mod clock;
pub mod id_generator;
pub mod network;
pub mod upload_client;

// 主要な trait を再エクスポート
pub use self::capture_store::{CaptureStore, INTERRUPTED_ERROR, StoreLimits, retention_cutoff};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::network::{ConnectivityWatch, NetworkMonitor};
pub use self::upload_client::UploadClient;
