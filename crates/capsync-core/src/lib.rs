//! capsync-core
//!
//! Offline capture durability and sync engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, capture, status, retry, events, errors, summary）
//! - **ports**: 抽象化レイヤー（CaptureStore, UploadClient, NetworkMonitor, Clock, IdGenerator）
//! - **impls**: 実装（InMemory / SQLite ストア、HTTP アップロード、接続監視）
//! - **app**: アプリケーションロジック（orchestrator, auto-sync, retention, notifier, engine, builder）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

#[cfg(test)]
mod test_support;

pub use app::{CaptureEngine, EngineBuilder, SyncOrchestrator, SyncOutcome};
pub use config::EngineConfig;
