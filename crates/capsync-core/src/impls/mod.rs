//! Impls - ports の具体実装
//!
//! - **InMemoryCaptureStore**: テスト・一時利用
//! - **SqliteCaptureStore**: 本番用の永続ストア
//! - **HttpUploadClient**: multipart アップロード
//! - **ManualNetworkMonitor / TcpNetworkMonitor**: 接続状態

pub mod http_upload;
pub mod memory_store;
pub mod network;
pub mod sqlite_store;

pub use self::http_upload::HttpUploadClient;
pub use self::memory_store::InMemoryCaptureStore;
pub use self::network::{ManualNetworkMonitor, TcpNetworkMonitor};
pub use self::sqlite_store::SqliteCaptureStore;
