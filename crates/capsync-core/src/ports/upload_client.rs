//! UploadClient port - リモートのアップロード API
//!
//! エンジンが依存するワイヤ契約はこれ 1 つだけ：
//! 1 キャプチャ = 1 リクエスト（multipart: assign id, task id, file）。
//! 2xx なら成功、それ以外（通信エラー・タイムアウト含む）は失敗。

use async_trait::async_trait;

use crate::domain::{PendingCapture, UploadError};

/// UploadClient は 1 件のキャプチャを送信する
///
/// # 設計原則
/// - バッチ送信・分割送信はしない
/// - タイムアウトは呼び出し側（SyncOrchestrator）でも掛ける
#[async_trait]
pub trait UploadClient: Send + Sync {
    /// Send `capture` (its assign id, task id and payload). `Ok` means the
    /// server acknowledged it.
    async fn upload(&self, capture: &PendingCapture) -> Result<(), UploadError>;
}
