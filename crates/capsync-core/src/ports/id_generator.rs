//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::CaptureId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は保存ごとに新しい CaptureId を生成
///
/// # ULID の特性
/// - 時刻でソート可能
/// - 調整なしで生成可能
/// - 128-bit（UUID 互換）
pub trait IdGenerator: Send + Sync {
    fn generate_capture_id(&self) -> CaptureId;
}

/// UlidGenerator は Clock を使って現在時刻ベースの ULID を生成します。
/// テスト時に FixedClock を使えば timestamp 部分が決定的になる。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_capture_id(&self) -> CaptureId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        CaptureId::from(ulid)
    }
}
