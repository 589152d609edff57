//! Capture record: metadata + payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AssignId, CaptureId, CaptureStatus, TaskId};

/// MIME type assumed when the producer does not supply one.
pub const DEFAULT_MIME_TYPE: &str = "image/jpeg";

/// Stage tag assumed when the producer does not supply one.
pub const DEFAULT_STAGE: &str = "after";

/// Finished binary evidence handed over by the capture producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    data: Vec<u8>,
    mime_type: String,
}

impl Blob {
    /// An empty or blank `mime_type` falls back to [`DEFAULT_MIME_TYPE`].
    pub fn new(data: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        let mime_type = mime_type.into();
        let mime_type = if mime_type.trim().is_empty() {
            DEFAULT_MIME_TYPE.to_string()
        } else {
            mime_type
        };
        Self {
            data: data.into(),
            mime_type,
        }
    }

    pub fn jpeg(data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, DEFAULT_MIME_TYPE)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (Vec<u8>, String) {
        (self.data, self.mime_type)
    }
}

/// File extension used when synthesizing a filename for `mime_type`.
pub fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "video/webm" => "webm",
        "video/mp4" => "mp4",
        m if m.starts_with("video/") => "webm",
        _ => "jpg",
    }
}

/// `capture_<millis>_<suffix>.<ext>`; the suffix is the random tail of the id
/// so two captures in the same millisecond still get distinct names.
pub fn synthesize_filename(id: CaptureId, timestamp_ms: i64, mime_type: &str) -> String {
    let ulid = id.as_ulid().to_string();
    let suffix = &ulid[ulid.len() - 6..];
    format!(
        "capture_{timestamp_ms}_{}.{}",
        suffix.to_ascii_lowercase(),
        extension_for(mime_type)
    )
}

/// The only persisted entity.
///
/// - `id` never changes once assigned.
/// - `retry_count` only grows, and only when the record enters `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCapture {
    pub id: CaptureId,
    pub task_id: TaskId,
    pub assign_id: AssignId,

    #[serde(skip)]
    pub blob: Vec<u8>,
    pub mime_type: String,
    pub filename: String,

    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,

    pub status: CaptureStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub stage: String,
}

impl PendingCapture {
    /// Build a fresh `Pending` record.
    pub fn new(
        id: CaptureId,
        task_id: TaskId,
        assign_id: AssignId,
        blob: Blob,
        stage: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let timestamp = created_at.timestamp_millis();
        let (data, mime_type) = blob.into_parts();
        let stage = stage.into();
        Self {
            id,
            task_id,
            assign_id,
            filename: synthesize_filename(id, timestamp, &mime_type),
            blob: data,
            mime_type,
            timestamp,
            status: CaptureStatus::Pending,
            retry_count: 0,
            last_error: None,
            stage: if stage.is_empty() {
                DEFAULT_STAGE.to_string()
            } else {
                stage
            },
        }
    }

    pub fn size(&self) -> u64 {
        self.blob.len() as u64
    }

    /// Apply a status change. Entering `Failed` bumps `retry_count` and
    /// records `error`; every other transition leaves both untouched.
    pub fn apply_status(&mut self, status: CaptureStatus, error: Option<String>) {
        if status == CaptureStatus::Failed {
            self.retry_count += 1;
            self.last_error = error;
        }
        self.status = status;
    }

    /// Manual recovery: back to `Pending` with a clean retry budget.
    pub fn reset_for_retry(&mut self) {
        self.status = CaptureStatus::Pending;
        self.retry_count = 0;
    }
}
