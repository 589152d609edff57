//! HttpUploadClient - multipart POST でキャプチャを送信
//!
//! フォームは 3 フィールド：`assign_id`, `task_details_id`, `file`。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::domain::{PendingCapture, UploadError};
use crate::ports::UploadClient;

pub const ASSIGN_FIELD: &str = "assign_id";
pub const TASK_FIELD: &str = "task_details_id";
pub const FILE_FIELD: &str = "file";

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 256;

pub struct HttpUploadClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpUploadClient {
    /// `endpoint` is the full URL of the submit route.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    /// Join `base_url` and `path` with exactly one slash between them.
    pub fn from_parts(base_url: &str, path: &str, timeout: Duration) -> Result<Self, UploadError> {
        let endpoint = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Self::new(endpoint, timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn form(capture: &PendingCapture) -> Result<Form, UploadError> {
        let file = Part::bytes(capture.blob.clone())
            .file_name(capture.filename.clone())
            .mime_str(&capture.mime_type)
            .map_err(|e| UploadError::InvalidPayload(e.to_string()))?;
        Ok(Form::new()
            .text(ASSIGN_FIELD, capture.assign_id.as_str().to_string())
            .text(TASK_FIELD, capture.task_id.as_str().to_string())
            .part(FILE_FIELD, file))
    }
}

#[async_trait]
impl UploadClient for HttpUploadClient {
    async fn upload(&self, capture: &PendingCapture) -> Result<(), UploadError> {
        let form = Self::form(capture)?;
        debug!(capture_id = %capture.id, endpoint = %self.endpoint, bytes = capture.size(), "uploading capture");

        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UploadError::Timeout(self.timeout)
                } else {
                    UploadError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(UploadError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
