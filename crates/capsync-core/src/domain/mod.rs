//! Domain model (IDs, capture records, status, events, errors).

pub mod capture;
pub mod errors;
pub mod events;
pub mod ids;
pub mod retry;
pub mod status;
pub mod summary;

pub use capture::{Blob, DEFAULT_MIME_TYPE, DEFAULT_STAGE, PendingCapture};
pub use errors::{CaptureError, QuotaKind, UploadError};
pub use events::{StorageWarning, SyncEvent};
pub use ids::{AssignId, CaptureId, TaskId};
pub use retry::RetryPolicy;
pub use status::CaptureStatus;
pub use summary::{QueueState, StorageState, SyncReport};
