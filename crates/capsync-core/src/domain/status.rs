//! Capture lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stored lifecycle state of a capture.
///
/// State transitions:
/// - Pending -> Syncing -> (deleted)
/// - Pending -> Syncing -> Failed
/// - Failed -> Syncing -> (deleted) / Failed   (automatic retry below the ceiling)
/// - Failed -> Pending                          (manual retry-all)
///
/// "Synced" is never stored: a delivered capture is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    /// Waiting for the next drain.
    Pending,

    /// An upload attempt is in flight.
    Syncing,

    /// The last upload attempt failed.
    Failed,
}

impl CaptureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureStatus::Pending => "pending",
            CaptureStatus::Syncing => "syncing",
            CaptureStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle edge.
    pub fn can_transition_to(self, next: CaptureStatus) -> bool {
        use CaptureStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing) | (Failed, Syncing) | (Syncing, Failed) | (Failed, Pending)
        )
    }
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CaptureStatus::Pending),
            "syncing" => Ok(CaptureStatus::Syncing),
            "failed" => Ok(CaptureStatus::Failed),
            other => Err(format!("unknown capture status: {other}")),
        }
    }
}
