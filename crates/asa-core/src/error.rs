// SPDX-License-Identifier: MIT OR Apache-2.0
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shared error taxonomy for the sync pipeline.
///
/// `Transient` and `Auth` drive retry control flow directly (no
/// exceptions-as-control-flow): callers match on the variant rather than
/// catching and re-classifying a generic error type.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A transient failure (network blip, 5xx, timeout) that retrying is
    /// expected to resolve.
    #[error("transient error: {0}")]
    Transient(String),

    /// Credentials were rejected or have expired; retrying without
    /// re-authenticating will not help.
    #[error("authentication required")]
    Auth,

    /// A non-retryable failure reported by the remote service.
    #[error("remote rejected request ({status}): {message}")]
    Permanent {
        /// HTTP status code returned by the remote.
        status: u16,
        /// Remote-provided error message.
        message: String,
    },

    /// The local tracker server could not be reached.
    #[error("tracker unreachable")]
    TrackerUnreachable,

    /// A tracker bucket has stopped producing new events past the stall
    /// threshold.
    #[error("tracker bucket {bucket_id} appears stalled")]
    TrackerStall {
        /// The stalled bucket's id.
        bucket_id: String,
    },

    /// The offline queue reached capacity and evicted the oldest entries.
    #[error("offline queue full, evicted {evicted} oldest entries")]
    QueueFull {
        /// Number of entries evicted to make room.
        evicted: usize,
    },

    /// An event exhausted its retry budget and was dropped.
    #[error("max retries exceeded, dropped {dropped} events")]
    MaxRetriesExceeded {
        /// Number of events dropped.
        dropped: usize,
    },
}

impl SyncError {
    /// Whether this error class should be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::TrackerUnreachable)
    }
}

/// Presentation state surfaced to the external tray/UI collaborator.
///
/// Precedence when multiple conditions hold simultaneously (highest
/// first): `QueueWarning`, `Queued`, `Syncing`, `Error`, `WaitingAuth`,
/// `Paused`, `Private`, `Starting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrayState {
    /// Daemon is starting up.
    Starting,
    /// A sync cycle is in progress.
    Syncing,
    /// Events are queued offline awaiting delivery.
    Queued,
    /// The offline queue is near capacity.
    QueueWarning,
    /// The last sync cycle failed.
    Error,
    /// Sync is user-paused.
    Paused,
    /// Private mode is active.
    Private,
    /// Credentials have expired; user action is required.
    WaitingAuth,
}
