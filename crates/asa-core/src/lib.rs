// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Data model shared by every crate in this workspace.

/// Event/bucket/checkpoint/queue data model.
pub mod model;
/// Shared error taxonomy and tray presentation state.
pub mod error;

pub use error::{SyncError, TrayState};
pub use model::{
    Bucket, BucketType, CategoryMapping, Checkpoint, Event, EventData, PrivacyPolicy,
    QueuedEvent, SyncState, SyncStats,
};

/// Stable contract version exchanged with the remote service during auth.
///
/// ```
/// assert_eq!(asa_core::CONTRACT_VERSION, "1.0.0");
/// ```
pub const CONTRACT_VERSION: &str = "1.0.0";
