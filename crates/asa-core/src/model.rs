// SPDX-License-Identifier: MIT OR Apache-2.0
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The kind of tracker that produced a [`Bucket`].
///
/// Trackers across server implementations and versions have used
/// different type strings for the same semantic bucket; [`BucketType::parse`]
/// tolerates every alias this workspace has ever observed in the wild.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketType {
    /// Active window / foreground application tracker.
    Window,
    /// Browser tab / URL tracker.
    Web,
    /// AFK (away-from-keyboard) status tracker.
    Afk,
    /// Keystroke/click/scroll input-activity tracker.
    Input,
    /// Break/reminder tracker.
    Break,
    /// Synthetic bucket used to represent redacted private-mode time.
    PrivateTime,
}

impl BucketType {
    /// Parse a raw bucket-type string, tolerating every legacy alias this
    /// workspace has observed across tracker server implementations.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "currentwindow" | "aw-watcher-window" => Some(Self::Window),
            "aw-watcher-web" => Some(Self::Web),
            "afkstatus" | "aw-watcher-afk" => Some(Self::Afk),
            "aw-watcher-input" => Some(Self::Input),
            "aw-watcher-break" | "break" => Some(Self::Break),
            "private-time" | "private_time" => Some(Self::PrivateTime),
            _ => None,
        }
    }
}

/// A bucket: a named, typed stream of events produced by one local tracker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Stable identifier assigned by the tracker server.
    pub id: String,
    /// Human-readable name, usually equal to `id`.
    pub name: String,
    /// The bucket's semantic type.
    pub bucket_type: BucketType,
    /// Name of the client process that owns this bucket.
    pub client: String,
    /// Hostname of the machine the bucket was created on.
    pub hostname: String,
    /// Creation timestamp reported by the tracker server.
    pub created: DateTime<Utc>,
}

/// The payload carried by an [`Event`], narrowed to the fields this agent
/// actually reads. Unknown fields from the tracker are preserved in `extra`
/// so they round-trip through the offline queue untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Foreground application name (window events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    /// Window title (window events), subject to the privacy filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Page URL (web events), subject to the privacy filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// AFK status string, e.g. `"afk"` / `"not-afk"` (afk events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Keystroke count (input events).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub presses: u64,
    /// Mouse click count (input events).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub clicks: u64,
    /// Scroll event count (input events).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub scrolls: u64,
    /// Any fields the tracker sent that this agent does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// A single timestamped, durative activity observation.
///
/// Invariant: `duration >= 0`. Invariant: `id` is unique within a bucket
/// but is reused by the tracker server across HTTP calls when an
/// in-progress event (e.g. the current window) is extended rather than
/// closed — this is the "heartbeat extension" behavior callers must
/// dedupe against (see [`crate::SyncState`] and the sync engine's
/// `sent_cache`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Tracker-assigned event id, stable across heartbeat extensions.
    pub id: i64,
    /// Bucket this event was read from.
    pub bucket_id: String,
    /// Start timestamp of the observation.
    pub timestamp: DateTime<Utc>,
    /// Duration in seconds. May grow across successive reads of the same
    /// `id` while the observation (e.g. the active window) is ongoing.
    pub duration: f64,
    /// Structured payload.
    pub data: EventData,
}

impl Event {
    /// The timestamp at which this event's observed span ends.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.timestamp + chrono::Duration::milliseconds((self.duration * 1000.0) as i64)
    }
}

/// Per-bucket sync progress, persisted so incremental sync can resume
/// after a restart without re-sending already-delivered events.
///
/// Invariant: `last_timestamp` never moves backward except when a pause
/// resume or a private-mode exit wholly resets the bucket's sync window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Bucket this checkpoint tracks.
    pub bucket_id: String,
    /// Highest event id observed as of the last successful send.
    pub last_event_id: i64,
    /// Timestamp of the last-sent event's end time.
    pub last_timestamp: DateTime<Utc>,
    /// Wall-clock time the checkpoint was last updated.
    pub updated_at: DateTime<Utc>,
}

/// An event durably persisted in the offline queue awaiting delivery.
///
/// Invariant: queue order is FIFO by `created_at`; delivery preserves
/// this order except for events explicitly dropped by `remove_failed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Row id assigned by the queue store.
    pub id: i64,
    /// The serialized event payload as it will be sent to the remote.
    pub event_data: serde_json::Value,
    /// Time the event was enqueued.
    pub created_at: DateTime<Utc>,
    /// Number of delivery attempts made so far.
    pub retry_count: u32,
}

/// A rule mapping an app name or URL substring to a project/category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryMapping {
    /// Substring matched against app name or URL.
    pub pattern: String,
    /// Category or project label applied when `pattern` matches.
    pub category: String,
}

/// User-configurable privacy policy applied to every event before it
/// leaves the machine.
///
/// Invariant: when `hash_titles` is `true`, raw window titles are never
/// retained or transmitted, even transiently, for apps not on
/// `title_allowlist`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PrivacyPolicy {
    /// Applications excluded from sync entirely (e.g. password managers).
    pub exclude_apps: Vec<String>,
    /// Applications whose window titles are sent unhashed.
    pub title_allowlist: Vec<String>,
    /// Hash window titles (SHA-256, first 16 hex chars) for apps not on
    /// `title_allowlist`.
    pub hash_titles: bool,
    /// Reduce URLs to their registrable domain before sending.
    pub domain_only_urls: bool,
    /// Send full URLs untouched. Takes precedence over `domain_only_urls`
    /// when both are set.
    pub collect_full_urls: bool,
    /// Attach an inferred coarse page category to web events.
    pub collect_page_category: bool,
}

impl Default for PrivacyPolicy {
    fn default() -> Self {
        Self {
            exclude_apps: vec![
                "1Password".to_string(),
                "Keychain Access".to_string(),
                "System Preferences".to_string(),
                "System Settings".to_string(),
            ],
            title_allowlist: vec![
                "Visual Studio Code".to_string(),
                "iTerm2".to_string(),
                "Terminal".to_string(),
                "Figma".to_string(),
            ],
            hash_titles: true,
            domain_only_urls: true,
            collect_full_urls: false,
            collect_page_category: false,
        }
    }
}

/// In-memory runtime state of the sync engine, mutated by pause/resume,
/// private-mode toggles, and project selection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Whether a remote session is currently open.
    pub session_active: bool,
    /// Whether sync is user-paused.
    pub paused: bool,
    /// Whether private mode (redact-and-discard) is active.
    pub private_mode: bool,
    /// Floor timestamp below which events are dropped even if a
    /// checkpoint has not yet advanced past them. Set when pause or
    /// private mode begins; cleared on resume. See `DESIGN.md` Open
    /// Question 1.
    pub post_pause_floor: Option<DateTime<Utc>>,
    /// Wall-clock time private mode was entered, retained so
    /// `setPrivateMode(false)` can synthesize a single covering
    /// `private_time` event. `None` outside of private mode.
    pub private_mode_since: Option<DateTime<Utc>>,
    /// Currently selected project/category override, if any.
    pub current_project: Option<String>,
    /// Timestamp of the last successful sync cycle.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Heartbeats sent since the session was opened.
    pub heartbeat_counter: u64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            session_active: false,
            paused: false,
            private_mode: false,
            post_pause_floor: None,
            private_mode_since: None,
            current_project: None,
            last_sync_at: None,
            heartbeat_counter: 0,
        }
    }
}

/// Aggregate counters for a single `sync()` cycle, surfaced to the tray.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Events read back from the tracker across all buckets, including
    /// the look-back overlap window.
    pub events_fetched: u32,
    /// Events dropped during transform (excluded app, sub-threshold
    /// duration, dedupe hit).
    pub events_filtered: u32,
    /// Events successfully delivered to the remote.
    pub events_synced: u32,
    /// Events left in (or newly added to) the offline queue.
    pub events_queued: u32,
    /// Events permanently dropped (max retries exceeded).
    pub events_dropped: u32,
    /// Buckets that completed a sync pass without error this cycle.
    pub buckets_synced: u32,
    /// Gaps closed by the look-back gap-fill pass.
    pub gaps_filled: u32,
    /// Non-fatal errors encountered this cycle (bucket fetch failures,
    /// tracker unreachable, etc). A populated list does not imply the
    /// cycle raised — see [`SyncStats::success`].
    pub errors: Vec<String>,
    /// Wall-clock duration of the cycle, in milliseconds.
    pub duration_ms: u64,
}

impl SyncStats {
    /// A cycle is successful iff it recorded no errors.
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_type_parses_legacy_aliases() {
        assert_eq!(BucketType::parse("currentwindow"), Some(BucketType::Window));
        assert_eq!(BucketType::parse("aw-watcher-window"), Some(BucketType::Window));
        assert_eq!(BucketType::parse("afkstatus"), Some(BucketType::Afk));
        assert_eq!(BucketType::parse("aw-watcher-afk"), Some(BucketType::Afk));
        assert_eq!(BucketType::parse("aw-watcher-web"), Some(BucketType::Web));
        assert_eq!(BucketType::parse("unknown-watcher"), None);
    }

    #[test]
    fn event_end_time_adds_duration() {
        let ev = Event {
            id: 1,
            bucket_id: "aw-watcher-window_host".into(),
            timestamp: "2026-01-01T00:00:00Z".parse().unwrap(),
            duration: 90.5,
            data: EventData::default(),
        };
        let end = ev.end_time();
        assert_eq!(end, ev.timestamp + chrono::Duration::milliseconds(90_500));
    }

    #[test]
    fn default_privacy_policy_excludes_sensitive_apps() {
        let policy = PrivacyPolicy::default();
        assert!(policy.exclude_apps.contains(&"1Password".to_string()));
        assert!(policy.hash_titles);
        assert!(policy.domain_only_urls);
    }
}
