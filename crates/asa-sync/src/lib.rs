// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod gapfill;
pub mod sent_cache;
pub mod transform;

use std::sync::Arc;

use asa_config::AgentConfig;
use asa_core::{Bucket, BucketType, Event, SyncState, SyncStats};
use asa_privacy::PrivacyFilter;
use asa_queue::OfflineQueue;
use asa_remote_client::{RemoteClient, RemoteError};
use asa_tracker_client::TrackerClient;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gapfill::fill_gaps;
use sent_cache::SentCache;
use transform::transform_event;

/// Sync cycles between heartbeats, per the remote API contract.
const HEARTBEAT_INTERVAL_CYCLES: u64 = 5;
/// Overlap window re-fetched before each bucket's checkpoint, to catch
/// events whose duration grew via a heartbeat extension since the last
/// cycle.
fn lookback_overlap() -> ChronoDuration {
    ChronoDuration::minutes(2)
}
/// First-run look-back when no checkpoint exists yet.
fn first_run_lookback() -> ChronoDuration {
    ChronoDuration::hours(24)
}
/// Events exceeding this retry count are dropped from the offline queue.
const MAX_QUEUE_RETRIES: u32 = 5;
/// Upper bound on events drained from the offline queue in one cycle,
/// expressed as a multiple of the configured batch size.
const QUEUE_DRAIN_BATCH_MULTIPLIER: usize = 10;

/// An error [`SyncEngine::sync`] propagates to its caller rather than
/// recording in [`SyncStats::errors`] — the orchestrator reacts to this
/// by entering a waiting-for-auth state.
#[derive(Debug, thiserror::Error)]
pub enum SyncEngineError {
    /// The remote rejected credentials mid-cycle; re-authentication is
    /// required before sync can resume.
    #[error("remote authentication required")]
    AuthRequired,
}

struct QueueBackoff {
    consecutive_failures: u32,
    backoff_until: Option<DateTime<Utc>>,
}

impl Default for QueueBackoff {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            backoff_until: None,
        }
    }
}

impl QueueBackoff {
    /// `consecutive_failures` is incremented *before* this is called, so
    /// the first failure (`consecutive_failures == 1`) must back off 60s,
    /// not 120s — subtract one to get the zero-based retry exponent.
    fn delay_after_failure(&self) -> ChronoDuration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(4);
        let secs = 60u64.saturating_mul(1u64 << exponent);
        ChronoDuration::seconds(secs.min(600) as i64)
    }
}

/// The core sync algorithm. Stateless across restarts beyond what is
/// persisted in the offline queue's checkpoint table; in-process state
/// (pause/private/session/heartbeat counters, the dedupe cache, queue
/// backoff) lives here behind a mutex so OS-event and UI callbacks can
/// mutate it concurrently with a running cycle.
pub struct SyncEngine {
    tracker: TrackerClient,
    remote: RemoteClient,
    queue: Arc<OfflineQueue>,
    config: Mutex<AgentConfig>,
    state: Mutex<SyncState>,
    sent_cache: Mutex<SentCache>,
    backoff: Mutex<QueueBackoff>,
    config_fetched: Mutex<bool>,
    heartbeat_counter: Mutex<u64>,
    on_config_updated: Option<Box<dyn Fn() + Send + Sync>>,
}

impl SyncEngine {
    /// Build an engine over its collaborators. `on_config_updated` fires
    /// whenever a server-driven config merge completes, so callers can
    /// propagate settings like AFK timeout to the tracker supervisor.
    pub fn new(
        tracker: TrackerClient,
        remote: RemoteClient,
        queue: Arc<OfflineQueue>,
        config: AgentConfig,
        on_config_updated: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            tracker,
            remote,
            queue,
            config: Mutex::new(config),
            state: Mutex::new(SyncState::default()),
            sent_cache: Mutex::new(SentCache::new()),
            backoff: Mutex::new(QueueBackoff::default()),
            config_fetched: Mutex::new(false),
            heartbeat_counter: Mutex::new(0),
            on_config_updated,
        }
    }

    /// Pause syncing: fast-forwards every known bucket's checkpoint to
    /// now, which is the sole mechanism preventing buffered-while-paused
    /// events from uploading after resume.
    pub async fn pause(&self) {
        let now = Utc::now();
        self.fast_forward_checkpoints(now).await;
        let mut state = self.state.lock().await;
        state.paused = true;
        if state.session_active {
            let _ = self.remote.end_session("app_quit").await;
            state.session_active = false;
        }
    }

    /// Resume syncing. Sets the post-pause floor to now: the first
    /// post-resume cycle drops any event timestamped before this, even
    /// though the look-back window would otherwise re-fetch it.
    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        state.paused = false;
        state.post_pause_floor = Some(Utc::now());
    }

    /// Toggle private mode. Entering fast-forwards checkpoints exactly
    /// like [`Self::pause`]; leaving synthesizes one `private_time`
    /// event spanning the whole private interval.
    pub async fn set_private_mode(&self, enabled: bool) {
        if enabled {
            let now = Utc::now();
            self.fast_forward_checkpoints(now).await;
            let mut state = self.state.lock().await;
            state.private_mode = true;
            state.private_mode_since = Some(now);
            if state.session_active {
                let _ = self.remote.end_session("private_time").await;
                state.session_active = false;
            }
        } else {
            let (private_start, now) = {
                let mut state = self.state.lock().await;
                let start = state.private_mode_since.take().unwrap_or_else(Utc::now);
                state.private_mode = false;
                state.post_pause_floor = Some(Utc::now());
                (start, Utc::now())
            };
            let duration = (now - private_start).num_milliseconds() as f64 / 1000.0;
            let event = serde_json::json!({
                "id": private_start.timestamp_millis(),
                "bucket_id": "private-time",
                "bucket_type": "private_time",
                "timestamp": private_start.to_rfc3339(),
                "duration": duration.max(0.0),
                "data": {"status": "private"},
            });
            match self.remote.send_events(&[event.clone()]).await {
                Ok(_) => {}
                Err(_) => {
                    if let Err(e) = self.queue.enqueue(event) {
                        warn!(target: "asa.sync", error = %e, "failed to enqueue private-time event");
                    }
                }
            }
        }
    }

    /// Set (or clear) the project attached to outgoing events.
    pub async fn set_current_project(&self, project_id: Option<String>) {
        self.state.lock().await.current_project = project_id;
    }

    /// Install the bearer token used by this engine's remote client,
    /// typically after an auto-login from the credential store.
    pub async fn set_credentials(&self, token: String) {
        self.remote.set_credentials(token).await;
    }

    /// Clear the remote client's credentials, e.g. after an auth error.
    pub async fn clear_credentials(&self) {
        self.remote.clear_credentials().await;
    }

    /// Current merged configuration snapshot, for callers that need to
    /// react to a server-driven config update (e.g. propagating a new
    /// AFK timeout to the tracker supervisor from `on_config_updated`).
    pub async fn current_config(&self) -> AgentConfig {
        self.config.lock().await.clone()
    }

    /// Current snapshot of engine state, for the tray/status surface.
    pub async fn get_status(&self) -> EngineStatus {
        let state = self.state.lock().await;
        let queue_size = self.queue.len().unwrap_or(0);
        EngineStatus {
            paused: state.paused,
            private_mode: state.private_mode,
            session_active: state.session_active,
            tracker_running: self.tracker.is_running().await,
            queue_size,
        }
    }

    /// Fetch and apply server-side configuration, firing the
    /// `on_config_updated` hook on success.
    pub async fn fetch_server_config(&self) {
        match self.remote.get_config().await {
            Ok(raw) => match serde_json::from_value::<asa_config::ServerConfigOverride>(raw) {
                Ok(server) => {
                    let mut config = self.config.lock().await;
                    let warnings = asa_config::merge_server_override(&mut config, &server);
                    for warning in warnings {
                        debug!(target: "asa.sync", %warning, "server config warning");
                    }
                    *self.config_fetched.lock().await = true;
                    info!(target: "asa.sync", "server configuration applied");
                    if let Some(hook) = &self.on_config_updated {
                        hook();
                    }
                }
                Err(e) => warn!(target: "asa.sync", error = %e, "malformed server config"),
            },
            Err(e) => warn!(target: "asa.sync", error = %e, "failed to fetch server config"),
        }
    }

    /// Gracefully end the remote session, if one is open.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.session_active {
            let _ = self.remote.end_session("app_quit").await;
            state.session_active = false;
        }
    }

    async fn fast_forward_checkpoints(&self, at: DateTime<Utc>) {
        let bucket_ids = match self.tracker.buckets().await {
            Ok(buckets) => buckets.into_iter().map(|b| b.id).collect::<Vec<_>>(),
            Err(_) => self
                .queue
                .all_checkpoints()
                .unwrap_or_default()
                .into_iter()
                .map(|c| c.bucket_id)
                .collect(),
        };
        for bucket_id in bucket_ids {
            let last_event_id = self
                .queue
                .get_checkpoint(&bucket_id)
                .ok()
                .flatten()
                .map(|c| c.last_event_id)
                .unwrap_or(0);
            if let Err(e) = self.queue.set_checkpoint(&bucket_id, last_event_id, at) {
                warn!(target: "asa.sync", bucket_id, error = %e, "failed to fast-forward checkpoint");
            }
        }
    }

    /// Run one sync cycle.
    pub async fn sync(&self) -> Result<SyncStats, SyncEngineError> {
        let started = std::time::Instant::now();
        let mut stats = SyncStats::default();

        let (paused, private_mode) = {
            let state = self.state.lock().await;
            (state.paused, state.private_mode)
        };
        if paused || private_mode {
            return Ok(stats);
        }

        if !*self.config_fetched.lock().await && self.remote.is_reachable().await {
            self.fetch_server_config().await;
        }

        if !self.tracker.is_running().await {
            stats.errors.push("local tracker is not running".to_string());
            return Ok(stats);
        }

        self.ensure_session().await;

        let buckets = match self.tracker.buckets().await {
            Ok(b) => b,
            Err(e) => {
                stats.errors.push(format!("failed to list buckets: {e}"));
                return Ok(stats);
            }
        };

        let mut all_outgoing = Vec::new();
        for bucket in &buckets {
            match self.sync_bucket(bucket, &buckets, &mut stats).await {
                Ok(mut outgoing) => {
                    stats.buckets_synced += 1;
                    all_outgoing.append(&mut outgoing);
                }
                Err(e) => stats.errors.push(format!("failed to sync bucket {}: {e}", bucket.id)),
            }
        }

        if !all_outgoing.is_empty() {
            if let Err(SyncEngineError::AuthRequired) = self.upload(all_outgoing, &mut stats).await {
                return Err(SyncEngineError::AuthRequired);
            }
        }

        if self.remote.is_reachable().await && !self.queue.is_empty().unwrap_or(false) {
            self.drain_queue(&mut stats).await;
        }

        self.tick_heartbeat().await;

        {
            let mut state = self.state.lock().await;
            state.last_sync_at = Some(Utc::now());
            if let Some(floor) = state.post_pause_floor {
                if stats.success() {
                    debug!(target: "asa.sync", %floor, "clearing post-pause floor after clean cycle");
                    state.post_pause_floor = None;
                }
            }
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        Ok(stats)
    }

    async fn ensure_session(&self) {
        let already_active = self.state.lock().await.session_active;
        if already_active {
            return;
        }
        if !self.remote.is_reachable().await {
            return;
        }
        match self.remote.start_session().await {
            Ok(()) => self.state.lock().await.session_active = true,
            Err(e) => debug!(target: "asa.sync", error = %e, "session start deferred, best-effort only"),
        }
    }

    async fn sync_bucket(
        &self,
        bucket: &Bucket,
        all_buckets: &[Bucket],
        stats: &mut SyncStats,
    ) -> Result<Vec<serde_json::Value>, asa_tracker_client::TrackerClientError> {
        if !matches!(
            bucket.bucket_type,
            BucketType::Window | BucketType::Web | BucketType::Afk | BucketType::Input
        ) {
            return Ok(Vec::new());
        }

        let checkpoint = self.queue.get_checkpoint(&bucket.id).ok().flatten();
        let lookback_start = match &checkpoint {
            Some(cp) => cp.last_timestamp - lookback_overlap(),
            None => Utc::now() - first_run_lookback(),
        };

        let batch_size = self.config.lock().await.sync.batch_size;
        let mut events = self
            .tracker
            .events_since(&bucket.id, lookback_start, batch_size.max(1))
            .await?;
        events.sort_by_key(|e| e.timestamp);
        stats.events_fetched += events.len() as u32;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        if bucket.bucket_type == BucketType::Window {
            let not_afk_spans = self.fetch_not_afk_spans(all_buckets, &events).await;
            stats.gaps_filled += fill_gaps(&mut events, &not_afk_spans);
        }

        let (policy, current_project, floor) = {
            let config = self.config.lock().await;
            let state = self.state.lock().await;
            (config.privacy.clone(), state.current_project.clone(), state.post_pause_floor)
        };
        let privacy = PrivacyFilter::new(policy);
        let now = Utc::now();

        let mut outgoing = Vec::with_capacity(events.len());
        {
            let mut cache = self.sent_cache.lock().await;
            for event in &events {
                if let Some(floor) = floor {
                    if event.timestamp < floor {
                        stats.events_filtered += 1;
                        continue;
                    }
                }
                let Some(value) = transform_event(event, bucket.bucket_type, &privacy, current_project.as_deref(), now) else {
                    stats.events_filtered += 1;
                    continue;
                };
                if !cache.observe(&bucket.id, event.id, event.duration) {
                    stats.events_filtered += 1;
                    continue;
                }
                outgoing.push(value);
            }
        }

        if let Some(newest) = events.iter().max_by_key(|e| e.timestamp) {
            self.queue
                .set_checkpoint(&bucket.id, newest.id, newest.timestamp)
                .map_err(|_| asa_tracker_client::TrackerClientError::Decode("checkpoint write failed".to_string()))?;
        }

        Ok(outgoing)
    }

    async fn fetch_not_afk_spans(
        &self,
        all_buckets: &[Bucket],
        window_events: &[Event],
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let Some(first) = window_events.first() else {
            return Vec::new();
        };
        let last = window_events.iter().map(Event::end_time).max().unwrap_or(first.timestamp);

        let mut spans = Vec::new();
        for bucket in all_buckets.iter().filter(|b| b.bucket_type == BucketType::Afk) {
            let events = self
                .tracker
                .events(&bucket.id, Some(first.timestamp), Some(last), 1000)
                .await
                .unwrap_or_default();
            for event in events {
                if event.data.status.as_deref() == Some("not-afk") {
                    spans.push((event.timestamp, event.end_time()));
                }
            }
        }
        spans
    }

    async fn upload(&self, events: Vec<serde_json::Value>, stats: &mut SyncStats) -> Result<(), SyncEngineError> {
        let batch_size = self.config.lock().await.sync.batch_size as usize;
        let chunks: Vec<_> = events.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect();

        for (i, chunk) in chunks.iter().enumerate() {
            match self.remote.send_events(chunk).await {
                Ok(result) => stats.events_synced += result.processed,
                Err(RemoteError::Auth) => {
                    self.enqueue_all(&chunks[i..], stats);
                    stats.errors.push("remote authentication required".to_string());
                    return Err(SyncEngineError::AuthRequired);
                }
                Err(e) => {
                    stats.errors.push(e.to_string());
                    self.enqueue_all(&chunks[i..], stats);
                    break;
                }
            }
        }
        Ok(())
    }

    fn enqueue_all(&self, chunks: &[Vec<serde_json::Value>], stats: &mut SyncStats) {
        for chunk in chunks {
            for event in chunk {
                match self.queue.enqueue(event.clone()) {
                    Ok(evicted) => {
                        stats.events_queued += 1;
                        stats.events_dropped += evicted as u32;
                    }
                    Err(e) => warn!(target: "asa.sync", error = %e, "failed to enqueue event"),
                }
            }
        }
    }

    async fn drain_queue(&self, stats: &mut SyncStats) {
        {
            let backoff = self.backoff.lock().await;
            if let Some(until) = backoff.backoff_until {
                if Utc::now() < until {
                    return;
                }
            }
        }

        if let Ok(dropped) = self.queue.remove_failed(MAX_QUEUE_RETRIES) {
            stats.events_dropped += dropped as u32;
        }

        let batch_size = self.config.lock().await.sync.batch_size as usize;
        let max_per_cycle = batch_size.max(1) * QUEUE_DRAIN_BATCH_MULTIPLIER;
        let mut processed = 0usize;

        while processed < max_per_cycle {
            let queued = match self.queue.peek_batch(batch_size.max(1)) {
                Ok(q) if !q.is_empty() => q,
                _ => break,
            };
            let ids: Vec<i64> = queued.iter().map(|q| q.id).collect();
            let events: Vec<serde_json::Value> = queued.into_iter().map(|q| q.event_data).collect();

            match self.remote.send_events(&events).await {
                Ok(result) => {
                    let _ = self.queue.remove(&ids);
                    stats.events_synced += result.processed;
                    processed += ids.len();
                    self.backoff.lock().await.consecutive_failures = 0;
                }
                Err(e) => {
                    let _ = self.queue.increment_retry(&ids);
                    let mut backoff = self.backoff.lock().await;
                    backoff.consecutive_failures += 1;
                    backoff.backoff_until = Some(Utc::now() + backoff.delay_after_failure());
                    debug!(target: "asa.sync", error = %e, "queue drain paused by backoff");
                    break;
                }
            }
        }
    }

    async fn tick_heartbeat(&self) {
        let mut counter = self.heartbeat_counter.lock().await;
        *counter += 1;
        if *counter < HEARTBEAT_INTERVAL_CYCLES {
            return;
        }
        *counter = 0;
        drop(counter);

        match self.remote.heartbeat().await {
            Ok(response) => {
                if let Some(commands) = response.get("commands").and_then(|c| c.as_array()) {
                    for command in commands {
                        match command.get("type").and_then(|t| t.as_str()) {
                            Some("pause") => {
                                info!(target: "asa.sync", "server requested pause");
                                self.pause().await;
                            }
                            Some("deregister") => {
                                warn!(target: "asa.sync", "device deregistered by server");
                                self.pause().await;
                            }
                            _ => {}
                        }
                    }
                }
                if response.get("config_updated").and_then(|v| v.as_bool()).unwrap_or(false) {
                    self.fetch_server_config().await;
                }
                if let Some(minimum) = response.get("minimum_agent_version").and_then(|v| v.as_str()) {
                    if semver_triple_lt(env!("CARGO_PKG_VERSION"), minimum) {
                        warn!(
                            target: "asa.sync",
                            current = env!("CARGO_PKG_VERSION"),
                            minimum,
                            "agent version is below the server's minimum; an update is required"
                        );
                    }
                }
            }
            Err(e) => debug!(target: "asa.sync", error = %e, "heartbeat failed"),
        }
    }
}

/// Parses `major.minor.patch` (ignoring any `-pre`/`+build` suffix) and
/// returns true iff `current` sorts strictly before `minimum`. Unparsable
/// components are treated as `0` rather than rejected outright.
fn semver_triple_lt(current: &str, minimum: &str) -> bool {
    parse_triple(current) < parse_triple(minimum)
}

fn parse_triple(version: &str) -> (u64, u64, u64) {
    let core = version.split(['-', '+']).next().unwrap_or(version);
    let mut parts = core.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// A point-in-time snapshot of engine state for status surfaces.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineStatus {
    /// Whether sync is user-paused.
    pub paused: bool,
    /// Whether private mode is active.
    pub private_mode: bool,
    /// Whether a remote session is currently open.
    pub session_active: bool,
    /// Whether the local tracker responded to a liveness check.
    pub tracker_running: bool,
    /// Rows currently held in the offline queue.
    pub queue_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_up_to_cap() {
        // consecutive_failures is incremented before delay_after_failure is
        // called, so 1/2/3/.. are the values drain_queue actually sees.
        let mut backoff = QueueBackoff::default();
        backoff.consecutive_failures = 1;
        assert_eq!(backoff.delay_after_failure(), ChronoDuration::seconds(60));
        backoff.consecutive_failures = 2;
        assert_eq!(backoff.delay_after_failure(), ChronoDuration::seconds(120));
        backoff.consecutive_failures = 3;
        assert_eq!(backoff.delay_after_failure(), ChronoDuration::seconds(240));
        backoff.consecutive_failures = 11;
        assert_eq!(backoff.delay_after_failure(), ChronoDuration::seconds(600));
    }

    #[test]
    fn semver_triple_comparison() {
        assert!(semver_triple_lt("1.2.3", "1.3.0"));
        assert!(semver_triple_lt("1.2.3", "2.0.0"));
        assert!(!semver_triple_lt("1.3.0", "1.2.3"));
        assert!(!semver_triple_lt("1.2.3", "1.2.3"));
        assert!(!semver_triple_lt("1.2.3-rc1", "1.2.3"));
    }
}
