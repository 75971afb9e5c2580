// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Single-instance advisory file lock.
pub mod lock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use asa_config::AgentConfig;
use asa_core::{SyncStats, TrayState};
use asa_os_events::{OsEvent, PollingOsEventListener};
use asa_queue::OfflineQueue;
use asa_remote_client::RemoteClient;
use asa_scheduler::Scheduler;
use asa_supervisor::process::ProcessSpec;
use asa_supervisor::{Supervisor, AFK_COMPONENT, SERVER_COMPONENT};
use asa_sync::{SyncEngine, SyncEngineError};
use asa_tracker_client::TrackerClient;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{info, warn};

/// How often `reminder_check`/`tray_time_refresh` fire.
const MINUTE_JOB_INTERVAL: Duration = Duration::from_secs(60);
/// How often the offline queue is swept for expired rows.
const QUEUE_EXPIRE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// How often the cached category mapping table is refreshed from the
/// remote service.
const CATEGORY_REFRESH_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
/// How often aggregate trend data is refreshed.
const TRENDS_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Age beyond which a queued event is dropped unsent without ever
/// having been delivered.
const QUEUE_EVENT_MAX_AGE: chrono::Duration = chrono::Duration::days(7);

/// Sink for state/notification updates the external tray/UI collaborator
/// would otherwise consume directly. The daemon core never renders UI;
/// it only calls this trait.
pub trait NotificationSink: Send + Sync {
    /// The tray-facing presentation state changed.
    fn tray_state_changed(&self, state: TrayState);
    /// A user-facing, non-modal notification (e.g. "queue is filling up").
    fn notify(&self, title: &str, body: &str);
}

/// A [`NotificationSink`] that discards everything, for headless runs
/// and tests.
#[derive(Default)]
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn tray_state_changed(&self, _state: TrayState) {}
    fn notify(&self, _title: &str, _body: &str) {}
}

/// Where the daemon loads/saves its bearer token. The OS keystore
/// integration itself is an external collaborator; this crate only
/// defines the seam.
pub trait CredentialStore: Send + Sync {
    /// Load a previously-saved bearer token, if any.
    fn load_token(&self) -> Option<String>;
    /// Persist a bearer token for the next auto-login.
    fn save_token(&self, token: &str);
    /// Remove any saved token (e.g. after a 401).
    fn clear_token(&self);
}

/// A [`CredentialStore`] backed by an environment variable, used when no
/// platform keystore integration is wired up.
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn load_token(&self) -> Option<String> {
        std::env::var("ASA_AUTH_TOKEN").ok()
    }
    fn save_token(&self, _token: &str) {}
    fn clear_token(&self) {}
}

/// User-facing actions the external UI collaborator invokes on a running
/// daemon.
pub struct DaemonHandle {
    engine: Arc<SyncEngine>,
    shutdown: Arc<Notify>,
}

impl DaemonHandle {
    /// Pause syncing.
    pub async fn pause(&self) {
        self.engine.pause().await;
    }

    /// Resume syncing after a pause.
    pub async fn resume(&self) {
        self.engine.resume().await;
    }

    /// Toggle private mode.
    pub async fn set_private_mode(&self, enabled: bool) {
        self.engine.set_private_mode(enabled).await;
    }

    /// Switch the active project tag.
    pub async fn set_current_project(&self, project_id: Option<String>) {
        self.engine.set_current_project(project_id).await;
    }

    /// Current engine status, for the tray surface.
    pub async fn status(&self) -> asa_sync::EngineStatus {
        self.engine.get_status().await
    }

    /// Request an idempotent shutdown of the main loop.
    pub fn quit(&self) {
        self.shutdown.notify_one();
    }
}

/// Errors raised while running the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The single-instance lock was already held.
    #[error(transparent)]
    Lock(#[from] lock::LockError),
    /// The tracker supervisor failed to start.
    #[error(transparent)]
    Supervisor(#[from] asa_supervisor::SupervisorError),
}

/// Wires every component together and drives the main loop.
pub struct Orchestrator<N: NotificationSink, C: CredentialStore> {
    config: AgentConfig,
    supervisor: Mutex<Supervisor>,
    engine: Arc<SyncEngine>,
    queue: Arc<OfflineQueue>,
    remote: Arc<RemoteClient>,
    notifications: Arc<N>,
    credentials: C,
    scheduler: Mutex<Scheduler>,
    shutdown: Arc<Notify>,
    /// Set while the engine is paused by a network-offline event rather
    /// than a user action, so the matching network-online event knows
    /// whether it is safe to resume. A user-initiated pause that occurs
    /// while this is set is left alone on resume.
    network_paused: AtomicBool,
}

impl<N: NotificationSink + 'static, C: CredentialStore + 'static> Orchestrator<N, C> {
    /// Build an orchestrator from its external collaborators. Does not
    /// start anything; call [`Orchestrator::run`] for that.
    ///
    /// Uses `Arc::new_cyclic` so the sync engine's `on_config_updated`
    /// hook can hold a weak reference back to the orchestrator it
    /// belongs to, letting it propagate a new AFK timeout to the
    /// supervisor without the hook owning a strong cycle.
    pub fn new(config: AgentConfig, notifications: N, credentials: C) -> Arc<Self> {
        let shutdown = Arc::new(Notify::new());
        let notifications = Arc::new(notifications);

        let tracker = TrackerClient::new(&config.tracker.host, config.tracker.port, Duration::from_secs(5));
        let remote = Arc::new(RemoteClient::new(
            config.sync.api_url.clone(),
            config.device_id.clone(),
            Duration::from_secs(30),
        ));

        let queue_path = asa_config::data_dir().join("offline_queue.db");
        let queue = Arc::new(
            OfflineQueue::open(&queue_path, config.sync.max_queue_size as usize)
                .unwrap_or_else(|_| OfflineQueue::open_in_memory(config.sync.max_queue_size as usize).expect("in-memory queue always opens")),
        );

        let supervisor = Mutex::new(Supervisor::new(&config.tracker.host, config.tracker.port));
        let engine_remote = RemoteClient::new(config.sync.api_url.clone(), config.device_id.clone(), Duration::from_secs(30));
        let config_for_engine = config.clone();
        let queue_for_engine = queue.clone();

        Arc::new_cyclic(|weak_self: &Weak<Self>| {
            let weak_for_hook = weak_self.clone();
            let engine = Arc::new(SyncEngine::new(
                tracker,
                engine_remote,
                queue_for_engine,
                config_for_engine,
                Some(Box::new(move || {
                    let weak = weak_for_hook.clone();
                    tokio::spawn(async move {
                        if let Some(orchestrator) = weak.upgrade() {
                            orchestrator.propagate_afk_timeout().await;
                        }
                    });
                })),
            ));

            Self {
                config,
                supervisor,
                engine,
                queue,
                remote,
                notifications,
                credentials,
                scheduler: Mutex::new(Scheduler::new()),
                shutdown,
                network_paused: AtomicBool::new(false),
            }
        })
    }

    /// Reads the engine's just-merged config and applies a changed AFK
    /// timeout to the supervisor's idle watcher.
    async fn propagate_afk_timeout(&self) {
        let afk_timeout_secs = self.engine.current_config().await.tracker.afk_timeout_secs;
        let mut supervisor = self.supervisor.lock().await;
        if let Err(e) = supervisor.set_afk_timeout(afk_timeout_secs).await {
            warn!(target: "asa.daemon", error = %e, "failed to apply updated afk timeout");
        }
    }

    /// A handle external callers (the UI collaborator) use to act on a
    /// running daemon.
    pub fn handle(self: &Arc<Self>) -> DaemonHandle {
        DaemonHandle {
            engine: self.engine.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run the full startup sequence and block until shutdown is
    /// requested. The single-instance lock is
    /// acquired by the caller (see [`run`]) so its lifetime spans the
    /// whole process, not just this call.
    pub async fn run(self: Arc<Self>) -> Result<(), DaemonError> {
        self.notifications.tray_state_changed(TrayState::Starting);

        // Step 5: try auto-login.
        let authenticated = if let Some(token) = self.credentials.load_token() {
            self.remote.set_credentials(token.clone()).await;
            self.engine.set_credentials(token).await;
            true
        } else {
            self.notifications.tray_state_changed(TrayState::WaitingAuth);
            false
        };

        // Step 6: start the supervisor (register server + watchers first).
        self.register_components().await;
        {
            let mut supervisor = self.supervisor.lock().await;
            supervisor.start_all().await?;
        }

        if authenticated {
            // Step 7: fetch config/projects/categories, recover a stale
            // session, start the scheduler.
            self.engine.fetch_server_config().await;
            let _ = self.remote.get_projects().await;
            if let Ok(categories) = self.remote.get_categories().await {
                if let Some(mappings) = parse_category_mappings(&categories) {
                    let _ = self.queue.set_category_mappings(&mappings);
                }
            }
            let _ = self.remote.end_session("crash_recovery").await;
            self.start_scheduler().await;
        }

        // Step 8: subscribe to OS events.
        let (os_tx, mut os_rx) = mpsc::unbounded_channel();
        let listener = PollingOsEventListener::new(remote_reachability_target(&self.config.sync.api_url));
        tokio::spawn(listener.run(os_tx));

        let os_self = self.clone();
        let os_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = os_shutdown.notified() => return,
                    event = os_rx.recv() => {
                        let Some(event) = event else { return };
                        os_self.handle_os_event(event).await;
                    }
                }
            }
        });

        // Step 10: block until quit.
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!(target: "asa.daemon", "received ctrl-c"),
            _ = self.shutdown.notified() => info!(target: "asa.daemon", "shutdown requested"),
        }

        self.shutdown().await;
        Ok(())
    }

    async fn register_components(&self) {
        let mut supervisor = self.supervisor.lock().await;
        let external = supervisor.detect_external_server().await;
        supervisor.register(SERVER_COMPONENT, ProcessSpec::new("data_service"), external);

        let mut afk_spec = ProcessSpec::new("watcher_afk");
        afk_spec.args = vec!["--timeout".to_string(), self.config.tracker.afk_timeout_secs.to_string()];
        supervisor.register(AFK_COMPONENT, afk_spec, false);

        supervisor.register("watcher_window", ProcessSpec::new("watcher_window"), false);
        if self.config.screenshots.enabled {
            supervisor.register("watcher_input", ProcessSpec::new("watcher_input"), false);
        }
    }

    async fn start_scheduler(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock().await;

        let sync_engine = self.engine.clone();
        let sync_self = self.clone();
        scheduler.every("sync", Duration::from_secs(self.config.sync.sync_interval_secs), move || {
            let engine = sync_engine.clone();
            let orchestrator = sync_self.clone();
            async move {
                orchestrator.notifications.tray_state_changed(TrayState::Syncing);
                match engine.sync().await {
                    Ok(stats) => orchestrator.report_stats(&stats).await,
                    Err(SyncEngineError::AuthRequired) => {
                        orchestrator.notifications.tray_state_changed(TrayState::WaitingAuth);
                        orchestrator.credentials.clear_token();
                        orchestrator.remote.clear_credentials().await;
                        orchestrator.engine.clear_credentials().await;
                        warn!(target: "asa.daemon", "auth expired mid-cycle, waiting for re-login");
                    }
                }
            }
        });

        let queue_for_expiry = self.queue.clone();
        scheduler.every("queue_expire", QUEUE_EXPIRE_INTERVAL, move || {
            let queue = queue_for_expiry.clone();
            async move {
                match queue.expire_older_than(QUEUE_EVENT_MAX_AGE) {
                    Ok(dropped) if dropped > 0 => info!(target: "asa.daemon", dropped, "expired stale queued events"),
                    Ok(_) => {}
                    Err(e) => warn!(target: "asa.daemon", error = %e, "queue expiry sweep failed"),
                }
            }
        });

        let remote_for_categories = self.remote.clone();
        let queue_for_categories = self.queue.clone();
        scheduler.every("category_refresh", CATEGORY_REFRESH_INTERVAL, move || {
            let remote = remote_for_categories.clone();
            let queue = queue_for_categories.clone();
            async move {
                if let Ok(categories) = remote.get_categories().await {
                    if let Some(mappings) = parse_category_mappings(&categories) {
                        let _ = queue.set_category_mappings(&mappings);
                    }
                }
            }
        });

        let remote_for_trends = self.remote.clone();
        scheduler.every("trends_refresh", TRENDS_REFRESH_INTERVAL, move || {
            let remote = remote_for_trends.clone();
            async move {
                let _ = remote.get_trends().await;
            }
        });

        let status_self = self.clone();
        scheduler.every("tray_time_refresh", MINUTE_JOB_INTERVAL, move || {
            let orchestrator = status_self.clone();
            async move {
                let status = orchestrator.engine.get_status().await;
                orchestrator.notifications.tray_state_changed(tray_state_for(&status));
            }
        });

        let reminders_enabled = self.config.reminders.enabled;
        let reminders_self = self.clone();
        scheduler.every("reminder_check", MINUTE_JOB_INTERVAL, move || {
            let orchestrator = reminders_self.clone();
            async move {
                if reminders_enabled {
                    orchestrator.notifications.notify("Take a break", "You've been active for a while.");
                }
            }
        });
    }

    async fn report_stats(&self, stats: &SyncStats) {
        if !stats.success() {
            self.notifications.tray_state_changed(TrayState::Error);
            return;
        }
        if self.queue.is_near_capacity().unwrap_or(false) {
            self.notifications.tray_state_changed(TrayState::QueueWarning);
        } else if stats.events_queued > 0 {
            self.notifications.tray_state_changed(TrayState::Queued);
        }
    }

    async fn handle_os_event(&self, event: OsEvent) {
        match event {
            OsEvent::Wake => {
                info!(target: "asa.daemon", "machine woke from sleep, resuming and nudging a sync");
                self.engine.resume().await;
                self.notifications.tray_state_changed(TrayState::Syncing);
                let _ = self.engine.sync().await;
            }
            OsEvent::SleptSince => {
                debug_sleep();
                self.engine.pause().await;
                self.notifications.tray_state_changed(TrayState::Paused);
            }
            OsEvent::NetworkReachable => {
                info!(target: "asa.daemon", "network reachable again");
                if self.network_paused.swap(false, Ordering::SeqCst) {
                    self.engine.resume().await;
                    let _ = self.engine.sync().await;
                }
            }
            OsEvent::NetworkUnreachable => {
                warn!(target: "asa.daemon", "network unreachable, pausing sync until it returns");
                self.network_paused.store(true, Ordering::SeqCst);
                self.engine.pause().await;
                self.notifications.tray_state_changed(TrayState::Queued);
            }
            OsEvent::ScreenLocked => {
                self.engine.pause().await;
                self.notifications.tray_state_changed(TrayState::Paused);
            }
            OsEvent::ScreenUnlocked => {
                self.engine.resume().await;
                let _ = self.engine.sync().await;
            }
        }
    }

    /// Idempotent shutdown: stop scheduler, end session, close queue,
    /// stop supervisor, release the lock (the lock itself is dropped by
    /// the caller once this returns).
    pub async fn shutdown(&self) {
        {
            let mut scheduler = self.scheduler.lock().await;
            std::mem::take(&mut *scheduler).shutdown();
        }
        self.engine.shutdown().await;
        {
            let mut supervisor = self.supervisor.lock().await;
            supervisor.stop_all().await;
        }
        info!(target: "asa.daemon", "shutdown complete");
    }
}

/// Map current engine status onto a tray state, for states not already
/// driven by a sync cycle's own outcome (`Syncing`/`Error`/`QueueWarning`/`Queued`).
fn tray_state_for(status: &asa_sync::EngineStatus) -> TrayState {
    if status.paused {
        TrayState::Paused
    } else if status.private_mode {
        TrayState::Private
    } else if status.queue_size > 0 {
        TrayState::Queued
    } else {
        TrayState::Syncing
    }
}

fn debug_sleep() {
    tracing::debug!(target: "asa.daemon", "clock-skew sleep detected (best-effort)");
}

fn remote_reachability_target(api_url: &str) -> String {
    let without_scheme = api_url.split("://").nth(1).unwrap_or(api_url);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:443")
    }
}

fn parse_category_mappings(raw: &serde_json::Value) -> Option<Vec<asa_core::CategoryMapping>> {
    let array = raw.as_array()?;
    let mut out = Vec::with_capacity(array.len());
    for entry in array {
        let pattern = entry.get("pattern")?.as_str()?.to_string();
        let category = entry.get("category")?.as_str()?.to_string();
        out.push(asa_core::CategoryMapping { pattern, category });
    }
    Some(out)
}

/// Top-level entry point: acquires the single-instance lock, runs the
/// orchestrator to completion, and releases the lock on return.
pub async fn run(config: AgentConfig) -> Result<(), DaemonError> {
    let lock_path = asa_config::data_dir().join(".lock");
    let _lock = lock::InstanceLock::acquire(&lock_path)?;

    let orchestrator = Orchestrator::new(config, NullNotificationSink, EnvCredentialStore);
    orchestrator.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachability_target_strips_scheme_and_defaults_port() {
        assert_eq!(remote_reachability_target("https://api.example.com"), "api.example.com:443");
        assert_eq!(remote_reachability_target("http://localhost:9000/v1"), "localhost:9000");
    }

    #[test]
    fn parses_category_mappings_from_array() {
        let raw = serde_json::json!([{"pattern": "github.com", "category": "code"}]);
        let mappings = parse_category_mappings(&raw).unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].pattern, "github.com");
    }

    #[test]
    fn rejects_malformed_category_mappings() {
        let raw = serde_json::json!({"not": "an array"});
        assert!(parse_category_mappings(&raw).is_none());
    }

    #[tokio::test]
    async fn orchestrator_builds_with_defaults() {
        let mut config = AgentConfig::default();
        config.sync.api_url = "http://127.0.0.1:1".to_string();
        let orchestrator = Orchestrator::new(config, NullNotificationSink, EnvCredentialStore);
        let handle = orchestrator.handle();
        handle.quit();
    }
}
