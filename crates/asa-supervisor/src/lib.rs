// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Binary discovery and release download.
pub mod discovery;
/// Health checks and stall detection.
pub mod health;
/// Per-process lifecycle state machine.
pub mod lifecycle;
/// Process spawn/stop primitives.
pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use asa_retry::{retry, RetryPolicy};
use asa_tracker_client::TrackerClient;
use discovery::BinaryDiscovery;
use health::{HealthMonitor, StallDetector};
use lifecycle::{LifecycleManager, LifecycleState};
use process::{ProcessSpec, SupervisedProcess};
use thiserror::Error;
use tracing::{info, warn};

/// Name of the data-service (server) component, started first and
/// stopped last.
pub const SERVER_COMPONENT: &str = "data_service";
/// Name of the AFK/idle watcher component, the only one that accepts
/// dynamic reconfiguration via [`Supervisor::set_afk_timeout`].
pub const AFK_COMPONENT: &str = "watcher_afk";
/// Name of the window watcher component, the only one subject to
/// event-freshness stall detection.
pub const WINDOW_COMPONENT: &str = "watcher_window";
/// CLI flag the AFK watcher binary reads its idle threshold from.
const AFK_TIMEOUT_FLAG: &str = "--timeout";

/// Grace period allowed for a component to exit on graceful stop before
/// being escalated to a hard kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Timeout waiting for the server to report healthy on startup.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Age beyond which the window watcher's newest observed event marks it
/// stalled even though the process is still alive.
const STALE_THRESHOLD: Duration = Duration::from_secs(300);

/// Errors raised by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A process could not be spawned.
    #[error(transparent)]
    Process(#[from] process::ProcessError),
    /// Binary discovery/download failed.
    #[error(transparent)]
    Discovery(#[from] discovery::DiscoveryError),
    /// The server did not become healthy within the startup timeout.
    #[error("tracker server did not become healthy within {0:?}")]
    StartupTimeout(Duration),
}

/// One supervised component: a process plus its lifecycle state.
struct Component {
    spec: ProcessSpec,
    lifecycle: LifecycleManager,
    handle: Option<SupervisedProcess>,
}

/// Supervises the tracker server and its watcher processes.
pub struct Supervisor {
    components: BTreeMap<String, Component>,
    health: HealthMonitor,
    tracker: TrackerClient,
    restart_policy: RetryPolicy,
    stall_detector: StallDetector,
    discovery: BinaryDiscovery,
}

impl Supervisor {
    /// Build a supervisor against a tracker reachable at `host:port`.
    ///
    /// Binary discovery searches the persistent install directory
    /// (`<data_dir>/trackers/<platform>`), an optional development
    /// directory (`ASA_TRACKER_DEV_DIR`), and an optional bundled-resource
    /// directory (`ASA_TRACKER_BUNDLE_DIR`), in that order.
    pub fn new(host: &str, port: u16) -> Self {
        let install_dir = asa_config::data_dir().join("trackers").join(discovery::platform_key());
        let dev_dir = std::env::var("ASA_TRACKER_DEV_DIR").ok().map(PathBuf::from);
        let bundle_dir = std::env::var("ASA_TRACKER_BUNDLE_DIR").ok().map(PathBuf::from);
        Self {
            components: BTreeMap::new(),
            health: HealthMonitor::new(),
            tracker: TrackerClient::new(host, port, Duration::from_secs(5)),
            restart_policy: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                exponential_base: 2.0,
                jitter_factor: 0.25,
                overall_timeout: Duration::from_secs(120),
            },
            stall_detector: StallDetector::new(STALE_THRESHOLD),
            discovery: BinaryDiscovery::new(install_dir, dev_dir, bundle_dir),
        }
    }

    /// Register a component to be managed. If the tracker server is
    /// already reachable, `server_component` is marked `External` and
    /// will never be spawned, stopped, or restarted by this supervisor.
    pub fn register(&mut self, name: &str, spec: ProcessSpec, external: bool) {
        let lifecycle = if external {
            LifecycleManager::external()
        } else {
            LifecycleManager::new()
        };
        self.components.insert(
            name.to_string(),
            Component { spec, lifecycle, handle: None },
        );
    }

    /// Whether an instance of the tracker server was already reachable
    /// before this supervisor started anything.
    pub async fn detect_external_server(&self) -> bool {
        self.tracker.is_running().await
    }

    /// Resolve every non-external component's binary across the
    /// discovery search path, downloading and extracting the upstream
    /// release archive first if any known binary is missing everywhere.
    /// Components a release can't provide (e.g. an optional watcher with
    /// no upstream mapping) are left to resolve via `PATH` if discovery
    /// doesn't find them either.
    async fn provision_binaries(&mut self) {
        let registered: Vec<String> = self
            .components
            .iter()
            .filter(|(_, c)| !c.lifecycle.is_external())
            .map(|(name, _)| name.clone())
            .collect();
        if registered.is_empty() {
            return;
        }

        let known_files: Vec<String> = registered
            .iter()
            .filter(|name| discovery::UPSTREAM_TO_BRANDED.iter().any(|(_, branded)| branded == name.as_str()))
            .map(|name| discovery::binary_file_name(name))
            .collect();
        let known_file_refs: Vec<&str> = known_files.iter().map(String::as_str).collect();

        if !known_file_refs.is_empty() && !self.discovery.all_present(&known_file_refs) {
            match discovery::release_download_url() {
                Some(url) => {
                    let renames = discovery::upstream_renames();
                    let rename_refs: Vec<(&str, &str)> = renames.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
                    info!(url, "tracker binaries missing, downloading release");
                    if let Err(e) = self.discovery.download_release(&url, &rename_refs).await {
                        warn!(error = %e, "failed to download tracker release; falling back to PATH resolution");
                    }
                }
                None => warn!("no tracker release asset published for this platform; relying on PATH"),
            }
        }

        for name in &registered {
            let file_name = discovery::binary_file_name(name);
            if let Some(resolved) = self.discovery.find(&file_name) {
                if let Some(component) = self.components.get_mut(name) {
                    component.spec.command = resolved.path;
                }
            }
        }
    }

    /// Start the server first, then every other registered component,
    /// skipping any marked external. Waits for the server to report
    /// healthy before starting watchers.
    pub async fn start_all(&mut self) -> Result<(), SupervisorError> {
        self.provision_binaries().await;

        if let Some(server) = self.components.get_mut(SERVER_COMPONENT) {
            if !server.lifecycle.is_external() {
                start_component(server)?;
                self.wait_for_server_health().await?;
            }
        }

        let watcher_names: Vec<String> = self
            .components
            .keys()
            .filter(|name| name.as_str() != SERVER_COMPONENT)
            .cloned()
            .collect();
        for name in watcher_names {
            let component = self.components.get_mut(&name).expect("just listed");
            if !component.lifecycle.is_external() {
                start_component(component)?;
            }
        }
        Ok(())
    }

    async fn wait_for_server_health(&self) -> Result<(), SupervisorError> {
        let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.tracker.is_running().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Err(SupervisorError::StartupTimeout(STARTUP_TIMEOUT))
    }

    /// Stop watchers first, then the server, skipping externally-managed
    /// components.
    pub async fn stop_all(&mut self) {
        let watcher_names: Vec<String> = self
            .components
            .keys()
            .filter(|name| name.as_str() != SERVER_COMPONENT)
            .cloned()
            .collect();
        for name in watcher_names {
            if let Some(component) = self.components.get_mut(&name) {
                stop_component(component).await;
            }
        }
        if let Some(server) = self.components.get_mut(SERVER_COMPONENT) {
            stop_component(server).await;
        }
    }

    /// Poll every non-external component: record health, and restart any
    /// that exited unexpectedly, honoring the supervisor's restart
    /// policy (bounded attempts with backoff).
    pub async fn check_and_restart(&mut self) {
        let names: Vec<String> = self.components.keys().cloned().collect();
        for name in names {
            let exited = {
                let component = self.components.get_mut(&name).expect("listed above");
                if component.lifecycle.is_external() {
                    continue;
                }
                component.handle.as_mut().and_then(|h| h.try_wait())
            };

            if let Some(code) = exited {
                warn!(component = %name, code, "component exited unexpectedly");
                self.health.record(&name, false);
                let component = self.components.get_mut(&name).expect("listed above");
                let _ = component.lifecycle.transition(LifecycleState::Crashed, Some(format!("exit code {code}")));
                if let Err(e) = self.restart(&name).await {
                    warn!(component = %name, error = %e, "restart attempt failed");
                }
            } else {
                self.health.record(&name, true);
            }
        }

        if let Err(e) = self.check_window_watcher_stall().await {
            warn!(error = %e, "window watcher stall check failed");
        }
    }

    /// Queries the tracker for the window watcher's newest event and
    /// restarts the watcher if its age exceeds the stall threshold, even
    /// though the process itself is still alive.
    async fn check_window_watcher_stall(&mut self) -> Result<(), SupervisorError> {
        let running = self
            .components
            .get(WINDOW_COMPONENT)
            .is_some_and(|c| !c.lifecycle.is_external() && c.handle.is_some());
        if !running {
            return Ok(());
        }

        let buckets = match self.tracker.window_buckets().await {
            Ok(b) => b,
            Err(_) => return Ok(()),
        };

        let mut newest_end = None;
        for bucket in &buckets {
            if let Ok(events) = self.tracker.events(&bucket.id, None, None, 1).await {
                if let Some(event) = events.first() {
                    let end = event.end_time();
                    newest_end = Some(newest_end.map_or(end, |prev: chrono::DateTime<chrono::Utc>| prev.max(end)));
                }
            }
        }

        let Some(newest_end) = newest_end else {
            return Ok(());
        };
        if !self.stall_detector.is_stalled(newest_end, chrono::Utc::now()) {
            return Ok(());
        }

        warn!(component = WINDOW_COMPONENT, %newest_end, "window watcher stalled, restarting");
        let component = self.components.get_mut(WINDOW_COMPONENT).expect("checked running above");
        let _ = component.lifecycle.transition(LifecycleState::Stalled, Some("newest event too old".into()));
        stop_component(component).await;
        self.restart(WINDOW_COMPONENT).await
    }

    async fn restart(&mut self, name: &str) -> Result<(), SupervisorError> {
        let policy = self.restart_policy;
        let outcome = retry(
            &policy,
            || async {
                let component = self.components.get_mut(name).expect("caller ensures presence");
                component.lifecycle.transition(LifecycleState::Starting, Some("restart".into())).ok();
                start_component(component)
            },
            |_| true,
        )
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(asa_retry::RetryError::RetriesExhausted { last_error, .. }) => Err(last_error.into()),
            Err(asa_retry::RetryError::OverallTimeoutExceeded { .. }) => {
                Err(SupervisorError::StartupTimeout(policy.overall_timeout))
            }
        }
    }

    /// Update the idle tracker's AFK threshold. Rewrites
    /// [`AFK_COMPONENT`]'s launch args and, if it is currently running,
    /// restarts it immediately so the new threshold takes effect
    /// without waiting for the next crash/restart cycle.
    pub async fn set_afk_timeout(&mut self, seconds: u32) -> Result<(), SupervisorError> {
        let Some(component) = self.components.get_mut(AFK_COMPONENT) else {
            return Ok(());
        };
        if let Some(pos) = component.spec.args.iter().position(|a| a == AFK_TIMEOUT_FLAG) {
            component.spec.args.drain(pos..(pos + 2).min(component.spec.args.len()));
        }
        component.spec.args.push(AFK_TIMEOUT_FLAG.to_string());
        component.spec.args.push(seconds.to_string());

        let running = component.handle.is_some() && !component.lifecycle.is_external();
        if !running {
            return Ok(());
        }

        info!(seconds, "restarting afk watcher with new timeout");
        stop_component(component).await;
        let component = self.components.get_mut(AFK_COMPONENT).expect("just looked up");
        start_component(component)
    }

    /// Current health rollup.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Current lifecycle state for a component.
    pub fn state(&self, name: &str) -> Option<LifecycleState> {
        self.components.get(name).map(|c| c.lifecycle.state())
    }

    /// Overrides the discovery search path, so tests don't touch the
    /// real per-user data directory or the network.
    #[cfg(test)]
    fn set_discovery_for_test(&mut self, install_dir: PathBuf) {
        self.discovery = BinaryDiscovery::new(install_dir, None, None);
    }
}

fn start_component(component: &mut Component) -> Result<(), SupervisorError> {
    let handle = SupervisedProcess::spawn(&component.spec)?;
    component.handle = Some(handle);
    let _ = component.lifecycle.transition(LifecycleState::Starting, None);
    let _ = component.lifecycle.transition(LifecycleState::Running, None);
    info!(command = %component.spec.command.display(), "component running");
    Ok(())
}

async fn stop_component(component: &mut Component) {
    if component.lifecycle.is_external() {
        return;
    }
    let _ = component.lifecycle.transition(LifecycleState::Stopping, None);
    if let Some(mut handle) = component.handle.take() {
        let _ = handle.stop(SHUTDOWN_GRACE).await;
    }
    let _ = component.lifecycle.transition(LifecycleState::Stopped, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_afk_timeout_rewrites_args_without_starting_stopped_component() {
        let mut supervisor = Supervisor::new("127.0.0.1", 1);
        supervisor.register(AFK_COMPONENT, ProcessSpec::new("watcher_afk"), false);

        supervisor.set_afk_timeout(120).await.unwrap();

        let component = supervisor.components.get(AFK_COMPONENT).unwrap();
        assert_eq!(component.spec.args, vec!["--timeout".to_string(), "120".to_string()]);
        assert!(component.handle.is_none());
    }

    #[tokio::test]
    async fn set_afk_timeout_replaces_prior_value() {
        let mut supervisor = Supervisor::new("127.0.0.1", 1);
        let mut spec = ProcessSpec::new("watcher_afk");
        spec.args = vec!["--timeout".to_string(), "180".to_string(), "--verbose".to_string()];
        supervisor.register(AFK_COMPONENT, spec, false);

        supervisor.set_afk_timeout(60).await.unwrap();

        let component = supervisor.components.get(AFK_COMPONENT).unwrap();
        assert_eq!(
            component.spec.args,
            vec!["--verbose".to_string(), "--timeout".to_string(), "60".to_string()]
        );
    }

    #[tokio::test]
    async fn set_afk_timeout_on_unregistered_component_is_noop() {
        let mut supervisor = Supervisor::new("127.0.0.1", 1);
        supervisor.set_afk_timeout(60).await.unwrap();
    }

    #[tokio::test]
    async fn provision_binaries_resolves_present_binary_without_downloading() {
        let dir = tempfile::tempdir().unwrap();
        let file_name = discovery::binary_file_name("watcher_afk");
        let bin_path = dir.path().join(&file_name);
        std::fs::write(&bin_path, b"#!/bin/sh\n").unwrap();

        let mut supervisor = Supervisor::new("127.0.0.1", 1);
        supervisor.set_discovery_for_test(dir.path().to_path_buf());
        supervisor.register(AFK_COMPONENT, ProcessSpec::new("watcher_afk"), false);

        supervisor.provision_binaries().await;

        let component = supervisor.components.get(AFK_COMPONENT).unwrap();
        assert_eq!(component.spec.command, bin_path);
    }

    #[tokio::test]
    async fn provision_binaries_leaves_unmapped_component_untouched_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new("127.0.0.1", 1);
        supervisor.set_discovery_for_test(dir.path().to_path_buf());
        supervisor.register("watcher_input", ProcessSpec::new("watcher_input"), false);

        supervisor.provision_binaries().await;

        let component = supervisor.components.get("watcher_input").unwrap();
        assert_eq!(component.spec.command, PathBuf::from("watcher_input"));
    }
}
