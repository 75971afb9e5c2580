// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info};

/// An OS-lifecycle event this agent reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsEvent {
    /// The machine resumed from sleep/hibernation.
    Wake,
    /// The machine is about to sleep (best-effort; the portable poller
    /// can only detect this in hindsight, after waking).
    SleptSince,
    /// Network connectivity was regained.
    NetworkReachable,
    /// Network connectivity was lost.
    NetworkUnreachable,
    /// The screen was locked. Never fired by [`PollingOsEventListener`];
    /// reserved for a platform-native hook.
    ScreenLocked,
    /// The screen was unlocked. Never fired by [`PollingOsEventListener`].
    ScreenUnlocked,
}

/// Poll interval for both the clock-skew and reachability checks. The
/// spec's own fallback clause caps this at 15s; 5s gives faster
/// reaction without meaningfully increasing idle overhead.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Wall-clock vs monotonic-clock divergence beyond which a sleep/wake
/// cycle is assumed to have occurred.
const SLEEP_SKEW_THRESHOLD: Duration = Duration::from_secs(20);

/// Portable OS event listener: detects sleep/wake via clock skew and
/// network reachability via TCP connect polling.
pub struct PollingOsEventListener {
    reachability_target: String,
}

impl PollingOsEventListener {
    /// Build a listener that polls reachability against `host:port`
    /// (typically the remote sync service's host).
    pub fn new(reachability_target: impl Into<String>) -> Self {
        Self {
            reachability_target: reachability_target.into(),
        }
    }

    /// Run the poll loop, sending events on `tx` until the channel
    /// closes. Intended to run as its own `tokio::task`.
    pub async fn run(self, tx: mpsc::UnboundedSender<OsEvent>) {
        let mut last_wall = std::time::SystemTime::now();
        let mut last_monotonic = Instant::now();
        let mut last_reachable = self.check_reachable().await;

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;

            let wall_now = std::time::SystemTime::now();
            let monotonic_now = Instant::now();
            let wall_elapsed = wall_now
                .duration_since(last_wall)
                .unwrap_or(Duration::ZERO);
            let monotonic_elapsed = monotonic_now.duration_since(last_monotonic);
            if wall_elapsed > monotonic_elapsed + SLEEP_SKEW_THRESHOLD {
                info!(
                    wall_elapsed_s = wall_elapsed.as_secs(),
                    monotonic_elapsed_s = monotonic_elapsed.as_secs(),
                    "clock skew detected, assuming sleep/wake"
                );
                if tx.send(OsEvent::Wake).is_err() {
                    return;
                }
            }
            last_wall = wall_now;
            last_monotonic = monotonic_now;

            let reachable = self.check_reachable().await;
            if reachable != last_reachable {
                let event = if reachable {
                    OsEvent::NetworkReachable
                } else {
                    OsEvent::NetworkUnreachable
                };
                debug!(reachable, "network reachability changed");
                if tx.send(event).is_err() {
                    return;
                }
            }
            last_reachable = reachable;
        }
    }

    async fn check_reachable(&self) -> bool {
        let target = self.reachability_target.clone();
        tokio::task::spawn_blocking(move || {
            target
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .map(|addr| std::net::TcpStream::connect_timeout(&addr, Duration::from_secs(3)).is_ok())
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_target_reports_false() {
        let listener = PollingOsEventListener::new("127.0.0.1:1");
        assert!(!listener.check_reachable().await);
    }

    #[tokio::test]
    async fn unresolvable_host_reports_false() {
        let listener = PollingOsEventListener::new("not-a-real-host.invalid:80");
        assert!(!listener.check_reachable().await);
    }
}
