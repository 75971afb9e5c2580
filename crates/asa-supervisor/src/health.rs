// SPDX-License-Identifier: MIT OR Apache-2.0
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Health as last observed for one supervised component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    /// Responding normally.
    Healthy,
    /// Reachable but degraded (e.g. slow, stale data).
    Degraded,
    /// Not reachable or failing checks.
    Unhealthy,
    /// No check has run yet.
    Unknown,
}

/// Rolling health record for one named component.
#[derive(Clone, Debug)]
struct ComponentHealth {
    status: HealthStatus,
    consecutive_failures: u32,
    last_checked: Instant,
    history: Vec<bool>,
}

/// Tracks health checks across every supervised component, rolling up
/// an overall status.
#[derive(Default)]
pub struct HealthMonitor {
    components: BTreeMap<String, ComponentHealth>,
}

impl HealthMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a health check for `component`.
    pub fn record(&mut self, component: &str, healthy: bool) {
        let entry = self.components.entry(component.to_string()).or_insert(ComponentHealth {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            last_checked: Instant::now(),
            history: Vec::new(),
        });
        entry.last_checked = Instant::now();
        entry.history.push(healthy);
        if entry.history.len() > 50 {
            entry.history.remove(0);
        }
        if healthy {
            entry.consecutive_failures = 0;
            entry.status = HealthStatus::Healthy;
        } else {
            entry.consecutive_failures += 1;
            entry.status = if entry.consecutive_failures >= 3 {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            };
        }
    }

    /// Current status for a component, or `Unknown` if never checked.
    pub fn status(&self, component: &str) -> HealthStatus {
        self.components.get(component).map(|c| c.status).unwrap_or(HealthStatus::Unknown)
    }

    /// Whether every tracked component is currently healthy.
    pub fn all_healthy(&self) -> bool {
        self.components.values().all(|c| c.status == HealthStatus::Healthy)
    }

    /// Names of every component currently unhealthy.
    pub fn unhealthy_components(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|(_, c)| c.status == HealthStatus::Unhealthy)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Fraction of recorded checks that were healthy, in `[0.0, 1.0]`.
    pub fn uptime_fraction(&self, component: &str) -> f64 {
        match self.components.get(component) {
            Some(c) if !c.history.is_empty() => {
                c.history.iter().filter(|h| **h).count() as f64 / c.history.len() as f64
            }
            _ => 0.0,
        }
    }
}

/// Detects a watcher bucket that has stopped producing new events even
/// though its process is still alive.
pub struct StallDetector {
    threshold: Duration,
}

impl StallDetector {
    /// Build a detector that flags a bucket stalled once its newest
    /// event is older than `threshold`.
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    /// Whether `newest_event_end` is stale relative to `now`.
    pub fn is_stalled(&self, newest_event_end: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(newest_event_end);
        age > chrono::Duration::from_std(self.threshold).unwrap_or(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_consecutive_failures_marks_unhealthy() {
        let mut monitor = HealthMonitor::new();
        monitor.record("data_service", true);
        assert_eq!(monitor.status("data_service"), HealthStatus::Healthy);
        monitor.record("data_service", false);
        assert_eq!(monitor.status("data_service"), HealthStatus::Degraded);
        monitor.record("data_service", false);
        monitor.record("data_service", false);
        assert_eq!(monitor.status("data_service"), HealthStatus::Unhealthy);
        assert_eq!(monitor.unhealthy_components(), vec!["data_service".to_string()]);
    }

    #[test]
    fn recovery_resets_failure_streak() {
        let mut monitor = HealthMonitor::new();
        monitor.record("watcher", false);
        monitor.record("watcher", false);
        monitor.record("watcher", true);
        assert_eq!(monitor.status("watcher"), HealthStatus::Healthy);
    }

    #[test]
    fn stall_detector_flags_old_events() {
        let detector = StallDetector::new(Duration::from_secs(120));
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(200);
        let fresh = now - chrono::Duration::seconds(10);
        assert!(detector.is_stalled(stale, now));
        assert!(!detector.is_stalled(fresh, now));
    }
}
