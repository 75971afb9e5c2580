// SPDX-License-Identifier: MIT OR Apache-2.0
use std::fmt;
use std::time::Instant;

/// Lifecycle states a single supervised process moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet spawned.
    Stopped,
    /// Spawned, awaiting its first successful health check.
    Starting,
    /// Healthy and serving.
    Running,
    /// Exited unexpectedly; a restart is pending.
    Crashed,
    /// Running but has failed consecutive health checks.
    Stalled,
    /// A graceful stop has been requested.
    Stopping,
    /// Managed externally — an instance was already running at startup,
    /// so this supervisor will never spawn, stop, or restart it.
    External,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Crashed => "crashed",
            LifecycleState::Stalled => "stalled",
            LifecycleState::Stopping => "stopping",
            LifecycleState::External => "external",
        };
        f.write_str(s)
    }
}

/// A recorded state transition.
#[derive(Clone, Debug)]
pub struct LifecycleTransition {
    /// State transitioned from.
    pub from: LifecycleState,
    /// State transitioned to.
    pub to: LifecycleState,
    /// Wall-clock time of the transition.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Optional human-readable reason.
    pub reason: Option<String>,
}

/// An attempted transition was not valid from the current state.
#[derive(Debug)]
pub struct InvalidTransition {
    /// The state the transition was attempted from.
    pub from: LifecycleState,
    /// The state the transition was attempted to.
    pub to: LifecycleState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Tracks one process's lifecycle state, transition history, and uptime.
pub struct LifecycleManager {
    state: LifecycleState,
    history: Vec<LifecycleTransition>,
    running_since: Option<Instant>,
}

impl LifecycleManager {
    /// Create a manager starting in [`LifecycleState::Stopped`].
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Stopped,
            history: Vec::new(),
            running_since: None,
        }
    }

    /// Create a manager starting in [`LifecycleState::External`], for a
    /// process this supervisor detected but does not own.
    pub fn external() -> Self {
        Self {
            state: LifecycleState::External,
            history: Vec::new(),
            running_since: Some(Instant::now()),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether this manager's process is externally managed.
    pub fn is_external(&self) -> bool {
        self.state == LifecycleState::External
    }

    fn can_transition(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        if self.state == External {
            return false;
        }
        matches!(
            (self.state, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Running, Stalled)
                | (Running, Crashed)
                | (Running, Stopping)
                | (Stalled, Running)
                | (Stalled, Crashed)
                | (Stalled, Stopping)
                | (Crashed, Starting)
                | (Stopping, Stopped)
        )
    }

    /// Attempt a transition, recording it in history on success.
    pub fn transition(
        &mut self,
        to: LifecycleState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        if !self.can_transition(to) {
            return Err(InvalidTransition { from: self.state, to });
        }
        if to == LifecycleState::Running {
            self.running_since = Some(Instant::now());
        }
        self.history.push(LifecycleTransition {
            from: self.state,
            to,
            timestamp: chrono::Utc::now(),
            reason,
        });
        self.state = to;
        Ok(())
    }

    /// Transition history, oldest first.
    pub fn history(&self) -> &[LifecycleTransition] {
        &self.history
    }

    /// How long the process has been continuously running, if it is.
    pub fn uptime(&self) -> Option<std::time::Duration> {
        if matches!(self.state, LifecycleState::Running | LifecycleState::External) {
            self.running_since.map(|t| t.elapsed())
        } else {
            None
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_happy_path() {
        let mut m = LifecycleManager::new();
        m.transition(LifecycleState::Starting, None).unwrap();
        m.transition(LifecycleState::Running, None).unwrap();
        assert_eq!(m.state(), LifecycleState::Running);
        assert!(m.uptime().is_some());
    }

    #[test]
    fn rejects_invalid_transition() {
        let mut m = LifecycleManager::new();
        let err = m.transition(LifecycleState::Running, None).unwrap_err();
        assert_eq!(err.from, LifecycleState::Stopped);
    }

    #[test]
    fn external_never_transitions() {
        let mut m = LifecycleManager::external();
        assert!(m.transition(LifecycleState::Stopping, None).is_err());
    }

    #[test]
    fn crash_then_restart_path() {
        let mut m = LifecycleManager::new();
        m.transition(LifecycleState::Starting, None).unwrap();
        m.transition(LifecycleState::Running, None).unwrap();
        m.transition(LifecycleState::Crashed, Some("exit code 1".into())).unwrap();
        m.transition(LifecycleState::Starting, None).unwrap();
        assert_eq!(m.history().len(), 4);
    }
}
