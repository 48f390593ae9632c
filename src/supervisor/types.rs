//! Supervision types

use crate::config::SupervisorConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a supervised process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// Agent runner
    Agent,
    /// Model-serving process
    ModelServer,
}

/// State the operator asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

/// State last observed from the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Stopped,
    Starting,
    Running,
    Crashed,
    Restarting,
    Stopping,
    /// Restart budget exceeded; only an explicit start clears it
    Failed,
}

/// Snapshot of one supervised process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedProcess {
    pub logical_id: String,
    pub kind: ProcessKind,
    /// OS pid of the live process, if any
    pub pid: Option<u32>,
    pub desired_state: DesiredState,
    pub observed_state: ObservedState,
    /// Automatic restarts since the last explicit start
    pub restart_count: u32,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Result of `ProcessSupervisor::start`
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A new process was spawned
    Started(SupervisedProcess),
    /// The logical id was already running; nothing was spawned
    AlreadyRunning(SupervisedProcess),
}

impl StartOutcome {
    pub fn process(&self) -> &SupervisedProcess {
        match self {
            StartOutcome::Started(p) | StartOutcome::AlreadyRunning(p) => p,
        }
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, StartOutcome::AlreadyRunning(_))
    }
}

/// Something notable a supervision tick did
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Exited {
        logical_id: String,
        exit_code: Option<i32>,
    },
    Restarted {
        logical_id: String,
        restart_count: u32,
    },
    RestartFailed {
        logical_id: String,
        error: String,
    },
    Failed {
        logical_id: String,
        restart_count: u32,
    },
}

/// Restart and shutdown policy
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restart processes that exit while desired running
    pub auto_restart: bool,
    /// Crashes within `window` that mark an entry failed (0 = unlimited)
    pub max_restarts: u32,
    pub window: Duration,
    /// Delay before the second restart in a window; doubles after that
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default(), true)
    }
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig, auto_restart: bool) -> Self {
        Self {
            auto_restart,
            max_restarts: config.max_restarts,
            window: Duration::from_secs(config.restart_window_secs),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
        }
    }

    /// Delay before restarting after the `crashes_in_window`-th crash.
    ///
    /// The first crash in a window restarts immediately.
    pub fn backoff_for(&self, crashes_in_window: usize) -> Duration {
        if crashes_in_window <= 1 {
            return Duration::ZERO;
        }
        let exponent = (crashes_in_window - 2).min(31) as u32;
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        delay.min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RestartPolicy {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::ZERO);
        assert_eq!(policy.backoff_for(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(4), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RestartPolicy::from_config(&SupervisorConfig::default(), false);
        assert!(!policy.auto_restart);
        assert_eq!(policy.max_restarts, 5);
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.stop_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_snapshot_serializes_states() {
        let process = SupervisedProcess {
            logical_id: "agent-1".to_string(),
            kind: ProcessKind::ModelServer,
            pid: None,
            desired_state: DesiredState::Running,
            observed_state: ObservedState::Failed,
            restart_count: 4,
            last_started_at: None,
            last_exit_code: Some(1),
            args: vec![],
        };
        let value = serde_json::to_value(&process).unwrap();
        assert_eq!(value["kind"], "model_server");
        assert_eq!(value["observed_state"], "failed");
        assert_eq!(value["restart_count"], 4);
    }
}
