//! Connection state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Authenticating,
    Connected,
    Backoff,
}

/// Process-wide connection state.
///
/// Written only by `BridgeSession`; everyone else reads clones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Results computed but not yet acknowledged by the backend
    pub pending_results: usize,
}

/// Shared handle to the connection state
pub type SharedConnectionState = Arc<RwLock<ConnectionState>>;

impl ConnectionState {
    pub fn shared() -> SharedConnectionState {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    pub(crate) fn record_success(&mut self) {
        self.phase = ConnectionPhase::Connected;
        self.last_success_at = Some(Utc::now());
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    pub(crate) fn record_failure(&mut self, error: &str) {
        self.phase = ConnectionPhase::Backoff;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_then_success_resets() {
        let mut state = ConnectionState::default();
        assert_eq!(state.phase, ConnectionPhase::Disconnected);

        state.record_failure("connection refused");
        state.record_failure("connection refused");
        assert_eq!(state.phase, ConnectionPhase::Backoff);
        assert_eq!(state.consecutive_failures, 2);

        state.record_success();
        assert!(state.is_connected());
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_none());
        assert!(state.last_success_at.is_some());
    }
}
