//! Backend protocol
//!
//! The remote backend is reached through the `BridgeBackend` trait so the
//! session can be driven by the HTTP client in production and by a scripted
//! backend in tests.

use crate::command::{Command, CommandId, CommandResult, InvalidCommand};
use crate::error::{Error, Result};
use crate::exec::OutputChunk;
use crate::status::StatusSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque session token issued by `authenticate`
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", crate::config::mask_secret(&self.0))
    }
}

/// Decoded answer to one poll
#[derive(Debug, Default)]
pub struct PollResponse {
    pub commands: Vec<Command>,
    pub invalid: Vec<InvalidCommand>,
    /// Replacement session id, when the backend rotates it
    pub session_id: Option<String>,
}

impl PollResponse {
    /// Decode a poll body.
    ///
    /// Accepts `{"commands": [...]}`, a bare array of commands, the legacy
    /// single-command object `{"command", "command_id", "session_id"}`, or an
    /// empty body.
    pub fn from_wire(value: serde_json::Value) -> Result<Self> {
        let mut response = PollResponse::default();

        let items = match value {
            serde_json::Value::Null => return Ok(response),
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(mut map) => {
                response.session_id = map
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(String::from);

                match map.remove("commands") {
                    Some(serde_json::Value::Array(items)) => items,
                    Some(serde_json::Value::Null) | None => {
                        let has_legacy = map.get("command").map_or(false, |c| !c.is_null())
                            || map.get("command_id").map_or(false, |c| !c.is_null());
                        if has_legacy {
                            map.remove("session_id");
                            vec![serde_json::Value::Object(map)]
                        } else {
                            Vec::new()
                        }
                    }
                    Some(other) => {
                        return Err(Error::Protocol(format!(
                            "'commands' must be an array, got {}",
                            other
                        )))
                    }
                }
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected poll response: {}",
                    other
                )))
            }
        };

        for item in items {
            match Command::from_wire(item) {
                Ok(command) => response.commands.push(command),
                Err(invalid) => response.invalid.push(invalid),
            }
        }
        Ok(response)
    }
}

/// What the backend accepted from one report call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportAck {
    pub accepted: Vec<CommandId>,
    /// Results the backend refused outright; retrying later will not help
    pub rejected: Vec<CommandId>,
    pub status_delivered: bool,
}

/// Structured report of an unexpected local fault
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    pub agent_version: String,
    pub os: String,
    pub machine: String,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        machine: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            command_id: None,
            agent_version: crate::VERSION.to_string(),
            os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            machine: machine.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn for_command(mut self, id: CommandId) -> Self {
        self.command_id = Some(id);
        self
    }
}

/// Agent bound to the bridge key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(alias = "agent_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
}

impl AgentInfo {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active")
    }
}

/// Remote orchestration backend
#[async_trait]
pub trait BridgeBackend: Send + Sync {
    /// Exchange the bridge key for a session token
    async fn authenticate(&self, bridge_key: &str) -> Result<SessionToken>;

    /// Fetch commands pending for this machine
    async fn poll(&self, token: &SessionToken) -> Result<PollResponse>;

    /// Deliver results and, when given, a status snapshot
    async fn report(
        &self,
        token: &SessionToken,
        results: &[CommandResult],
        status: Option<&StatusSnapshot>,
    ) -> Result<ReportAck>;

    /// Forward a chunk of live output
    async fn stream(
        &self,
        _token: &SessionToken,
        _command_id: &CommandId,
        _chunk: &OutputChunk,
    ) -> Result<()> {
        Ok(())
    }

    /// Report an unexpected local fault
    async fn report_error(&self, _token: Option<&SessionToken>, _report: &ErrorReport) -> Result<()> {
        Ok(())
    }

    /// Agents bound to the bridge key
    async fn list_agents(&self, token: &SessionToken) -> Result<Vec<AgentInfo>>;
}
