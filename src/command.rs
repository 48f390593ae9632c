//! Command and result types exchanged with the backend
//!
//! A `Command` is immutable once decoded. Its `kind` is a closed set of
//! variants so dispatch is an exhaustive `match`, never string routing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque command identifier, unique per issuance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub String);

impl CommandId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A command issued by the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    pub issued_at: DateTime<Utc>,
}

impl Command {
    /// Build a shell command issued now
    pub fn shell(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: CommandId::new(id),
            kind: CommandKind::Shell(text.into()),
            issued_at: Utc::now(),
        }
    }

    /// Decode a command from its wire form.
    ///
    /// On failure the id is returned alongside the error when the payload
    /// carried one, so the caller can still answer with a failed result.
    pub fn from_wire(value: serde_json::Value) -> Result<Self, InvalidCommand> {
        let id = value
            .get("id")
            .or_else(|| value.get("command_id"))
            .and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .map(CommandId);

        let wire: WireCommand = match serde_json::from_value(value) {
            Ok(w) => w,
            Err(e) => {
                return Err(InvalidCommand {
                    id,
                    reason: e.to_string(),
                })
            }
        };
        let Some(id) = id else {
            return Err(InvalidCommand {
                id: None,
                reason: "command has no id".to_string(),
            });
        };

        let invalid = |reason: String| InvalidCommand {
            id: Some(id.clone()),
            reason,
        };

        let kind = match wire.kind.as_str() {
            "shell" => match wire.payload {
                serde_json::Value::String(text) => CommandKind::Shell(text),
                serde_json::Value::Object(map) => match map.get("command") {
                    Some(serde_json::Value::String(text)) => CommandKind::Shell(text.clone()),
                    _ => return Err(invalid("shell payload has no 'command' string".to_string())),
                },
                _ => return Err(invalid("shell payload must be a string".to_string())),
            },
            "agent_lifecycle" | "agent" => CommandKind::Agent(
                serde_json::from_value(wire.payload).map_err(|e| invalid(e.to_string()))?,
            ),
            "model_op" | "model" => CommandKind::Model(
                serde_json::from_value(wire.payload).map_err(|e| invalid(e.to_string()))?,
            ),
            other => return Err(invalid(format!("unsupported command kind '{}'", other))),
        };

        Ok(Self {
            id,
            kind,
            issued_at: wire.issued_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Raw command as sent by the backend
#[derive(Debug, Deserialize)]
struct WireCommand {
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default, alias = "command")]
    payload: serde_json::Value,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
}

fn default_kind() -> String {
    "shell".to_string()
}

/// A pending command that could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidCommand {
    pub id: Option<CommandId>,
    pub reason: String,
}

/// What a command asks the bridge to do
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum CommandKind {
    /// Shell command line
    Shell(String),
    /// Agent runner lifecycle
    #[serde(rename = "agent_lifecycle")]
    Agent(AgentOp),
    /// Model download / inference / serving
    #[serde(rename = "model_op")]
    Model(ModelOp),
}

impl CommandKind {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            CommandKind::Shell(_) => "shell",
            CommandKind::Agent(_) => "agent_lifecycle",
            CommandKind::Model(_) => "model_op",
        }
    }
}

/// Agent lifecycle operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentOp {
    Start {
        agent_id: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Stop {
        agent_id: String,
    },
    Status {
        agent_id: String,
    },
    List,
}

/// Model operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ModelOp {
    Download {
        model: String,
    },
    Infer {
        model: String,
        prompt: String,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
    },
    Serve {
        model: String,
        #[serde(default = "default_port")]
        port: u16,
    },
    Stop {
        model: String,
    },
}

impl ModelOp {
    /// Model the operation targets
    pub fn model(&self) -> &str {
        match self {
            ModelOp::Download { model }
            | ModelOp::Infer { model, .. }
            | ModelOp::Serve { model, .. }
            | ModelOp::Stop { model } => model,
        }
    }
}

fn default_max_tokens() -> u32 {
    256
}

fn default_port() -> u16 {
    8000
}

/// Terminal status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ok,
    Denied,
    TimedOut,
    Failed,
    Truncated,
}

/// Outcome of one command, produced exactly once per command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Human-readable diagnostic (denial reason, spawn error, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandResult {
    /// Successful result carrying text output
    pub fn ok(command_id: CommandId, stdout: impl Into<String>, duration: Duration) -> Self {
        Self {
            command_id,
            status: CommandStatus::Ok,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            duration_ms: duration.as_millis() as u64,
            message: None,
        }
    }

    /// Result for a command rejected by policy
    pub fn denied(command_id: CommandId, reason: impl Into<String>) -> Self {
        Self {
            command_id,
            status: CommandStatus::Denied,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: 0,
            message: Some(reason.into()),
        }
    }

    /// Result for a command that could not run or failed
    pub fn failed(command_id: CommandId, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            command_id,
            status: CommandStatus::Failed,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: duration.as_millis() as u64,
            message: Some(message.into()),
        }
    }

    /// stdout and stderr joined, as the legacy `output` field expects
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}{}", self.stdout, self.stderr),
        }
    }
}
