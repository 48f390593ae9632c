//! HTTPS backend client
//!
//! Endpoints live under `{backend_url}/functions/v1/`. Every request carries
//! the anon key as `apikey` and bearer token, and the bridge key last passed
//! to `authenticate` as `x-bridge-key`.

use super::backend::{AgentInfo, BridgeBackend, ErrorReport, PollResponse, ReportAck, SessionToken};
use crate::command::{CommandId, CommandResult};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::exec::OutputChunk;
use crate::status::StatusSnapshot;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;
use tokio::sync::RwLock;

const POLL_ENDPOINT: &str = "bridge-poll";
const STREAM_ENDPOINT: &str = "bridge-stream";
const RESULT_ENDPOINT: &str = "bridge-result";
const STATUS_ENDPOINT: &str = "bridge-status";

/// Capabilities advertised on every poll
pub const CAPABILITIES: &[&str] = &["execute", "file_transfer", "stream"];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error bodies are cut to this many characters in messages
const ERROR_BODY_CHARS: usize = 200;

/// Backend reached over HTTPS
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    bridge_key: RwLock<String>,
    anon_key: String,
    machine_name: String,
}

impl HttpBackend {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("priority-bridge/{}", crate::VERSION))
            .build()?;
        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            bridge_key: RwLock::new(config.bridge_key.clone()),
            anon_key: config.anon_key.clone(),
            machine_name: config.resolved_machine_name(),
        })
    }

    pub fn endpoint(&self, name: &str) -> String {
        format!("{}/functions/v1/{}", self.base_url, name)
    }

    async fn post(&self, endpoint: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = self.endpoint(endpoint);
        let bridge_key = self.bridge_key.read().await.clone();
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
            .header("x-bridge-key", bridge_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("{} request failed: {}", endpoint, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Connectivity(format!("{} response unreadable: {}", endpoint, e)))?;

        if !status.is_success() {
            return Err(classify_status(endpoint, status, &text));
        }
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::Protocol(format!("{} returned invalid JSON: {}", endpoint, e)))
    }

    fn result_body(&self, token: &SessionToken, result: &CommandResult) -> serde_json::Value {
        json!({
            "command_id": result.command_id,
            "status": result.status,
            "exit_code": result.exit_code.unwrap_or(-1),
            "output": result.combined_output(),
            "stdout": result.stdout,
            "stderr": result.stderr,
            "duration_ms": result.duration_ms,
            "message": result.message,
            "machine_name": self.machine_name,
            "session_id": token.as_str(),
        })
    }
}

fn classify_status(endpoint: &str, status: StatusCode, body: &str) -> Error {
    let excerpt: String = body.chars().take(ERROR_BODY_CHARS).collect();
    let message = format!("{} returned {}: {}", endpoint, status, excerpt);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(message),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS || s == StatusCode::REQUEST_TIMEOUT => {
            Error::Connectivity(message)
        }
        _ => Error::Protocol(message),
    }
}

#[async_trait]
impl BridgeBackend for HttpBackend {
    /// Authenticates against the status endpoint so no command can be
    /// handed out before the session has a token to report with.
    async fn authenticate(&self, bridge_key: &str) -> Result<SessionToken> {
        crate::config::validate_bridge_key(bridge_key)?;
        *self.bridge_key.write().await = bridge_key.to_string();
        let body = self
            .post(
                STATUS_ENDPOINT,
                json!({
                    "action": "authenticate",
                    "machine_name": self.machine_name,
                    "cli_version": crate::VERSION,
                    "capabilities": CAPABILITIES,
                }),
            )
            .await?;

        let token = body
            .get("session_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(SessionToken::new(token))
    }

    async fn poll(&self, token: &SessionToken) -> Result<PollResponse> {
        let body = self
            .post(
                POLL_ENDPOINT,
                json!({
                    "machine_name": self.machine_name,
                    "session_id": token.as_str(),
                    "capabilities": CAPABILITIES,
                }),
            )
            .await?;
        PollResponse::from_wire(body)
    }

    async fn report(
        &self,
        token: &SessionToken,
        results: &[CommandResult],
        status: Option<&StatusSnapshot>,
    ) -> Result<ReportAck> {
        let mut ack = ReportAck::default();
        let mut first_error = None;

        for result in results {
            match self.post(RESULT_ENDPOINT, self.result_body(token, result)).await {
                Ok(_) => ack.accepted.push(result.command_id.clone()),
                // Refused payload: the rest of the batch can still go through
                Err(Error::Protocol(reason)) => {
                    tracing::warn!(command_id = %result.command_id, "Backend rejected result: {}", reason);
                    ack.rejected.push(result.command_id.clone());
                }
                Err(e) => {
                    tracing::warn!(command_id = %result.command_id, "Result delivery failed: {}", e);
                    first_error = Some(e);
                    break;
                }
            }
        }

        if let (Some(snapshot), None) = (status, first_error.as_ref()) {
            let mut body = serde_json::to_value(snapshot)?;
            if let serde_json::Value::Object(map) = &mut body {
                map.insert("machine_name".into(), json!(self.machine_name));
                map.insert("cli_version".into(), json!(crate::VERSION));
                map.insert("session_id".into(), json!(token.as_str()));
            }
            match self.post(STATUS_ENDPOINT, body).await {
                Ok(_) => ack.status_delivered = true,
                Err(Error::Protocol(reason)) => tracing::warn!("Backend rejected status: {}", reason),
                Err(e) => first_error = Some(e),
            }
        }

        match first_error {
            Some(e) if ack.accepted.is_empty() && ack.rejected.is_empty() => Err(e),
            _ => Ok(ack),
        }
    }

    async fn stream(
        &self,
        token: &SessionToken,
        command_id: &CommandId,
        chunk: &OutputChunk,
    ) -> Result<()> {
        self.post(
            STREAM_ENDPOINT,
            json!({
                "command_id": command_id,
                "chunk": chunk.text,
                "stream": chunk.stream,
                "machine_name": self.machine_name,
                "session_id": token.as_str(),
            }),
        )
        .await
        .map(|_| ())
    }

    async fn report_error(&self, _token: Option<&SessionToken>, report: &ErrorReport) -> Result<()> {
        self.post(
            RESULT_ENDPOINT,
            json!({
                "command_id": report.command_id,
                "exit_code": -1,
                "output": serde_json::to_string(report)?,
                "machine_name": self.machine_name,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn list_agents(&self, token: &SessionToken) -> Result<Vec<AgentInfo>> {
        let body = self
            .post(
                POLL_ENDPOINT,
                json!({
                    "action": "list_agents",
                    "machine_name": self.machine_name,
                    "session_id": token.as_str(),
                }),
            )
            .await?;
        match body.get("agents") {
            Some(agents) => Ok(serde_json::from_value(agents.clone())?),
            None => Ok(Vec::new()),
        }
    }
}
