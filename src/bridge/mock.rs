//! Scripted backend for session tests

use super::backend::{AgentInfo, BridgeBackend, ErrorReport, PollResponse, ReportAck, SessionToken};
use crate::command::{CommandId, CommandResult};
use crate::error::{Error, Result};
use crate::exec::OutputChunk;
use crate::status::StatusSnapshot;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    polls: VecDeque<serde_json::Value>,
    poll_count: usize,
    poll_failures: usize,
    auth_rejections: usize,
    auth_attempts: usize,
    accepted_key: Option<String>,
    keys_tried: Vec<String>,
    refused_results: HashSet<String>,
    rejections: usize,
    /// (command id, chunks streamed for it) at the time its result arrived
    streamed_at_report: Vec<(String, usize)>,
    report_failures: usize,
    report_failures_seen: usize,
    received: Vec<CommandResult>,
    snapshots: Vec<StatusSnapshot>,
    streamed: Vec<(String, String)>,
    errors: Vec<ErrorReport>,
}

#[derive(Default)]
pub(crate) struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn script_poll(&self, body: serde_json::Value) {
        self.with(|s| s.polls.push_back(body));
    }

    pub fn fail_polls(&self, n: usize) {
        self.with(|s| s.poll_failures = n);
    }

    pub fn reject_auth(&self, n: usize) {
        self.with(|s| s.auth_rejections = n);
    }

    /// Only `key` authenticates from now on
    pub fn accept_only_key(&self, key: &str) {
        self.with(|s| s.accepted_key = Some(key.to_string()));
    }

    /// Refuse every result for `id` as a malformed payload
    pub fn refuse_result(&self, id: &str) {
        self.with(|s| s.refused_results.insert(id.to_string()));
    }

    pub fn keys_tried(&self) -> Vec<String> {
        self.with(|s| s.keys_tried.clone())
    }

    pub fn rejections(&self) -> usize {
        self.with(|s| s.rejections)
    }

    pub fn streamed_at_report(&self, id: &str) -> Option<usize> {
        self.with(|s| {
            s.streamed_at_report
                .iter()
                .find(|(seen, _)| seen == id)
                .map(|(_, n)| *n)
        })
    }

    pub fn fail_reports(&self, n: usize) {
        self.with(|s| s.report_failures = n);
    }

    pub fn polls(&self) -> usize {
        self.with(|s| s.poll_count)
    }

    pub fn auth_attempts(&self) -> usize {
        self.with(|s| s.auth_attempts)
    }

    pub fn report_failures_seen(&self) -> usize {
        self.with(|s| s.report_failures_seen)
    }

    /// Distinct command ids received, sorted
    pub fn received_ids(&self) -> Vec<String> {
        self.with(|s| {
            let mut ids: Vec<String> = s.received.iter().map(|r| r.command_id.0.clone()).collect();
            ids.sort();
            ids.dedup();
            ids
        })
    }

    /// Latest result received for `id`
    pub fn result_for(&self, id: &str) -> Option<CommandResult> {
        self.with(|s| s.received.iter().rev().find(|r| r.command_id.as_str() == id).cloned())
    }

    pub fn snapshots(&self) -> usize {
        self.with(|s| s.snapshots.len())
    }

    pub fn last_snapshot(&self) -> Option<StatusSnapshot> {
        self.with(|s| s.snapshots.last().cloned())
    }

    pub fn streamed(&self) -> Vec<(String, String)> {
        self.with(|s| s.streamed.clone())
    }

    #[allow(dead_code)]
    pub fn errors(&self) -> Vec<ErrorReport> {
        self.with(|s| s.errors.clone())
    }
}

#[async_trait]
impl BridgeBackend for MockBackend {
    async fn authenticate(&self, bridge_key: &str) -> Result<SessionToken> {
        self.with(|s| {
            s.auth_attempts += 1;
            s.keys_tried.push(bridge_key.to_string());
            if s.auth_rejections > 0 {
                s.auth_rejections -= 1;
                return Err(Error::Unauthorized("invalid bridge key".to_string()));
            }
            if s.accepted_key.as_deref().map_or(false, |k| k != bridge_key) {
                return Err(Error::Unauthorized("invalid bridge key".to_string()));
            }
            Ok(SessionToken::new(format!("session-{}", s.auth_attempts)))
        })
    }

    async fn poll(&self, _token: &SessionToken) -> Result<PollResponse> {
        let body = self.with(|s| {
            s.poll_count += 1;
            if s.poll_failures > 0 {
                s.poll_failures -= 1;
                return Err(Error::Connectivity("connection refused".to_string()));
            }
            Ok(s.polls.pop_front().unwrap_or(serde_json::Value::Null))
        })?;
        PollResponse::from_wire(body)
    }

    async fn report(
        &self,
        _token: &SessionToken,
        results: &[CommandResult],
        status: Option<&StatusSnapshot>,
    ) -> Result<ReportAck> {
        self.with(|s| {
            if s.report_failures > 0 {
                s.report_failures -= 1;
                s.report_failures_seen += 1;
                return Err(Error::Connectivity("connection reset".to_string()));
            }
            let mut ack = ReportAck {
                status_delivered: status.is_some(),
                ..Default::default()
            };
            for result in results {
                let id = result.command_id.0.clone();
                if s.refused_results.contains(&id) {
                    s.rejections += 1;
                    ack.rejected.push(result.command_id.clone());
                    continue;
                }
                let streamed = s.streamed.iter().filter(|(seen, _)| *seen == id).count();
                s.streamed_at_report.push((id, streamed));
                s.received.push(result.clone());
                ack.accepted.push(result.command_id.clone());
            }
            if let Some(snapshot) = status {
                s.snapshots.push(snapshot.clone());
            }
            Ok(ack)
        })
    }

    async fn stream(
        &self,
        _token: &SessionToken,
        command_id: &CommandId,
        chunk: &OutputChunk,
    ) -> Result<()> {
        self.with(|s| s.streamed.push((command_id.0.clone(), chunk.text.clone())));
        Ok(())
    }

    async fn report_error(&self, _token: Option<&SessionToken>, report: &ErrorReport) -> Result<()> {
        self.with(|s| s.errors.push(report.clone()));
        Ok(())
    }

    async fn list_agents(&self, _token: &SessionToken) -> Result<Vec<AgentInfo>> {
        Ok(vec![AgentInfo {
            id: "agent-1".to_string(),
            name: "Researcher".to_string(),
            status: "active".to_string(),
        }])
    }
}
