//! Command dispatch
//!
//! Routes each command to the component that owns its kind: shell commands
//! to the executor, agent lifecycle to the supervisor, model operations to
//! the model manager.

use crate::command::{AgentOp, Command, CommandId, CommandKind, CommandResult};
use crate::exec::{CommandExecutor, OutputChunk};
use crate::models::ModelManager;
use crate::supervisor::{ProcessKind, ProcessSupervisor, StartOutcome, SupervisedProcess};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub struct Dispatcher {
    executor: Arc<CommandExecutor>,
    supervisor: ProcessSupervisor,
    models: ModelManager,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<CommandExecutor>,
        supervisor: ProcessSupervisor,
        models: ModelManager,
    ) -> Self {
        Self {
            executor,
            supervisor,
            models,
        }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub async fn dispatch(
        &self,
        command: &Command,
        chunks: Option<mpsc::Sender<OutputChunk>>,
    ) -> CommandResult {
        match &command.kind {
            CommandKind::Shell(_) => self.executor.execute_streaming(command, chunks).await,
            CommandKind::Agent(op) => self.agent(&command.id, op).await,
            CommandKind::Model(op) => self.models.execute(&command.id, op, chunks).await,
        }
    }

    async fn agent(&self, id: &CommandId, op: &AgentOp) -> CommandResult {
        let started = Instant::now();
        match op {
            AgentOp::Start { agent_id, args } => {
                match self
                    .supervisor
                    .start(agent_id, ProcessKind::Agent, args.clone())
                    .await
                {
                    Ok(StartOutcome::Started(process)) => {
                        process_result(id, &process, None, started.elapsed())
                    }
                    Ok(StartOutcome::AlreadyRunning(process)) => process_result(
                        id,
                        &process,
                        Some(format!("{} is already running", agent_id)),
                        started.elapsed(),
                    ),
                    Err(e) => CommandResult::failed(id.clone(), e.to_string(), started.elapsed()),
                }
            }
            AgentOp::Stop { agent_id } => match self.supervisor.stop(agent_id).await {
                Ok(Some(process)) => process_result(id, &process, None, started.elapsed()),
                Ok(None) => CommandResult::failed(
                    id.clone(),
                    format!("{} is not running", agent_id),
                    started.elapsed(),
                ),
                Err(e) => CommandResult::failed(id.clone(), e.to_string(), started.elapsed()),
            },
            AgentOp::Status { agent_id } => match self.supervisor.status(agent_id).await {
                Some(process) => process_result(id, &process, None, started.elapsed()),
                None => CommandResult::failed(
                    id.clone(),
                    format!("Unknown agent {}", agent_id),
                    started.elapsed(),
                ),
            },
            AgentOp::List => {
                let processes = self.supervisor.list().await;
                match serde_json::to_string_pretty(&processes) {
                    Ok(json) => CommandResult::ok(id.clone(), json, started.elapsed()),
                    Err(e) => CommandResult::failed(id.clone(), e.to_string(), started.elapsed()),
                }
            }
        }
    }
}

fn process_result(
    id: &CommandId,
    process: &SupervisedProcess,
    message: Option<String>,
    elapsed: Duration,
) -> CommandResult {
    match serde_json::to_string_pretty(process) {
        Ok(json) => CommandResult {
            message,
            ..CommandResult::ok(id.clone(), json, elapsed)
        },
        Err(e) => CommandResult::failed(id.clone(), e.to_string(), elapsed),
    }
}
