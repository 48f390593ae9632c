//! Local model management
//!
//! Download and inference run configured external programs through
//! `OutputCapture`. Serving hands a model-server process to the supervisor
//! under the logical id `model:<name>`.

use crate::command::{CommandId, CommandResult, ModelOp};
use crate::config::{BridgeConfig, ModelsConfig};
use crate::exec::{CaptureLimits, CommandExecutor, OutputChunk};
use crate::supervisor::{ProcessKind, ProcessSupervisor, StartOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Logical id prefix for model servers
pub const MODEL_SERVER_PREFIX: &str = "model:";

/// Directory name for a model id (`org/name` → `org--name`)
pub fn model_dir_name(model: &str) -> String {
    model.replace('/', "--")
}

/// Supervisor logical id for a model server
pub fn server_id(model: &str) -> String {
    format!("{}{}", MODEL_SERVER_PREFIX, model)
}

/// Names of models present under `dir`, sorted
pub fn installed_models(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names
}

/// Runs model operations
///
/// Download and inference programs are spawned through the shared
/// `CommandExecutor`, under the model timeout rather than the shell one.
pub struct ModelManager {
    config: ModelsConfig,
    models_dir: PathBuf,
    limits: CaptureLimits,
    executor: Arc<CommandExecutor>,
    supervisor: ProcessSupervisor,
}

impl ModelManager {
    pub fn new(
        config: ModelsConfig,
        models_dir: impl Into<PathBuf>,
        max_output_bytes: usize,
        executor: Arc<CommandExecutor>,
        supervisor: ProcessSupervisor,
    ) -> Self {
        let limits = CaptureLimits {
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            max_output_bytes,
        };
        Self {
            config,
            models_dir: models_dir.into(),
            limits,
            executor,
            supervisor,
        }
    }

    pub fn from_config(
        config: &BridgeConfig,
        executor: Arc<CommandExecutor>,
        supervisor: ProcessSupervisor,
    ) -> Self {
        Self::new(
            config.models.clone(),
            config.default_model_path.clone(),
            config.commands.max_output_bytes,
            executor,
            supervisor,
        )
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn installed(&self) -> Vec<String> {
        installed_models(&self.models_dir)
    }

    /// Local directory for `model`
    pub fn local_path(&self, model: &str) -> PathBuf {
        self.models_dir.join(model_dir_name(model))
    }

    /// Local path when downloaded, otherwise the raw model name
    pub fn resolve(&self, model: &str) -> String {
        let local = self.local_path(model);
        if local.is_dir() {
            local.display().to_string()
        } else {
            model.to_string()
        }
    }

    pub async fn execute(
        &self,
        id: &CommandId,
        op: &ModelOp,
        chunks: Option<mpsc::Sender<OutputChunk>>,
    ) -> CommandResult {
        let started = Instant::now();
        let model = op.model();
        if let Err(reason) = validate_model_name(model) {
            return CommandResult::failed(id.clone(), reason, Duration::ZERO);
        }

        match op {
            ModelOp::Download { model } => {
                if let Err(e) = tokio::fs::create_dir_all(&self.models_dir).await {
                    return CommandResult::failed(
                        id.clone(),
                        format!("Cannot create {}: {}", self.models_dir.display(), e),
                        started.elapsed(),
                    );
                }
                let local_dir = self.local_path(model).display().to_string();
                tracing::info!(command_id = %id, model = %model, "Downloading model");
                let args = vec![
                    "download".to_string(),
                    model.clone(),
                    "--local-dir".to_string(),
                    local_dir,
                ];
                self.run_program(id, &self.config.download_program, &args, chunks)
                    .await
            }
            ModelOp::Infer {
                model,
                prompt,
                max_tokens,
            } => {
                tracing::info!(command_id = %id, model = %model, "Running inference");
                let args = vec![
                    "--model".to_string(),
                    self.resolve(model),
                    "--prompt".to_string(),
                    prompt.clone(),
                    "--max-tokens".to_string(),
                    max_tokens.to_string(),
                ];
                self.run_program(id, &self.config.infer_program, &args, chunks)
                    .await
            }
            ModelOp::Serve { model, port } => self.serve(id, model, *port, started).await,
            ModelOp::Stop { model } => match self.supervisor.stop(&server_id(model)).await {
                Ok(Some(_)) => CommandResult::ok(
                    id.clone(),
                    format!("Stopped model server for {}", model),
                    started.elapsed(),
                ),
                Ok(None) => CommandResult::failed(
                    id.clone(),
                    format!("No model server running for {}", model),
                    started.elapsed(),
                ),
                Err(e) => CommandResult::failed(id.clone(), e.to_string(), started.elapsed()),
            },
        }
    }

    /// Start (or confirm) the model server for `model`.
    pub async fn serve(
        &self,
        id: &CommandId,
        model: &str,
        port: u16,
        started: Instant,
    ) -> CommandResult {
        let args = vec![
            "--model".to_string(),
            self.resolve(model),
            "--port".to_string(),
            port.to_string(),
        ];
        match self
            .supervisor
            .start(&server_id(model), ProcessKind::ModelServer, args)
            .await
        {
            Ok(StartOutcome::Started(process)) => CommandResult::ok(
                id.clone(),
                format!(
                    "Serving {} on port {} (pid {})",
                    model,
                    port,
                    process.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
                ),
                started.elapsed(),
            ),
            Ok(StartOutcome::AlreadyRunning(process)) => CommandResult::ok(
                id.clone(),
                format!(
                    "Model server for {} already running (pid {})",
                    model,
                    process.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
                ),
                started.elapsed(),
            ),
            Err(e) => CommandResult::failed(id.clone(), e.to_string(), started.elapsed()),
        }
    }

    async fn run_program(
        &self,
        id: &CommandId,
        program: &str,
        args: &[String],
        chunks: Option<mpsc::Sender<OutputChunk>>,
    ) -> CommandResult {
        self.executor
            .run_program(id, program, args, &self.limits, chunks)
            .await
    }
}

fn validate_model_name(model: &str) -> std::result::Result<(), String> {
    let trimmed = model.trim();
    if trimmed.is_empty() {
        return Err("Model name must be non-empty".to_string());
    }
    if trimmed.split('/').any(|part| part == ".." || part == ".") || trimmed.contains('\\') {
        return Err(format!("Invalid model name '{}'", model));
    }
    Ok(())
}
