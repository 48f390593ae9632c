//! Worker launch specifications
//!
//! Turns a `(kind, logical_id, args)` request into the concrete program,
//! arguments, working directory and environment to spawn.

use super::types::ProcessKind;
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Environment variable carrying the model storage path
pub const MODEL_PATH_ENV: &str = "PL_MODEL_PATH";

/// Environment variable carrying the logical id
pub const LOGICAL_ID_ENV: &str = "PL_LOGICAL_ID";

/// How to spawn one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Resolves launch specs for supervised workers
pub trait WorkerLauncher: Send + Sync {
    fn launch_spec(&self, kind: ProcessKind, logical_id: &str, args: &[String]) -> Result<LaunchSpec>;
}

/// Launcher driven by the bridge configuration
#[derive(Debug, Clone)]
pub struct ConfiguredLauncher {
    agent_program: String,
    serve_program: String,
    model_path: PathBuf,
}

impl ConfiguredLauncher {
    pub fn new(
        agent_program: impl Into<String>,
        serve_program: impl Into<String>,
        model_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_program: agent_program.into(),
            serve_program: serve_program.into(),
            model_path: model_path.into(),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.supervisor.agent_program.clone(),
            config.models.serve_program.clone(),
            config.default_model_path.clone(),
        )
    }
}

impl WorkerLauncher for ConfiguredLauncher {
    fn launch_spec(&self, kind: ProcessKind, logical_id: &str, args: &[String]) -> Result<LaunchSpec> {
        if logical_id.trim().is_empty() {
            return Err(Error::Supervision("logical id must be non-empty".to_string()));
        }

        let spec = match kind {
            ProcessKind::Agent => LaunchSpec::new(&self.agent_program)
                .args(["--agent-id", logical_id])
                .args(args.iter().cloned()),
            ProcessKind::ModelServer => {
                LaunchSpec::new(&self.serve_program).args(args.iter().cloned())
            }
        };

        let model_path = self.model_path.display().to_string();
        Ok(LaunchSpec {
            cwd: Some(self.model_path.clone()),
            env: vec![
                (MODEL_PATH_ENV.to_string(), model_path),
                (LOGICAL_ID_ENV.to_string(), logical_id.to_string()),
            ],
            ..spec
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_spec() {
        let launcher = ConfiguredLauncher::new("pl-agent", "pl-model-server", "/srv/models");
        let spec = launcher
            .launch_spec(ProcessKind::Agent, "agent-1", &["--verbose".to_string()])
            .unwrap();

        assert_eq!(spec.program, "pl-agent");
        assert_eq!(spec.args, vec!["--agent-id", "agent-1", "--verbose"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/srv/models")));
        assert!(spec
            .env
            .contains(&(MODEL_PATH_ENV.to_string(), "/srv/models".to_string())));
    }

    #[test]
    fn test_model_server_spec() {
        let launcher = ConfiguredLauncher::new("pl-agent", "pl-model-server", "/srv/models");
        let args = vec!["--model".to_string(), "phi".to_string()];
        let spec = launcher
            .launch_spec(ProcessKind::ModelServer, "model:phi", &args)
            .unwrap();
        assert_eq!(spec.program, "pl-model-server");
        assert_eq!(spec.args, args);
    }

    #[test]
    fn test_empty_logical_id_rejected() {
        let launcher = ConfiguredLauncher::from_config(&BridgeConfig::default());
        assert!(launcher.launch_spec(ProcessKind::Agent, " ", &[]).is_err());
    }
}
