//! Shell command executor

use super::capture::{CaptureLimits, CaptureOutcome, OutputCapture, OutputChunk};
use crate::command::{Command, CommandId, CommandKind, CommandResult, CommandStatus};
use crate::config::CommandsConfig;
use crate::guard::{GuardVerdict, SafetyGuard};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Runs shell commands behind the safety guard
pub struct CommandExecutor {
    guard: Arc<SafetyGuard>,
    limits: CaptureLimits,
    /// Working directory for commands (home directory by default)
    working_dir: Option<PathBuf>,
    /// Processes spawned so far
    spawned: AtomicU64,
}

impl CommandExecutor {
    pub fn new(guard: Arc<SafetyGuard>, limits: CaptureLimits) -> Self {
        Self {
            guard,
            limits,
            working_dir: dirs_next::home_dir(),
            spawned: AtomicU64::new(0),
        }
    }

    /// Executor with the built-in deny-list and configured limits
    pub fn from_config(config: &CommandsConfig) -> Self {
        Self::new(
            Arc::new(SafetyGuard::new()),
            CaptureLimits {
                timeout: Duration::from_secs(config.timeout_secs.max(1)),
                max_output_bytes: config.max_output_bytes,
            },
        )
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn limits(&self) -> &CaptureLimits {
        &self.limits
    }

    /// Number of processes this executor has spawned
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Execute a command, producing its result.
    pub async fn execute(&self, command: &Command) -> CommandResult {
        self.execute_streaming(command, None).await
    }

    /// Execute a command, forwarding output chunks while it runs.
    pub async fn execute_streaming(
        &self,
        command: &Command,
        chunks: Option<mpsc::Sender<OutputChunk>>,
    ) -> CommandResult {
        match &command.kind {
            CommandKind::Shell(text) => self.run_shell(&command.id, text, chunks).await,
            other => CommandResult::failed(
                command.id.clone(),
                format!("{} commands are not executed by the shell executor", other.label()),
                Duration::ZERO,
            ),
        }
    }

    /// Run `program` with explicit arguments, without a shell.
    ///
    /// The guard sees the rendered command line. `limits` replaces the
    /// executor's own limits for this run.
    pub async fn run_program(
        &self,
        id: &CommandId,
        program: &str,
        args: &[String],
        limits: &CaptureLimits,
        chunks: Option<mpsc::Sender<OutputChunk>>,
    ) -> CommandResult {
        let line = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(denied) = self.screen(id, &line) {
            return denied;
        }

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        self.apply_working_dir(&mut cmd);
        self.capture(id, cmd, limits, chunks).await
    }

    async fn run_shell(
        &self,
        id: &CommandId,
        text: &str,
        chunks: Option<mpsc::Sender<OutputChunk>>,
    ) -> CommandResult {
        if let Some(denied) = self.screen(id, text) {
            return denied;
        }
        self.capture(id, self.shell_command(text), &self.limits, chunks)
            .await
    }

    fn screen(&self, id: &CommandId, text: &str) -> Option<CommandResult> {
        let GuardVerdict::Denied { category, pattern } = self.guard.check(text) else {
            return None;
        };
        tracing::warn!(
            command_id = %id,
            category = ?category,
            pattern = %pattern,
            "Command blocked by safety guard"
        );
        Some(CommandResult::denied(
            id.clone(),
            format!("Command blocked: potentially dangerous operation (matched '{}')", pattern),
        ))
    }

    async fn capture(
        &self,
        id: &CommandId,
        cmd: tokio::process::Command,
        limits: &CaptureLimits,
        chunks: Option<mpsc::Sender<OutputChunk>>,
    ) -> CommandResult {
        let started = Instant::now();
        let capture = OutputCapture::new(limits.clone()).with_chunks(chunks);
        self.spawned.fetch_add(1, Ordering::Relaxed);

        match capture.run(cmd).await {
            Ok(outcome) => to_result(id.clone(), outcome, limits),
            Err(e) => {
                tracing::warn!(command_id = %id, "Command failed to start: {}", e);
                CommandResult::failed(id.clone(), e.to_string(), started.elapsed())
            }
        }
    }

    fn apply_working_dir(&self, cmd: &mut tokio::process::Command) {
        if let Some(dir) = self.working_dir.as_ref().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }
    }

    fn shell_command(&self, text: &str) -> tokio::process::Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C").arg(text);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(text);
            cmd
        };
        self.apply_working_dir(&mut cmd);
        cmd
    }
}

/// Map a capture outcome onto a command result.
///
/// A timeout outranks truncation; truncation outranks the exit code.
fn to_result(
    id: CommandId,
    outcome: CaptureOutcome,
    limits: &CaptureLimits,
) -> CommandResult {
    let (status, message) = if outcome.timed_out {
        (
            CommandStatus::TimedOut,
            Some(format!(
                "Command timed out ({}s limit)",
                limits.timeout.as_secs()
            )),
        )
    } else if outcome.truncated {
        (
            CommandStatus::Truncated,
            Some(format!(
                "Output truncated at {} bytes",
                limits.max_output_bytes
            )),
        )
    } else if outcome.exit_code == Some(0) {
        (CommandStatus::Ok, None)
    } else {
        (
            CommandStatus::Failed,
            Some(match outcome.exit_code {
                Some(code) => format!("Exited with code {}", code),
                None => "Exited without a status code".to_string(),
            }),
        )
    };

    CommandResult {
        command_id: id,
        status,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code: outcome.exit_code,
        duration_ms: outcome.duration.as_millis() as u64,
        message,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor(timeout_ms: u64, cap: usize) -> CommandExecutor {
        CommandExecutor::new(
            Arc::new(SafetyGuard::new()),
            CaptureLimits {
                timeout: Duration::from_millis(timeout_ms),
                max_output_bytes: cap,
            },
        )
    }

    #[tokio::test]
    async fn test_ls_tmp_ok() {
        let dir = tempfile::Builder::new()
            .prefix("plbridge-ls-")
            .tempdir_in("/tmp")
            .unwrap();
        let name = dir.path().file_name().unwrap().to_string_lossy().to_string();

        let exec = executor(10_000, 50_000);
        let result = exec.execute(&Command::shell("c-1", "ls /tmp")).await;

        assert_eq!(result.status, CommandStatus::Ok);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains(&name));
    }

    #[tokio::test]
    async fn test_denied_spawns_nothing() {
        let exec = executor(10_000, 50_000);
        for text in ["rm -rf /", "mkfs.ext4 /dev/sda", ":(){ :|:& };:", "sudo reboot"] {
            let result = exec.execute(&Command::shell("c-deny", text)).await;
            assert_eq!(result.status, CommandStatus::Denied, "{}", text);
            assert!(result.exit_code.is_none());
            assert!(result.message.as_deref().unwrap().contains("blocked"));
        }
        assert_eq!(exec.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_status() {
        let exec = executor(200, 50_000);
        let result = exec.execute(&Command::shell("c-slow", "sleep 20")).await;
        assert_eq!(result.status, CommandStatus::TimedOut);
        assert_eq!(exec.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_truncated_status() {
        let exec = executor(10_000, 512);
        let result = exec
            .execute(&Command::shell("c-big", "yes abcdefgh | head -n 5000"))
            .await;
        assert_eq!(result.status, CommandStatus::Truncated);
        assert!(result.stdout.len() + result.stderr.len() <= 512);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let exec = executor(10_000, 50_000);
        let result = exec.execute(&Command::shell("c-fail", "echo nope >&2; exit 7")).await;
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.exit_code, Some(7));
        assert_eq!(result.stderr, "nope\n");
    }

    #[tokio::test]
    async fn test_missing_binary_is_failed_not_crash() {
        let exec = executor(10_000, 50_000);
        let result = exec
            .execute(&Command::shell("c-missing", "definitely-not-a-real-binary-xyz"))
            .await;
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.exit_code, Some(127));
    }

    #[tokio::test]
    async fn test_non_shell_kind_rejected() {
        let exec = executor(10_000, 50_000);
        let command = Command {
            id: CommandId::new("c-agent"),
            kind: CommandKind::Agent(crate::command::AgentOp::List),
            issued_at: chrono::Utc::now(),
        };
        let result = exec.execute(&command).await;
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(exec.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_run_program_passes_args_without_shell() {
        let exec = executor(10_000, 50_000);
        let limits = CaptureLimits {
            timeout: Duration::from_secs(5),
            max_output_bytes: 50_000,
        };
        let args = vec!["a b".to_string(), "$HOME".to_string()];
        let result = exec
            .run_program(&CommandId::new("p-1"), "echo", &args, &limits, None)
            .await;
        assert_eq!(result.status, CommandStatus::Ok);
        assert_eq!(result.stdout, "a b $HOME\n");
        assert_eq!(exec.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_run_program_is_guarded() {
        let exec = executor(10_000, 50_000);
        let args = vec!["-rf".to_string(), "/".to_string()];
        let result = exec
            .run_program(&CommandId::new("p-2"), "rm", &args, &CaptureLimits::default(), None)
            .await;
        assert_eq!(result.status, CommandStatus::Denied);
        assert_eq!(exec.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_run_program_uses_given_limits() {
        let exec = executor(10_000, 50_000);
        let limits = CaptureLimits {
            timeout: Duration::from_millis(200),
            max_output_bytes: 50_000,
        };
        let result = exec
            .run_program(&CommandId::new("p-3"), "sleep", &["20".to_string()], &limits, None)
            .await;
        assert_eq!(result.status, CommandStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_working_dir_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let exec = executor(10_000, 50_000).with_working_dir(dir.path());
        let result = exec.execute(&Command::shell("c-pwd", "pwd")).await;
        let expected = dir.path().canonicalize().unwrap();
        let actual = std::path::PathBuf::from(result.stdout.trim()).canonicalize().unwrap();
        assert_eq!(actual, expected);
    }
}
