//! Process supervisor
//!
//! Keeps one table entry per logical id. Each entry holds the child handle,
//! the launch spec used to respawn it, the crash history used for the
//! restart budget, and a bounded tail of the process's output.
//!
//! Liveness is observed on tick with `try_wait`; no per-process exit task
//! races the supervisor for the child handle.

use super::launcher::{LaunchSpec, WorkerLauncher};
use super::types::{
    DesiredState, ObservedState, ProcessKind, RestartPolicy, StartOutcome, SupervisedProcess,
    SupervisorEvent,
};
use crate::error::{Error, Result};
use crate::exec::capture::{exit_code_of, kill_process_tree};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Output lines retained per process
pub const LOG_TAIL_LINES: usize = 200;

type LogTail = Arc<Mutex<VecDeque<String>>>;

struct Entry {
    info: SupervisedProcess,
    spec: LaunchSpec,
    child: Option<Child>,
    /// Crash instants inside the restart window
    crashes: VecDeque<Instant>,
    backoff_until: Option<Instant>,
    logs: LogTail,
}

impl Entry {
    /// Observe the child. Returns `Some(exit_code)` when it has just exited.
    fn poll_exit(&mut self) -> Option<Option<i32>> {
        let child = self.child.as_mut()?;
        let exit_code = match child.try_wait() {
            Ok(None) => {
                if self.info.observed_state == ObservedState::Starting {
                    self.info.observed_state = ObservedState::Running;
                }
                return None;
            }
            Ok(Some(status)) => exit_code_of(status),
            Err(e) => {
                tracing::warn!(logical_id = %self.info.logical_id, "Failed to poll process: {}", e);
                None
            }
        };
        self.child = None;
        self.info.pid = None;
        self.info.last_exit_code = exit_code;
        self.info.observed_state = ObservedState::Crashed;
        Some(exit_code)
    }

    /// Record a crash and schedule the next restart.
    ///
    /// Returns false when the restart budget is spent and the entry is failed.
    fn record_crash(&mut self, now: Instant, policy: &RestartPolicy) -> bool {
        while let Some(oldest) = self.crashes.front() {
            if now.duration_since(*oldest) > policy.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);

        if policy.max_restarts > 0 && self.crashes.len() >= policy.max_restarts as usize {
            self.info.observed_state = ObservedState::Failed;
            self.backoff_until = None;
            return false;
        }

        self.info.observed_state = ObservedState::Crashed;
        self.backoff_until = Some(now + policy.backoff_for(self.crashes.len()));
        true
    }

    fn restart_due(&self, now: Instant) -> bool {
        self.child.is_none()
            && self.info.observed_state == ObservedState::Crashed
            && self.backoff_until.map_or(true, |until| now >= until)
    }
}

struct Inner {
    table: RwLock<HashMap<String, Entry>>,
    launcher: Arc<dyn WorkerLauncher>,
    policy: RestartPolicy,
    failures: Arc<Notify>,
}

/// Supervisor for agent runners and model servers
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, policy: RestartPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: RwLock::new(HashMap::new()),
                launcher,
                policy,
                failures: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.inner.policy
    }

    /// Notified whenever an entry transitions to failed
    pub fn failure_notifier(&self) -> Arc<Notify> {
        self.inner.failures.clone()
    }

    /// Start a process under `logical_id`.
    ///
    /// Idempotent: a live entry is returned as `AlreadyRunning` without
    /// spawning. An explicit start clears a failed entry and its restart
    /// budget.
    pub async fn start(
        &self,
        logical_id: &str,
        kind: ProcessKind,
        args: Vec<String>,
    ) -> Result<StartOutcome> {
        let spec = self.inner.launcher.launch_spec(kind, logical_id, &args)?;

        let mut table = self.inner.table.write().await;
        if let Some(entry) = table.get_mut(logical_id) {
            if entry.info.observed_state == ObservedState::Stopping {
                return Err(Error::Supervision(format!(
                    "{} is stopping; retry once it has stopped",
                    logical_id
                )));
            }
            entry.poll_exit();
            if entry.child.is_some() {
                if entry.info.kind != kind {
                    return Err(Error::Supervision(format!(
                        "{} is already running as {:?}",
                        logical_id, entry.info.kind
                    )));
                }
                return Ok(StartOutcome::AlreadyRunning(entry.info.clone()));
            }
        }

        let logs: LogTail = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_TAIL_LINES)));
        let child = spawn_child(logical_id, &spec, &logs)?;
        let info = SupervisedProcess {
            logical_id: logical_id.to_string(),
            kind,
            pid: child.id(),
            desired_state: DesiredState::Running,
            observed_state: ObservedState::Starting,
            restart_count: 0,
            last_started_at: Some(Utc::now()),
            last_exit_code: None,
            args,
        };

        tracing::info!(
            logical_id = %logical_id,
            kind = ?kind,
            pid = ?info.pid,
            program = %spec.program,
            "Started supervised process"
        );

        table.insert(
            logical_id.to_string(),
            Entry {
                info: info.clone(),
                spec,
                child: Some(child),
                crashes: VecDeque::new(),
                backoff_until: None,
                logs,
            },
        );
        Ok(StartOutcome::Started(info))
    }

    /// Stop a process: SIGTERM, grace period, then SIGKILL.
    ///
    /// Returns the final snapshot, or `None` when the id is unknown.
    pub async fn stop(&self, logical_id: &str) -> Result<Option<SupervisedProcess>> {
        let (child, mut info) = {
            let mut table = self.inner.table.write().await;
            let Some(entry) = table.get_mut(logical_id) else {
                return Ok(None);
            };
            entry.info.desired_state = DesiredState::Stopped;
            entry.info.observed_state = ObservedState::Stopping;
            entry.backoff_until = None;
            (entry.child.take(), entry.info.clone())
        };

        if let Some(mut child) = child {
            info.last_exit_code = terminate(&mut child, self.inner.policy.stop_grace).await;
        }

        self.inner.table.write().await.remove(logical_id);

        info.pid = None;
        info.observed_state = ObservedState::Stopped;
        tracing::info!(logical_id = %logical_id, exit_code = ?info.last_exit_code, "Stopped supervised process");
        Ok(Some(info))
    }

    pub async fn status(&self, logical_id: &str) -> Option<SupervisedProcess> {
        let table = self.inner.table.read().await;
        table.get(logical_id).map(|e| e.info.clone())
    }

    /// All entries, sorted by logical id
    pub async fn list(&self) -> Vec<SupervisedProcess> {
        let table = self.inner.table.read().await;
        let mut processes: Vec<_> = table.values().map(|e| e.info.clone()).collect();
        processes.sort_by(|a, b| a.logical_id.cmp(&b.logical_id));
        processes
    }

    /// Last `lines` output lines of a process
    pub async fn logs(&self, logical_id: &str, lines: usize) -> Option<Vec<String>> {
        let tail = {
            let table = self.inner.table.read().await;
            table.get(logical_id)?.logs.clone()
        };
        let tail = tail.lock().await;
        let skip = tail.len().saturating_sub(lines);
        Some(tail.iter().skip(skip).cloned().collect())
    }

    /// Reconcile every entry with OS liveness and apply the restart policy.
    pub async fn tick(&self) -> Vec<SupervisorEvent> {
        let policy = &self.inner.policy;
        let mut events = Vec::new();
        let now = Instant::now();

        let mut table = self.inner.table.write().await;
        let ids: Vec<String> = table.keys().cloned().collect();

        for id in ids {
            let Some(entry) = table.get_mut(&id) else {
                continue;
            };
            if entry.info.desired_state != DesiredState::Running
                || entry.info.observed_state == ObservedState::Failed
            {
                continue;
            }

            if let Some(exit_code) = entry.poll_exit() {
                tracing::warn!(logical_id = %id, exit_code = ?exit_code, "Supervised process exited");
                events.push(SupervisorEvent::Exited {
                    logical_id: id.clone(),
                    exit_code,
                });

                if !policy.auto_restart {
                    table.remove(&id);
                    continue;
                }
                if !entry.record_crash(now, policy) {
                    events.push(self.failed(&id, entry));
                    continue;
                }
            }

            if !entry.restart_due(now) {
                continue;
            }

            entry.info.observed_state = ObservedState::Restarting;
            match spawn_child(&id, &entry.spec, &entry.logs) {
                Ok(child) => {
                    entry.info.pid = child.id();
                    entry.child = Some(child);
                    entry.backoff_until = None;
                    entry.info.restart_count += 1;
                    entry.info.observed_state = ObservedState::Starting;
                    entry.info.last_started_at = Some(Utc::now());
                    tracing::info!(
                        logical_id = %id,
                        pid = ?entry.info.pid,
                        restart_count = entry.info.restart_count,
                        "Restarted supervised process"
                    );
                    events.push(SupervisorEvent::Restarted {
                        logical_id: id.clone(),
                        restart_count: entry.info.restart_count,
                    });
                }
                Err(e) => {
                    tracing::warn!(logical_id = %id, "Restart failed: {}", e);
                    events.push(SupervisorEvent::RestartFailed {
                        logical_id: id.clone(),
                        error: e.to_string(),
                    });
                    if !entry.record_crash(now, policy) {
                        events.push(self.failed(&id, entry));
                    }
                }
            }
        }

        events
    }

    fn failed(&self, id: &str, entry: &Entry) -> SupervisorEvent {
        tracing::error!(
            logical_id = %id,
            restart_count = entry.info.restart_count,
            window_secs = self.inner.policy.window.as_secs(),
            "Restart budget exhausted; process marked failed"
        );
        self.inner.failures.notify_one();
        SupervisorEvent::Failed {
            logical_id: id.to_string(),
            restart_count: entry.info.restart_count,
        }
    }

    /// Stop every supervised process.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.table.read().await.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "Stopping supervised processes");
        let stops = ids.iter().map(|id| self.stop(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                tracing::warn!(logical_id = %id, "Failed to stop process: {}", e);
            }
        }
    }

    /// Tick on `interval` until `cancel` fires.
    pub fn start_watchdog(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let events = supervisor.tick().await;
                        if !events.is_empty() {
                            tracing::debug!(count = events.len(), "Supervision tick");
                        }
                    }
                }
            }
            tracing::debug!("Supervisor watchdog stopped");
        })
    }
}

fn spawn_child(logical_id: &str, spec: &LaunchSpec, logs: &LogTail) -> Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &spec.cwd {
        if let Err(e) = std::fs::create_dir_all(cwd) {
            tracing::warn!(logical_id = %logical_id, "Cannot create {}: {}", cwd.display(), e);
        }
        cmd.current_dir(cwd);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        Error::Supervision(format!("Failed to spawn {} for {}: {}", spec.program, logical_id, e))
    })?;

    if let Some(stdout) = child.stdout.take() {
        drain_lines(stdout, logs.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        drain_lines(stderr, logs.clone());
    }
    Ok(child)
}

/// Keep reading a pipe so the child never blocks on a full buffer.
fn drain_lines<R>(reader: R, logs: LogTail)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut tail = logs.lock().await;
            if tail.len() == LOG_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });
}

async fn terminate(child: &mut Child, grace: Duration) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: negative pid targets the process group created at spawn.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => exit_code_of(status),
        Ok(Err(e)) => {
            tracing::warn!("Failed to wait for process: {}", e);
            kill_process_tree(child).await;
            None
        }
        Err(_) => {
            tracing::warn!(grace_secs = grace.as_secs(), "Process ignored SIGTERM, force killing");
            kill_process_tree(child).await;
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Runs `args[0]` as an `sh -c` script
    struct ScriptLauncher;

    impl WorkerLauncher for ScriptLauncher {
        fn launch_spec(
            &self,
            _kind: ProcessKind,
            _logical_id: &str,
            args: &[String],
        ) -> Result<LaunchSpec> {
            let script = args.first().cloned().unwrap_or_default();
            Ok(LaunchSpec::new("sh").args(["-c".to_string(), script]))
        }
    }

    fn policy() -> RestartPolicy {
        RestartPolicy {
            auto_restart: true,
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            stop_grace: Duration::from_millis(300),
        }
    }

    fn supervisor(policy: RestartPolicy) -> ProcessSupervisor {
        ProcessSupervisor::new(Arc::new(ScriptLauncher), policy)
    }

    fn is_process_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    /// Tick until `done` holds for the entry, or give up after ~5s.
    async fn tick_until<F>(sup: &ProcessSupervisor, id: &str, done: F) -> Option<SupervisedProcess>
    where
        F: Fn(&SupervisedProcess) -> bool,
    {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sup.tick().await;
            match sup.status(id).await {
                Some(p) if done(&p) => return Some(p),
                None => return None,
                _ => {}
            }
        }
        sup.status(id).await
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let sup = supervisor(policy());
        let first = sup
            .start("agent-1", ProcessKind::Agent, vec!["sleep 30".into()])
            .await
            .unwrap();
        let second = sup
            .start("agent-1", ProcessKind::Agent, vec!["sleep 30".into()])
            .await
            .unwrap();

        assert!(!first.is_already_running());
        assert!(second.is_already_running());
        assert_eq!(first.process().pid, second.process().pid);
        assert_eq!(sup.list().await.len(), 1);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_starting_promoted_on_first_live_tick() {
        let sup = supervisor(policy());
        let started = sup
            .start("agent-1", ProcessKind::Agent, vec!["sleep 30".into()])
            .await
            .unwrap();
        assert_eq!(started.process().observed_state, ObservedState::Starting);
        assert_eq!(
            sup.status("agent-1").await.unwrap().observed_state,
            ObservedState::Starting
        );

        sup.tick().await;
        assert_eq!(
            sup.status("agent-1").await.unwrap().observed_state,
            ObservedState::Running
        );

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_kind_conflict_rejected() {
        let sup = supervisor(policy());
        sup.start("x", ProcessKind::Agent, vec!["sleep 30".into()])
            .await
            .unwrap();
        let err = sup
            .start("x", ProcessKind::ModelServer, vec!["sleep 30".into()])
            .await;
        assert!(err.is_err());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_kills_and_removes() {
        let sup = supervisor(policy());
        let started = sup
            .start("agent-1", ProcessKind::Agent, vec!["sleep 30".into()])
            .await
            .unwrap();
        let pid = started.process().pid.unwrap();
        assert!(is_process_alive(pid));

        let stopped = sup.stop("agent-1").await.unwrap().unwrap();
        assert_eq!(stopped.observed_state, ObservedState::Stopped);
        assert_eq!(stopped.desired_state, DesiredState::Stopped);
        assert!(sup.status("agent-1").await.is_none());
        assert!(!is_process_alive(pid));

        assert!(sup.stop("agent-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_force_kills_after_grace() {
        let sup = supervisor(policy());
        let started = sup
            .start(
                "stubborn",
                ProcessKind::Agent,
                vec!["trap '' TERM; sleep 30".into()],
            )
            .await
            .unwrap();
        let pid = started.process().pid.unwrap();

        let begun = Instant::now();
        sup.stop("stubborn").await.unwrap();
        assert!(begun.elapsed() >= Duration::from_millis(300));
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_crash_is_restarted() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("ran-once");
        let script = format!(
            "if [ -f {m} ]; then sleep 30; else touch {m}; exit 3; fi",
            m = marker.display()
        );

        let sup = supervisor(policy());
        sup.start("agent-1", ProcessKind::Agent, vec![script])
            .await
            .unwrap();

        let process = tick_until(&sup, "agent-1", |p| p.restart_count == 1)
            .await
            .unwrap();
        assert_eq!(process.restart_count, 1);
        assert_eq!(process.observed_state, ObservedState::Starting);
        assert_eq!(process.last_exit_code, Some(3));

        sup.tick().await;
        let process = sup.status("agent-1").await.unwrap();
        assert_eq!(process.restart_count, 1);
        assert_eq!(process.observed_state, ObservedState::Running);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_storm_marks_failed() {
        let sup = supervisor(policy());
        let notifier = sup.failure_notifier();
        sup.start("flappy", ProcessKind::Agent, vec!["exit 1".into()])
            .await
            .unwrap();

        let process = tick_until(&sup, "flappy", |p| {
            p.observed_state == ObservedState::Failed
        })
        .await
        .unwrap();
        assert_eq!(process.observed_state, ObservedState::Failed);
        assert_eq!(process.restart_count, 4);

        // Failed entries are left alone
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.tick().await;
        assert_eq!(sup.status("flappy").await.unwrap().restart_count, 4);

        tokio::time::timeout(Duration::from_secs(1), notifier.notified())
            .await
            .unwrap();

        // Explicit start clears the failure
        let outcome = sup
            .start("flappy", ProcessKind::Agent, vec!["sleep 30".into()])
            .await
            .unwrap();
        assert!(!outcome.is_already_running());
        assert_eq!(outcome.process().restart_count, 0);
        assert_eq!(outcome.process().observed_state, ObservedState::Starting);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_exit_without_auto_restart_removes_entry() {
        let sup = supervisor(RestartPolicy {
            auto_restart: false,
            ..policy()
        });
        sup.start("once", ProcessKind::Agent, vec!["exit 0".into()])
            .await
            .unwrap();

        assert!(tick_until(&sup, "once", |_| false).await.is_none());
    }

    #[tokio::test]
    async fn test_backoff_delays_second_restart() {
        let sup = supervisor(RestartPolicy {
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(60),
            ..policy()
        });
        sup.start("slow", ProcessKind::Agent, vec!["exit 1".into()])
            .await
            .unwrap();

        // First crash restarts immediately, second waits out the backoff
        let process = tick_until(&sup, "slow", |p| {
            p.restart_count == 1 && p.observed_state == ObservedState::Crashed
        })
        .await
        .unwrap();
        assert_eq!(process.restart_count, 1);
        assert_eq!(process.observed_state, ObservedState::Crashed);
        assert!(process.pid.is_none());

        sup.shutdown().await;
        assert!(sup.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_logs_keep_tail() {
        let sup = supervisor(policy());
        sup.start(
            "chatty",
            ProcessKind::Agent,
            vec!["for i in $(seq 1 250); do echo line-$i; done; sleep 30".into()],
        )
        .await
        .unwrap();

        let mut lines = Vec::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            lines = sup.logs("chatty", 1000).await.unwrap();
            if lines.last().map(String::as_str) == Some("line-250") {
                break;
            }
        }
        assert_eq!(lines.len(), LOG_TAIL_LINES);
        assert_eq!(lines.first().map(String::as_str), Some("line-51"));

        let last_two = sup.logs("chatty", 2).await.unwrap();
        assert_eq!(last_two, vec!["line-249", "line-250"]);
        assert!(sup.logs("nope", 5).await.is_none());

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_watchdog_restarts_and_cancels() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("ran-once");
        let script = format!(
            "if [ -f {m} ]; then sleep 30; else touch {m}; exit 1; fi",
            m = marker.display()
        );

        let sup = supervisor(policy());
        sup.start("agent-1", ProcessKind::Agent, vec![script])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = sup.start_watchdog(Duration::from_millis(50), cancel.clone());

        let mut restarted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if sup.status("agent-1").await.unwrap().restart_count == 1 {
                restarted = true;
                break;
            }
        }
        assert!(restarted);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        sup.shutdown().await;
    }
}
