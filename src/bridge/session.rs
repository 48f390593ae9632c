//! Bridge session
//!
//! One long-lived loop per process:
//!
//! ```text
//! authenticate ─→ poll ─→ dispatch (one task per command) ─→ report ─→ sleep
//!      ↑  failure: backoff                                             │
//!      └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Commands start in the order they were received, at most
//! `max_concurrent` at a time. Results are held in the outbox until the
//! backend acknowledges their `command_id`; a result the backend refuses is
//! retried a bounded number of times, then dropped with an error log. A
//! refused bridge key is logged once per key and re-read before every
//! attempt, so it can be corrected without a restart. On stop no new commands are accepted, in-flight commands
//! finish within their own timeouts, results are flushed best-effort, and
//! supervised processes are stopped.

use super::backend::{BridgeBackend, ErrorReport, PollResponse, SessionToken};
use super::backoff::Backoff;
use super::dispatch::Dispatcher;
use super::outbox::Outbox;
use super::state::{ConnectionPhase, SharedConnectionState};
use crate::command::{Command, CommandId, CommandResult};
use crate::config::{BridgeConfig, KeySource};
use crate::error::Error;
use crate::exec::OutputChunk;
use crate::status::StatusReporter;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Output chunks buffered per command before chunks are dropped
const STREAM_BUFFER: usize = 64;

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub key: KeySource,
    pub machine_name: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub tick_interval: Duration,
    /// Commands executing at once
    pub max_concurrent: usize,
    pub backoff: Backoff,
    /// Bound on the final flush at shutdown
    pub flush_timeout: Duration,
    /// Recently accepted command ids remembered for de-duplication
    pub seen_capacity: usize,
    pub stream_output: bool,
    /// Refusals of one result before it is dropped
    pub max_rejections: u32,
}

impl SessionSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            key: KeySource::fixed(config.bridge_key.clone()),
            machine_name: config.resolved_machine_name(),
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            tick_interval: Duration::from_millis(config.supervisor.tick_interval_ms.max(100)),
            max_concurrent: config.commands.max_concurrent.max(1),
            backoff: Backoff::default(),
            flush_timeout: Duration::from_secs(10),
            seen_capacity: 1024,
            stream_output: true,
            max_rejections: 5,
        }
    }
}

/// Bounded memory of accepted command ids
#[derive(Debug)]
struct SeenIds {
    order: VecDeque<CommandId>,
    set: HashSet<CommandId>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Remember `id`; false when it was already seen.
    fn insert(&mut self, id: &CommandId) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.set.insert(id.clone());
        true
    }
}

pub struct BridgeSession {
    settings: SessionSettings,
    backend: Arc<dyn BridgeBackend>,
    dispatcher: Arc<Dispatcher>,
    reporter: StatusReporter,
    state: SharedConnectionState,
    failures: Arc<Notify>,
    permits: Arc<Semaphore>,
    token: Option<SessionToken>,
    outbox: Outbox,
    seen: SeenIds,
    /// Accepted commands waiting for a permit
    queued: VecDeque<Command>,
    in_flight: JoinSet<CommandResult>,
    next_heartbeat: Instant,
    /// Key used by the latest authentication attempt
    last_key: String,
    /// Key whose refusal was already logged
    rejected_key: Option<String>,
    key_errors_logged: u32,
}

impl BridgeSession {
    pub fn new(
        settings: SessionSettings,
        backend: Arc<dyn BridgeBackend>,
        dispatcher: Arc<Dispatcher>,
        reporter: StatusReporter,
        state: SharedConnectionState,
    ) -> Self {
        let failures = dispatcher.supervisor().failure_notifier();
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        let seen = SeenIds::new(settings.seen_capacity);
        Self {
            settings,
            backend,
            dispatcher,
            reporter,
            state,
            failures,
            permits,
            token: None,
            outbox: Outbox::new(),
            seen,
            queued: VecDeque::new(),
            in_flight: JoinSet::new(),
            next_heartbeat: Instant::now(),
            last_key: String::new(),
            rejected_key: None,
            key_errors_logged: 0,
        }
    }

    pub fn state(&self) -> SharedConnectionState {
        self.state.clone()
    }

    /// Times a refused bridge key was logged at error level
    pub fn key_errors_logged(&self) -> u32 {
        self.key_errors_logged
    }

    /// Results not yet acknowledged by the backend
    pub fn pending_results(&self) -> &[CommandResult] {
        self.outbox.pending()
    }

    /// Run until `stop` fires, then drain.
    pub async fn run(&mut self, stop: CancellationToken) {
        tracing::info!(
            machine = %self.settings.machine_name,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            max_concurrent = self.settings.max_concurrent,
            "Bridge session starting"
        );

        let watchdog_stop = stop.child_token();
        let watchdog = self
            .dispatcher
            .supervisor()
            .start_watchdog(self.settings.tick_interval, watchdog_stop.clone());

        while !stop.is_cancelled() {
            let delay = self.cycle(&stop).await;
            if self.idle(delay, &stop).await {
                break;
            }
        }

        self.drain().await;
        watchdog_stop.cancel();
        if let Err(e) = watchdog.await {
            tracing::warn!("Supervisor watchdog ended abnormally: {}", e);
        }
        tracing::info!("Bridge session stopped");
    }

    /// One poll cycle; returns the delay before the next one.
    async fn cycle(&mut self, stop: &CancellationToken) -> Duration {
        self.collect_finished();

        let token = match self.token.clone() {
            Some(token) => token,
            None => match self.authenticate(stop).await {
                Some(token) => token,
                None => return self.retry_delay().await,
            },
        };

        let polled = tokio::select! {
            _ = stop.cancelled() => return Duration::ZERO,
            polled = self.backend.poll(&token) => polled,
        };
        match polled {
            Ok(response) => {
                self.state.write().await.record_success();
                self.accept(response, &token);
            }
            Err(e) => {
                self.connection_failed("poll", &e).await;
                return self.retry_delay().await;
            }
        }

        self.collect_finished();
        let token = self.token.clone().unwrap_or(token);
        if let Err(e) = self.flush(&token, stop).await {
            self.connection_failed("report", &e).await;
            return self.retry_delay().await;
        }
        self.settings.poll_interval
    }

    async fn authenticate(&mut self, stop: &CancellationToken) -> Option<SessionToken> {
        self.state.write().await.phase = ConnectionPhase::Authenticating;

        let key = match self.settings.key.current() {
            Ok(key) => key,
            Err(e) => {
                self.last_key.clear();
                let error = Error::Config(format!("cannot read bridge key: {}", e));
                self.connection_failed("authenticate", &error).await;
                return None;
            }
        };
        self.last_key = key;

        let result = tokio::select! {
            _ = stop.cancelled() => return None,
            result = self.backend.authenticate(&self.last_key) => result,
        };
        match result {
            Ok(token) => {
                tracing::info!("Authenticated with backend");
                self.rejected_key = None;
                self.state.write().await.record_success();
                self.token = Some(token.clone());
                Some(token)
            }
            Err(e) => {
                self.connection_failed("authenticate", &e).await;
                None
            }
        }
    }

    /// Degrade to backoff. The session token survives transient failures;
    /// only a rejection forces re-authentication.
    async fn connection_failed(&mut self, during: &str, error: &Error) {
        let failures = {
            let mut state = self.state.write().await;
            state.record_failure(&format!("{}: {}", during, error));
            state.consecutive_failures
        };

        match error {
            Error::Unauthorized(_) | Error::Config(_) if during == "authenticate" => {
                self.token = None;
                self.settings.key.rejected();
                if self.rejected_key.as_deref() != Some(self.last_key.as_str()) {
                    tracing::error!(
                        "Bridge key rejected ({}). Fix it with `pl config set bridge_key pb_...`; still retrying",
                        error
                    );
                    self.rejected_key = Some(self.last_key.clone());
                    self.key_errors_logged += 1;
                } else {
                    tracing::debug!(during, failures, "Still unauthorized: {}", error);
                }
            }
            Error::Unauthorized(_) => {
                self.token = None;
                tracing::warn!(during, "Session no longer valid; re-authenticating: {}", error);
            }
            _ => tracing::warn!(during, failures, "Backend unavailable: {}", error),
        }
    }

    async fn retry_delay(&self) -> Duration {
        let failures = self.state.read().await.consecutive_failures;
        let delay = self.settings.backoff.delay(failures);
        tracing::debug!(failures, delay_ms = delay.as_millis() as u64, "Backing off");
        delay
    }

    fn accept(&mut self, response: PollResponse, token: &SessionToken) {
        if let Some(session_id) = response.session_id {
            if session_id != token.as_str() {
                self.token = Some(SessionToken::new(session_id));
            }
        }

        for invalid in response.invalid {
            match invalid.id {
                Some(id) => {
                    if self.seen.insert(&id) {
                        tracing::warn!(command_id = %id, "Malformed command: {}", invalid.reason);
                        self.outbox.push(CommandResult::failed(
                            id,
                            format!("Malformed command: {}", invalid.reason),
                            Duration::ZERO,
                        ));
                    }
                }
                None => tracing::warn!("Skipping malformed command without id: {}", invalid.reason),
            }
        }

        for command in response.commands {
            if !self.seen.insert(&command.id) {
                tracing::debug!(command_id = %command.id, "Skipping re-delivered command");
                continue;
            }
            tracing::info!(command_id = %command.id, kind = command.kind.label(), "Received command");
            self.queued.push_back(command);
        }
        self.launch_queued();
    }

    /// Start queued commands, oldest first, while permits are free.
    fn launch_queued(&mut self) {
        while !self.queued.is_empty() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            if let Some(command) = self.queued.pop_front() {
                self.spawn_command(command, permit);
            }
        }
    }

    fn spawn_command(&mut self, command: Command, permit: OwnedSemaphorePermit) {
        let dispatcher = self.dispatcher.clone();
        let backend = self.backend.clone();
        let token = self.token.clone();
        let stream = self.settings.stream_output;
        let machine = self.settings.machine_name.clone();

        self.in_flight.spawn(async move {
            let _permit = permit;
            let id = command.id.clone();

            // Output is forwarded inside this task, so every chunk has been
            // handed to the backend before the result is queued.
            let (chunks, forward) = match token.clone().filter(|_| stream) {
                Some(token) => {
                    let (tx, rx) = mpsc::channel::<OutputChunk>(STREAM_BUFFER);
                    let forward = forward_chunks(backend.clone(), token, id.clone(), rx);
                    (Some(tx), Some(forward))
                }
                None => (None, None),
            };
            let run = AssertUnwindSafe(dispatcher.dispatch(&command, chunks)).catch_unwind();
            let (outcome, ()) = tokio::join!(run, async move {
                if let Some(forward) = forward {
                    forward.await;
                }
            });

            match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(command_id = %id, "Command task panicked: {}", message);
                    let report = ErrorReport::new("panic", &message, machine).for_command(id.clone());
                    if let Err(e) = backend.report_error(token.as_ref(), &report).await {
                        tracing::debug!("Error report not delivered: {}", e);
                    }
                    CommandResult::failed(id, format!("Internal error: {}", message), Duration::ZERO)
                }
            }
        });
    }

    fn collect_finished(&mut self) {
        while let Some(Some(joined)) = self.in_flight.join_next().now_or_never() {
            self.finished(joined);
        }
    }

    fn finished(&mut self, joined: Result<CommandResult, JoinError>) {
        match joined {
            Ok(result) => {
                tracing::info!(
                    command_id = %result.command_id,
                    status = ?result.status,
                    exit_code = ?result.exit_code,
                    duration_ms = result.duration_ms,
                    "Command finished"
                );
                self.outbox.push(result);
            }
            Err(e) => tracing::error!("Command task aborted: {}", e),
        }
        self.launch_queued();
    }

    /// Report pending results, plus a snapshot when a heartbeat is due.
    async fn flush(&mut self, token: &SessionToken, stop: &CancellationToken) -> crate::error::Result<()> {
        let heartbeat_due = Instant::now() >= self.next_heartbeat;
        if self.outbox.is_empty() && !heartbeat_due {
            return Ok(());
        }

        self.state.write().await.pending_results = self.outbox.len();
        let snapshot = if heartbeat_due {
            Some(self.reporter.snapshot().await)
        } else {
            None
        };

        let ack = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            ack = self.backend.report(token, self.outbox.pending(), snapshot.as_ref()) => ack?,
        };

        let sent = self.outbox.len();
        let delivered = self.outbox.acknowledge(&ack.accepted);
        for id in &ack.rejected {
            match self.outbox.reject(id, self.settings.max_rejections) {
                Some(dropped) => tracing::error!(
                    command_id = %dropped.command_id,
                    attempts = self.settings.max_rejections,
                    "Backend keeps rejecting result; giving up"
                ),
                None => tracing::warn!(command_id = %id, "Backend rejected result; retrying next cycle"),
            }
        }
        if delivered + ack.rejected.len() < sent {
            tracing::debug!(delivered, sent, "Partial report; remaining results retried next cycle");
        }
        if ack.status_delivered {
            self.next_heartbeat = Instant::now() + self.settings.heartbeat_interval;
        }
        self.state.write().await.pending_results = self.outbox.len();
        Ok(())
    }

    /// Wait out `delay`, reporting results as commands complete.
    ///
    /// Returns true when `stop` fired.
    async fn idle(&mut self, delay: Duration, stop: &CancellationToken) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return true,
                _ = tokio::time::sleep_until(deadline) => return false,
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.finished(joined);
                    self.collect_finished();
                    if let Some(token) = self.token.clone() {
                        if let Err(e) = self.flush(&token, stop).await {
                            self.connection_failed("report", &e).await;
                        }
                    }
                }
                _ = self.failures.notified() => {
                    tracing::info!("Supervised process failed; sending status early");
                    self.next_heartbeat = Instant::now();
                    return false;
                }
            }
        }
    }

    async fn drain(&mut self) {
        if !self.in_flight.is_empty() || !self.queued.is_empty() {
            tracing::info!(
                in_flight = self.in_flight.len(),
                queued = self.queued.len(),
                "Stopping: waiting for accepted commands"
            );
        }
        self.launch_queued();
        while let Some(joined) = self.in_flight.join_next().await {
            self.finished(joined);
        }

        if !self.outbox.is_empty() {
            self.final_flush().await;
        }
        if !self.outbox.is_empty() {
            for result in self.outbox.pending() {
                tracing::warn!(command_id = %result.command_id, "Result not delivered before shutdown");
            }
        }

        self.dispatcher.supervisor().shutdown().await;

        let mut state = self.state.write().await;
        state.phase = ConnectionPhase::Disconnected;
        state.pending_results = self.outbox.len();
    }

    async fn final_flush(&mut self) {
        let backend = self.backend.clone();
        let bridge_key = self.settings.key.current().unwrap_or_default();
        let existing = self.token.clone();
        let pending = self.outbox.pending().to_vec();

        let attempt = async move {
            let token = match existing {
                Some(token) => token,
                None => backend.authenticate(&bridge_key).await?,
            };
            backend.report(&token, &pending, None).await
        };

        match tokio::time::timeout(self.settings.flush_timeout, attempt).await {
            Ok(Ok(ack)) => {
                let delivered = self.outbox.acknowledge(&ack.accepted);
                tracing::info!(delivered, "Flushed results before shutdown");
            }
            Ok(Err(e)) => tracing::warn!("Final flush failed: {}", e),
            Err(_) => tracing::warn!(
                timeout_secs = self.settings.flush_timeout.as_secs(),
                "Final flush timed out"
            ),
        }
    }
}

/// Hand output chunks to the backend until the sender is dropped.
/// Delivery is best-effort.
async fn forward_chunks(
    backend: Arc<dyn BridgeBackend>,
    token: SessionToken,
    id: CommandId,
    mut rx: mpsc::Receiver<OutputChunk>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = backend.stream(&token, &id, &chunk).await {
            tracing::debug!(command_id = %id, "Stream chunk dropped: {}", e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
