//! Priority Bridge - local control-plane worker
//!
//! Connects an operator's machine to a remote orchestration backend,
//! executes the commands the backend issues under safety and resource
//! limits, supervises long-running agent and model-server processes, and
//! reports results and status back.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        BridgeSession                         │
//! │   authenticate → poll → dispatch → report → sleep / backoff  │
//! └───────┬──────────────────────┬──────────────────────┬────────┘
//!         │ shell                │ agent lifecycle      │ model op
//! ┌───────▼────────┐    ┌────────▼─────────┐    ┌───────▼────────┐
//! │ CommandExecutor│    │ ProcessSupervisor│◄───┤  ModelManager  │
//! │  SafetyGuard   │    │  tick / restart  │    │ download/infer │
//! │  OutputCapture │    │  backoff / fail  │    │ serve / stop   │
//! └────────────────┘    └────────┬─────────┘    └────────────────┘
//!                                │
//!                       ┌────────▼─────────┐
//!                       │  StatusReporter  │ → heartbeats, GET /status
//!                       └──────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Shell commands matching the deny-list are rejected before any process
//!   is spawned.
//! - Every command produces exactly one result, kept until the backend
//!   acknowledges its `command_id` (at-least-once delivery).
//! - A logical id maps to at most one supervised process; liveness is
//!   re-checked on every supervision tick.
//! - Network failures degrade the connection and back off; they never end
//!   the process.

pub mod bridge;
pub mod command;
pub mod config;
pub mod error;
pub mod exec;
pub mod guard;
pub mod models;
pub mod status;
pub mod supervisor;

/// Agent version reported to the backend
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bridge::{BridgeBackend, BridgeSession, ConnectionPhase, ConnectionState, HttpBackend};
pub use command::{Command, CommandId, CommandKind, CommandResult, CommandStatus};
pub use config::{BridgeConfig, ConfigStore, KeySource};
pub use error::{Error, Result};
pub use exec::{CommandExecutor, OutputCapture};
pub use guard::SafetyGuard;
pub use status::{StatusReporter, StatusSnapshot};
pub use supervisor::{ProcessSupervisor, SupervisedProcess};
