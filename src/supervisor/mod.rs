//! Supervised local processes
//!
//! Owns long-running agent runners and model servers: start, stop, status,
//! and a periodic tick that reconciles each entry against real process
//! liveness and applies the restart policy.
//!
//! ```text
//! stopped → starting → running ─┬→ crashed → restarting → starting
//!                               │      └→ failed (restart budget spent)
//!                               └→ stopping → stopped
//! ```
//!
//! `starting` becomes `running` on the first tick that finds the child
//! alive.

pub mod launcher;
pub mod manager;
pub mod types;

pub use launcher::{ConfiguredLauncher, LaunchSpec, WorkerLauncher};
pub use manager::ProcessSupervisor;
pub use types::{
    DesiredState, ObservedState, ProcessKind, RestartPolicy, StartOutcome, SupervisedProcess,
    SupervisorEvent,
};
