//! Local command execution
//!
//! `OutputCapture` runs one external process under a wall-clock limit and
//! a combined output cap. `CommandExecutor` is the trust boundary: every
//! externally issued shell command passes the safety guard there before a
//! process is spawned.

pub mod capture;
pub mod executor;

pub use capture::{CaptureLimits, CaptureOutcome, OutputCapture, OutputChunk, OutputStream};
pub use executor::CommandExecutor;
