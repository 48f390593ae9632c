//! Status reporting
//!
//! `StatusReporter` aggregates connection state, supervised processes and
//! system facts into a snapshot for heartbeats and local inspection. Slow
//! facts are cached and refreshed in the background.

pub mod diagnostics;
pub mod http;
pub mod reporter;

pub use diagnostics::{Check, CheckStatus, DiagnosticReport, GpuInfo};
pub use reporter::{FactsConfig, StatusReporter, StatusSnapshot, SystemFacts};
