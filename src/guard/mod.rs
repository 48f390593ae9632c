//! Command safety guard
//!
//! A fixed deny-list checked before any externally issued shell command is
//! executed. Unmatched commands are allowed: this is a deny-list, not a
//! sandbox.

pub mod denylist;

pub use denylist::{DenyCategory, GuardVerdict, SafetyGuard};
