//! Backend bridge
//!
//! `BridgeSession` owns the connection to the remote backend: authenticate,
//! poll, dispatch, report, back off. The backend itself sits behind the
//! `BridgeBackend` trait, with `HttpBackend` as the production client.

pub mod backend;
pub mod backoff;
pub mod dispatch;
pub mod http;
pub mod outbox;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod mock;

pub use backend::{AgentInfo, BridgeBackend, ErrorReport, PollResponse, ReportAck, SessionToken};
pub use backoff::Backoff;
pub use dispatch::Dispatcher;
pub use http::HttpBackend;
pub use outbox::Outbox;
pub use session::{BridgeSession, SessionSettings};
pub use state::{ConnectionPhase, ConnectionState, SharedConnectionState};
