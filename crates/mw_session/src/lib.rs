//! mw_session — Matchwire session lifecycle orchestration
//!
//! Owns all live sessions, drives the 4-step handshake over an unreliable
//! transport, queues outbound plaintext until encryption is ready, and
//! retries transient failures with exponential backoff.
//!
//! # Module layout
//! - `orchestrator` — the caller-facing API and the protocol driver
//! - `session`      — one record per live session (state, engine, queue)
//! - `queue`        — bounded drop-oldest queue for pre-READY sends
//! - `transport`    — pub/sub collaborator seam
//! - `store`        — session-metadata persistence seam (never keys)
//! - `config`       — timeouts, bounds, retry policy
//! - `error`        — unified error type with explicit retriability

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod session;
pub mod store;
pub mod transport;

pub use config::SessionConfig;
pub use error::SessionError;
pub use orchestrator::{SendOutcome, SessionOrchestrator};
pub use session::{SessionState, SessionStats};
pub use store::{MemorySessionStore, SessionRecord, SessionStore};
pub use transport::Transport;
