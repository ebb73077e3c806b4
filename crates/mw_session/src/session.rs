//! Per-session record.
//!
//! One struct per live session id, owned by one orchestrator map entry.
//! State, engine, queue, retry counters and ready-waiters all live here
//! together, so nothing can drift out of sync across separate maps.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use mw_crypto::engine::{Role, SessionCrypto};

use crate::queue::MessageQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    KeyExchange,
    Ready,
    Error,
    Closed,
}

impl SessionState {
    /// ERROR or CLOSED: no further protocol progress on this record.
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }
}

/// Snapshot exposed through `SessionOrchestrator::session_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub state: SessionState,
    pub is_initiator: bool,
    pub partner_id: String,
    pub age_secs: u64,
    pub queued_messages: usize,
    pub retry_count: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
}

pub(crate) struct Session {
    pub id: String,
    pub local_id: String,
    pub partner_id: String,
    pub role: Role,
    pub state: SessionState,
    pub created_at: Instant,
    pub created_at_utc: DateTime<Utc>,
    pub engine: SessionCrypto,
    pub queue: MessageQueue,
    pub retry_count: u32,
    pub decrypt_failures: u32,
    /// Bumped on every handshake step and retry; stale step watchdogs
    /// compare epochs before firing.
    pub handshake_epoch: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_rotation: Option<Instant>,
    /// Doubles as the ready-callback list: waiters subscribe, the first
    /// READY transition wakes them all.
    pub state_tx: watch::Sender<SessionState>,
}

impl Session {
    /// Transition the state machine. CLOSED is terminal: once set, every
    /// later transition is a no-op.
    pub fn set_state(&mut self, next: SessionState) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = next;
        self.state_tx.send_replace(next);
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id.clone(),
            state: self.state,
            is_initiator: self.role == Role::Initiator,
            partner_id: self.partner_id.clone(),
            age_secs: self.created_at.elapsed().as_secs(),
            queued_messages: self.queue.len(),
            retry_count: self.retry_count,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
        }
    }
}
