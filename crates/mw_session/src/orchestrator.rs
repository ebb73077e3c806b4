//! Session lifecycle orchestration.
//!
//! Owns every live session, drives the 4-step handshake over the
//! transport, queues outbound plaintext until READY, and converts
//! protocol failures into state transitions — never into panics or
//! exceptions surfaced to callers.
//!
//! # State machine
//!
//!   INITIALIZING → KEY_EXCHANGE → READY
//!
//! ERROR and CLOSED are reachable from any state; CLOSED is terminal.
//! A retriable failure (timeout, transport) re-enters KEY_EXCHANGE with
//! exponential backoff up to a bounded retry count; anything else, or an
//! exhausted retry budget, settles in ERROR and the session is torn down
//! after a grace delay.
//!
//! # Concurrency
//!
//! Session creation is single-flight: an in-flight registry maps each id
//! to a shared `OnceCell`, so concurrent `create_session` calls for one
//! id construct exactly one engine. Each session's state lives behind its
//! own lock; the orchestrator never holds a session lock across a
//! transport emit or a queued send action.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use mw_crypto::engine::{Role, SessionCrypto};
use mw_proto::{
    events, CipherMessage, HandshakeMessage, HandshakePhase, KeyRotationNotice,
};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::queue::{MessageQueue, SendAction};
use crate::session::{Session, SessionState, SessionStats};
use crate::store::{SessionRecord, SessionStore};
use crate::transport::Transport;

type SharedSession = Arc<Mutex<Session>>;
type CreateCell = Arc<OnceCell<Result<(), SessionError>>>;

/// What `send_message` did with the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The session was READY; the send action ran immediately.
    Sent,
    /// Queued until READY; carries the queue entry id.
    Queued(String),
}

#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    sessions: Mutex<HashMap<String, SharedSession>>,
    /// Single-flight registry: one in-flight construction per id.
    inflight: Mutex<HashMap<String, CreateCell>>,
}

impl SessionOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                store,
                sessions: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_defaults(transport: Arc<dyn Transport>, store: Arc<dyn SessionStore>) -> Self {
        Self::new(transport, store, SessionConfig::default())
    }

    // ── Session creation ─────────────────────────────────────────────────

    /// Create (or join the in-flight creation of) a session.
    ///
    /// Idempotent: concurrent calls for the same id collapse onto one
    /// construction and share its result. A prior session in ERROR or
    /// CLOSED is torn down first, with a settle delay before the engine
    /// is reinitialised.
    pub async fn create_session(
        &self,
        session_id: &str,
        local_id: &str,
        is_initiator: bool,
        partner_id: &str,
    ) -> Result<(), SessionError> {
        let cell = {
            let mut inflight = self.inner.inflight.lock().await;
            inflight
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| self.construct_session(session_id, local_id, is_initiator, partner_id))
            .await
            .clone();

        // Retire the registry entry once resolved so a later create (for
        // example after close) constructs anew.
        {
            let mut inflight = self.inner.inflight.lock().await;
            if let Some(existing) = inflight.get(session_id) {
                if Arc::ptr_eq(existing, &cell) {
                    inflight.remove(session_id);
                }
            }
        }

        result
    }

    async fn construct_session(
        &self,
        session_id: &str,
        local_id: &str,
        is_initiator: bool,
        partner_id: &str,
    ) -> Result<(), SessionError> {
        let prior = {
            let sessions = self.inner.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        if let Some(prior) = prior {
            let dead = { prior.lock().await.state.is_dead() };
            if dead {
                debug!(session_id, "tearing down dead session before reinitialising");
                self.teardown(session_id, &prior).await;
                sleep(self.inner.config.recreate_settle).await;
            } else {
                debug!(session_id, "session already live; create is a no-op");
                return Ok(());
            }
        }

        // Metadata-only resume: keys never survive, so any resumed record
        // still goes through a full key exchange.
        match self.inner.store.load(session_id).await {
            Ok(Some(record)) => info!(
                session_id,
                resumed_state = ?record.state,
                "found persisted session record; forcing fresh key exchange"
            ),
            Ok(None) => {}
            Err(err) => warn!(session_id, %err, "session store load failed; continuing fresh"),
        }

        let engine = SessionCrypto::generate()
            .map_err(|e| SessionError::Initialization(e.to_string()))?;
        let role = if is_initiator {
            Role::Initiator
        } else {
            Role::Responder
        };
        let (state_tx, _) = tokio::sync::watch::channel(SessionState::Initializing);
        let session = Session {
            id: session_id.to_string(),
            local_id: local_id.to_string(),
            partner_id: partner_id.to_string(),
            role,
            state: SessionState::Initializing,
            created_at: Instant::now(),
            created_at_utc: Utc::now(),
            engine,
            queue: MessageQueue::new(self.inner.config.queue_capacity),
            retry_count: 0,
            decrypt_failures: 0,
            handshake_epoch: 0,
            messages_sent: 0,
            messages_received: 0,
            last_rotation: None,
            state_tx,
        };
        let shared = Arc::new(Mutex::new(session));
        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.insert(session_id.to_string(), shared.clone());
        }

        let created_at_utc = {
            let mut s = shared.lock().await;
            s.set_state(SessionState::KeyExchange);
            s.created_at_utc
        };
        self.persist_state(session_id, SessionState::KeyExchange, created_at_utc)
            .await;
        info!(session_id, is_initiator, partner_id, "session created; entering key exchange");

        // Kick the protocol off without blocking the creator: handshake
        // progress and failures are handled asynchronously.
        let this = self.clone();
        let shared_bg = shared.clone();
        tokio::spawn(async move {
            if is_initiator {
                if let Err(err) = this.start_key_exchange(shared_bg.clone()).await {
                    this.handle_session_failure(shared_bg, err).await;
                }
            } else {
                // Responder: arm the step watchdog while waiting for
                // x3dh_init.
                let epoch = {
                    let mut s = shared_bg.lock().await;
                    s.handshake_epoch += 1;
                    s.handshake_epoch
                };
                this.arm_step_watchdog(shared_bg, epoch);
            }
        });

        Ok(())
    }

    /// Initiator side: publish our key bundle and wait for x3dh_response.
    async fn start_key_exchange(&self, shared: SharedSession) -> Result<(), SessionError> {
        let (msg, epoch) = {
            let mut s = shared.lock().await;
            if s.state != SessionState::KeyExchange {
                return Ok(());
            }
            let bundle = s
                .engine
                .public_keys()
                .map_err(|e| SessionError::Handshake(e.to_string()))?;
            s.handshake_epoch += 1;
            (
                HandshakeMessage::x3dh_init(&s.id, &s.local_id, &s.partner_id, bundle),
                s.handshake_epoch,
            )
        };
        self.emit_handshake(&msg).await?;
        self.arm_step_watchdog(shared, epoch);
        Ok(())
    }

    // ── Inbound protocol steps ───────────────────────────────────────────

    /// Feed one handshake message from the transport subscription.
    pub async fn handle_handshake_message(
        &self,
        msg: HandshakeMessage,
    ) -> Result<(), SessionError> {
        // The message may have raced ahead of create_session: wait
        // briefly for the session to appear.
        let shared = self
            .await_session_entry(&msg.session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(msg.session_id.clone()))?;

        let result = match msg.phase {
            HandshakePhase::X3dhInit => self.on_x3dh_init(&shared, &msg).await,
            HandshakePhase::X3dhResponse => self.on_x3dh_response(&shared, &msg).await,
            HandshakePhase::RatchetInitFromInitiator => {
                self.on_ratchet_from_initiator(&shared, &msg).await
            }
            HandshakePhase::RatchetInitFromResponder => {
                self.on_ratchet_from_responder(&shared, &msg).await
            }
        };

        if let Err(err) = result {
            self.handle_session_failure(shared, err.clone()).await;
            return Err(err);
        }
        Ok(())
    }

    /// Responder receives the initiator's bundle, runs its half of the
    /// DH agreement and answers with its own bundle.
    async fn on_x3dh_init(
        &self,
        shared: &SharedSession,
        msg: &HandshakeMessage,
    ) -> Result<(), SessionError> {
        let bundle = msg
            .keys()
            .ok_or_else(|| SessionError::Handshake("x3dh_init without key bundle".into()))?;

        let (reply, watchdog) = {
            let mut s = shared.lock().await;
            if s.state == SessionState::Closed {
                return Err(SessionError::Closed(s.id.clone()));
            }
            if s.role != Role::Responder {
                debug!(session_id = %s.id, "x3dh_init at initiator ignored");
                return Ok(());
            }
            if s.engine.has_root_key() {
                // The initiator's retry path restarts from x3dh_init, so a
                // repeat means our earlier x3dh_response was lost. Answer
                // again (the bundle is unchanged) instead of stalling the
                // exchange.
                debug!(session_id = %s.id, "repeated x3dh_init; re-sending x3dh_response");
            } else {
                s.engine
                    .perform_handshake(bundle, Role::Responder)
                    .map_err(|e| SessionError::Handshake(e.to_string()))?;
            }
            let own = s
                .engine
                .public_keys()
                .map_err(|e| SessionError::Handshake(e.to_string()))?;
            s.handshake_epoch += 1;
            let watchdog = (s.state == SessionState::KeyExchange).then_some(s.handshake_epoch);
            (
                HandshakeMessage::x3dh_response(&s.id, &s.local_id, &s.partner_id, own),
                watchdog,
            )
        };
        self.emit_handshake(&reply).await?;
        if let Some(epoch) = watchdog {
            self.arm_step_watchdog(shared.clone(), epoch);
        }
        Ok(())
    }

    /// Initiator receives the responder's bundle, completes the DH
    /// agreement and leads the ratchet exchange — the initiator always
    /// sends its ratchet key first, fixing a deterministic order.
    async fn on_x3dh_response(
        &self,
        shared: &SharedSession,
        msg: &HandshakeMessage,
    ) -> Result<(), SessionError> {
        let bundle = msg
            .keys()
            .ok_or_else(|| SessionError::Handshake("x3dh_response without key bundle".into()))?;

        let (reply, epoch) = {
            let mut s = shared.lock().await;
            if s.state == SessionState::Closed {
                return Err(SessionError::Closed(s.id.clone()));
            }
            if s.role != Role::Initiator {
                debug!(session_id = %s.id, "x3dh_response at responder ignored");
                return Ok(());
            }
            if s.engine.has_root_key() {
                if s.state != SessionState::KeyExchange {
                    debug!(session_id = %s.id, "duplicate x3dh_response ignored");
                    return Ok(());
                }
                // Still mid-exchange on a repeat: our ratchet_init reply
                // was lost, or the responder's phase-4 answer to it was.
                // Re-send phase 3 rather than stalling.
                debug!(session_id = %s.id, "repeated x3dh_response; re-sending ratchet key");
            } else {
                s.engine
                    .perform_handshake(bundle, Role::Initiator)
                    .map_err(|e| SessionError::Handshake(e.to_string()))?;
            }
            let ratchet_key = s
                .engine
                .ratchet_public_key()
                .map_err(|e| SessionError::Handshake(e.to_string()))?;
            s.handshake_epoch += 1;
            (
                HandshakeMessage::ratchet_init(
                    &s.id,
                    &s.local_id,
                    &s.partner_id,
                    HandshakePhase::RatchetInitFromInitiator,
                    ratchet_key,
                ),
                s.handshake_epoch,
            )
        };
        self.emit_handshake(&reply).await?;
        self.arm_step_watchdog(shared.clone(), epoch);
        Ok(())
    }

    /// Responder installs the initiator's ratchet key, answers with its
    /// own, and is READY — it already holds both keys its chains need.
    async fn on_ratchet_from_initiator(
        &self,
        shared: &SharedSession,
        msg: &HandshakeMessage,
    ) -> Result<(), SessionError> {
        let key = msg
            .ratchet_key()
            .ok_or_else(|| SessionError::Handshake("ratchet init without key".into()))?;

        let reply = {
            let mut s = shared.lock().await;
            if s.state == SessionState::Closed {
                return Err(SessionError::Closed(s.id.clone()));
            }
            if s.role != Role::Responder {
                debug!(session_id = %s.id, "initiator ratchet key at initiator ignored");
                return Ok(());
            }
            if s.state == SessionState::Ready {
                // Replayed phase 3 after the session went READY: the key
                // it carries may predate a rotation, so it must not be
                // reinstalled. Only the lost phase-4 reply is re-sent.
                debug!(session_id = %s.id, "repeated initiator ratchet key; re-sending reply only");
            } else {
                s.engine
                    .install_partner_ratchet(key)
                    .map_err(|e| SessionError::Handshake(e.to_string()))?;
                s.handshake_epoch += 1;
            }
            let own = s
                .engine
                .ratchet_public_key()
                .map_err(|e| SessionError::Handshake(e.to_string()))?;
            HandshakeMessage::ratchet_init(
                &s.id,
                &s.local_id,
                &s.partner_id,
                HandshakePhase::RatchetInitFromResponder,
                own,
            )
        };
        // Re-sent on duplicates too: if our earlier reply was lost, the
        // initiator re-sends phase 3 and needs phase 4 again.
        self.emit_handshake(&reply).await?;
        self.enter_ready(shared).await;
        Ok(())
    }

    /// Initiator installs the responder's ratchet key — handshake done.
    async fn on_ratchet_from_responder(
        &self,
        shared: &SharedSession,
        msg: &HandshakeMessage,
    ) -> Result<(), SessionError> {
        let key = msg
            .ratchet_key()
            .ok_or_else(|| SessionError::Handshake("ratchet init without key".into()))?;

        {
            let mut s = shared.lock().await;
            if s.state == SessionState::Closed {
                return Err(SessionError::Closed(s.id.clone()));
            }
            if s.role != Role::Initiator {
                debug!(session_id = %s.id, "responder ratchet key at responder ignored");
                return Ok(());
            }
            if s.state == SessionState::Ready {
                debug!(session_id = %s.id, "duplicate responder ratchet key ignored");
                return Ok(());
            }
            s.engine
                .install_partner_ratchet(key)
                .map_err(|e| SessionError::Handshake(e.to_string()))?;
            s.handshake_epoch += 1;
        }
        self.enter_ready(shared).await;
        Ok(())
    }

    /// First entry into READY: wake waiters, persist, drain the queue.
    async fn enter_ready(&self, shared: &SharedSession) {
        let (session_id, created_at_utc, first) = {
            let mut s = shared.lock().await;
            let first = s.state != SessionState::Ready;
            if first {
                s.retry_count = 0;
                s.set_state(SessionState::Ready);
            }
            (s.id.clone(), s.created_at_utc, first)
        };
        if !first {
            return;
        }
        info!(session_id, "session ready");
        self.persist_state(&session_id, SessionState::Ready, created_at_utc)
            .await;
        self.drain_queue(shared.clone()).await;
    }

    /// Drain queued messages strictly FIFO with pacing. Over-age entries
    /// are discarded; per-entry failures are logged and never halt the
    /// rest of the queue.
    async fn drain_queue(&self, shared: SharedSession) {
        loop {
            let entry = {
                let mut s = shared.lock().await;
                if s.state != SessionState::Ready {
                    break;
                }
                let expired = s.queue.prune_expired(Instant::now());
                if expired > 0 {
                    debug!(session_id = %s.id, expired, "dropped expired queued messages");
                }
                s.queue.pop()
            };
            let Some(entry) = entry else { break };

            if entry.queued_at.elapsed() > self.inner.config.drain_max_age {
                debug!(entry_id = %entry.id, "discarding over-age queued message at drain");
                continue;
            }
            if let Err(err) = (entry.action)().await {
                warn!(entry_id = %entry.id, %err, "queued send failed; continuing drain");
            }
            sleep(self.inner.config.drain_pacing).await;
        }
    }

    // ── Messaging ────────────────────────────────────────────────────────

    /// Encrypt under the session's sending chain. Pre-READY sessions
    /// report `EncryptionUnavailable` — callers queue via `send_message`.
    pub async fn encrypt_message(
        &self,
        session_id: &str,
        plaintext: &str,
    ) -> Result<CipherMessage, SessionError> {
        let shared = self.get(session_id).await?;
        let op = async {
            let mut s = shared.lock().await;
            if s.state != SessionState::Ready {
                return Err(SessionError::EncryptionUnavailable(session_id.to_string()));
            }
            let sealed = s
                .engine
                .encrypt(plaintext.as_bytes())
                .map_err(|_| SessionError::EncryptionUnavailable(session_id.to_string()))?;
            s.messages_sent += 1;
            Ok(CipherMessage::from_sealed(&sealed, &s.local_id))
        };
        timeout(self.inner.config.crypto_op_timeout, op)
            .await
            .map_err(|_| SessionError::Timeout("encryption"))?
    }

    /// Decrypt an inbound ciphertext. Failures are uniform and never
    /// retried per message; a run of consecutive failures past the
    /// threshold marks the session ERROR (unrecoverable ratchet desync).
    pub async fn decrypt_message(
        &self,
        session_id: &str,
        msg: &CipherMessage,
    ) -> Result<String, SessionError> {
        let shared = self.get(session_id).await?;
        let op = async {
            let mut s = shared.lock().await;
            if s.state != SessionState::Ready {
                return Err(SessionError::EncryptionUnavailable(session_id.to_string()));
            }
            let ciphertext = msg
                .ciphertext_bytes()
                .map_err(|_| SessionError::Decryption)?;
            let nonce = msg.nonce_bytes().map_err(|_| SessionError::Decryption)?;
            match s.engine.decrypt(&ciphertext, &nonce, msg.counter) {
                Ok(plaintext) => {
                    s.decrypt_failures = 0;
                    s.messages_received += 1;
                    String::from_utf8(plaintext).map_err(|_| SessionError::Decryption)
                }
                Err(_) => {
                    s.decrypt_failures += 1;
                    let desynced =
                        s.decrypt_failures >= self.inner.config.decrypt_failure_threshold;
                    drop(s);
                    if desynced {
                        warn!(session_id, "consecutive decryption failures exceeded threshold");
                        self.fail_terminal(shared.clone(), SessionError::Decryption)
                            .await;
                    }
                    Err(SessionError::Decryption)
                }
            }
        };
        timeout(self.inner.config.crypto_op_timeout, op)
            .await
            .map_err(|_| SessionError::Timeout("decryption"))?
    }

    /// Run `action` now if the session is READY, otherwise queue it with
    /// the plaintext until the handshake completes.
    pub async fn send_message(
        &self,
        session_id: &str,
        content: &str,
        action: SendAction,
    ) -> Result<SendOutcome, SessionError> {
        let shared = self.get(session_id).await?;
        let mut s = shared.lock().await;
        if s.state.is_dead() {
            return Err(SessionError::Closed(session_id.to_string()));
        }
        // One lock for the check and the push: the drain loop takes the
        // same lock, so a push can never land just after the final drain
        // pass and be stranded in the queue.
        if s.state == SessionState::Ready {
            drop(s);
            action().await?;
            return Ok(SendOutcome::Sent);
        }

        let (entry_id, evicted) = s.queue.push(
            content.to_string(),
            self.inner.config.queued_message_expiry,
            action,
        );
        if let Some(dropped) = evicted {
            debug!(session_id, dropped_entry = %dropped, "queue overflow; dropped oldest entry");
        }
        debug!(session_id, entry_id = %entry_id, queued = s.queue.len(), "message queued until ready");
        Ok(SendOutcome::Queued(entry_id))
    }

    /// Whether a message would be sent immediately (session READY).
    pub async fn can_send_message(&self, session_id: &str) -> bool {
        match self.get(session_id).await {
            Ok(shared) => shared.lock().await.state == SessionState::Ready,
            Err(_) => false,
        }
    }

    pub async fn is_session_ready(&self, session_id: &str) -> bool {
        self.can_send_message(session_id).await
    }

    /// Block until the session reaches READY, fails, or the wait times
    /// out (`config.ready_wait_timeout` when `wait` is `None`).
    pub async fn wait_for_session(
        &self,
        session_id: &str,
        wait: Option<Duration>,
    ) -> Result<(), SessionError> {
        let shared = self.get(session_id).await?;
        let mut rx = {
            let s = shared.lock().await;
            match s.state {
                SessionState::Ready => return Ok(()),
                SessionState::Error | SessionState::Closed => {
                    return Err(SessionError::Closed(session_id.to_string()))
                }
                _ => s.state_tx.subscribe(),
            }
        };

        let deadline = wait.unwrap_or(self.inner.config.ready_wait_timeout);
        timeout(deadline, async {
            loop {
                rx.changed()
                    .await
                    .map_err(|_| SessionError::Closed(session_id.to_string()))?;
                match *rx.borrow() {
                    SessionState::Ready => return Ok(()),
                    SessionState::Error | SessionState::Closed => {
                        return Err(SessionError::Closed(session_id.to_string()))
                    }
                    _ => {}
                }
            }
        })
        .await
        .map_err(|_| SessionError::Timeout("session ready"))?
    }

    // ── Key rotation ─────────────────────────────────────────────────────

    /// Re-key the session and announce the new ratchet public key.
    pub async fn rotate_session_keys(&self, session_id: &str) -> Result<(), SessionError> {
        let shared = self.get(session_id).await?;
        let notice = {
            let mut s = shared.lock().await;
            if s.state != SessionState::Ready {
                return Err(SessionError::EncryptionUnavailable(session_id.to_string()));
            }
            s.engine
                .rotate()
                .map_err(|e| SessionError::Handshake(e.to_string()))?;
            let key = s
                .engine
                .ratchet_public_key()
                .map_err(|e| SessionError::Handshake(e.to_string()))?;
            s.last_rotation = Some(Instant::now());
            KeyRotationNotice::new(&s.id, &s.local_id, key)
        };
        info!(session_id, "session keys rotated");
        let payload =
            serde_json::to_value(&notice).map_err(|e| SessionError::Transport(e.to_string()))?;
        self.emit_with_retry(events::KEY_ROTATION, payload).await
    }

    /// Mirror a partner-initiated rotation.
    pub async fn handle_rotation_notice(
        &self,
        notice: KeyRotationNotice,
    ) -> Result<(), SessionError> {
        let shared = self.get(&notice.session_id).await?;
        let mut s = shared.lock().await;
        if s.state != SessionState::Ready {
            return Err(SessionError::EncryptionUnavailable(notice.session_id.clone()));
        }
        s.engine
            .apply_partner_rotation(&notice.new_ratchet_public_key)
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        s.decrypt_failures = 0;
        s.last_rotation = Some(Instant::now());
        debug!(session_id = %notice.session_id, "applied partner key rotation");
        Ok(())
    }

    /// Rotation advice: enough messages on the current chain, or enough
    /// time since the last rotation (session creation counts as one).
    pub async fn should_rotate_keys(
        &self,
        session_id: &str,
        message_threshold: u64,
        time_threshold: Duration,
    ) -> Result<bool, SessionError> {
        let shared = self.get(session_id).await?;
        let s = shared.lock().await;
        if s.state != SessionState::Ready {
            return Ok(false);
        }
        let since = match s.last_rotation {
            Some(at) => at.elapsed(),
            None => s.created_at.elapsed(),
        };
        Ok(s.engine.send_counter() >= message_threshold || since >= time_threshold)
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// The only cancellation primitive. Fences the session CLOSED first,
    /// zeroizes key material, then removes the bookkeeping after a short
    /// grace so in-flight operations observe CLOSED. Idempotent.
    pub async fn close_session(&self, session_id: &str) -> Result<(), SessionError> {
        let shared = {
            let sessions = self.inner.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        let Some(shared) = shared else {
            debug!(session_id, "close for unknown session is a no-op");
            return Ok(());
        };
        {
            let mut s = shared.lock().await;
            if s.state == SessionState::Closed {
                debug!(session_id, "session already closed");
                return Ok(());
            }
            s.set_state(SessionState::Closed);
            s.engine.clear();
            s.queue.clear();
            s.handshake_epoch += 1;
        }
        if let Err(err) = self.inner.store.delete(session_id).await {
            warn!(session_id, %err, "failed to delete persisted session record");
        }
        sleep(self.inner.config.close_grace).await;
        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.remove(session_id);
        }
        {
            let mut inflight = self.inner.inflight.lock().await;
            inflight.remove(session_id);
        }
        info!(session_id, "session closed");
        Ok(())
    }

    /// Teardown used internally when replacing a dead session; same steps
    /// as `close_session` minus the idempotency short-circuit.
    async fn teardown(&self, session_id: &str, shared: &SharedSession) {
        {
            let mut s = shared.lock().await;
            s.set_state(SessionState::Closed);
            s.engine.clear();
            s.queue.clear();
            s.handshake_epoch += 1;
        }
        if let Err(err) = self.inner.store.delete(session_id).await {
            warn!(session_id, %err, "failed to delete persisted session record");
        }
        let mut sessions = self.inner.sessions.lock().await;
        sessions.remove(session_id);
    }

    // ── Diagnostics ──────────────────────────────────────────────────────

    pub async fn session_stats(&self, session_id: &str) -> Result<SessionStats, SessionError> {
        let shared = self.get(session_id).await?;
        let s = shared.lock().await;
        Ok(s.stats())
    }

    pub async fn active_session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Expire persisted records past the configured max age.
    pub async fn clear_expired_records(&self) -> Result<usize, SessionError> {
        self.inner
            .store
            .clear_expired(self.inner.config.record_max_age)
            .await
    }

    // ── Failure handling ─────────────────────────────────────────────────

    /// Route a protocol failure: retriable failures re-enter KEY_EXCHANGE
    /// with exponential backoff while the retry budget lasts; everything
    /// else settles in ERROR and is torn down after the grace delay.
    ///
    /// Boxed because the retry task awaits this function again when the
    /// re-attempt itself fails; without the indirection the future type
    /// would contain itself.
    fn handle_session_failure(
        &self,
        shared: SharedSession,
        err: SessionError,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.route_failure(shared, err))
    }

    async fn route_failure(&self, shared: SharedSession, err: SessionError) {
        let (session_id, retries, dead) = {
            let s = shared.lock().await;
            (s.id.clone(), s.retry_count, s.state.is_dead())
        };
        if dead {
            return;
        }

        if err.retriable() && retries < self.inner.config.max_handshake_retries {
            let delay = self.inner.config.retry_backoff_base * 2u32.pow(retries);
            {
                let mut s = shared.lock().await;
                s.retry_count += 1;
                s.handshake_epoch += 1;
            }
            warn!(
                session_id,
                %err,
                attempt = retries + 1,
                backoff_ms = delay.as_millis() as u64,
                "retriable session failure; scheduling key exchange retry"
            );
            let this = self.clone();
            tokio::spawn(async move {
                sleep(delay).await;
                let (proceed, role, epoch, created_at_utc) = {
                    let mut s = shared.lock().await;
                    // Only re-attempt a session still stuck in key
                    // exchange; one that reached READY in the meantime
                    // must not be knocked back.
                    if s.state != SessionState::KeyExchange {
                        (false, s.role, s.handshake_epoch, s.created_at_utc)
                    } else {
                        s.handshake_epoch += 1;
                        (true, s.role, s.handshake_epoch, s.created_at_utc)
                    }
                };
                if !proceed {
                    return;
                }
                let id = { shared.lock().await.id.clone() };
                this.persist_state(&id, SessionState::KeyExchange, created_at_utc)
                    .await;
                match role {
                    Role::Initiator => {
                        if let Err(retry_err) = this.start_key_exchange(shared.clone()).await {
                            this.handle_session_failure(shared, retry_err).await;
                        }
                    }
                    Role::Responder => this.arm_step_watchdog(shared, epoch),
                }
            });
        } else {
            self.fail_terminal(shared, err).await;
        }
    }

    /// Move to ERROR and schedule removal after the grace delay, leaving
    /// a window for final diagnostic reads.
    async fn fail_terminal(&self, shared: SharedSession, err: SessionError) {
        let (session_id, created_at_utc) = {
            let mut s = shared.lock().await;
            if s.state.is_dead() {
                return;
            }
            s.set_state(SessionState::Error);
            (s.id.clone(), s.created_at_utc)
        };
        warn!(session_id, %err, "session entered ERROR; teardown after grace delay");
        self.persist_state(&session_id, SessionState::Error, created_at_utc)
            .await;
        let this = self.clone();
        tokio::spawn(async move {
            sleep(this.inner.config.teardown_grace).await;
            let _ = this.close_session(&session_id).await;
        });
    }

    /// One bounded timer per expected handshake step. Stale timers (the
    /// epoch moved on, or the session left KEY_EXCHANGE) do nothing.
    fn arm_step_watchdog(&self, shared: SharedSession, epoch: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            sleep(this.inner.config.handshake_step_timeout).await;
            let stale = {
                let s = shared.lock().await;
                s.handshake_epoch != epoch || s.state != SessionState::KeyExchange
            };
            if stale {
                return;
            }
            this.handle_session_failure(shared, SessionError::Timeout("handshake step"))
                .await;
        });
    }

    // ── Internal plumbing ────────────────────────────────────────────────

    async fn get(&self, session_id: &str) -> Result<SharedSession, SessionError> {
        self.inner
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Bounded poll for a session that an inbound message raced ahead of.
    async fn await_session_entry(&self, session_id: &str) -> Option<SharedSession> {
        let attempts = self.inner.config.arrival_poll_attempts;
        for attempt in 0..attempts {
            {
                let sessions = self.inner.sessions.lock().await;
                if let Some(shared) = sessions.get(session_id) {
                    return Some(shared.clone());
                }
            }
            if attempt + 1 < attempts {
                sleep(self.inner.config.arrival_poll_interval).await;
            }
        }
        None
    }

    async fn emit_handshake(&self, msg: &HandshakeMessage) -> Result<(), SessionError> {
        let payload =
            serde_json::to_value(msg).map_err(|e| SessionError::Transport(e.to_string()))?;
        self.emit_with_retry(events::HANDSHAKE, payload).await
    }

    /// Outbound send with its own bounded retry, independent of the
    /// handshake retry budget.
    async fn emit_with_retry(&self, event: &str, payload: Value) -> Result<(), SessionError> {
        let attempts = self.inner.config.send_retry_attempts.max(1);
        let mut last = SessionError::Transport("no send attempted".into());
        for attempt in 0..attempts {
            match self.inner.transport.emit(event, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last = err;
                    if attempt + 1 < attempts {
                        let delay = self.inner.config.send_retry_base * 2u32.pow(attempt);
                        debug!(event, attempt, %last, "transport emit failed; backing off");
                        sleep(delay).await;
                    }
                }
            }
        }
        Err(last)
    }

    /// Best-effort metadata persistence on meaningful transitions.
    async fn persist_state(
        &self,
        session_id: &str,
        state: SessionState,
        created_at: DateTime<Utc>,
    ) {
        let record = SessionRecord {
            session_id: session_id.to_string(),
            state,
            created_at,
            updated_at: Utc::now(),
        };
        if let Err(err) = self.inner.store.save(record).await {
            warn!(session_id, %err, "failed to persist session record");
        }
    }
}
