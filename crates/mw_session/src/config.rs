//! Orchestrator tuning knobs.
//!
//! All timeouts are independent; none cancels another.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on each inbound handshake step.
    pub handshake_step_timeout: Duration,
    /// Bound on a single encrypt or decrypt operation.
    pub crypto_op_timeout: Duration,
    /// Default bound for `wait_for_session` when the caller passes none.
    pub ready_wait_timeout: Duration,

    /// Pre-READY queue capacity; overflow evicts the oldest entry.
    pub queue_capacity: usize,
    /// Per-entry lifetime while waiting in the queue.
    pub queued_message_expiry: Duration,
    /// Entries older than this at drain time are discarded, not sent.
    pub drain_max_age: Duration,
    /// Pause between entries while draining.
    pub drain_pacing: Duration,

    /// Handshake re-attempts before the session settles in ERROR.
    pub max_handshake_retries: u32,
    /// Exponential backoff base for handshake retries.
    pub retry_backoff_base: Duration,
    /// Attempts per outbound transport emit.
    pub send_retry_attempts: u32,
    /// Exponential backoff base for outbound emits.
    pub send_retry_base: Duration,

    /// Consecutive decryption failures that force ERROR (ratchet desync).
    pub decrypt_failure_threshold: u32,
    /// Delay between entering ERROR and removing the session, so final
    /// diagnostic reads still find it.
    pub teardown_grace: Duration,
    /// Delay between fencing a session CLOSED and dropping its
    /// bookkeeping, so in-flight operations observe CLOSED.
    pub close_grace: Duration,
    /// Settle delay between tearing down a dead session and reinitialising
    /// the same id.
    pub recreate_settle: Duration,

    /// Poll interval while waiting for a session that a handshake message
    /// raced ahead of.
    pub arrival_poll_interval: Duration,
    pub arrival_poll_attempts: u32,

    /// Age beyond which persisted session records are expired.
    pub record_max_age: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_step_timeout: Duration::from_secs(15),
            crypto_op_timeout: Duration::from_secs(5),
            ready_wait_timeout: Duration::from_secs(10),
            queue_capacity: 50,
            queued_message_expiry: Duration::from_secs(30),
            drain_max_age: Duration::from_secs(60),
            drain_pacing: Duration::from_millis(50),
            max_handshake_retries: 3,
            retry_backoff_base: Duration::from_millis(500),
            send_retry_attempts: 3,
            send_retry_base: Duration::from_millis(250),
            decrypt_failure_threshold: 5,
            teardown_grace: Duration::from_secs(3),
            close_grace: Duration::from_millis(150),
            recreate_settle: Duration::from_millis(100),
            arrival_poll_interval: Duration::from_millis(50),
            arrival_poll_attempts: 20,
            record_max_age: Duration::from_secs(3600),
        }
    }
}
