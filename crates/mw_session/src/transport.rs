//! Transport collaborator seam.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SessionError;

/// Fire-and-forget pub/sub channel between the two matched parties.
///
/// No delivery or ordering guarantee is assumed; the orchestrator
/// compensates with per-step timeouts and bounded retries. The subscribe
/// half of the contract is the embedding application feeding inbound
/// events into `SessionOrchestrator::handle_handshake_message` and
/// `handle_rotation_notice`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn emit(&self, event: &str, payload: Value) -> Result<(), SessionError>;
}
