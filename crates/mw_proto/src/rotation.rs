//! Key-rotation announcement.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationKind {
    KeyRotationNotification,
}

/// Sent after a local re-key so the peer can mirror the rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRotationNotice {
    pub session_id: String,
    pub sender_id: String,
    /// Base64url X25519 ratchet public key
    pub new_ratchet_public_key: String,
    #[serde(rename = "type")]
    pub kind: RotationKind,
}

impl KeyRotationNotice {
    pub fn new(session_id: &str, sender_id: &str, new_ratchet_public_key: String) -> Self {
        Self {
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            new_ratchet_public_key,
            kind: RotationKind::KeyRotationNotification,
        }
    }
}
