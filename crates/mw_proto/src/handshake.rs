//! Handshake wire messages.
//!
//! Four strictly ordered phases per session:
//!   1. `x3dh_init`                   initiator → responder  (key bundle)
//!   2. `x3dh_response`               responder → initiator  (key bundle)
//!   3. `ratchet_init_from_initiator` initiator → responder  (ratchet key)
//!   4. `ratchet_init_from_responder` responder → initiator  (ratchet key)
//!
//! The initiator always sends its ratchet key first — a deterministic
//! order that avoids both sides waiting on each other.

use serde::{Deserialize, Serialize};

use mw_crypto::keys::PublicKeyBundle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePhase {
    X3dhInit,
    X3dhResponse,
    RatchetInitFromInitiator,
    RatchetInitFromResponder,
}

/// Key material carried by a handshake message: a full public-key bundle
/// for the x3dh phases, a single base64url ratchet key for the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandshakePayload {
    Keys(PublicKeyBundle),
    RatchetKey(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub session_id: String,
    pub sender_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub phase: HandshakePhase,
    pub message: HandshakePayload,
}

impl HandshakeMessage {
    pub fn x3dh_init(
        session_id: &str,
        sender_id: &str,
        target_id: &str,
        keys: PublicKeyBundle,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            target_id: target_id.into(),
            phase: HandshakePhase::X3dhInit,
            message: HandshakePayload::Keys(keys),
        }
    }

    pub fn x3dh_response(
        session_id: &str,
        sender_id: &str,
        target_id: &str,
        keys: PublicKeyBundle,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            target_id: target_id.into(),
            phase: HandshakePhase::X3dhResponse,
            message: HandshakePayload::Keys(keys),
        }
    }

    pub fn ratchet_init(
        session_id: &str,
        sender_id: &str,
        target_id: &str,
        phase: HandshakePhase,
        ratchet_key: String,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            target_id: target_id.into(),
            phase,
            message: HandshakePayload::RatchetKey(ratchet_key),
        }
    }

    /// Key bundle, if this is an x3dh phase.
    pub fn keys(&self) -> Option<&PublicKeyBundle> {
        match &self.message {
            HandshakePayload::Keys(bundle) => Some(bundle),
            HandshakePayload::RatchetKey(_) => None,
        }
    }

    /// Ratchet key, if this is a ratchet phase.
    pub fn ratchet_key(&self) -> Option<&str> {
        match &self.message {
            HandshakePayload::RatchetKey(key) => Some(key),
            HandshakePayload::Keys(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_tags_are_wire_stable() {
        let tags = [
            (HandshakePhase::X3dhInit, "\"x3dh_init\""),
            (HandshakePhase::X3dhResponse, "\"x3dh_response\""),
            (
                HandshakePhase::RatchetInitFromInitiator,
                "\"ratchet_init_from_initiator\"",
            ),
            (
                HandshakePhase::RatchetInitFromResponder,
                "\"ratchet_init_from_responder\"",
            ),
        ];
        for (phase, expected) in tags {
            assert_eq!(serde_json::to_string(&phase).unwrap(), expected);
        }
    }

    #[test]
    fn x3dh_message_roundtrip() {
        let msg = HandshakeMessage::x3dh_init(
            "s1",
            "alice",
            "bob",
            PublicKeyBundle {
                identity: "aWRlbnRpdHk".into(),
                ephemeral: "ZXBoZW1lcmFs".into(),
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"x3dh_init\""));
        let back: HandshakeMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phase, HandshakePhase::X3dhInit);
        assert!(back.keys().is_some());
        assert!(back.ratchet_key().is_none());
    }

    #[test]
    fn ratchet_message_roundtrip() {
        let msg = HandshakeMessage::ratchet_init(
            "s1",
            "bob",
            "alice",
            HandshakePhase::RatchetInitFromResponder,
            "cmF0Y2hldA".into(),
        );
        let back: HandshakeMessage =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(back.ratchet_key(), Some("cmF0Y2hldA"));
        assert!(back.keys().is_none());
    }
}
