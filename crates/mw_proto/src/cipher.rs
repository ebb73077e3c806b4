//! Encrypted application message.
//!
//! What the transport (and any relay behind it) sees: opaque ciphertext,
//! a nonce, the chain counter and the sender identity. Nothing else.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use mw_crypto::engine::SealedMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherMessage {
    /// Base64url ciphertext + tag
    pub encrypted: String,
    /// Base64url 24-byte nonce
    pub nonce: String,
    /// 1-based position in the sender's current chain
    pub counter: u64,
    pub sender_identity: String,
}

impl CipherMessage {
    pub fn from_sealed(sealed: &SealedMessage, sender_identity: &str) -> Self {
        Self {
            encrypted: URL_SAFE_NO_PAD.encode(&sealed.ciphertext),
            nonce: URL_SAFE_NO_PAD.encode(sealed.nonce),
            counter: sealed.counter,
            sender_identity: sender_identity.into(),
        }
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        URL_SAFE_NO_PAD.decode(&self.encrypted)
    }

    pub fn nonce_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        URL_SAFE_NO_PAD.decode(&self.nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_message_encoding_roundtrip() {
        let sealed = SealedMessage {
            ciphertext: vec![1, 2, 3, 4],
            nonce: [7u8; 24],
            counter: 3,
        };
        let msg = CipherMessage::from_sealed(&sealed, "alice");
        assert_eq!(msg.ciphertext_bytes().unwrap(), sealed.ciphertext);
        assert_eq!(msg.nonce_bytes().unwrap(), sealed.nonce);
        assert_eq!(msg.counter, 3);

        let back: CipherMessage =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(back.sender_identity, "alice");
    }
}
