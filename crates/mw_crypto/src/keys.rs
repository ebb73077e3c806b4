//! X25519 key material and the interoperable public-key representation.
//!
//! Every key pair in the protocol (identity, ephemeral, ratchet) is an
//! X25519 pair on Curve25519; the identity key participates in DH only,
//! there is no signing. Public keys cross the wire as base64url-no-pad
//! strings inside plain JSON objects, independent of any transport.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;

pub(crate) fn encode_key(key: &X25519Public) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

pub(crate) fn decode_key(s: &str) -> Result<X25519Public, CryptoError> {
    let bytes = URL_SAFE_NO_PAD.decode(s)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte X25519 key".into()))?;
    Ok(X25519Public::from(arr))
}

// ── Key pair ──────────────────────────────────────────────────────────────────

/// One X25519 key pair. The secret half zeroizes itself on drop
/// (`StaticSecret` carries its own zeroize-on-drop).
pub struct KeyPair {
    secret: StaticSecret,
    public: X25519Public,
}

impl KeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public(&self) -> &X25519Public {
        &self.public
    }

    pub fn public_b64(&self) -> String {
        encode_key(&self.public)
    }

    /// Raw 32-byte shared secret with a peer public key.
    pub fn diffie_hellman(&self, peer: &X25519Public) -> [u8; 32] {
        self.secret.diffie_hellman(peer).to_bytes()
    }
}

// ── Public key bundle ─────────────────────────────────────────────────────────

/// Public half of a session's handshake keys — identity + ephemeral.
/// This is exactly what the x3dh handshake phases carry on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    /// Base64url X25519 identity public key
    pub identity: String,
    /// Base64url X25519 ephemeral public key
    pub ephemeral: String,
}

impl PublicKeyBundle {
    pub fn identity_key(&self) -> Result<X25519Public, CryptoError> {
        decode_key(&self.identity)
    }

    pub fn ephemeral_key(&self) -> Result<X25519Public, CryptoError> {
        decode_key(&self.ephemeral)
    }

    /// Diagnostic fingerprint: BLAKE3 of the identity key, truncated to
    /// 20 bytes, hex-encoded in groups of 4 for display.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.identity.as_bytes());
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_roundtrip() {
        let pair = KeyPair::generate().unwrap();
        let encoded = pair.public_b64();
        let decoded = decode_key(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), pair.public().as_bytes());
    }

    #[test]
    fn rejects_wrong_length_keys() {
        assert!(decode_key("c2hvcnQ").is_err());
    }

    #[test]
    fn dh_is_commutative() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        assert_eq!(a.diffie_hellman(b.public()), b.diffie_hellman(a.public()));
    }

    #[test]
    fn fingerprint_is_stable_and_grouped() {
        let pair = KeyPair::generate().unwrap();
        let bundle = PublicKeyBundle {
            identity: pair.public_b64(),
            ephemeral: pair.public_b64(),
        };
        let fp = bundle.fingerprint();
        assert_eq!(fp, bundle.fingerprint());
        assert_eq!(fp.split(' ').count(), 10);
    }
}
