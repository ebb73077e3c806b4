//! Key derivation for the session engine.
//!
//! `derive_root_key`   — HKDF-SHA256 over the combined handshake secret.
//! `derive_chain_keys` — the two deterministic message chains under a root.
//! `mix_root_key`      — rotation: fold a fresh DH output into the root.
//! `chain_step`        — HMAC-SHA256 per-message step (Signal-style KDF_CK).
//!
//! All labels are domain-separated with the `mw-` protocol prefix; changing
//! any label is a wire-breaking protocol revision.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;

/// Protocol-wide HKDF salt.
const PROTOCOL_SALT: &[u8] = b"mw-handshake-v1";

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive the 32-byte root key from the byte-sorted, concatenated
/// handshake secrets.
pub fn derive_root_key(combined: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut key = [0u8; 32];
    hkdf_expand(combined, Some(PROTOCOL_SALT), b"mw-root-key", &mut key)?;
    Ok(key)
}

/// Derive the two message chains from a root key.
///
/// Chain A is the initiator's sending chain and the responder's receiving
/// chain; chain B is the mirror. Both parties derive the identical pair
/// and assign directions by role.
pub fn derive_chain_keys(root: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(PROTOCOL_SALT), root);
    let mut chain_a = [0u8; 32];
    let mut chain_b = [0u8; 32];
    hk.expand(b"mw-chain-a", &mut chain_a)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"mw-chain-b", &mut chain_b)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((chain_a, chain_b))
}

/// Rotation step: mix a fresh DH output into the existing root key.
/// Returns (new_root_key, chain_a, chain_b).
pub fn mix_root_key(
    root: &[u8; 32],
    dh_output: &[u8],
) -> Result<([u8; 32], [u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(root), dh_output);
    let mut new_root = [0u8; 32];
    let mut chain_a = [0u8; 32];
    let mut chain_b = [0u8; 32];
    hk.expand(b"mw-rotated-root", &mut new_root)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"mw-chain-a", &mut chain_a)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"mw-chain-b", &mut chain_b)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_root, chain_a, chain_b))
}

/// Per-message chain step: chain key → (next_chain_key, message_key).
///
/// HMAC with distinct constants, per the Signal KDF_CK construction. The
/// step is one-way: holding `next_chain_key` reveals nothing about the
/// chain key it was derived from.
pub fn chain_step(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac_ck = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x01]); // chain key derivation constant
    let next_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x02]); // message key derivation constant
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((next_ck, mk))
}
