//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random, fresh per message).
//! Tag: 16 bytes.
//!
//! The nonce is returned separately from the ciphertext because the wire
//! format carries it as its own field next to the message counter.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    XChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 24;

/// Encrypt `plaintext` with a 32-byte message key and a fresh random nonce.
/// `aad` — additional associated data (authenticated but not encrypted).
pub fn encrypt(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::EncryptFailed)?;

    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            chacha20poly1305::aead::Payload { msg: plaintext, aad },
        )
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut nonce_out = [0u8; NONCE_LEN];
    nonce_out.copy_from_slice(&nonce);
    Ok((nonce_out, ciphertext))
}

/// Decrypt `ciphertext` under `key` and `nonce`.
///
/// Every failure path collapses to `CryptoError::DecryptFailed`: a bad
/// nonce length, a forged tag and a wrong key are indistinguishable.
pub fn decrypt(
    key: &[u8; 32],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::DecryptFailed);
    }
    let nonce = chacha20poly1305::XNonce::from_slice(nonce);

    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::DecryptFailed)?;

    let plaintext = cipher
        .decrypt(
            nonce,
            chacha20poly1305::aead::Payload { msg: ciphertext, aad },
        )
        .map_err(|_| CryptoError::DecryptFailed)?;

    Ok(Zeroizing::new(plaintext))
}
