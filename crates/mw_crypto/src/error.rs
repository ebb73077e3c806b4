use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("AEAD encryption failed")]
    EncryptFailed,

    /// Carries no detail on purpose: a tampered ciphertext and a wrong or
    /// desynchronised key must be indistinguishable to the caller.
    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Session engine missing {0}")]
    NotInitialised(&'static str),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
