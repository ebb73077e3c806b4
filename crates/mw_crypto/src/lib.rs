//! mw_crypto — Matchwire cryptographic session engine
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Pure state machine: no I/O, no async, no clocks.
//!
//! # Module layout
//! - `keys`   — X25519 key pairs + the interoperable public-key bundle
//! - `kdf`    — HKDF / HMAC derivation for root and message chains
//! - `aead`   — XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `engine` — per-session handshake + ratchet state machine
//! - `error`  — unified error type

pub mod aead;
pub mod engine;
pub mod error;
pub mod kdf;
pub mod keys;

pub use engine::{Role, SealedMessage, SessionCrypto};
pub use error::CryptoError;
pub use keys::PublicKeyBundle;
