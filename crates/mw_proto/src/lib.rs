//! mw_proto — Matchwire wire types
//!
//! Everything that crosses the transport between two matched parties:
//! - `handshake` — the four ordered key-agreement messages
//! - `rotation`  — key-rotation announcements
//! - `cipher`    — encrypted application messages
//!
//! All payloads are JSON; public keys are base64url-no-pad strings. The
//! transport itself is an opaque pub/sub channel — these types make no
//! assumption about delivery or ordering.

pub mod cipher;
pub mod handshake;
pub mod rotation;

pub use cipher::CipherMessage;
pub use handshake::{HandshakeMessage, HandshakePayload, HandshakePhase};
pub use rotation::KeyRotationNotice;

/// Transport event names.
pub mod events {
    pub const HANDSHAKE: &str = "handshake";
    pub const KEY_ROTATION: &str = "key_rotation";
}
