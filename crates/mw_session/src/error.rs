use thiserror::Error;

/// Orchestrator-level failures.
///
/// Classification is carried by the type, not by error text: `retriable()`
/// names the exact set of failures the handshake retry loop may re-attempt.
/// Clone is required because single-flight creation shares one result
/// between every concurrent caller.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session initialisation failed: {0}")]
    Initialization(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Session {0} is not ready for encryption")]
    EncryptionUnavailable(String),

    /// Uniform per-message decryption failure; never retried, accumulates
    /// toward the consecutive-failure threshold.
    #[error("Decryption failed")]
    Decryption,

    #[error("Session {0} is closed")]
    Closed(String),

    #[error("Unknown session: {0}")]
    NotFound(String),

    #[error("Session store failure: {0}")]
    Persistence(String),
}

impl SessionError {
    /// Whether the session may re-enter KEY_EXCHANGE after this failure.
    pub fn retriable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeout_and_transport_are_retriable() {
        assert!(SessionError::Timeout("handshake step").retriable());
        assert!(SessionError::Transport("connection reset".into()).retriable());

        assert!(!SessionError::Initialization("rng".into()).retriable());
        assert!(!SessionError::Handshake("bad key".into()).retriable());
        assert!(!SessionError::Decryption.retriable());
        assert!(!SessionError::EncryptionUnavailable("s1".into()).retriable());
        assert!(!SessionError::Closed("s1".into()).retriable());
    }
}
