//! Error types for the session core

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::storage::StoreError;

/// Errors surfaced to the message pipeline
///
/// Everything except [`SessionError::CorruptKeyStore`] is recoverable by
/// retrying the operation that produced it.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Device setup failed: {0}")]
    Setup(String),

    #[error("Bundle publish failed: {0}")]
    Publish(String),

    #[error("Signing key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    /// The session was ended; the outgoing message was dropped
    #[error("Session with {0} is ended, message not sent")]
    SendBlocked(String),

    /// Sending was attempted while a key exchange is still running
    #[error("Session with {0} is still negotiating, message not sent")]
    SendDuringNegotiation(String),

    #[error("Could not decrypt message from {peer}: {reason}")]
    Decrypt { peer: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Invalid peer address: {0}")]
    InvalidPeer(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// The local key store holds identity data that can't be decoded
    #[error("Local key store is corrupt: {0}")]
    CorruptKeyStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether the error needs user intervention rather than a retry
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::CorruptKeyStore(_))
    }

    pub(crate) fn handshake(peer: impl ToString, reason: impl ToString) -> Self {
        SessionError::Handshake {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn decrypt(peer: impl ToString, reason: impl ToString) -> Self {
        SessionError::Decrypt {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<CryptoError> for SessionError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyGenerationFailed(reason) => SessionError::KeyGeneration(reason),
            other => SessionError::Setup(other.to_string()),
        }
    }
}

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;
