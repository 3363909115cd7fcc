//! Double Ratchet wrapper
//!
//! Thin wrappers around vodozemac's Olm `Account` and `Session`. Every key
//! exchange uses a fresh, ephemeral [`OlmAccount`]; nothing here is persisted,
//! so dropping a [`RatchetSession`] discards its key material for good.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use vodozemac::olm::{Account, OlmMessage, Session, SessionConfig};
use vodozemac::Curve25519PublicKey;

use crate::crypto::errors::{CryptoError, CryptoResult};

/// Wrapper around a vodozemac Account used for a single key exchange
pub struct OlmAccount {
    inner: Account,
}

impl OlmAccount {
    pub fn new() -> Self {
        Self {
            inner: Account::new(),
        }
    }

    /// Curve25519 key the peer pairs with our one-time key
    pub fn identity_key(&self) -> Curve25519PublicKey {
        self.inner.curve25519_key()
    }

    /// Generate one fresh one-time key and return it
    pub fn issue_one_time_key(&mut self) -> CryptoResult<Curve25519PublicKey> {
        self.inner.generate_one_time_keys(1);
        let key = self
            .inner
            .one_time_keys()
            .into_values()
            .next()
            .ok_or_else(|| CryptoError::KeyGenerationFailed("No one-time key issued".to_string()))?;
        self.inner.mark_keys_as_published();
        Ok(key)
    }

    /// Create an outbound session (responder side of a key offer)
    pub fn create_outbound_session(
        &self,
        their_identity_key: Curve25519PublicKey,
        their_one_time_key: Curve25519PublicKey,
    ) -> RatchetSession {
        let session = self.inner.create_outbound_session(
            SessionConfig::version_2(),
            their_identity_key,
            their_one_time_key,
        );

        RatchetSession::new(session)
    }

    /// Create an inbound session from the first PreKey message
    pub fn create_inbound_session(
        &mut self,
        their_identity_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> CryptoResult<(RatchetSession, Vec<u8>)> {
        let prekey_message = match message {
            OlmMessage::PreKey(m) => m,
            OlmMessage::Normal(_) => {
                return Err(CryptoError::SessionCreation(
                    "first message of a session must be a PreKey message".to_string(),
                ));
            }
        };

        let result = self
            .inner
            .create_inbound_session(their_identity_key, prekey_message)?;

        Ok((RatchetSession::new(result.session), result.plaintext))
    }
}

impl Default for OlmAccount {
    fn default() -> Self {
        Self::new()
    }
}

/// Established Olm channel, counting the messages it carries
pub struct RatchetSession {
    inner: Session,
    messages_sent: u64,
    messages_received: u64,
}

impl RatchetSession {
    fn new(session: Session) -> Self {
        Self {
            inner: session,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    /// Until the peer has replied, output is in PreKey form
    pub fn encrypt(&mut self, plaintext: &[u8]) -> OlmMessage {
        self.messages_sent += 1;
        self.inner.encrypt(plaintext)
    }

    pub fn decrypt(&mut self, message: &OlmMessage) -> CryptoResult<Vec<u8>> {
        let plaintext = self.inner.decrypt(message)?;
        self.messages_received += 1;
        Ok(plaintext)
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id(),
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
        }
    }
}

/// Message counters of an encrypted session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: String,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Olm message as carried in a data or accept frame: base64 of the message
/// type byte followed by the ciphertext
pub fn pack_message(message: &OlmMessage) -> String {
    let (kind, ciphertext) = message.to_parts();
    let mut bytes = Vec::with_capacity(1 + ciphertext.len());
    bytes.push(kind as u8);
    bytes.extend_from_slice(&ciphertext);
    STANDARD.encode(bytes)
}

pub fn unpack_message(encoded: &str) -> CryptoResult<OlmMessage> {
    let bytes = STANDARD.decode(encoded)?;
    let (kind, ciphertext) = bytes
        .split_first()
        .ok_or_else(|| CryptoError::DecryptionError("Empty Olm message".to_string()))?;

    OlmMessage::from_parts(usize::from(*kind), ciphertext)
        .map_err(|e| CryptoError::DecryptionError(format!("Olm message type {}: {}", kind, e)))
}
