//! Types shared with the host message pipeline

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};

/// Normalised bare address of a peer, used as the session key
///
/// `Alice@Example.org/phone` and `alice@example.org/laptop` map to the same
/// `PeerId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn parse(address: &str) -> SessionResult<Self> {
        let bare = address.split('/').next().unwrap_or_default().trim();

        let valid = match bare.split_once('@') {
            Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
            None => !bare.is_empty(),
        };
        if !valid {
            return Err(SessionError::InvalidPeer(address.to_string()));
        }

        Ok(Self(bare.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which way a message is travelling through a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// A chat message as seen by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub uid: Uuid,
    /// What goes over (or came off) the wire; `None` once a protocol message
    /// has been consumed
    pub body: Option<String>,
    /// Text shown to the user
    pub plaintext: Option<String>,
    /// Whether `plaintext` travelled encrypted
    pub encrypted: bool,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            uid: Uuid::new_v4(),
            body: Some(text.clone()),
            plaintext: Some(text),
            encrypted: false,
        }
    }

    pub fn plaintext_message(&self) -> Option<&str> {
        self.plaintext.as_deref()
    }

    /// Whether anything is left to deliver to the user
    pub fn has_payload(&self) -> bool {
        self.plaintext.as_deref().is_some_and(|text| !text.is_empty())
    }
}

/// The contact a message belongs to
pub trait Peer: Send + Sync {
    /// Full address, possibly including a resource
    fn address(&self) -> &str;

    /// Name of the encryption protocol selected for this contact, if any
    fn encryption_protocol(&self) -> Option<&str>;

    /// Post a notice into the conversation
    fn add_system_message(&self, text: &str);
}

/// Delivers protocol-internal messages (key exchange, disconnect) to a peer
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: &PeerId, body: String) -> Result<(), String>;
}
