//! Message pipeline hooks

use std::sync::Arc;

use crate::error::{SessionError, SessionResult};
use crate::otr::registry::SessionRegistry;
use crate::otr::wire;
use crate::pipeline::{Direction, Message, Peer, PeerId};

/// Value of [`Peer::encryption_protocol`] that routes sends through a session
pub const PROTOCOL_NAME: &str = "otr";

/// Posted to the conversation when a send is refused because the session ended
pub const SEND_BLOCKED_NOTICE: &str = "your message wasn't sent, please end your private conversation";

pub struct MessageProcessor {
    registry: Arc<SessionRegistry>,
}

impl MessageProcessor {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Inbound hook
    ///
    /// Only bodies carrying a protocol marker reach a session; everything
    /// else is returned untouched without a session lookup.
    pub async fn after_receive<P: Peer, E>(
        &self,
        peer: P,
        message: Message,
        envelope: E,
    ) -> SessionResult<(P, Message, E)> {
        let marked = message
            .body
            .as_deref()
            .is_some_and(wire::has_protocol_marker);
        if !marked {
            return Ok((peer, message, envelope));
        }

        let peer_id = PeerId::parse(peer.address())?;
        let session = self.registry.get_session(&peer_id).await?;
        let message = session.process_message(message, Direction::Decrypt).await?;
        Ok((peer, message, envelope))
    }

    /// Outbound hook
    ///
    /// Peers that haven't selected this protocol pass through. An error means
    /// the message must not be sent.
    pub async fn pre_send<P: Peer>(&self, peer: P, message: Message) -> SessionResult<(P, Message)> {
        if peer.encryption_protocol() != Some(PROTOCOL_NAME) {
            return Ok((peer, message));
        }

        let peer_id = PeerId::parse(peer.address())?;
        let session = self.registry.get_session(&peer_id).await?;
        match session.process_message(message, Direction::Encrypt).await {
            Ok(message) => Ok((peer, message)),
            Err(e @ SessionError::SendBlocked(_)) => {
                peer.add_system_message(SEND_BLOCKED_NOTICE);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
