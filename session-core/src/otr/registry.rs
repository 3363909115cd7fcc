//! Peer → session map

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::config::Config;
use crate::error::{SessionError, SessionResult};
use crate::otr::key_cache::KeyMaterialCache;
use crate::otr::session::{EncryptionSession, SessionState};
use crate::pipeline::{PeerId, Transport};

type SessionCell = Arc<OnceCell<Arc<EncryptionSession>>>;

/// Owns every encryption session, one per peer
pub struct SessionRegistry {
    cache: Arc<KeyMaterialCache>,
    transport: Arc<dyn Transport>,
    config: Config,
    sessions: Mutex<HashMap<PeerId, SessionCell>>,
}

impl SessionRegistry {
    pub fn new(cache: Arc<KeyMaterialCache>, transport: Arc<dyn Transport>, config: Config) -> Self {
        Self {
            cache,
            transport,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The session for `peer`, created on first use
    ///
    /// Concurrent callers for the same new peer share a single construction.
    /// If construction fails (the signing key isn't available) nothing is
    /// cached and the next call tries again.
    pub async fn get_session(&self, peer: &PeerId) -> SessionResult<Arc<EncryptionSession>> {
        let cell = self
            .sessions
            .lock()
            .await
            .entry(peer.clone())
            .or_default()
            .clone();

        let session = cell
            .get_or_try_init(|| async {
                let signing_key = self.cache.get().await?;
                tracing::debug!("Creating encryption session for {}", peer);
                Ok::<_, SessionError>(Arc::new(EncryptionSession::new(
                    peer.clone(),
                    signing_key,
                    self.transport.clone(),
                    &self.config,
                )))
            })
            .await?;

        Ok(session.clone())
    }

    /// The session for `peer` if one was already created
    pub async fn existing_session(&self, peer: &PeerId) -> Option<Arc<EncryptionSession>> {
        self.sessions
            .lock()
            .await
            .get(peer)
            .and_then(|cell| cell.get().cloned())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Flip the encrypted channel with `peer` on or off
    ///
    /// Encrypted goes plain and plaintext starts a key exchange. An ended
    /// session is acknowledged and returns to plaintext without an offer.
    /// Returns the state afterwards.
    pub async fn toggle_transfer(&self, peer: &PeerId) -> SessionResult<SessionState> {
        let session = self.get_session(peer).await?;
        match session.state() {
            SessionState::Encrypted => session.go_plain().await?,
            SessionState::Ended => session.leave_ended().await,
            SessionState::Plaintext | SessionState::Negotiating => session.go_encrypted().await?,
        }
        Ok(session.state())
    }

    /// End every session, e.g. on logout
    pub async fn end_all_sessions(&self) {
        let sessions: Vec<Arc<EncryptionSession>> = self
            .sessions
            .lock()
            .await
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect();

        tracing::info!("Ending {} encryption sessions", sessions.len());
        for session in sessions {
            session.end().await;
        }
    }
}
