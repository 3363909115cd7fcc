//! Per-peer encryption session
//!
//! Key exchange: the initiator creates an ephemeral Olm account and sends a
//! [`Frame::KeyOffer`] with its identity and one-time key, signed with its
//! long-term signing key. The responder checks the signature, opens an
//! outbound ratchet to those keys and answers with a signed
//! [`Frame::KeyAccept`] carrying the first ratchet message. The initiator
//! opens the matching inbound ratchet from it. Both sides then exchange
//! [`Frame::Data`] until one of them sends [`Frame::Disconnect`].
//!
//! Nothing about a session is persisted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use crate::config::{Config, NegotiatingPolicy, OtrOptions};
use crate::crypto::{
    fingerprint, pack_message, unpack_message, verify_signature, OlmAccount, RatchetSession,
    SessionStats, SigningKey,
};
use crate::error::{SessionError, SessionResult};
use crate::otr::wire::{self, Frame, Inbound};
use crate::pipeline::{Direction, Message, PeerId, Transport};

const OFFER_CONTEXT: &[u8] = b"nochat-otr-offer";
const ACCEPT_CONTEXT: &[u8] = b"nochat-otr-accept";
/// Plaintext of the ratchet message inside a key accept
const ACCEPT_PAYLOAD: &[u8] = b"nochat-otr-established";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Plaintext,
    Negotiating,
    Encrypted,
    Ended,
}

/// Our half of a key exchange we started
struct PendingHandshake {
    account: OlmAccount,
    identity_key: Curve25519PublicKey,
    one_time_key: Curve25519PublicKey,
    deadline: Instant,
}

struct SessionInner {
    state: SessionState,
    engine: Option<RatchetSession>,
    pending: Option<PendingHandshake>,
    /// Bumped whenever an exchange starts or the session is torn down, so a
    /// waiter can tell whether the exchange it started is still the live one
    epoch: u64,
    remote_signing_key: Option<Ed25519PublicKey>,
}

pub struct EncryptionSession {
    peer: PeerId,
    signing_key: Arc<SigningKey>,
    transport: Arc<dyn Transport>,
    options: OtrOptions,
    negotiating_policy: NegotiatingPolicy,
    handshake_timeout: Duration,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
}

impl EncryptionSession {
    pub fn new(
        peer: PeerId,
        signing_key: Arc<SigningKey>,
        transport: Arc<dyn Transport>,
        config: &Config,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Plaintext);
        Self {
            peer,
            signing_key,
            transport,
            options: config.otr.clone(),
            negotiating_policy: config.negotiating_policy,
            handshake_timeout: config.handshake_timeout(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Plaintext,
                engine: None,
                pending: None,
                epoch: 0,
                remote_signing_key: None,
            }),
            state_tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_encrypted(&self) -> bool {
        self.state() == SessionState::Encrypted
    }

    pub fn is_ended(&self) -> bool {
        self.state() == SessionState::Ended
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Fingerprint of the signing key the peer authenticated with, for
    /// out-of-band verification
    pub async fn remote_fingerprint(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .remote_signing_key
            .as_ref()
            .map(fingerprint)
    }

    pub async fn stats(&self) -> Option<SessionStats> {
        self.inner.lock().await.engine.as_ref().map(RatchetSession::stats)
    }

    /// Start a key exchange and wait for it to settle
    ///
    /// Joins an exchange that is already running. A no-op when encrypted.
    pub async fn go_encrypted(&self) -> SessionResult<()> {
        let mut rx = self.state_tx.subscribe();

        let epoch = {
            let mut inner = self.lock().await;
            let state = inner.state;
            match state {
                SessionState::Encrypted => return Ok(()),
                SessionState::Negotiating => inner.epoch,
                SessionState::Plaintext | SessionState::Ended => {
                    self.start_handshake(&mut inner).await?
                }
            }
        };

        let outcome = tokio::time::timeout(
            self.handshake_timeout,
            rx.wait_for(|state| *state != SessionState::Negotiating),
        )
        .await;

        match outcome {
            Ok(Ok(state)) => match *state {
                SessionState::Encrypted => Ok(()),
                SessionState::Ended => Err(self.handshake_error("session ended during key exchange")),
                _ => Err(self.handshake_error("key exchange aborted")),
            },
            Ok(Err(_)) => Err(self.handshake_error("session dropped")),
            Err(_) => {
                let mut inner = self.inner.lock().await;
                if inner.epoch == epoch && inner.state == SessionState::Negotiating {
                    inner.pending = None;
                    self.set_state(&mut inner, SessionState::Plaintext);
                }
                tracing::warn!("Key exchange with {} timed out", self.peer);
                Err(self.handshake_error("timed out"))
            }
        }
    }

    /// Leave the encrypted channel and go back to plaintext
    pub async fn go_plain(&self) -> SessionResult<()> {
        let mut inner = self.lock().await;
        let state = inner.state;
        match state {
            SessionState::Ended => {
                tracing::debug!("Session with {} is ended, staying ended", self.peer);
                return Ok(());
            }
            SessionState::Encrypted => self.notify_disconnect().await,
            SessionState::Plaintext | SessionState::Negotiating => {}
        }

        inner.epoch += 1;
        inner.engine = None;
        inner.pending = None;
        self.set_state(&mut inner, SessionState::Plaintext);
        Ok(())
    }

    /// Acknowledge an ended session and return to plaintext without a new
    /// key exchange. Other states are left alone.
    pub async fn leave_ended(&self) {
        let mut inner = self.lock().await;
        if inner.state == SessionState::Ended {
            inner.epoch += 1;
            self.set_state(&mut inner, SessionState::Plaintext);
            tracing::debug!("Session with {} is back to plaintext", self.peer);
        }
    }

    /// Tear the session down and block further sends
    ///
    /// Ephemeral key material is dropped. A key exchange still in flight is
    /// abandoned; its answer will be discarded when it arrives.
    pub async fn end(&self) {
        let mut inner = self.inner.lock().await;
        let was_live = inner.state == SessionState::Encrypted;

        inner.epoch += 1;
        inner.engine = None;
        inner.pending = None;
        self.set_state(&mut inner, SessionState::Ended);

        if was_live {
            self.notify_disconnect().await;
        }
        tracing::info!("Session with {} ended", self.peer);
    }

    /// Run a message through the session in the given direction
    pub async fn process_message(&self, message: Message, direction: Direction) -> SessionResult<Message> {
        match direction {
            Direction::Decrypt => self.decrypt_incoming(message).await,
            Direction::Encrypt => self.encrypt_outgoing(message).await,
        }
    }

    async fn decrypt_incoming(&self, mut message: Message) -> SessionResult<Message> {
        let inbound = match message.body.as_deref().map(wire::parse_inbound) {
            Some(Ok(Some(inbound))) => inbound,
            None | Some(Ok(None)) => return Ok(message),
            Some(Err(reason)) => return Err(SessionError::decrypt(&self.peer, reason)),
        };

        if self.options.debug {
            tracing::debug!("OTR <- {}: {:?}", self.peer, inbound);
        }

        let mut inner = self.lock().await;
        match inbound {
            Inbound::Tagged(text) => {
                if self.options.whitespace_start_ake && inner.state == SessionState::Plaintext {
                    self.offer_in_background(&mut inner).await;
                }
                message.body = Some(text.clone());
                message.plaintext = Some(text);
                Ok(message)
            }
            Inbound::Query => {
                if inner.state != SessionState::Negotiating {
                    self.start_handshake(&mut inner).await?;
                }
                Ok(swallowed(message))
            }
            Inbound::Error(reason) => {
                tracing::warn!("{} reported a protocol error: {}", self.peer, reason);
                if self.options.error_start_ake && inner.state != SessionState::Negotiating {
                    self.offer_in_background(&mut inner).await;
                }
                message.plaintext = Some(reason);
                Ok(message)
            }
            Inbound::Frame(frame) => {
                self.handle_frame(&mut inner, frame, message).await
            }
        }
    }

    async fn handle_frame(
        &self,
        inner: &mut SessionInner,
        frame: Frame,
        mut message: Message,
    ) -> SessionResult<Message> {
        match frame {
            Frame::KeyOffer {
                identity_key,
                one_time_key,
                signing_key,
                signature,
            } => {
                self.answer_offer(inner, &identity_key, &one_time_key, &signing_key, &signature)
                    .await?;
                Ok(swallowed(message))
            }
            Frame::KeyAccept {
                identity_key,
                signing_key,
                signature,
                message: first,
            } => {
                let Some(mut pending) = inner.pending.take() else {
                    return Err(self.handshake_error("key accept without a pending key exchange"));
                };

                match self.complete_handshake(&mut pending, &identity_key, &signing_key, &signature, &first) {
                    Ok((engine, remote_signing_key)) => {
                        inner.engine = Some(engine);
                        self.remember_remote(inner, remote_signing_key);
                        self.set_state(inner, SessionState::Encrypted);
                        tracing::info!("Encrypted session established with {}", self.peer);
                        Ok(swallowed(message))
                    }
                    Err(e) => {
                        inner.pending = Some(pending);
                        Err(e)
                    }
                }
            }
            Frame::Data { message: payload } => {
                if inner.state != SessionState::Encrypted {
                    return Err(SessionError::decrypt(&self.peer, "no encrypted channel"));
                }
                let engine = inner
                    .engine
                    .as_mut()
                    .ok_or_else(|| SessionError::decrypt(&self.peer, "no encrypted channel"))?;

                let plaintext = unpack_message(&payload)
                    .and_then(|olm| engine.decrypt(&olm))
                    .map_err(|e| SessionError::decrypt(&self.peer, e))?;
                let text = String::from_utf8(plaintext)
                    .map_err(|_| SessionError::decrypt(&self.peer, "payload is not UTF-8"))?;

                message.plaintext = Some(text);
                message.encrypted = true;
                Ok(message)
            }
            Frame::Disconnect => {
                if matches!(inner.state, SessionState::Encrypted | SessionState::Negotiating) {
                    inner.epoch += 1;
                    inner.engine = None;
                    inner.pending = None;
                    self.set_state(inner, SessionState::Ended);
                    tracing::info!("{} closed the encrypted session", self.peer);
                }
                Ok(swallowed(message))
            }
        }
    }

    async fn encrypt_outgoing(&self, mut message: Message) -> SessionResult<Message> {
        let mut inner = self.lock().await;

        if inner.state == SessionState::Negotiating && self.negotiating_policy == NegotiatingPolicy::Wait {
            drop(inner);
            let mut rx = self.state_tx.subscribe();
            tokio::time::timeout(
                self.handshake_timeout,
                rx.wait_for(|state| *state != SessionState::Negotiating),
            )
            .await
            .map_err(|_| SessionError::SendDuringNegotiation(self.peer.to_string()))?
            .map_err(|_| SessionError::SendDuringNegotiation(self.peer.to_string()))?;
            inner = self.lock().await;

            // A held message only leaves over the channel it waited for
            if inner.state == SessionState::Plaintext {
                return Err(SessionError::SendDuringNegotiation(self.peer.to_string()));
            }
        }

        let state = inner.state;
        match state {
            SessionState::Ended => Err(SessionError::SendBlocked(self.peer.to_string())),
            SessionState::Negotiating => Err(SessionError::SendDuringNegotiation(self.peer.to_string())),
            SessionState::Plaintext => {
                if self.options.send_whitespace_tag {
                    message.body = message.body.as_deref().map(wire::tag_plaintext);
                }
                Ok(message)
            }
            SessionState::Encrypted => {
                let Some(text) = message.plaintext.clone().or_else(|| message.body.clone()) else {
                    return Ok(message);
                };
                let engine = inner
                    .engine
                    .as_mut()
                    .ok_or_else(|| SessionError::SendBlocked(self.peer.to_string()))?;

                let frame = Frame::Data {
                    message: pack_message(&engine.encrypt(text.as_bytes())),
                };
                let body = wire::encode_frame(&frame)?;
                if self.options.debug {
                    tracing::debug!("OTR -> {}: {}", self.peer, body);
                }

                message.body = Some(body);
                message.plaintext = Some(text);
                message.encrypted = true;
                Ok(message)
            }
        }
    }

    /// Send a fresh key offer and enter Negotiating; returns the new epoch
    async fn start_handshake(&self, inner: &mut SessionInner) -> SessionResult<u64> {
        let mut account = OlmAccount::new();
        let one_time_key = account.issue_one_time_key()?;
        let identity_key = account.identity_key();

        let signature = self.signing_key.sign(&offer_transcript(&identity_key, &one_time_key));
        self.send_frame(&Frame::KeyOffer {
            identity_key: identity_key.to_base64(),
            one_time_key: one_time_key.to_base64(),
            signing_key: self.signing_key.public_key().to_base64(),
            signature: signature.to_base64(),
        })
        .await?;

        inner.epoch += 1;
        inner.engine = None;
        inner.pending = Some(PendingHandshake {
            account,
            identity_key,
            one_time_key,
            deadline: Instant::now() + self.handshake_timeout,
        });
        self.set_state(inner, SessionState::Negotiating);
        tracing::debug!("Key offer sent to {}", self.peer);
        Ok(inner.epoch)
    }

    /// Start an exchange on behalf of an inbound message that still has to
    /// reach the user, so a failed offer is only logged
    async fn offer_in_background(&self, inner: &mut SessionInner) {
        if let Err(e) = self.start_handshake(inner).await {
            tracing::warn!("Could not offer a key exchange to {}: {}", self.peer, e);
        }
    }

    async fn answer_offer(
        &self,
        inner: &mut SessionInner,
        identity_key: &str,
        one_time_key: &str,
        signing_key: &str,
        signature: &str,
    ) -> SessionResult<()> {
        let their_identity =
            Curve25519PublicKey::from_base64(identity_key).map_err(|e| self.handshake_error(e))?;
        let their_one_time =
            Curve25519PublicKey::from_base64(one_time_key).map_err(|e| self.handshake_error(e))?;
        let their_signing =
            Ed25519PublicKey::from_base64(signing_key).map_err(|e| self.handshake_error(e))?;
        let signature = Ed25519Signature::from_base64(signature).map_err(|e| self.handshake_error(e))?;

        verify_signature(
            &their_signing,
            &offer_transcript(&their_identity, &their_one_time),
            &signature,
        )
        .map_err(|e| self.handshake_error(e))?;

        // Both sides offered at once: the larger identity key keeps its offer
        if let Some(pending) = &inner.pending {
            if pending.identity_key.as_bytes() > their_identity.as_bytes() {
                tracing::debug!("Crossed key offers with {}, keeping ours", self.peer);
                return Ok(());
            }
        }

        let account = OlmAccount::new();
        let our_identity = account.identity_key();
        let mut engine = account.create_outbound_session(their_identity, their_one_time);
        let first = pack_message(&engine.encrypt(ACCEPT_PAYLOAD));

        let signature = self
            .signing_key
            .sign(&accept_transcript(&our_identity, &their_identity, &their_one_time));
        self.send_frame(&Frame::KeyAccept {
            identity_key: our_identity.to_base64(),
            signing_key: self.signing_key.public_key().to_base64(),
            signature: signature.to_base64(),
            message: first,
        })
        .await?;

        inner.epoch += 1;
        inner.pending = None;
        inner.engine = Some(engine);
        self.remember_remote(inner, their_signing);
        self.set_state(inner, SessionState::Encrypted);
        tracing::info!("Encrypted session established with {}", self.peer);
        Ok(())
    }

    fn complete_handshake(
        &self,
        pending: &mut PendingHandshake,
        identity_key: &str,
        signing_key: &str,
        signature: &str,
        first: &str,
    ) -> SessionResult<(RatchetSession, Ed25519PublicKey)> {
        let their_identity =
            Curve25519PublicKey::from_base64(identity_key).map_err(|e| self.handshake_error(e))?;
        let their_signing =
            Ed25519PublicKey::from_base64(signing_key).map_err(|e| self.handshake_error(e))?;
        let signature = Ed25519Signature::from_base64(signature).map_err(|e| self.handshake_error(e))?;

        verify_signature(
            &their_signing,
            &accept_transcript(&their_identity, &pending.identity_key, &pending.one_time_key),
            &signature,
        )
        .map_err(|e| self.handshake_error(e))?;

        let first = unpack_message(first).map_err(|e| self.handshake_error(e))?;
        let (engine, plaintext) = pending
            .account
            .create_inbound_session(their_identity, &first)
            .map_err(|e| self.handshake_error(e))?;

        if plaintext != ACCEPT_PAYLOAD {
            return Err(self.handshake_error("unexpected key accept payload"));
        }
        Ok((engine, their_signing))
    }

    fn remember_remote(&self, inner: &mut SessionInner, key: Ed25519PublicKey) {
        if let Some(previous) = inner.remote_signing_key {
            if previous != key {
                tracing::warn!(
                    "Signing key of {} changed from {} to {}",
                    self.peer,
                    fingerprint(&previous),
                    fingerprint(&key)
                );
            }
        }
        inner.remote_signing_key = Some(key);
    }

    /// Lock the inner state, first abandoning a key exchange nobody answered
    async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        let mut inner = self.inner.lock().await;
        let expired = inner.state == SessionState::Negotiating
            && inner
                .pending
                .as_ref()
                .is_some_and(|pending| pending.deadline <= Instant::now());
        if expired {
            tracing::debug!("Abandoning unanswered key exchange with {}", self.peer);
            inner.pending = None;
            self.set_state(&mut inner, SessionState::Plaintext);
        }
        inner
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    async fn send_frame(&self, frame: &Frame) -> SessionResult<()> {
        let body = wire::encode_frame(frame)?;
        if self.options.debug {
            tracing::debug!("OTR -> {}: {}", self.peer, body);
        }
        self.transport
            .send(&self.peer, body)
            .await
            .map_err(SessionError::Transport)
    }

    async fn notify_disconnect(&self) {
        if let Err(e) = self.send_frame(&Frame::Disconnect).await {
            tracing::warn!("Could not tell {} the session ended: {}", self.peer, e);
        }
    }

    fn handshake_error(&self, reason: impl ToString) -> SessionError {
        SessionError::handshake(&self.peer, reason)
    }
}

/// A protocol message consumed by the session, nothing left for the user
fn swallowed(mut message: Message) -> Message {
    message.body = None;
    message.plaintext = None;
    message
}

fn offer_transcript(identity_key: &Curve25519PublicKey, one_time_key: &Curve25519PublicKey) -> Vec<u8> {
    [
        OFFER_CONTEXT,
        identity_key.as_bytes().as_slice(),
        one_time_key.as_bytes().as_slice(),
    ]
    .concat()
}

fn accept_transcript(
    responder_identity: &Curve25519PublicKey,
    initiator_identity: &Curve25519PublicKey,
    initiator_one_time: &Curve25519PublicKey,
) -> Vec<u8> {
    [
        ACCEPT_CONTEXT,
        responder_identity.as_bytes().as_slice(),
        initiator_identity.as_bytes().as_slice(),
        initiator_one_time.as_bytes().as_slice(),
    ]
    .concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use crate::test_utils::{deliver_all, Outbox};

    struct Offline;

    #[async_trait::async_trait]
    impl Transport for Offline {
        async fn send(&self, _to: &PeerId, _body: String) -> Result<(), String> {
            Err("offline".to_string())
        }
    }

    struct Pair {
        alice: EncryptionSession,
        bob: EncryptionSession,
        to_bob: Arc<Outbox>,
        to_alice: Arc<Outbox>,
    }

    fn pair_with(alice_config: &Config, bob_config: &Config) -> Pair {
        let to_bob = Arc::new(Outbox::default());
        let to_alice = Arc::new(Outbox::default());
        Pair {
            alice: EncryptionSession::new(
                PeerId::parse("bob@example.org").unwrap(),
                Arc::new(SigningKey::generate()),
                to_bob.clone(),
                alice_config,
            ),
            bob: EncryptionSession::new(
                PeerId::parse("alice@example.org").unwrap(),
                Arc::new(SigningKey::generate()),
                to_alice.clone(),
                bob_config,
            ),
            to_bob,
            to_alice,
        }
    }

    fn pair() -> Pair {
        pair_with(&Config::default(), &Config::default())
    }

    impl Pair {
        /// Shuttle frames both ways until nothing is left in flight
        async fn settle(&self) {
            loop {
                let moved = deliver_all(&self.to_bob, &self.bob).await.len()
                    + deliver_all(&self.to_alice, &self.alice).await.len();
                if moved == 0 {
                    break;
                }
            }
        }

        async fn established() -> Self {
            let pair = pair();
            let (result, _) = tokio::join!(pair.alice.go_encrypted(), async {
                while pair.to_bob.is_empty() {
                    tokio::task::yield_now().await;
                }
                pair.settle().await;
            });
            result.unwrap();
            assert!(pair.bob.is_encrypted());
            pair
        }
    }

    #[tokio::test]
    async fn test_new_session_is_plaintext() {
        let p = pair();
        assert_eq!(p.alice.state(), SessionState::Plaintext);
        assert!(!p.alice.is_encrypted());
        assert!(!p.alice.is_ended());
        assert!(p.alice.stats().await.is_none());
        assert!(p.alice.remote_fingerprint().await.is_none());
    }

    #[tokio::test]
    async fn test_handshake_establishes_both_sides() {
        let p = Pair::established().await;

        assert!(p.alice.is_encrypted());
        assert_eq!(
            p.alice.remote_fingerprint().await.unwrap(),
            p.bob.signing_key.fingerprint()
        );
        assert_eq!(
            p.bob.remote_fingerprint().await.unwrap(),
            p.alice.signing_key.fingerprint()
        );

        // Already encrypted: nothing is sent
        p.alice.go_encrypted().await.unwrap();
        assert!(p.to_bob.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let p = Pair::established().await;

        let outgoing = p
            .alice
            .process_message(Message::new("hello bob"), Direction::Encrypt)
            .await
            .unwrap();
        assert!(outgoing.encrypted);
        let wire_body = outgoing.body.clone().unwrap();
        assert!(wire_body.starts_with("?OTR:"));
        assert!(!wire_body.contains("hello bob"));

        let received = p
            .bob
            .process_message(Message::new(wire_body), Direction::Decrypt)
            .await
            .unwrap();
        assert_eq!(received.plaintext_message(), Some("hello bob"));
        assert!(received.encrypted);

        let reply = p
            .bob
            .process_message(Message::new("hi alice"), Direction::Encrypt)
            .await
            .unwrap();
        let received = p
            .alice
            .process_message(Message::new(reply.body.unwrap()), Direction::Decrypt)
            .await
            .unwrap();
        assert_eq!(received.plaintext_message(), Some("hi alice"));

        let stats = p.alice.stats().await.unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 1);
    }

    #[tokio::test]
    async fn test_unmarked_inbound_bypasses_engine() {
        let p = Pair::established().await;
        let before = p.bob.stats().await.unwrap();

        let message = Message::new("plain hello");
        let result = p
            .bob
            .process_message(message.clone(), Direction::Decrypt)
            .await
            .unwrap();

        assert_eq!(result, message);
        assert_eq!(p.bob.stats().await.unwrap().messages_received, before.messages_received);
    }

    #[tokio::test]
    async fn test_handshake_frame_has_no_user_payload() {
        let p = pair();
        p.alice
            .process_message(Message::new(wire::QUERY_MESSAGE), Direction::Decrypt)
            .await
            .unwrap();
        let offer = p.to_bob.take().unwrap();

        let result = p
            .bob
            .process_message(Message::new(offer), Direction::Decrypt)
            .await
            .unwrap();
        assert!(!result.has_payload());
        assert!(result.body.is_none());
    }

    #[tokio::test]
    async fn test_data_without_channel_is_decrypt_error() {
        let p = Pair::established().await;
        let outgoing = p
            .alice
            .process_message(Message::new("secret"), Direction::Encrypt)
            .await
            .unwrap();

        let stranger = pair().bob;
        let err = stranger
            .process_message(Message::new(outgoing.body.unwrap()), Direction::Decrypt)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Decrypt { .. }));
        assert_eq!(stranger.state(), SessionState::Plaintext);
    }

    #[tokio::test]
    async fn test_tampered_data_leaves_session_encrypted() {
        let p = Pair::established().await;
        let bogus = wire::encode_frame(&Frame::Data {
            message: STANDARD.encode([1u8, 0, 1, 2, 3]),
        })
        .unwrap();

        let err = p
            .bob
            .process_message(Message::new(bogus), Direction::Decrypt)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Decrypt { .. }));
        assert!(p.bob.is_encrypted());
    }

    #[tokio::test]
    async fn test_send_after_end_is_blocked() {
        let p = pair();
        p.alice.end().await;
        assert!(p.alice.is_ended());

        let err = p
            .alice
            .process_message(Message::new("hello"), Direction::Encrypt)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SendBlocked(_)));
        assert!(p.to_bob.is_empty());
    }

    #[tokio::test]
    async fn test_end_notifies_live_peer() {
        let p = Pair::established().await;
        p.alice.end().await;
        assert_eq!(p.to_bob.len(), 1);

        deliver_all(&p.to_bob, &p.bob).await;
        assert!(p.bob.is_ended());
        assert!(p.bob.stats().await.is_none());

        let err = p
            .bob
            .process_message(Message::new("still there?"), Direction::Encrypt)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SendBlocked(_)));
    }

    #[tokio::test]
    async fn test_go_plain_sends_disconnect() {
        let p = Pair::established().await;
        p.alice.go_plain().await.unwrap();
        assert_eq!(p.alice.state(), SessionState::Plaintext);

        deliver_all(&p.to_bob, &p.bob).await;
        assert!(p.bob.is_ended());

        // Plaintext passes through again on Alice's side
        let outgoing = p
            .alice
            .process_message(Message::new("in the clear"), Direction::Encrypt)
            .await
            .unwrap();
        assert_eq!(outgoing.body.as_deref(), Some("in the clear"));
        assert!(!outgoing.encrypted);
    }

    #[tokio::test]
    async fn test_renegotiate_after_end() {
        let p = Pair::established().await;
        p.alice.end().await;
        p.settle().await;
        assert!(p.bob.is_ended());

        let (result, _) = tokio::join!(p.alice.go_encrypted(), async {
            while p.to_bob.is_empty() {
                tokio::task::yield_now().await;
            }
            p.settle().await;
        });
        result.unwrap();
        assert!(p.alice.is_encrypted());
        assert!(p.bob.is_encrypted());
    }

    #[tokio::test]
    async fn test_end_during_handshake_discards_answer() {
        let p = pair();

        let (result, _) = tokio::join!(p.alice.go_encrypted(), async {
            while p.to_bob.is_empty() {
                tokio::task::yield_now().await;
            }
            deliver_all(&p.to_bob, &p.bob).await;
            p.alice.end().await;
            let results = deliver_all(&p.to_alice, &p.alice).await;
            assert!(results.iter().all(Result::is_err));
        });

        assert!(matches!(result, Err(SessionError::Handshake { .. })));
        assert!(p.alice.is_ended());
        assert!(p.alice.stats().await.is_none());
    }

    #[tokio::test]
    async fn test_unanswered_handshake_times_out() {
        let config = Config {
            handshake_timeout_ms: 50,
            ..Config::default()
        };
        let p = pair_with(&config, &config);

        let err = p.alice.go_encrypted().await.unwrap_err();
        assert!(matches!(err, SessionError::Handshake { ref reason, .. } if reason == "timed out"));
        assert_eq!(p.alice.state(), SessionState::Plaintext);
    }

    #[tokio::test]
    async fn test_send_while_negotiating_is_rejected() {
        let p = pair();
        p.alice
            .process_message(Message::new(wire::QUERY_MESSAGE), Direction::Decrypt)
            .await
            .unwrap();
        assert_eq!(p.alice.state(), SessionState::Negotiating);

        let err = p
            .alice
            .process_message(Message::new("too early"), Direction::Encrypt)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SendDuringNegotiation(_)));
    }

    #[tokio::test]
    async fn test_send_while_negotiating_waits_when_configured() {
        let config = Config {
            negotiating_policy: NegotiatingPolicy::Wait,
            ..Config::default()
        };
        let p = pair_with(&config, &Config::default());
        p.alice
            .process_message(Message::new(wire::QUERY_MESSAGE), Direction::Decrypt)
            .await
            .unwrap();

        let (result, _) = tokio::join!(
            p.alice.process_message(Message::new("held"), Direction::Encrypt),
            p.settle()
        );

        let outgoing = result.unwrap();
        assert!(outgoing.encrypted);
        let received = p
            .bob
            .process_message(Message::new(outgoing.body.unwrap()), Direction::Decrypt)
            .await
            .unwrap();
        assert_eq!(received.plaintext_message(), Some("held"));
    }

    #[tokio::test]
    async fn test_held_send_fails_when_exchange_is_abandoned() {
        let config = Config {
            negotiating_policy: NegotiatingPolicy::Wait,
            handshake_timeout_ms: 100,
            ..Config::default()
        };
        let p = pair_with(&config, &Config::default());

        let (handshake, send) = tokio::join!(p.alice.go_encrypted(), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            p.alice
                .process_message(Message::new("secret"), Direction::Encrypt)
                .await
        });

        assert!(handshake.is_err());
        assert_eq!(p.alice.state(), SessionState::Plaintext);
        assert!(matches!(send, Err(SessionError::SendDuringNegotiation(_))));
    }

    #[tokio::test]
    async fn test_held_send_fails_after_go_plain() {
        let config = Config {
            negotiating_policy: NegotiatingPolicy::Wait,
            ..Config::default()
        };
        let p = pair_with(&config, &Config::default());
        p.alice
            .process_message(Message::new(wire::QUERY_MESSAGE), Direction::Decrypt)
            .await
            .unwrap();

        let (send, _) = tokio::join!(
            p.alice.process_message(Message::new("secret"), Direction::Encrypt),
            async {
                tokio::task::yield_now().await;
                p.alice.go_plain().await.unwrap();
            }
        );
        assert!(matches!(send, Err(SessionError::SendDuringNegotiation(_))));
    }

    #[tokio::test]
    async fn test_crossed_offers_settle_on_one_exchange() {
        let p = pair();
        p.alice
            .process_message(Message::new(wire::QUERY_MESSAGE), Direction::Decrypt)
            .await
            .unwrap();
        p.bob
            .process_message(Message::new(wire::QUERY_MESSAGE), Direction::Decrypt)
            .await
            .unwrap();

        p.settle().await;
        assert!(p.alice.is_encrypted());
        assert!(p.bob.is_encrypted());

        let outgoing = p
            .bob
            .process_message(Message::new("after glare"), Direction::Encrypt)
            .await
            .unwrap();
        let received = p
            .alice
            .process_message(Message::new(outgoing.body.unwrap()), Direction::Decrypt)
            .await
            .unwrap();
        assert_eq!(received.plaintext_message(), Some("after glare"));
    }

    #[tokio::test]
    async fn test_whitespace_tag_advertises_and_starts_exchange() {
        let config = Config {
            otr: OtrOptions {
                send_whitespace_tag: true,
                ..OtrOptions::default()
            },
            ..Config::default()
        };
        let p = pair_with(&config, &Config::default());

        let outgoing = p
            .alice
            .process_message(Message::new("hi"), Direction::Encrypt)
            .await
            .unwrap();
        let body = outgoing.body.unwrap();
        assert!(body.ends_with(wire::WHITESPACE_TAG));

        let received = p
            .bob
            .process_message(Message::new(body), Direction::Decrypt)
            .await
            .unwrap();
        assert_eq!(received.plaintext_message(), Some("hi"));
        assert_eq!(p.bob.state(), SessionState::Negotiating);
        assert_eq!(p.to_alice.len(), 1);
    }

    #[tokio::test]
    async fn test_tagged_text_survives_failed_offer() {
        let config = Config {
            otr: OtrOptions {
                error_start_ake: true,
                ..OtrOptions::default()
            },
            ..Config::default()
        };
        let session = EncryptionSession::new(
            PeerId::parse("alice@example.org").unwrap(),
            Arc::new(SigningKey::generate()),
            Arc::new(Offline),
            &config,
        );

        let received = session
            .process_message(Message::new(wire::tag_plaintext("hello bob")), Direction::Decrypt)
            .await
            .unwrap();
        assert_eq!(received.plaintext_message(), Some("hello bob"));

        let received = session
            .process_message(Message::new("?OTR Error: lost session"), Direction::Decrypt)
            .await
            .unwrap();
        assert_eq!(received.plaintext_message(), Some("lost session"));
        assert_eq!(session.state(), SessionState::Plaintext);
    }

    #[tokio::test]
    async fn test_error_message_starts_exchange_only_when_enabled() {
        let p = pair();
        let received = p
            .alice
            .process_message(Message::new("?OTR Error: lost session"), Direction::Decrypt)
            .await
            .unwrap();
        assert_eq!(received.plaintext_message(), Some("lost session"));
        assert_eq!(p.alice.state(), SessionState::Plaintext);

        let config = Config {
            otr: OtrOptions {
                error_start_ake: true,
                ..OtrOptions::default()
            },
            ..Config::default()
        };
        let p = pair_with(&config, &config);
        p.alice
            .process_message(Message::new("?OTR Error: lost session"), Direction::Decrypt)
            .await
            .unwrap();
        assert_eq!(p.alice.state(), SessionState::Negotiating);
    }

    #[tokio::test]
    async fn test_forged_offer_is_rejected() {
        let p = pair();
        let mut account = OlmAccount::new();
        let otk = account.issue_one_time_key().unwrap();
        let mallory = SigningKey::generate();
        let forged = wire::encode_frame(&Frame::KeyOffer {
            identity_key: account.identity_key().to_base64(),
            one_time_key: otk.to_base64(),
            // Claims Alice's key but is signed by someone else
            signing_key: p.alice.signing_key.public_key().to_base64(),
            signature: mallory
                .sign(&offer_transcript(&account.identity_key(), &otk))
                .to_base64(),
        })
        .unwrap();

        let err = p
            .bob
            .process_message(Message::new(forged), Direction::Decrypt)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Handshake { .. }));
        assert_eq!(p.bob.state(), SessionState::Plaintext);
        assert!(p.to_alice.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_observes_transitions() {
        let p = pair();
        let mut rx = p.alice.subscribe();
        p.alice.end().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Ended);
    }
}
