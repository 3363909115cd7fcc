//! Text framing for session messages
//!
//! Protocol traffic rides inside ordinary chat bodies:
//!
//! - `?OTRv4?` (any body starting with `?OTR` that isn't a frame or error) is a
//!   query asking the receiver to start a key exchange
//! - `?OTR Error:...` reports a protocol error
//! - `?OTR:<base64 json>.` carries a [`Frame`]
//! - plaintext carrying [`WHITESPACE_TAG`] advertises support
//!
//! Anything else is not ours and must not reach a session.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Invisible tag appended to plaintext to advertise protocol support
pub const WHITESPACE_TAG: &str =
    "\x20\x09\x20\x20\x09\x09\x09\x09\x20\x09\x20\x09\x20\x09\x20\x20";

pub const PROTOCOL_PREFIX: &str = "?OTR";
pub const QUERY_MESSAGE: &str = "?OTRv4?";
pub const ERROR_PREFIX: &str = "?OTR Error:";
const FRAME_PREFIX: &str = "?OTR:";
const FRAME_SUFFIX: char = '.';

/// Whether an inbound body has to be routed into a session
pub fn has_protocol_marker(text: &str) -> bool {
    text.starts_with(PROTOCOL_PREFIX) || text.contains(WHITESPACE_TAG)
}

/// A structured protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Start of a key exchange: an ephemeral Curve25519 identity and one-time
    /// key, authenticated by the sender's long-term signing key
    #[serde(rename_all = "camelCase")]
    KeyOffer {
        identity_key: String,
        one_time_key: String,
        signing_key: String,
        signature: String,
    },
    /// Answer to an offer, carrying the first ratchet message
    #[serde(rename_all = "camelCase")]
    KeyAccept {
        identity_key: String,
        signing_key: String,
        signature: String,
        message: String,
    },
    /// Encrypted user payload
    Data { message: String },
    /// The sender has closed the encrypted channel
    Disconnect,
}

/// Classification of an inbound body that carries a protocol marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Query,
    Error(String),
    /// Plaintext with the whitespace tag removed
    Tagged(String),
    Frame(Frame),
}

pub fn encode_frame(frame: &Frame) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(frame)?;
    Ok(format!("{}{}{}", FRAME_PREFIX, STANDARD.encode(json), FRAME_SUFFIX))
}

/// Classify an inbound body; `Ok(None)` for unmarked text
pub fn parse_inbound(text: &str) -> Result<Option<Inbound>, String> {
    if let Some(encoded) = text.strip_prefix(FRAME_PREFIX) {
        let encoded = encoded
            .trim_end()
            .strip_suffix(FRAME_SUFFIX)
            .ok_or_else(|| "Unterminated frame".to_string())?;
        let json = STANDARD
            .decode(encoded)
            .map_err(|e| format!("Frame is not base64: {}", e))?;
        let frame = serde_json::from_slice(&json).map_err(|e| format!("Malformed frame: {}", e))?;
        return Ok(Some(Inbound::Frame(frame)));
    }

    if let Some(reason) = text.strip_prefix(ERROR_PREFIX) {
        return Ok(Some(Inbound::Error(reason.trim().to_string())));
    }

    if text.starts_with(PROTOCOL_PREFIX) {
        return Ok(Some(Inbound::Query));
    }

    if text.contains(WHITESPACE_TAG) {
        return Ok(Some(Inbound::Tagged(text.replace(WHITESPACE_TAG, ""))));
    }

    Ok(None)
}

/// Append the whitespace tag unless it's already there
pub fn tag_plaintext(text: &str) -> String {
    if text.contains(WHITESPACE_TAG) {
        text.to_string()
    } else {
        format!("{}{}", text, WHITESPACE_TAG)
    }
}
