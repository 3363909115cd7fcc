//! Runtime configuration
//!
//! Loaded once at startup from JSON. Every field has a default so an empty
//! object (or no file at all) is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::PreKeyConfig;
use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Display name advertised for this device
    pub device_name: String,
    pub otr: OtrOptions,
    /// What to do with an outgoing message while a key exchange is running
    pub negotiating_policy: NegotiatingPolicy,
    pub handshake_timeout_ms: u64,
    pub key_generation: KeyGenerationMode,
    pub prekeys: PreKeyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: "NoChat Desktop".to_string(),
            otr: OtrOptions::default(),
            negotiating_policy: NegotiatingPolicy::Reject,
            handshake_timeout_ms: 30_000,
            key_generation: KeyGenerationMode::Worker,
            prekeys: PreKeyConfig::default(),
        }
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> SessionResult<Self> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file, falling back to defaults when it doesn't exist
    pub fn load(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json_str(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(SessionError::Config(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn validate(&self) -> SessionResult<()> {
        if self.device_name.trim().is_empty() {
            return Err(SessionError::Config("deviceName must not be empty".to_string()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(SessionError::Config(
                "handshakeTimeoutMs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Protocol switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OtrOptions {
    /// Start a key exchange when the peer reports a protocol error
    pub error_start_ake: bool,
    /// Trace protocol frames
    pub debug: bool,
    /// Append the whitespace tag to outgoing plaintext to advertise support
    pub send_whitespace_tag: bool,
    /// Start a key exchange when a whitespace-tagged message arrives
    pub whitespace_start_ake: bool,
}

impl Default for OtrOptions {
    fn default() -> Self {
        Self {
            error_start_ake: false,
            debug: false,
            send_whitespace_tag: false,
            whitespace_start_ake: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiatingPolicy {
    /// Fail the send
    Reject,
    /// Hold the send until the key exchange settles (bounded by the handshake timeout)
    Wait,
}

/// How the long-term signing key gets generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyGenerationMode {
    /// On the blocking thread pool
    Worker,
    /// On the calling task
    Inline,
    /// No generation available; the encrypted path is disabled
    Disabled,
}
