//! Cryptography building blocks
//!
//! The primitives themselves come from vodozemac; this module wraps them in
//! the shapes the session core needs.
//!
//! ## Components
//!
//! - **keys**: Identity key, long-term signing key, Curve25519 prekeys
//! - **prekeys**: Prekey generation for the device bundle
//! - **ratchet**: Ephemeral Olm accounts and Double Ratchet sessions

pub mod errors;
pub mod keys;
pub mod prekeys;
pub mod ratchet;

pub use errors::{CryptoError, CryptoResult};
pub use keys::{
    fingerprint, verify_signature, Curve25519KeyPair, IdentityKeyPair, OneTimePreKey,
    SignedPreKey, SigningKey, StoredIdentityKey, StoredPreKey,
};
pub use prekeys::{PreKeyConfig, PreKeyManager};
pub use ratchet::{pack_message, unpack_message, OlmAccount, RatchetSession, SessionStats};
