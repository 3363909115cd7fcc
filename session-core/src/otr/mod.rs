//! Per-peer encrypted sessions
//!
//! - **wire**: text framing of protocol messages inside chat bodies
//! - **key_cache**: the long-term signing key, loaded once per process
//! - **session**: the per-peer state machine and key exchange
//! - **registry**: one session per peer, created on demand
//! - **processor**: hooks called by the host message pipeline

pub mod key_cache;
pub mod processor;
pub mod registry;
pub mod session;
pub mod wire;

pub use key_cache::{KeyCacheState, KeyMaterialCache};
pub use processor::{MessageProcessor, PROTOCOL_NAME, SEND_BLOCKED_NOTICE};
pub use registry::SessionRegistry;
pub use session::{EncryptionSession, SessionState};
