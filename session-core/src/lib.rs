//! NoChat session core
//!
//! Prepares the local device (identity, published prekey bundle) and runs
//! per-peer encrypted sessions behind the host's message pipeline hooks.
//!
//! Durable storage, bundle publication and message delivery belong to the
//! embedder; see [`storage::KeyStore`], [`device::BundlePublisher`] and
//! [`pipeline::Transport`].

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod otr;
pub mod pipeline;
pub mod state;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::Config;
pub use error::{SessionError, SessionResult};
pub use state::SessionCore;

/// Install the default `tracing` subscriber
///
/// `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nochat_session_core=info".into()),
        )
        .init();
}
