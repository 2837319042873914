//! Shared protocol types for Rendezvous: wire envelope, error taxonomy, logging setup.
//!
//! Both the gateway and the peer-side client speak the JSON envelope defined in
//! [`protocol`], and report failures with the codes in [`error`].

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;

pub use error::{ErrorCode, Result, SignalError};
pub use protocol::*;

/// Initialize tracing with a specific default filter.
///
/// `RUST_LOG` takes precedence when set.
pub fn init_tracing_with_default(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
