//! Eddie sync core - mail operation queue and POP3 client
//!
//! ## Module Organization
//!
//! - `types/`: shared error type and message/folder naming
//! - `config/`: TOML configuration
//! - `sync/`: operation model, queues and the engine
//! - `adapters/`: POP3 protocol stack and SQLite storage
//! - `services/`: logging and the POP3-backed account

pub mod adapters;
pub mod config;
pub mod services;
pub mod sync;
pub mod types;

/// Select the rustls crypto provider before any TLS connection is made.
///
/// rustls 0.23+ does not pick one on its own. Installing twice is a no-op.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
