//! Unified error types for the sync core
//!
//! This module defines error types that:
//! - Are serializable so they can be stored next to an operation
//! - Provide actionable error messages
//! - Map library errors (sqlite, io, toml) to a small set of variants

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide error type for services, storage and the engine handle
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum EddieError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Sync engine is not running")]
    EngineStopped,

    #[error("{0}")]
    Other(String),
}

// Implement From for common error types

impl From<std::io::Error> for EddieError {
    fn from(err: std::io::Error) -> Self {
        EddieError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for EddieError {
    fn from(err: toml::de::Error) -> Self {
        EddieError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for EddieError {
    fn from(err: serde_json::Error) -> Self {
        EddieError::Parse(err.to_string())
    }
}

impl From<rusqlite::Error> for EddieError {
    fn from(err: rusqlite::Error) -> Self {
        EddieError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for EddieError {
    fn from(err: r2d2::Error) -> Self {
        EddieError::Database(format!("Connection pool error: {}", err))
    }
}

impl From<String> for EddieError {
    fn from(err: String) -> Self {
        EddieError::Other(err)
    }
}

impl From<&str> for EddieError {
    fn from(err: &str) -> Self {
        EddieError::Other(err.to_string())
    }
}

/// Result type alias using EddieError
pub type Result<T> = std::result::Result<T, EddieError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serializes_with_tag() {
        let err = EddieError::AccountNotFound("acct0".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"{"type":"AccountNotFound","message":"acct0"}"#);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: EddieError = io.into();
        assert!(matches!(err, EddieError::Io(ref m) if m.contains("disk gone")));
    }
}
