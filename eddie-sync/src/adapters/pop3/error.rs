use std::fmt;
use thiserror::Error;

use super::parser::Response;
use crate::types::error::EddieError;

/// What the failing request was trying to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Connection,
    Authentication,
    Mailbox,
    Message,
}

impl fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connection => "connection",
            Self::Authentication => "authentication",
            Self::Mailbox => "mailbox",
            Self::Message => "message",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3ErrorKind {
    /// Socket failure, connect timeout, or a negative greeting
    UnresponsiveServer,
    /// STLS refused or the TLS upgrade failed
    BadSecurity,
    /// Every authentication method was rejected
    BadUserOrPass,
    /// A mailbox or message command got a negative reply
    ServerProblem,
}

impl fmt::Display for Pop3ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UnresponsiveServer => "unresponsive-server",
            Self::BadSecurity => "bad-security",
            Self::BadUserOrPass => "bad-user-or-pass",
            Self::ServerProblem => "server-problem",
        })
    }
}

/// Normalized POP3 client error
#[derive(Debug, Clone, Error)]
#[error("POP3 {scope} error ({kind}): {message}")]
pub struct Pop3Error {
    pub scope: ErrorScope,
    pub kind: Pop3ErrorKind,
    pub message: String,
    /// Printable request, never present for credential commands
    pub request: Option<String>,
    pub response: Option<Response>,
}

impl Pop3Error {
    pub fn new(scope: ErrorScope, kind: Pop3ErrorKind, message: impl Into<String>) -> Self {
        Self {
            scope,
            kind,
            message: message.into(),
            request: None,
            response: None,
        }
    }

    /// Build from a negative reply, keeping the reply for diagnostics.
    pub fn from_response(scope: ErrorScope, kind: Pop3ErrorKind, response: Response) -> Self {
        Self {
            scope,
            kind,
            message: response.status_line(),
            request: response.request.clone(),
            response: Some(response),
        }
    }
}

impl From<Pop3Error> for EddieError {
    fn from(err: Pop3Error) -> Self {
        match (err.scope, err.kind) {
            (_, Pop3ErrorKind::BadUserOrPass) => EddieError::Auth(err.to_string()),
            (ErrorScope::Connection, _) => EddieError::Network(err.to_string()),
            _ => EddieError::Protocol(err.to_string()),
        }
    }
}
