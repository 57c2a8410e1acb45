//! POP3 adapter
//!
//! - `parser`: splits the byte stream into single and multi-line responses
//! - `protocol`: pairs responses with requests in FIFO order
//! - `socket`: TCP, TLS and STLS upgrade
//! - `client`: session setup, authentication, listing and downloads
//! - `mime`: turns raw RFC 2822 text into header/body records

pub mod client;
pub mod error;
pub mod mime;
pub mod parser;
pub mod protocol;
pub mod socket;

pub use client::{
    AuthMethod, ClientState, Crypto, FetchProgress, ListOptions, ListResult, ListingSink,
    MessageInfo, Pop3Client, Pop3Options,
};
pub use error::{ErrorScope, Pop3Error, Pop3ErrorKind};
pub use mime::{ParsedMessage, MimeContext};
