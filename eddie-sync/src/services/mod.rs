//! Services built on the adapters
//!
//! - `logger`: tracing subscriber setup
//! - `pop3_account`: the POP3 mailbox the engine runs operations against

pub mod logger;
pub mod pop3_account;

pub use pop3_account::{Pop3Account, Pop3Connector, SyncSummary, TcpConnector};
