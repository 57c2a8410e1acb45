//! External systems: the POP3 wire protocol and the SQLite store

pub mod pop3;
pub mod sqlite;
