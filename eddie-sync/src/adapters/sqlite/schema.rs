use rusqlite::Connection;

use crate::types::error::EddieError;

pub fn initialize_schema(conn: &Connection) -> Result<(), EddieError> {
    conn.execute_batch("
        -- Engine state: the mutation history plus deferred op ids
        CREATE TABLE IF NOT EXISTS account_state (
            account_id          TEXT PRIMARY KEY,
            next_mutation_num   INTEGER NOT NULL,
            mutations_json      TEXT NOT NULL,      -- JSON array of operations, oldest first
            deferred_json       TEXT NOT NULL,      -- JSON array of longterm ids
            updated_at          INTEGER NOT NULL    -- unix epoch ms
        );

        -- UIDLs already stored locally, so a sync never fetches them twice
        CREATE TABLE IF NOT EXISTS pop3_uidl (
            account_id  TEXT NOT NULL,
            uidl        TEXT NOT NULL,
            message_id  TEXT NOT NULL,              -- suid of the stored message
            PRIMARY KEY (account_id, uidl)
        );

        -- Messages left on the server by the per-sync limit
        CREATE TABLE IF NOT EXISTS pop3_overflow (
            account_id  TEXT NOT NULL,
            uidl        TEXT NOT NULL,
            size        INTEGER NOT NULL,
            PRIMARY KEY (account_id, uidl)
        );

        CREATE TABLE IF NOT EXISTS folders (
            folder_id   TEXT PRIMARY KEY,           -- <account>/<num>
            account_id  TEXT NOT NULL,
            name        TEXT NOT NULL,
            folder_type TEXT NOT NULL,
            local_only  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS messages (
            suid        TEXT PRIMARY KEY,           -- <folder>/<num>
            account_id  TEXT NOT NULL,
            folder_id   TEXT NOT NULL,
            uidl        TEXT,
            date        INTEGER NOT NULL,           -- unix epoch ms
            flags_json  TEXT NOT NULL DEFAULT '[]',
            header_json TEXT NOT NULL,
            body_json   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_folder ON messages(folder_id, date DESC);
        CREATE INDEX IF NOT EXISTS idx_folders_account ON folders(account_id);
    ")?;

    Ok(())
}
