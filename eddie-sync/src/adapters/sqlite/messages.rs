use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::DbPool;
use crate::types::error::EddieError;
use crate::types::{account_id_for_id, folder_id_for_suid};

/// A message as stored locally
///
/// Header and body are kept as JSON so any source can produce them; POP3
/// downloads store the parsed header and body records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub suid: String,
    pub uidl: Option<String>,
    pub date: i64,
    pub flags: Vec<String>,
    pub header: Value,
    /// `None` until something has been downloaded
    pub body: Option<Value>,
}

impl StoredMessage {
    pub fn folder_id(&self) -> &str {
        folder_id_for_suid(&self.suid)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

const COLUMNS: &str = "suid, uidl, date, flags_json, header_json, body_json";

fn message_from_row(row: &Row) -> rusqlite::Result<StoredMessage> {
    let flags: String = row.get(3)?;
    let header: String = row.get(4)?;
    let body: Option<String> = row.get(5)?;
    Ok(StoredMessage {
        suid: row.get(0)?,
        uidl: row.get(1)?,
        date: row.get(2)?,
        flags: serde_json::from_str(&flags).unwrap_or_default(),
        header: serde_json::from_str(&header).unwrap_or(Value::Null),
        body: body.and_then(|b| serde_json::from_str(&b).ok()),
    })
}

pub fn insert_message(pool: &DbPool, message: &StoredMessage) -> Result<(), EddieError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO messages (
            suid, account_id, folder_id, uidl, date, flags_json, header_json, body_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            message.suid,
            account_id_for_id(&message.suid),
            message.folder_id(),
            message.uidl,
            message.date,
            serde_json::to_string(&message.flags)?,
            serde_json::to_string(&message.header)?,
            message.body.as_ref().map(serde_json::to_string).transpose()?,
        ],
    )?;
    Ok(())
}

pub fn get_message(pool: &DbPool, suid: &str) -> Result<Option<StoredMessage>, EddieError> {
    let conn = pool.get()?;
    let message = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE suid = ?1", COLUMNS),
            params![suid],
            message_from_row,
        )
        .optional()?;
    Ok(message)
}

/// Newest first
pub fn list_messages(pool: &DbPool, folder_id: &str) -> Result<Vec<StoredMessage>, EddieError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages WHERE folder_id = ?1 ORDER BY date DESC, suid",
        COLUMNS
    ))?;
    let messages = stmt
        .query_map(params![folder_id], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

/// The next unused message number in the folder.
pub fn next_message_num(pool: &DbPool, folder_id: &str) -> Result<i64, EddieError> {
    let conn = pool.get()?;
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(CAST(substr(suid, ?2) AS INTEGER)) FROM messages WHERE folder_id = ?1",
        params![folder_id, folder_id.len() as i64 + 2],
        |row| row.get(0),
    )?;
    Ok(max.map_or(0, |n| n + 1))
}

/// The next unused `<folder>/<num>` suid.
pub fn next_suid(pool: &DbPool, folder_id: &str) -> Result<String, EddieError> {
    Ok(format!("{}/{}", folder_id, next_message_num(pool, folder_id)?))
}

/// Rename a message to `new_suid`, moving it into that suid's folder.
pub fn move_message(pool: &DbPool, suid: &str, new_suid: &str) -> Result<bool, EddieError> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;
    let moved = tx.execute(
        "UPDATE messages SET suid = ?2, folder_id = ?3 WHERE suid = ?1",
        params![suid, new_suid, folder_id_for_suid(new_suid)],
    )?;
    tx.execute(
        "UPDATE pop3_uidl SET message_id = ?2 WHERE message_id = ?1",
        params![suid, new_suid],
    )?;
    tx.commit()?;
    debug!("Moved message {} to {}", suid, new_suid);
    Ok(moved > 0)
}

pub fn set_flags(pool: &DbPool, suid: &str, flags: &[String]) -> Result<bool, EddieError> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE messages SET flags_json = ?2 WHERE suid = ?1",
        params![suid, serde_json::to_string(flags)?],
    )?;
    Ok(updated > 0)
}

pub fn update_body(pool: &DbPool, suid: &str, header: &Value, body: &Value) -> Result<bool, EddieError> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE messages SET header_json = ?2, body_json = ?3 WHERE suid = ?1",
        params![suid, serde_json::to_string(header)?, serde_json::to_string(body)?],
    )?;
    Ok(updated > 0)
}

/// Delete a message, returning the row so it can be restored.
pub fn delete_message(pool: &DbPool, suid: &str) -> Result<Option<StoredMessage>, EddieError> {
    let Some(message) = get_message(pool, suid)? else {
        return Ok(None);
    };
    let conn = pool.get()?;
    conn.execute("DELETE FROM messages WHERE suid = ?1", params![suid])?;
    Ok(Some(message))
}

/// Delete every message in the folder carrying `flag`.
pub fn purge_flagged(pool: &DbPool, folder_id: &str, flag: &str) -> Result<usize, EddieError> {
    let doomed: Vec<String> = list_messages(pool, folder_id)?
        .into_iter()
        .filter(|m| m.has_flag(flag))
        .map(|m| m.suid)
        .collect();

    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;
    for suid in &doomed {
        tx.execute("DELETE FROM messages WHERE suid = ?1", params![suid])?;
    }
    tx.commit()?;
    Ok(doomed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SyncDatabase;
    use serde_json::json;

    fn message(suid: &str, date: i64) -> StoredMessage {
        StoredMessage {
            suid: suid.to_string(),
            uidl: Some(format!("uidl-{}", suid)),
            date,
            flags: vec![],
            header: json!({"subject": suid}),
            body: None,
        }
    }

    #[test]
    fn test_insert_list_and_next_suid() {
        let db = SyncDatabase::in_memory().unwrap();
        assert_eq!(next_suid(db.pool(), "a/0").unwrap(), "a/0/0");

        insert_message(db.pool(), &message("a/0/0", 10)).unwrap();
        insert_message(db.pool(), &message("a/0/1", 20)).unwrap();
        insert_message(db.pool(), &message("a/1/0", 30)).unwrap();

        let inbox = list_messages(db.pool(), "a/0").unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].suid, "a/0/1");
        assert_eq!(next_suid(db.pool(), "a/0").unwrap(), "a/0/2");
    }

    #[test]
    fn test_move_follows_uidl_map() {
        let db = SyncDatabase::in_memory().unwrap();
        insert_message(db.pool(), &message("a/0/0", 10)).unwrap();
        super::super::pop3_state::record_uidl(db.pool(), "a", "uidl-a/0/0", "a/0/0").unwrap();

        assert!(move_message(db.pool(), "a/0/0", "a/3/0").unwrap());
        assert!(get_message(db.pool(), "a/0/0").unwrap().is_none());
        let moved = get_message(db.pool(), "a/3/0").unwrap().unwrap();
        assert_eq!(moved.folder_id(), "a/3");

        let conn = db.pool().get().unwrap();
        let target: String = conn
            .query_row("SELECT message_id FROM pop3_uidl WHERE uidl = 'uidl-a/0/0'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(target, "a/3/0");
    }

    #[test]
    fn test_delete_returns_row_and_purge() {
        let db = SyncDatabase::in_memory().unwrap();
        let mut flagged = message("a/0/0", 10);
        flagged.flags = vec!["\\Deleted".to_string()];
        insert_message(db.pool(), &flagged).unwrap();
        insert_message(db.pool(), &message("a/0/1", 20)).unwrap();

        let removed = delete_message(db.pool(), "a/0/1").unwrap().unwrap();
        assert_eq!(removed.header["subject"], "a/0/1");
        insert_message(db.pool(), &removed).unwrap();

        assert_eq!(purge_flagged(db.pool(), "a/0", "\\Deleted").unwrap(), 1);
        assert_eq!(list_messages(db.pool(), "a/0").unwrap().len(), 1);
    }

    #[test]
    fn test_flags_and_body() {
        let db = SyncDatabase::in_memory().unwrap();
        insert_message(db.pool(), &message("a/0/0", 10)).unwrap();

        set_flags(db.pool(), "a/0/0", &["\\Seen".to_string()]).unwrap();
        update_body(db.pool(), "a/0/0", &json!({"subject": "x"}), &json!({"body_reps": []})).unwrap();

        let stored = get_message(db.pool(), "a/0/0").unwrap().unwrap();
        assert!(stored.has_flag("\\Seen"));
        assert_eq!(stored.body, Some(json!({"body_reps": []})));
        assert!(!set_flags(db.pool(), "a/0/9", &[]).unwrap());
    }
}
