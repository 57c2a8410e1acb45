//! POP3 bookkeeping: which UIDLs are stored and which were left on the server

use rusqlite::params;
use std::collections::HashSet;

use super::DbPool;
use crate::adapters::pop3::MessageInfo;
use crate::types::error::EddieError;

pub fn record_uidl(pool: &DbPool, account_id: &str, uidl: &str, suid: &str) -> Result<(), EddieError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO pop3_uidl (account_id, uidl, message_id) VALUES (?1, ?2, ?3)",
        params![account_id, uidl, suid],
    )?;
    Ok(())
}

pub fn known_uidls(pool: &DbPool, account_id: &str) -> Result<HashSet<String>, EddieError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT uidl FROM pop3_uidl WHERE account_id = ?1")?;
    let uidls = stmt
        .query_map(params![account_id], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(uidls)
}

/// Remember messages the size limit kept us from fetching.
pub fn add_overflow(pool: &DbPool, account_id: &str, messages: &[MessageInfo]) -> Result<(), EddieError> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;
    for info in messages {
        tx.execute(
            "INSERT OR REPLACE INTO pop3_overflow (account_id, uidl, size) VALUES (?1, ?2, ?3)",
            params![account_id, info.uidl, info.size as i64],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn remove_overflow(pool: &DbPool, account_id: &str, uidl: &str) -> Result<(), EddieError> {
    let conn = pool.get()?;
    conn.execute(
        "DELETE FROM pop3_overflow WHERE account_id = ?1 AND uidl = ?2",
        params![account_id, uidl],
    )?;
    Ok(())
}

pub fn overflow_uidls(pool: &DbPool, account_id: &str) -> Result<HashSet<String>, EddieError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT uidl FROM pop3_overflow WHERE account_id = ?1")?;
    let uidls = stmt
        .query_map(params![account_id], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(uidls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SyncDatabase;

    #[test]
    fn test_uidl_and_overflow_maps() {
        let db = SyncDatabase::in_memory().unwrap();
        record_uidl(db.pool(), "a", "u1", "a/0/1").unwrap();
        record_uidl(db.pool(), "b", "u9", "b/0/1").unwrap();
        assert_eq!(known_uidls(db.pool(), "a").unwrap(), HashSet::from(["u1".to_string()]));

        let overflow = vec![
            MessageInfo { uidl: "u2".into(), size: 10, number: 2 },
            MessageInfo { uidl: "u3".into(), size: 20, number: 3 },
        ];
        add_overflow(db.pool(), "a", &overflow).unwrap();
        remove_overflow(db.pool(), "a", "u2").unwrap();
        assert_eq!(overflow_uidls(db.pool(), "a").unwrap(), HashSet::from(["u3".to_string()]));
    }
}
