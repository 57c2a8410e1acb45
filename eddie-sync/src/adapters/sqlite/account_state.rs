//! Persisted engine state per account

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::DbPool;
use crate::sync::account::AccountOpState;
use crate::types::error::EddieError;

/// Replace the account's saved state in one transaction.
pub fn save_account_state(pool: &DbPool, account_id: &str, state: &AccountOpState) -> Result<(), EddieError> {
    let mutations_json = serde_json::to_string(&state.mutations)?;
    let deferred_json = serde_json::to_string(&state.deferred)?;

    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO account_state (account_id, next_mutation_num, mutations_json, deferred_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(account_id) DO UPDATE SET
            next_mutation_num = excluded.next_mutation_num,
            mutations_json = excluded.mutations_json,
            deferred_json = excluded.deferred_json,
            updated_at = excluded.updated_at",
        params![
            account_id,
            state.next_mutation_num as i64,
            mutations_json,
            deferred_json,
            chrono::Utc::now().timestamp_millis(),
        ],
    )?;
    tx.commit()?;

    debug!(
        account_id = %account_id,
        "Saved account state with {} mutations",
        state.mutations.len()
    );
    Ok(())
}

pub fn load_account_state(pool: &DbPool, account_id: &str) -> Result<Option<AccountOpState>, EddieError> {
    let conn = pool.get()?;
    let row: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT next_mutation_num, mutations_json, deferred_json
             FROM account_state WHERE account_id = ?1",
            params![account_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((next_mutation_num, mutations_json, deferred_json)) = row else {
        return Ok(None);
    };
    Ok(Some(AccountOpState {
        next_mutation_num: next_mutation_num.max(0) as u64,
        mutations: serde_json::from_str(&mutations_json)?,
        deferred: serde_json::from_str(&deferred_json)?,
    }))
}

/// Drop every row the account owns, across all tables.
pub fn delete_account_data(pool: &DbPool, account_id: &str) -> Result<(), EddieError> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;
    for table in ["account_state", "pop3_uidl", "pop3_overflow", "messages", "folders"] {
        tx.execute(
            &format!("DELETE FROM {} WHERE account_id = ?1", table),
            params![account_id],
        )?;
    }
    tx.commit()?;
    Ok(())
}
