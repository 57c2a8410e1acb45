use rusqlite::{params, OptionalExtension, Row};

use super::DbPool;
use crate::types::error::EddieError;
use crate::types::{account_id_for_id, Folder, FolderType};

fn folder_from_row(row: &Row) -> rusqlite::Result<Folder> {
    let folder_type: String = row.get(2)?;
    Ok(Folder {
        id: row.get(0)?,
        name: row.get(1)?,
        folder_type: FolderType::parse(&folder_type),
        local_only: row.get::<_, i32>(3)? != 0,
    })
}

/// Insert the folder unless one with its id exists.
pub fn ensure_folder(pool: &DbPool, folder: &Folder) -> Result<bool, EddieError> {
    let conn = pool.get()?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO folders (folder_id, account_id, name, folder_type, local_only)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            folder.id,
            account_id_for_id(&folder.id),
            folder.name,
            folder.folder_type.as_str(),
            folder.local_only as i32,
        ],
    )?;
    Ok(inserted > 0)
}

pub fn get_folder(pool: &DbPool, folder_id: &str) -> Result<Option<Folder>, EddieError> {
    let conn = pool.get()?;
    let folder = conn
        .query_row(
            "SELECT folder_id, name, folder_type, local_only FROM folders WHERE folder_id = ?1",
            params![folder_id],
            folder_from_row,
        )
        .optional()?;
    Ok(folder)
}

pub fn list_folders(pool: &DbPool, account_id: &str) -> Result<Vec<Folder>, EddieError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT folder_id, name, folder_type, local_only FROM folders
         WHERE account_id = ?1 ORDER BY folder_id",
    )?;
    let folders = stmt
        .query_map(params![account_id], folder_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(folders)
}

pub fn delete_folder(pool: &DbPool, folder_id: &str) -> Result<bool, EddieError> {
    let conn = pool.get()?;
    let deleted = conn.execute("DELETE FROM folders WHERE folder_id = ?1", params![folder_id])?;
    Ok(deleted > 0)
}

/// The next unused `<account>/<num>` folder id.
pub fn next_folder_id(pool: &DbPool, account_id: &str) -> Result<String, EddieError> {
    let prefix_len = account_id.len() as i64 + 2;
    let conn = pool.get()?;
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(CAST(substr(folder_id, ?2) AS INTEGER)) FROM folders WHERE account_id = ?1",
        params![account_id, prefix_len],
        |row| row.get(0),
    )?;
    Ok(format!("{}/{}", account_id, max.map_or(0, |n| n + 1)))
}
