pub mod account_state;
pub mod folders;
pub mod messages;
pub mod pool;
pub mod pop3_state;
pub mod schema;

use std::path::Path;
use tracing::info;

use crate::types::error::EddieError;

// Re-export the pool type so callers can do `use crate::adapters::sqlite::DbPool`
pub use pool::DbPool;

/// An initialized account database
#[derive(Clone)]
pub struct SyncDatabase {
    pool: DbPool,
}

impl SyncDatabase {
    pub fn open(path: &Path) -> Result<Self, EddieError> {
        info!("Opening sync database at {:?}", path);
        Self::with_pool(pool::create_pool(path)?)
    }

    /// Private throwaway database, for tests and dry runs
    pub fn in_memory() -> Result<Self, EddieError> {
        Self::with_pool(pool::create_memory_pool()?)
    }

    fn with_pool(pool: DbPool) -> Result<Self, EddieError> {
        let conn = pool.get()?;
        schema::initialize_schema(&conn)?;
        drop(conn);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}
