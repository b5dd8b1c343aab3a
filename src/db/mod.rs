//! Local SQLite file backing the client: the `settings` key/value table holds
//! the stream configuration and the persisted session snapshot.

mod migrations;
pub mod queries;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration failed: {0}")]
    Migration(String),
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens the settings file, creating it and its schema on first use.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        // Readers (a second stream_tail, say) must not block the snapshot writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrations::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version recorded in the file header.
    pub fn schema_version(&self) -> Result<u32, DbError> {
        migrations::current_version(&self.conn())
    }

    /// A panic while holding the lock leaves no half-written rows (every
    /// write is a single statement), so a poisoned guard is still usable.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
