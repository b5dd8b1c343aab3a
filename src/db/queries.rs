//! Raw access to the `settings` table. Callers own the json encoding.

use rusqlite::{params, OptionalExtension};

use super::{Database, DbError};

/// Insert or replace `key`, stamping `updated_at` (RFC 3339).
pub fn upsert_setting(
    db: &Database,
    key: &str,
    value_json: &str,
    updated_at: &str,
) -> Result<(), DbError> {
    db.conn().execute(
        "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE
         SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        params![key, value_json, updated_at],
    )?;
    Ok(())
}

pub fn get_setting(db: &Database, key: &str) -> Result<Option<String>, DbError> {
    let value = db
        .conn()
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Removing an absent key is not an error.
pub fn delete_setting(db: &Database, key: &str) -> Result<(), DbError> {
    db.conn()
        .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
    Ok(())
}
