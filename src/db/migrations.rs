use rusqlite::Connection;

use super::DbError;

/// Schema steps in order; step `i` moves the file to `user_version = i + 1`.
const STEPS: &[&str] = &[
    // 1: settings rows keyed by name, values stored as raw json text
    "CREATE TABLE IF NOT EXISTS settings (
        key         TEXT PRIMARY KEY,
        value_json  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );",
];

pub(super) fn latest_version() -> u32 {
    STEPS.len() as u32
}

pub(super) fn current_version(conn: &Connection) -> Result<u32, DbError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

pub(super) fn migrate(conn: &Connection) -> Result<(), DbError> {
    let from = current_version(conn)?;
    if from > latest_version() {
        return Err(DbError::Migration(format!(
            "settings file is at schema v{from}, this build knows v{}",
            latest_version()
        )));
    }

    for (version, sql) in (1u32..).zip(STEPS).skip(from as usize) {
        tracing::info!(version, "upgrading settings schema");
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)
            .map_err(|e| DbError::Migration(format!("v{version}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }
    Ok(())
}
