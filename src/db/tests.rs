//! Settings table tests

use crate::db::{queries, Database};

#[test]
fn settings_upsert_overwrites_value() {
    let db = Database::open_in_memory().expect("in-memory DB");
    let now = chrono::Utc::now().to_rfc3339();

    queries::upsert_setting(&db, "stream_config", r#"{"debounce_ms":100}"#, &now).unwrap();
    queries::upsert_setting(&db, "stream_config", r#"{"debounce_ms":250}"#, &now).unwrap();

    let value = queries::get_setting(&db, "stream_config").unwrap();
    assert_eq!(value.as_deref(), Some(r#"{"debounce_ms":250}"#));
}

#[test]
fn missing_setting_is_none_and_delete_is_idempotent() {
    let db = Database::open_in_memory().expect("in-memory DB");
    assert!(queries::get_setting(&db, "session_state").unwrap().is_none());

    queries::delete_setting(&db, "session_state").unwrap();
    queries::upsert_setting(&db, "session_state", "{}", "2024-01-01T00:00:00Z").unwrap();
    queries::delete_setting(&db, "session_state").unwrap();
    assert!(queries::get_setting(&db, "session_state").unwrap().is_none());
}

#[test]
fn reopening_file_database_keeps_migrations_applied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agentstream.db");

    {
        let db = Database::open(&path).expect("open db");
        queries::upsert_setting(&db, "k", "\"v\"", "2024-01-01T00:00:00Z").unwrap();
    }

    let db = Database::open(&path).expect("reopen db");
    assert_eq!(queries::get_setting(&db, "k").unwrap().as_deref(), Some("\"v\""));
}

#[test]
fn fresh_database_is_stamped_with_latest_schema() {
    let db = Database::open_in_memory().expect("in-memory DB");
    assert_eq!(db.schema_version().unwrap(), super::migrations::latest_version());
}

#[test]
fn file_from_a_newer_build_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agentstream.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
    }

    match Database::open(&path) {
        Err(crate::db::DbError::Migration(message)) => assert!(message.contains("v99")),
        Err(other) => panic!("expected a migration error, got {other}"),
        Ok(_) => panic!("newer schema must not open"),
    }
}
