//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: preferences and the pending message queue
    r#"
    CREATE TABLE IF NOT EXISTS preferences (
        token            TEXT NOT NULL,
        key              TEXT NOT NULL,
        value            JSON NOT NULL,
        updated_at       DATETIME NOT NULL,

        PRIMARY KEY (token, key)
    );

    CREATE TABLE IF NOT EXISTS queue (
        token            TEXT NOT NULL,
        seq              INTEGER NOT NULL,
        kind             TEXT NOT NULL,
        payload          JSON NOT NULL,
        created_at       DATETIME NOT NULL,

        PRIMARY KEY (token, seq)
    );
    "#,
    // Version 2: per-kind drain order
    r#"
    CREATE INDEX IF NOT EXISTS idx_queue_token_kind_seq ON queue(token, kind, seq);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    Ok(())
}
