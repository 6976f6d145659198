//! Database repository layer
//!
//! Provides query and insert operations for preferences and queued records.

use crate::error::{Error, Result};
use crate::queue::QueueRecord;
use crate::types::MessageKind;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL keeps a crash mid-write from leaving a half-applied record
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn()
    }

    // A panic while holding the lock cannot leave SQLite half-written, so a
    // poisoned guard is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Preference operations
    // ============================================

    /// Get a raw JSON preference value
    pub fn get_preference(&self, token: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT value FROM preferences WHERE token = ?1 AND key = ?2",
            params![token, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Insert or replace a preference value
    pub fn set_preference(&self, token: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO preferences (token, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(token, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![token, key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_preference(&self, token: &str, key: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM preferences WHERE token = ?1 AND key = ?2",
            params![token, key],
        )?;
        Ok(())
    }

    /// Delete every preference of a token except the listed keys
    pub fn delete_preferences_except(&self, token: &str, keep: &[&str]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let keys: Vec<String> = {
            let mut stmt = tx.prepare("SELECT key FROM preferences WHERE token = ?1")?;
            let rows = stmt.query_map([token], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut deleted = 0;
        for key in keys.iter().filter(|k| !keep.contains(&k.as_str())) {
            deleted += tx.execute(
                "DELETE FROM preferences WHERE token = ?1 AND key = ?2",
                params![token, key],
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    // ============================================
    // Queue operations
    // ============================================

    /// Append a record and evict the oldest records beyond `ceiling`.
    ///
    /// Both happen in one transaction. Returns the number of evicted records.
    pub fn append_record(&self, record: &QueueRecord, ceiling: usize) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO queue (token, seq, kind, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.token,
                record.seq,
                record.kind.as_str(),
                record.payload,
                record.created_at.to_rfc3339(),
            ],
        )?;

        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM queue WHERE token = ?1",
            [&record.token],
            |row| row.get(0),
        )?;
        let excess = (count - ceiling as i64).max(0);
        let evicted = if excess > 0 {
            tx.execute(
                r#"
                DELETE FROM queue WHERE token = ?1 AND seq IN (
                    SELECT seq FROM queue WHERE token = ?1 ORDER BY seq ASC LIMIT ?2
                )
                "#,
                params![record.token, excess],
            )?
        } else {
            0
        };
        tx.commit()?;
        Ok(evicted)
    }

    /// Oldest records of one kind for a token, in sequence order
    pub fn select_records(
        &self,
        token: &str,
        kind: MessageKind,
        limit: usize,
    ) -> Result<Vec<QueueRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT token, seq, kind, payload, created_at FROM queue
            WHERE token = ?1 AND kind = ?2
            ORDER BY seq ASC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(params![token, kind.as_str(), limit as i64], |row| {
            Self::row_to_record(row)
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Delete records of one kind with `seq <= up_to`
    pub fn delete_records_up_to(
        &self,
        token: &str,
        kind: MessageKind,
        up_to: i64,
    ) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM queue WHERE token = ?1 AND kind = ?2 AND seq <= ?3",
            params![token, kind.as_str(), up_to],
        )?;
        Ok(deleted)
    }

    /// Delete every record of a token
    pub fn delete_token_records(&self, token: &str) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM queue WHERE token = ?1", [token])?;
        Ok(deleted)
    }

    pub fn count_records(&self, token: &str) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue WHERE token = ?1",
            [token],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Highest sequence number ever stored for a token, if any remain
    pub fn max_seq(&self, token: &str) -> Result<Option<i64>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT MAX(seq) FROM queue WHERE token = ?1",
            [token],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(Error::from)
    }

    /// Tokens with at least one queued record
    pub fn list_queue_tokens(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT token FROM queue ORDER BY token")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<QueueRecord> {
        let kind_str: String = row.get("kind")?;
        let created_at_str: String = row.get("created_at")?;

        Ok(QueueRecord {
            token: row.get("token")?,
            seq: row.get("seq")?,
            // Unknown kinds can only come from a newer schema; route them to events
            kind: MessageKind::parse(&kind_str).unwrap_or(MessageKind::Events),
            payload: row.get("payload")?,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}
