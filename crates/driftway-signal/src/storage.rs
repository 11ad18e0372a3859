//! SQLite storage for the audit trail
//!
//! Room and peer state is never persisted; only audit records survive a
//! restart.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditSink};

/// SQLite audit log
pub struct AuditStore {
    conn: Mutex<Connection>,
}

impl AuditStore {
    /// Open or create a database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                username TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                detail TEXT,
                address TEXT NOT NULL,
                agent TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_log_user ON audit_log(user_id);
            "#,
        )?;

        info!("Audit schema initialized");
        Ok(())
    }

    /// Append a record
    pub fn insert(&self, event: &AuditEvent) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        conn.execute(
            "INSERT INTO audit_log (user_id, username, action, resource_type, resource_id, detail, address, agent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.user_id,
                event.username,
                event.action,
                event.resource_type,
                event.resource_id,
                event.detail,
                event.address,
                event.agent,
                event.timestamp.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Most recent records, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let mut stmt = conn.prepare(
            "SELECT user_id, username, action, resource_type, resource_id, detail, address, agent, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let created_at: String = row.get(8)?;
            Ok(AuditEvent {
                user_id: row.get(0)?,
                username: row.get(1)?,
                action: row.get(2)?,
                resource_type: row.get(3)?,
                resource_id: row.get(4)?,
                detail: row.get(5)?,
                address: row.get(6)?,
                agent: row.get(7)?,
                timestamp: DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
            })
        })?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Number of stored records
    pub fn count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Audit sink writing to an [`AuditStore`]
///
/// Inserts run on the blocking pool; failures are logged and dropped.
#[derive(Clone)]
pub struct SqliteAuditSink {
    store: Arc<AuditStore>,
}

impl SqliteAuditSink {
    pub fn new(store: Arc<AuditStore>) -> Self {
        Self { store }
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&self, event: AuditEvent) {
        let store = self.store.clone();
        let write = move || {
            if let Err(e) = store.insert(&event) {
                warn!("Failed to write audit record {}: {}", event.action, e);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Mutex lock was poisoned (a thread panicked while holding the lock)
    #[error("Lock poisoned: a thread panicked while holding the lock")]
    LockPoisoned,
}
