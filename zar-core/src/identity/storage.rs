//! Scoped key-value storage backends for identity records
//!
//! The in-memory backend plays the role of per-tab session storage. The SQLite
//! backend persists across process restarts and is what the CLI uses.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// A string key-value store scoped to one browsing context.
pub trait ScopedStorage: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("memory storage lock poisoned".to_string()))
    }
}

impl ScopedStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

const MIGRATIONS: &[&str] = &[
    // Version 1: scoped key-value table
    r#"
    CREATE TABLE IF NOT EXISTS kv (
        scope       TEXT NOT NULL,
        key         TEXT NOT NULL,
        value       TEXT NOT NULL,
        updated_at  INTEGER NOT NULL,
        PRIMARY KEY (scope, key)
    );
    "#,
];

fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running identity storage migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::debug!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Identity storage migrations complete"
        );
    }
    Ok(())
}

/// SQLite-backed storage; every key lives under a scope name.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    scope: String,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and migrate it.
    pub fn open(path: &Path, scope: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            scope: scope.to_string(),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory(scope: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            scope: scope.to_string(),
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("sqlite storage lock poisoned".to_string()))
    }
}

impl ScopedStorage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE scope = ?1 AND key = ?2",
                params![self.scope, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO kv (scope, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(scope, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![
                self.scope,
                key,
                value,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM kv WHERE scope = ?1 AND key = ?2",
            params![self.scope, key],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("k").unwrap(), None);
        storage.set("k", "v").unwrap();
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v"));
        storage.remove("k").unwrap();
        assert_eq!(storage.get("k").unwrap(), None);
    }

    #[test]
    fn test_sqlite_storage_scopes_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.db");

        let a = SqliteStorage::open(&path, "tab-a").unwrap();
        let b = SqliteStorage::open(&path, "tab-b").unwrap();
        a.set("__zar_vid", "one").unwrap();

        assert_eq!(a.get("__zar_vid").unwrap().as_deref(), Some("one"));
        assert_eq!(b.get("__zar_vid").unwrap(), None);
    }

    #[test]
    fn test_sqlite_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.db");

        {
            let storage = SqliteStorage::open(&path, "cli").unwrap();
            storage.set("key", "first").unwrap();
            storage.set("key", "second").unwrap();
        }

        let storage = SqliteStorage::open(&path, "cli").unwrap();
        assert_eq!(storage.get("key").unwrap().as_deref(), Some("second"));
        storage.remove("key").unwrap();
        assert_eq!(storage.get("key").unwrap(), None);
    }

    #[test]
    fn test_migrations_set_user_version() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
