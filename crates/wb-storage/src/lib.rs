pub mod local_files;
pub mod memory;

pub use local_files::LocalFileService;
pub use memory::{MemoryScope, MemoryScopedStore};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use wb_core::{ScopedStorage, StorageError};

pub const SCOPED_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<SqliteStoreError> for StorageError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::Serialization(message) => StorageError::Serialization(message),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredScope {
    pub scope: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed scoped key-value store. One row per scope key.
pub struct SqliteScopedStore {
    conn: Mutex<Connection>,
}

impl SqliteScopedStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let conn = self.conn.lock().map_err(|_| SqliteStoreError::Poisoned)?;
        f(&conn)
    }

    pub fn schema_version(&self) -> Result<i64, SqliteStoreError> {
        self.with_conn(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
    }

    pub fn migrate(&self) -> Result<(), SqliteStoreError> {
        let current = self.schema_version()?;
        if current > SCOPED_SCHEMA_VERSION {
            return Err(SqliteStoreError::UnsupportedSchemaVersion {
                found: current,
                supported: SCOPED_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            self.with_conn(|conn| {
                conn.execute_batch(include_str!("../migrations/0001_scoped_state.sql"))?;
                conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
                Ok(())
            })?;
        }

        Ok(())
    }

    pub fn scope(self: &Arc<Self>, key: impl Into<String>) -> SqliteScope {
        SqliteScope {
            store: Arc::clone(self),
            key: key.into(),
        }
    }

    pub fn load(&self, scope: &str) -> Result<Option<StoredScope>, SqliteStoreError> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT scope, value_json, updated_at FROM scoped_state WHERE scope = ?1",
                    params![scope],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        row.map(|(scope, value_json, updated_at)| stored_scope_from_row(scope, value_json, updated_at))
            .transpose()
    }

    pub fn store(
        &self,
        scope: &str,
        value: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), SqliteStoreError> {
        let value_json = serde_json::to_string(value)
            .map_err(|err| SqliteStoreError::Serialization(err.to_string()))?;
        self.with_conn(|conn| {
            conn.execute(
                "
                INSERT INTO scoped_state (scope, value_json, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(scope) DO UPDATE SET
                    value_json=excluded.value_json,
                    updated_at=excluded.updated_at
                ",
                params![scope, value_json, now.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn remove(&self, scope: &str) -> Result<bool, SqliteStoreError> {
        self.with_conn(|conn| {
            let changes = conn.execute("DELETE FROM scoped_state WHERE scope = ?1", params![scope])?;
            Ok(changes > 0)
        })
    }

    pub fn scopes(&self) -> Result<Vec<StoredScope>, SqliteStoreError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT scope, value_json, updated_at FROM scoped_state ORDER BY scope ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(scope, value_json, updated_at)| stored_scope_from_row(scope, value_json, updated_at))
            .collect()
    }
}

fn stored_scope_from_row(
    scope: String,
    value_json: String,
    updated_at: String,
) -> Result<StoredScope, SqliteStoreError> {
    let value = serde_json::from_str(&value_json)
        .map_err(|err| SqliteStoreError::Serialization(err.to_string()))?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|err| SqliteStoreError::Timestamp(err.to_string()))?
        .with_timezone(&Utc);
    Ok(StoredScope {
        scope,
        value,
        updated_at,
    })
}

#[derive(Clone)]
pub struct SqliteScope {
    store: Arc<SqliteScopedStore>,
    key: String,
}

impl ScopedStorage for SqliteScope {
    fn scope(&self) -> &str {
        &self.key
    }

    fn get_value(&self) -> Result<Option<Value>, StorageError> {
        Ok(self.store.load(&self.key)?.map(|stored| stored.value))
    }

    fn set_value(&self, value: &Value) -> Result<(), StorageError> {
        Ok(self.store.store(&self.key, value, Utc::now())?)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.store.remove(&self.key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};
    use tempfile::NamedTempFile;
    use wb_core::ScopedStorageExt;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Geometry {
        height: u32,
        open: bool,
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn migration_sets_schema_version() {
        let store = SqliteScopedStore::open_in_memory().expect("open db");
        assert_eq!(store.schema_version().expect("version"), SCOPED_SCHEMA_VERSION);
        store.migrate().expect("second migrate is a no-op");

        let table: String = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'scoped_state'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .expect("scoped_state table");
        assert_eq!(table, "scoped_state");
    }

    #[test]
    fn scopes_are_isolated() {
        let store = Arc::new(SqliteScopedStore::open_in_memory().expect("open db"));
        let console = store.scope("workbench:cfg-1:console");
        let tabs = store.scope("workbench:cfg-1:tabs");

        console
            .set(&Geometry {
                height: 240,
                open: true,
            })
            .expect("set console");

        assert_eq!(
            console.get::<Geometry>().expect("get console"),
            Some(Geometry {
                height: 240,
                open: true
            })
        );
        assert_eq!(tabs.get::<Geometry>().expect("get tabs"), None);

        console.clear().expect("clear");
        assert_eq!(console.get::<Geometry>().expect("get cleared"), None);
    }

    #[test]
    fn store_overwrites_and_lists_scopes() {
        let store = SqliteScopedStore::open_in_memory().expect("open db");
        store
            .store("b", &serde_json::json!({"v": 1}), ts())
            .expect("store b");
        store
            .store("a", &serde_json::json!({"v": 1}), ts())
            .expect("store a");
        store
            .store("b", &serde_json::json!({"v": 2}), ts())
            .expect("overwrite b");

        let scopes = store.scopes().expect("scopes");
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[0].scope, "a");
        assert_eq!(scopes[1].value, serde_json::json!({"v": 2}));
        assert_eq!(scopes[1].updated_at, ts());
    }

    #[test]
    fn values_survive_reopen() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = Arc::new(SqliteScopedStore::open(file.path()).expect("open"));
            store
                .scope("tabs")
                .set(&vec!["a.py".to_string()])
                .expect("set");
        }
        let reopened = Arc::new(SqliteScopedStore::open(file.path()).expect("reopen"));
        assert_eq!(
            reopened.scope("tabs").get::<Vec<String>>().expect("get"),
            Some(vec!["a.py".to_string()])
        );
    }

    #[test]
    fn undecodable_value_reports_serialization_error() {
        let store = Arc::new(SqliteScopedStore::open_in_memory().expect("open db"));
        let scope = store.scope("tabs");
        scope.set(&"not a geometry").expect("set");
        assert!(matches!(
            scope.get::<Geometry>(),
            Err(StorageError::Serialization(_))
        ));
    }
}
