//! SQLite repository backend
//!
//! Each collection is a table of JSON bodies keyed by uuid, with the
//! version and plan execution id pulled out into columns so that
//! compare-and-swap and scoped queries run in SQL:
//!
//! ```sql
//! UPDATE node_executions SET body = ?, version = version + 1
//!  WHERE uuid = ? AND version = ?
//! ```
//!
//! Several engine processes may open the same database file; SQLite
//! serializes their writes and the version check keeps them honest.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{Entity, Repository};
use crate::error::{EngineError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to one SQLite connection
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("Opened {:?} (journal mode {})", path.as_ref(), mode);
        Ok(Self::from_connection(conn))
    }

    /// A private in-memory database, gone when the last handle drops
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

/// Repository storing one collection in its own table
pub struct SqliteRepository<T> {
    db: SqliteDatabase,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Entity> SqliteRepository<T> {
    /// Bind a repository to `db`, creating its table if needed
    pub fn new(db: SqliteDatabase) -> Result<Self> {
        db.conn.lock().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                plan_execution_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_plan_execution
                ON {table} (plan_execution_id);",
            table = T::COLLECTION
        ))?;
        Ok(Self {
            db,
            _marker: std::marker::PhantomData,
        })
    }

    fn query_bodies(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<T>> {
        let conn = self.db.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let bodies = stmt
            .query_map(args, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(EngineError::from))
            .collect()
    }
}

fn to_sql_version(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| EngineError::invalid(format!("version {} out of range", version)))
}

impl<T: Entity> Repository<T> for SqliteRepository<T> {
    fn insert(&self, entity: &T) -> Result<T> {
        let body = serde_json::to_string(entity)?;
        let conn = self.db.conn.lock();
        let result = conn.execute(
            &format!(
                "INSERT INTO {} (uuid, plan_execution_id, version, body) VALUES (?1, ?2, ?3, ?4)",
                T::COLLECTION
            ),
            params![
                entity.uuid(),
                entity.plan_execution_id(),
                to_sql_version(entity.version())?,
                body
            ],
        );
        match result {
            Ok(_) => Ok(entity.clone()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(EngineError::DuplicateKey {
                    collection: T::COLLECTION,
                    uuid: entity.uuid().to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, uuid: &str) -> Result<Option<T>> {
        let conn = self.db.conn.lock();
        let body: Option<String> = conn
            .query_row(
                &format!("SELECT body FROM {} WHERE uuid = ?1", T::COLLECTION),
                params![uuid],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(EngineError::from))
            .transpose()
    }

    fn update(&self, entity: &T) -> Result<T> {
        let mut stored = entity.clone();
        stored.set_version(entity.version() + 1);
        let body = serde_json::to_string(&stored)?;

        let conn = self.db.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET body = ?1, version = ?2 WHERE uuid = ?3 AND version = ?4",
                T::COLLECTION
            ),
            params![
                body,
                to_sql_version(stored.version())?,
                entity.uuid(),
                to_sql_version(entity.version())?
            ],
        )?;
        if changed == 1 {
            return Ok(stored);
        }

        let exists: Option<i64> = conn
            .query_row(
                &format!("SELECT version FROM {} WHERE uuid = ?1", T::COLLECTION),
                params![entity.uuid()],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(EngineError::stale(T::COLLECTION, entity.uuid())),
            None => Err(EngineError::not_found(T::COLLECTION, entity.uuid())),
        }
    }

    fn find_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<T>> {
        self.query_bodies(
            &format!(
                "SELECT body FROM {} WHERE plan_execution_id = ?1 ORDER BY seq",
                T::COLLECTION
            ),
            &[&plan_execution_id],
        )
    }

    fn list(&self) -> Result<Vec<T>> {
        self.query_bodies(
            &format!("SELECT body FROM {} ORDER BY seq", T::COLLECTION),
            &[],
        )
    }

    fn delete(&self, uuid: &str) -> Result<bool> {
        let conn = self.db.conn.lock();
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE uuid = ?1", T::COLLECTION),
            params![uuid],
        )?;
        Ok(removed > 0)
    }

    fn delete_by_plan_execution(&self, plan_execution_id: &str) -> Result<usize> {
        let conn = self.db.conn.lock();
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE plan_execution_id = ?1", T::COLLECTION),
            params![plan_execution_id],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::testing::{exercise_repository, Note};

    #[test]
    fn test_sqlite_repository_contract() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let repo: SqliteRepository<Note> = SqliteRepository::new(db).unwrap();
        exercise_repository(&repo);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        {
            let repo: SqliteRepository<Note> =
                SqliteRepository::new(SqliteDatabase::open(&path).unwrap()).unwrap();
            let note = repo.insert(&Note::new("n1", "exec", "kept")).unwrap();
            repo.update(&note).unwrap();
        }

        let repo: SqliteRepository<Note> =
            SqliteRepository::new(SqliteDatabase::open(&path).unwrap()).unwrap();
        let note = repo.require("n1").unwrap();
        assert_eq!(note.text, "kept");
        assert_eq!(note.version, 1);
    }

    #[test]
    fn test_two_connections_share_cas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let first: SqliteRepository<Note> =
            SqliteRepository::new(SqliteDatabase::open(&path).unwrap()).unwrap();
        let second: SqliteRepository<Note> =
            SqliteRepository::new(SqliteDatabase::open(&path).unwrap()).unwrap();

        let note = first.insert(&Note::new("n", "exec", "v0")).unwrap();
        let seen_by_second = second.require("n").unwrap();

        first.update(&note).unwrap();
        assert!(second.update(&seen_by_second).unwrap_err().is_stale());
    }
}
