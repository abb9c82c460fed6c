use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{now_ms, CredentialPatch, CredentialRecord, CredentialStore, StoreError, StoreResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS auth (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  refresh_token TEXT NOT NULL,
  access_token TEXT,
  expires_at INTEGER,
  email TEXT,
  project_id TEXT,
  managed_project_id TEXT,
  updated_at INTEGER NOT NULL
)
";

/// Single-row credential table on disk.
///
/// All statements touch at most one row; calls go straight through a mutex
/// rather than a connection pool.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let guard = self.conn.lock().map_err(|_| StoreError::Lock)?;
        Ok(f(&guard)?)
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn get(&self) -> StoreResult<Option<CredentialRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT refresh_token, access_token, expires_at, email, project_id,
                        managed_project_id, updated_at
                 FROM auth WHERE id = 1",
                [],
                |row| {
                    Ok(CredentialRecord {
                        refresh_token: row.get(0)?,
                        access_token: row.get(1)?,
                        expires_at: row.get(2)?,
                        email: row.get(3)?,
                        project_id: row.get(4)?,
                        managed_project_id: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()
        })
    }

    async fn save(&self, patch: CredentialPatch) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth (id, refresh_token, access_token, expires_at, email,
                                   project_id, managed_project_id, updated_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   refresh_token = excluded.refresh_token,
                   access_token = excluded.access_token,
                   expires_at = excluded.expires_at,
                   email = COALESCE(excluded.email, auth.email),
                   project_id = COALESCE(excluded.project_id, auth.project_id),
                   managed_project_id = COALESCE(excluded.managed_project_id, auth.managed_project_id),
                   updated_at = excluded.updated_at",
                params![
                    patch.refresh_token,
                    patch.access_token,
                    patch.expires_at,
                    patch.email,
                    patch.project_id,
                    patch.managed_project_id,
                    now_ms(),
                ],
            )
            .map(|_| ())
        })
    }

    async fn update_access_token(
        &self,
        access_token: &str,
        expires_at: i64,
        new_refresh_token: Option<&str>,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            match new_refresh_token {
                Some(refresh) => conn.execute(
                    "UPDATE auth SET access_token = ?1, expires_at = ?2, refresh_token = ?3,
                                     updated_at = ?4 WHERE id = 1",
                    params![access_token, expires_at, refresh, now_ms()],
                ),
                None => conn.execute(
                    "UPDATE auth SET access_token = ?1, expires_at = ?2, updated_at = ?3
                     WHERE id = 1",
                    params![access_token, expires_at, now_ms()],
                ),
            }
            .map(|_| ())
        })
    }

    async fn update_managed_project(&self, managed_project_id: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE auth SET managed_project_id = ?1, updated_at = ?2 WHERE id = 1",
                params![managed_project_id, now_ms()],
            )
            .map(|_| ())
        })
    }

    async fn clear(&self) -> StoreResult<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM auth WHERE id = 1", []).map(|_| ()))
    }
}
