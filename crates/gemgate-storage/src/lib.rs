//! Credential persistence for the proxy.
//!
//! Exactly one credential exists at a time (fixed row id 1). Backends:
//! - [`SqliteStore`] - on-disk single-row table
//! - [`MemoryStore`] - in-memory (testing)

mod memory;
mod sqlite;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Lock,
}

/// The single durable credential record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub refresh_token: String,
    pub access_token: Option<String>,
    /// Epoch milliseconds.
    pub expires_at: Option<i64>,
    pub email: Option<String>,
    pub project_id: Option<String>,
    pub managed_project_id: Option<String>,
    pub updated_at: i64,
}

/// Upsert input for [`CredentialStore::save`].
///
/// `access_token`/`expires_at` always overwrite the stored values; the
/// remaining optional fields are preserved when absent, so a re-login does
/// not discard an already-resolved managed project.
#[derive(Debug, Clone, Default)]
pub struct CredentialPatch {
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub expires_at: Option<i64>,
    pub email: Option<String>,
    pub project_id: Option<String>,
    pub managed_project_id: Option<String>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self) -> StoreResult<Option<CredentialRecord>>;

    async fn save(&self, patch: CredentialPatch) -> StoreResult<()>;

    async fn update_access_token(
        &self,
        access_token: &str,
        expires_at: i64,
        new_refresh_token: Option<&str>,
    ) -> StoreResult<()>;

    async fn update_managed_project(&self, managed_project_id: &str) -> StoreResult<()>;

    async fn clear(&self) -> StoreResult<()>;
}

/// Blanket impl for `Arc<T>`.
#[async_trait]
impl<T: CredentialStore + ?Sized> CredentialStore for std::sync::Arc<T> {
    async fn get(&self) -> StoreResult<Option<CredentialRecord>> {
        (**self).get().await
    }
    async fn save(&self, patch: CredentialPatch) -> StoreResult<()> {
        (**self).save(patch).await
    }
    async fn update_access_token(
        &self,
        access_token: &str,
        expires_at: i64,
        new_refresh_token: Option<&str>,
    ) -> StoreResult<()> {
        (**self)
            .update_access_token(access_token, expires_at, new_refresh_token)
            .await
    }
    async fn update_managed_project(&self, managed_project_id: &str) -> StoreResult<()> {
        (**self).update_managed_project(managed_project_id).await
    }
    async fn clear(&self) -> StoreResult<()> {
        (**self).clear().await
    }
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
