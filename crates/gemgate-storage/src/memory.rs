use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{now_ms, CredentialPatch, CredentialRecord, CredentialStore, StoreResult};

/// In-memory credential store, primarily for testing.
#[derive(Default)]
pub struct MemoryStore {
    record: RwLock<Option<CredentialRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self) -> StoreResult<Option<CredentialRecord>> {
        Ok(self.record.read().await.clone())
    }

    async fn save(&self, patch: CredentialPatch) -> StoreResult<()> {
        let mut guard = self.record.write().await;
        let previous = guard.take();
        let keep = |new: Option<String>, old: Option<String>| new.or(old);
        let (old_email, old_project, old_managed) = match previous {
            Some(record) => (record.email, record.project_id, record.managed_project_id),
            None => (None, None, None),
        };
        *guard = Some(CredentialRecord {
            refresh_token: patch.refresh_token,
            access_token: patch.access_token,
            expires_at: patch.expires_at,
            email: keep(patch.email, old_email),
            project_id: keep(patch.project_id, old_project),
            managed_project_id: keep(patch.managed_project_id, old_managed),
            updated_at: now_ms(),
        });
        Ok(())
    }

    async fn update_access_token(
        &self,
        access_token: &str,
        expires_at: i64,
        new_refresh_token: Option<&str>,
    ) -> StoreResult<()> {
        let mut guard = self.record.write().await;
        if let Some(record) = guard.as_mut() {
            record.access_token = Some(access_token.to_string());
            record.expires_at = Some(expires_at);
            if let Some(refresh) = new_refresh_token {
                record.refresh_token = refresh.to_string();
            }
            record.updated_at = now_ms();
        }
        Ok(())
    }

    async fn update_managed_project(&self, managed_project_id: &str) -> StoreResult<()> {
        let mut guard = self.record.write().await;
        if let Some(record) = guard.as_mut() {
            record.managed_project_id = Some(managed_project_id.to_string());
            record.updated_at = now_ms();
        }
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        *self.record.write().await = None;
        Ok(())
    }
}
