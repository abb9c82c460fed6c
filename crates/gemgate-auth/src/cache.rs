//! Process-local memo of the last-seen valid access token.
//!
//! The durable record is the source of truth; the cache only smooths over
//! re-reads. An unexpired durable token always wins and refreshes the cache.

use std::sync::Mutex;

use gemgate_storage::CredentialRecord;

use crate::constants::ACCESS_TOKEN_EXPIRY_BUFFER_MS;
use crate::now_ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub access_token: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
}

impl CachedToken {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.access_token.is_empty() || self.expires_at <= now_ms + ACCESS_TOKEN_EXPIRY_BUFFER_MS
    }
}

#[derive(Default)]
pub struct TokenCache {
    inner: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciles the cache against the durable record and returns the
    /// snapshot to use: the durable token when unexpired, an unexpired cached
    /// token as a fallback, and the durable token when both are stale.
    pub fn resolve(&self, record: Option<&CredentialRecord>) -> Option<CachedToken> {
        let durable = CachedToken {
            access_token: record?.access_token.clone()?,
            expires_at: record?.expires_at.unwrap_or(0),
        };
        let now = now_ms();

        let mut guard = self.inner.lock().ok()?;
        if !durable.is_expired(now) {
            *guard = Some(durable.clone());
            return Some(durable);
        }
        if let Some(cached) = guard.as_ref()
            && !cached.is_expired(now)
        {
            return Some(cached.clone());
        }
        *guard = Some(durable.clone());
        Some(durable)
    }

    pub fn store(&self, token: CachedToken) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some(token);
        }
    }

    pub fn snapshot(&self) -> Option<CachedToken> {
        self.inner.lock().ok()?.clone()
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(access_token: &str, expires_at: i64) -> CredentialRecord {
        CredentialRecord {
            refresh_token: "r".to_string(),
            access_token: Some(access_token.to_string()),
            expires_at: Some(expires_at),
            email: None,
            project_id: None,
            managed_project_id: None,
            updated_at: 0,
        }
    }

    #[test]
    fn unexpired_durable_token_wins_and_refreshes_cache() {
        let cache = TokenCache::new();
        cache.store(CachedToken {
            access_token: "old".to_string(),
            expires_at: now_ms() + 3_600_000,
        });

        let fresh = record("fresh", now_ms() + 3_600_000);
        let resolved = cache.resolve(Some(&fresh)).unwrap();
        assert_eq!(resolved.access_token, "fresh");
        assert_eq!(cache.snapshot().unwrap().access_token, "fresh");
    }

    #[test]
    fn unexpired_cache_covers_an_expired_durable_token() {
        let cache = TokenCache::new();
        cache.store(CachedToken {
            access_token: "cached".to_string(),
            expires_at: now_ms() + 3_600_000,
        });

        let stale = record("stale", now_ms() - 1);
        let resolved = cache.resolve(Some(&stale)).unwrap();
        assert_eq!(resolved.access_token, "cached");
    }

    #[test]
    fn both_expired_falls_back_to_durable() {
        let cache = TokenCache::new();
        cache.store(CachedToken {
            access_token: "cached".to_string(),
            expires_at: 1,
        });

        let stale = record("stale", now_ms() - 1);
        let resolved = cache.resolve(Some(&stale)).unwrap();
        assert_eq!(resolved.access_token, "stale");
        assert_eq!(cache.snapshot().unwrap().access_token, "stale");
    }

    #[test]
    fn missing_record_or_token_resolves_to_none() {
        let cache = TokenCache::new();
        assert_eq!(cache.resolve(None), None);

        let mut no_token = record("x", 0);
        no_token.access_token = None;
        assert_eq!(cache.resolve(Some(&no_token)), None);
    }

    #[test]
    fn expiry_buffer_applies() {
        let token = CachedToken {
            access_token: "a".to_string(),
            expires_at: 100_000,
        };
        assert!(token.is_expired(100_000 - ACCESS_TOKEN_EXPIRY_BUFFER_MS));
        assert!(!token.is_expired(100_000 - ACCESS_TOKEN_EXPIRY_BUFFER_MS - 1));
    }
}
