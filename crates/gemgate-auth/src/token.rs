//! Access-token lifecycle: validity checks, refresh, revocation purge.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, warn};

use gemgate_project::ProjectResolver;
use gemgate_storage::{CredentialRecord, CredentialStore};

use crate::cache::{CachedToken, TokenCache};
use crate::constants::{ACCESS_TOKEN_EXPIRY_BUFFER_MS, CLIENT_ID, CLIENT_SECRET};
use crate::now_ms;
use crate::oauth::OAuthEndpoints;

/// Read-only snapshot of the stored credential, for the status surface.
#[derive(Debug, Clone, Default)]
pub struct TokenState {
    pub has_token: bool,
    pub access_token: Option<String>,
    pub expires_at: Option<i64>,
    pub email: Option<String>,
    pub is_expired: bool,
    pub needs_refresh: bool,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Keeps the single stored credential usable.
///
/// Concurrent callers may race a refresh; refreshed tokens are equally
/// valid and the provider treats refresh as idempotent, so last-writer-wins
/// on the store. Only project resolution single-flights.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    cache: TokenCache,
    projects: Arc<ProjectResolver>,
    client: wreq::Client,
    endpoints: OAuthEndpoints,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        projects: Arc<ProjectResolver>,
        client: wreq::Client,
        endpoints: OAuthEndpoints,
    ) -> Self {
        Self {
            store,
            cache: TokenCache::new(),
            projects,
            client,
            endpoints,
        }
    }

    /// Returns a valid access token, refreshing first when needed, or `None`
    /// when the proxy is effectively unauthenticated.
    pub async fn ensure_valid_token(&self) -> Option<String> {
        let record = self.read_record().await?;
        if record.refresh_token.is_empty() {
            return None;
        }
        if !access_token_expired(&record) {
            return record.access_token;
        }
        self.refresh_access_token().await
    }

    /// Refreshes the access token with the stored refresh token.
    ///
    /// `invalid_grant` means the grant is permanently revoked: every piece of
    /// credential state is purged so the user is asked to log in again. Any
    /// other failure may be transient, so it leaves state untouched and
    /// returns `None`.
    pub async fn refresh_access_token(&self) -> Option<String> {
        let record = self.read_record().await?;
        if record.refresh_token.is_empty() {
            return None;
        }

        let body = format!(
            "grant_type=refresh_token&refresh_token={}&client_id={}&client_secret={}",
            urlencoding::encode(&record.refresh_token),
            urlencoding::encode(CLIENT_ID),
            urlencoding::encode(CLIENT_SECRET),
        );
        let response = match self
            .client
            .post(&self.endpoints.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "token refresh request failed");
                return None;
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let parsed = parse_oauth_error_payload(&text);
            warn!(
                status = status.as_u16(),
                code = parsed.code.as_deref().unwrap_or(""),
                detail = parsed.description.as_deref().unwrap_or(""),
                "token refresh rejected"
            );
            if parsed.code.as_deref() == Some("invalid_grant") {
                warn!("refresh token revoked upstream; purging stored credential");
                self.purge().await;
            }
            return None;
        }

        let payload: RefreshResponse = match serde_json::from_str(&text) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "token refresh returned an unreadable payload");
                return None;
            }
        };

        let expires_at = now_ms() + payload.expires_in * 1000;
        if let Err(err) = self
            .store
            .update_access_token(
                &payload.access_token,
                expires_at,
                payload.refresh_token.as_deref(),
            )
            .await
        {
            error!(error = %err, "failed to persist refreshed access token");
            return None;
        }

        self.cache.store(CachedToken {
            access_token: payload.access_token.clone(),
            expires_at,
        });
        self.projects.invalidate();

        Some(payload.access_token)
    }

    pub async fn token_state(&self) -> TokenState {
        let record = self.read_record().await;
        let has_token = record
            .as_ref()
            .map(|r| !r.refresh_token.is_empty())
            .unwrap_or(false);
        let is_expired = record.as_ref().map(access_token_expired).unwrap_or(true);
        TokenState {
            has_token,
            access_token: record.as_ref().and_then(|r| r.access_token.clone()),
            expires_at: record.as_ref().and_then(|r| r.expires_at),
            email: record.as_ref().and_then(|r| r.email.clone()),
            is_expired,
            needs_refresh: has_token && is_expired,
        }
    }

    /// Cached view for surfaces that tolerate a slightly stale token.
    pub async fn resolve_cached(&self) -> Option<CachedToken> {
        let record = self.read_record().await;
        self.cache.resolve(record.as_ref())
    }

    pub fn cached_snapshot(&self) -> Option<CachedToken> {
        self.cache.snapshot()
    }

    /// Removes every piece of credential state: durable record, token cache,
    /// memoized project contexts.
    pub async fn purge(&self) {
        self.projects.invalidate();
        self.cache.clear();
        if let Err(err) = self.store.clear().await {
            error!(error = %err, "failed to clear stored credential");
        }
    }

    async fn read_record(&self) -> Option<CredentialRecord> {
        match self.store.get().await {
            Ok(record) => record,
            Err(err) => {
                error!(error = %err, "failed to read stored credential");
                None
            }
        }
    }
}

fn access_token_expired(record: &CredentialRecord) -> bool {
    let Some(access_token) = record.access_token.as_deref() else {
        return true;
    };
    if access_token.is_empty() {
        return true;
    }
    match record.expires_at {
        Some(expires_at) => expires_at <= now_ms() + ACCESS_TOKEN_EXPIRY_BUFFER_MS,
        None => true,
    }
}

#[derive(Debug, Default, PartialEq)]
struct OAuthErrorInfo {
    code: Option<String>,
    description: Option<String>,
}

/// Pulls a machine-readable code out of the provider's error payload, which
/// arrives either as a flat `{"error": "...", "error_description": "..."}`
/// or with a nested `{"error": {"code", "status", "message"}}` object.
fn parse_oauth_error_payload(text: &str) -> OAuthErrorInfo {
    if text.is_empty() {
        return OAuthErrorInfo::default();
    }
    let Ok(payload) = serde_json::from_str::<serde_json::Value>(text) else {
        return OAuthErrorInfo {
            code: None,
            description: Some(text.to_string()),
        };
    };
    if !payload.is_object() {
        return OAuthErrorInfo {
            code: None,
            description: Some(text.to_string()),
        };
    }

    let error = payload.get("error");
    let code = match error {
        Some(serde_json::Value::String(code)) => Some(code.clone()),
        Some(serde_json::Value::Object(map)) => map
            .get("status")
            .or_else(|| map.get("code"))
            .and_then(|value| value.as_str())
            .map(|value| value.to_string()),
        _ => None,
    };

    let description = payload
        .get("error_description")
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
        .or_else(|| {
            error
                .and_then(|value| value.get("message"))
                .and_then(|value| value.as_str())
                .map(|value| value.to_string())
        });

    OAuthErrorInfo { code, description }
}
