//! Managed-project resolution for the Code Assist API.
//!
//! Every Code Assist call must carry a billing-scoped project id. The
//! upstream hands one out through a load-or-onboard handshake: `loadCodeAssist`
//! reports an existing project, otherwise `onboardUser` provisions one for a
//! tier, completing asynchronously. Resolution is memoized per credential and
//! single-flighted so concurrent proxy calls never race duplicate onboarding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use gemgate_storage::CredentialStore;

const DEFAULT_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
const DEFAULT_ONBOARD_ATTEMPTS: u32 = 10;
const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(5);
const FALLBACK_TIER_ID: &str = "FREE";

const IDE_TYPE: &str = "IDE_UNSPECIFIED";
const PLATFORM: &str = "PLATFORM_UNSPECIFIED";
const PLUGIN_TYPE: &str = "GEMINI";

pub type ProjectResult<T> = Result<T, ProjectError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProjectError {
    #[error("could not obtain a project id; ensure the account has Gemini API access")]
    Unresolved,
    #[error("credential store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub base_url: String,
    pub onboard_attempts: u32,
    pub poll_delay: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            onboard_attempts: DEFAULT_ONBOARD_ATTEMPTS,
            poll_delay: DEFAULT_POLL_DELAY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LoadPayload {
    cloudaicompanion_project: Option<String>,
    current_tier: Option<Tier>,
    allowed_tiers: Option<Vec<Tier>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Tier {
    id: Option<String>,
    is_default: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OnboardPayload {
    done: bool,
    response: Option<OnboardResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OnboardResponse {
    cloudaicompanion_project: Option<OnboardProject>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OnboardProject {
    id: Option<String>,
}

type SharedResolution = Shared<BoxFuture<'static, ProjectResult<String>>>;

#[derive(Default)]
struct ContextCache {
    resolved: HashMap<String, String>,
    pending: HashMap<String, SharedResolution>,
}

/// Resolves and memoizes the managed project id for the current credential.
pub struct ProjectResolver {
    store: Arc<dyn CredentialStore>,
    client: wreq::Client,
    config: ResolverConfig,
    cache: Mutex<ContextCache>,
}

impl ProjectResolver {
    pub fn new(store: Arc<dyn CredentialStore>, client: wreq::Client) -> Self {
        Self::with_config(store, client, ResolverConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn CredentialStore>,
        client: wreq::Client,
        config: ResolverConfig,
    ) -> Self {
        Self {
            store,
            client,
            config,
            cache: Mutex::new(ContextCache::default()),
        }
    }

    /// Drops every memoized and in-flight resolution. Called whenever the
    /// credential changes underneath the cache (refresh, revocation, logout).
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.resolved.clear();
            cache.pending.clear();
        }
    }

    /// Returns the effective project id for `access_token`.
    ///
    /// Order: durable record, completed-result cache, in-flight resolution
    /// (joined, not duplicated), fresh load-or-onboard.
    pub async fn ensure_project_context(&self, access_token: &str) -> ProjectResult<String> {
        if let Ok(Some(record)) = self.store.get().await
            && let Some(managed) = record.managed_project_id
        {
            return Ok(managed);
        }

        let key = cache_key(access_token);
        let resolution = {
            let mut cache = self.cache.lock().map_err(|_| {
                ProjectError::Store("project context cache lock poisoned".to_string())
            })?;
            if let Some(found) = cache.resolved.get(&key) {
                return Ok(found.clone());
            }
            if let Some(pending) = cache.pending.get(&key) {
                pending.clone()
            } else {
                let future = resolve_context(
                    self.store.clone(),
                    self.client.clone(),
                    self.config.clone(),
                    access_token.to_string(),
                )
                .boxed()
                .shared();
                cache.pending.insert(key.clone(), future.clone());
                future
            }
        };

        let result = resolution.await;
        if let Ok(mut cache) = self.cache.lock() {
            cache.pending.remove(&key);
            if let Ok(project_id) = &result {
                cache.resolved.insert(key, project_id.clone());
            }
        }
        result
    }
}

/// First 20 characters of the token stand in for its identity. Not a security
/// boundary; the single place to swap in a full-token hash.
fn cache_key(access_token: &str) -> String {
    access_token.chars().take(20).collect()
}

async fn resolve_context(
    store: Arc<dyn CredentialStore>,
    client: wreq::Client,
    config: ResolverConfig,
    access_token: String,
) -> ProjectResult<String> {
    let load = load_managed_project(&client, &config, &access_token, None).await;
    if let Some(payload) = &load
        && let Some(project_id) = payload.cloudaicompanion_project.as_deref()
        && !project_id.is_empty()
    {
        persist_managed_project(&store, project_id).await?;
        return Ok(project_id.to_string());
    }

    let tier_id = load
        .as_ref()
        .and_then(|payload| payload.current_tier.as_ref().and_then(|tier| tier.id.clone()))
        .or_else(|| load.as_ref().and_then(|payload| default_tier_id(payload.allowed_tiers.as_deref())))
        .unwrap_or_else(|| FALLBACK_TIER_ID.to_string());

    debug!(tier = %tier_id, "onboarding managed project");
    match onboard_managed_project(&client, &config, &access_token, &tier_id, None).await {
        Some(project_id) => {
            persist_managed_project(&store, &project_id).await?;
            Ok(project_id)
        }
        None => Err(ProjectError::Unresolved),
    }
}

async fn persist_managed_project(
    store: &Arc<dyn CredentialStore>,
    project_id: &str,
) -> ProjectResult<()> {
    store
        .update_managed_project(project_id)
        .await
        .map_err(|err| ProjectError::Store(err.to_string()))
}

fn build_metadata(project_id: Option<&str>) -> JsonValue {
    let mut metadata = json!({
        "ideType": IDE_TYPE,
        "platform": PLATFORM,
        "pluginType": PLUGIN_TYPE,
    });
    if let Some(project_id) = project_id
        && let Some(map) = metadata.as_object_mut()
    {
        map.insert("duetProject".to_string(), JsonValue::String(project_id.to_string()));
    }
    metadata
}

fn default_tier_id(allowed_tiers: Option<&[Tier]>) -> Option<String> {
    let tiers = allowed_tiers?;
    for tier in tiers {
        if tier.is_default == Some(true)
            && let Some(id) = &tier.id
        {
            return Some(id.clone());
        }
    }
    tiers.first().and_then(|tier| tier.id.clone())
}

async fn load_managed_project(
    client: &wreq::Client,
    config: &ResolverConfig,
    access_token: &str,
    project_id: Option<&str>,
) -> Option<LoadPayload> {
    let url = format!(
        "{}/v1internal:loadCodeAssist",
        config.base_url.trim_end_matches('/')
    );
    let mut body = json!({ "metadata": build_metadata(project_id) });
    if let Some(project_id) = project_id
        && let Some(map) = body.as_object_mut()
    {
        map.insert(
            "cloudaicompanionProject".to_string(),
            JsonValue::String(project_id.to_string()),
        );
    }

    let response = match post_json(client, &url, access_token, &body).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "loadCodeAssist request failed");
            return None;
        }
    };
    let status = response.status();
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "loadCodeAssist response could not be read");
            return None;
        }
    };
    if !status.is_success() {
        warn!(status = %status, "loadCodeAssist returned an error");
        return None;
    }
    match serde_json::from_slice::<LoadPayload>(&bytes) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(error = %err, "loadCodeAssist payload was not valid JSON");
            None
        }
    }
}

async fn onboard_managed_project(
    client: &wreq::Client,
    config: &ResolverConfig,
    access_token: &str,
    tier_id: &str,
    project_id: Option<&str>,
) -> Option<String> {
    let url = format!(
        "{}/v1internal:onboardUser",
        config.base_url.trim_end_matches('/')
    );
    let mut body = json!({
        "tierId": tier_id,
        "metadata": build_metadata(project_id),
    });
    if tier_id != FALLBACK_TIER_ID
        && let Some(project_id) = project_id
        && let Some(map) = body.as_object_mut()
    {
        map.insert(
            "cloudaicompanionProject".to_string(),
            JsonValue::String(project_id.to_string()),
        );
    }

    for attempt in 0..config.onboard_attempts {
        let response = match post_json(client, &url, access_token, &body).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "onboardUser request failed");
                return None;
            }
        };
        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "onboardUser response could not be read");
                return None;
            }
        };
        if !status.is_success() {
            warn!(status = %status, "onboardUser returned an error");
            return None;
        }
        let payload = match serde_json::from_slice::<OnboardPayload>(&bytes) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "onboardUser payload was not valid JSON");
                return None;
            }
        };

        let onboarded = payload
            .response
            .and_then(|response| response.cloudaicompanion_project)
            .and_then(|project| project.id);
        if payload.done
            && let Some(id) = onboarded
        {
            return Some(id);
        }
        if payload.done
            && let Some(project_id) = project_id
        {
            return Some(project_id.to_string());
        }

        debug!(attempt = attempt + 1, "onboarding not complete yet");
        tokio::time::sleep(config.poll_delay).await;
    }

    None
}

async fn post_json(
    client: &wreq::Client,
    url: &str,
    access_token: &str,
    body: &JsonValue,
) -> Result<wreq::Response, wreq::Error> {
    client
        .post(url)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("Content-Type", "application/json")
        .body(body.to_string())
        .send()
        .await
}
