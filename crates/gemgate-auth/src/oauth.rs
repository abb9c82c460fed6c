//! PKCE authorization and code exchange against the Google OAuth endpoints.
//!
//! The PKCE verifier is never stored server-side: it travels to the provider
//! and back inside the opaque `state` parameter, so the redirect can be
//! completed even by a process that did not issue the authorization URL.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::constants::{
    CLIENT_ID, CLIENT_SECRET, DEFAULT_AUTH_URL, DEFAULT_REDIRECT_URI, DEFAULT_TOKEN_URL,
    DEFAULT_USERINFO_URL, OAUTH_SCOPES,
};

#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub redirect_uri: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            userinfo_url: DEFAULT_USERINFO_URL.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// Authorization URL plus the verifier the caller must keep for the callback.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub url: String,
    pub verifier: String,
}

/// Tokens obtained from a completed code exchange.
#[derive(Debug, Clone)]
pub struct ExchangedTokens {
    pub refresh_token: String,
    pub access_token: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
    pub email: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("invalid oauth state: {0}")]
    BadState(String),
    #[error("token exchange failed: {0}")]
    TokenEndpoint(String),
    #[error("missing refresh token in response")]
    MissingRefreshToken,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UserInfo {
    email: Option<String>,
}

pub fn generate_pkce() -> PkcePair {
    let mut bytes = [0u8; 32];
    let mut rng = rand::rng();
    rng.fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let digest = Sha256::digest(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(digest);
    PkcePair { verifier, challenge }
}

pub fn encode_state(verifier: &str) -> String {
    let json = serde_json::json!({ "verifier": verifier }).to_string();
    URL_SAFE_NO_PAD.encode(json.as_bytes())
}

pub fn decode_state(state: &str) -> Result<String, ExchangeError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(state.trim_end_matches('=').as_bytes())
        .map_err(|err| ExchangeError::BadState(format!("not base64url: {err}")))?;
    let parsed: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|err| ExchangeError::BadState(format!("not JSON: {err}")))?;
    match parsed.get("verifier").and_then(|value| value.as_str()) {
        Some(verifier) if !verifier.is_empty() => Ok(verifier.to_string()),
        _ => Err(ExchangeError::BadState(
            "missing PKCE verifier in state".to_string(),
        )),
    }
}

/// Builds the provider authorization URL for a fresh PKCE pair.
pub fn authorize(endpoints: &OAuthEndpoints) -> Authorization {
    let pkce = generate_pkce();
    let state = encode_state(&pkce.verifier);
    let scope = OAUTH_SCOPES.join(" ");
    let params = [
        ("client_id", CLIENT_ID),
        ("response_type", "code"),
        ("redirect_uri", endpoints.redirect_uri.as_str()),
        ("scope", scope.as_str()),
        ("code_challenge", pkce.challenge.as_str()),
        ("code_challenge_method", "S256"),
        ("state", state.as_str()),
        ("access_type", "offline"),
        ("prompt", "consent"),
    ];
    let qs = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    Authorization {
        url: format!("{}?{}", endpoints.auth_url.trim_end_matches('/'), qs),
        verifier: pkce.verifier,
    }
}

/// Exchanges an authorization code, recovering the verifier from `state`.
pub async fn exchange(
    client: &wreq::Client,
    endpoints: &OAuthEndpoints,
    code: &str,
    state: &str,
) -> Result<ExchangedTokens, ExchangeError> {
    let verifier = decode_state(state)?;
    exchange_with_verifier(client, endpoints, code, &verifier).await
}

/// Exchanges an authorization code using a known PKCE verifier.
pub async fn exchange_with_verifier(
    client: &wreq::Client,
    endpoints: &OAuthEndpoints,
    code: &str,
    verifier: &str,
) -> Result<ExchangedTokens, ExchangeError> {
    let body = format!(
        "client_id={}&client_secret={}&code={}&grant_type=authorization_code&redirect_uri={}&code_verifier={}",
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(CLIENT_SECRET),
        urlencoding::encode(code),
        urlencoding::encode(&endpoints.redirect_uri),
        urlencoding::encode(verifier),
    );

    let response = client
        .post(&endpoints.token_url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(|err| ExchangeError::TokenEndpoint(err.to_string()))?;
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ExchangeError::TokenEndpoint(err.to_string()))?;
    if !status.is_success() {
        return Err(ExchangeError::TokenEndpoint(
            String::from_utf8_lossy(&bytes).into_owned(),
        ));
    }
    let payload: TokenResponse = serde_json::from_slice(&bytes)
        .map_err(|err| ExchangeError::TokenEndpoint(err.to_string()))?;

    // A missing refresh token makes the credential useless for
    // non-interactive refresh later, even though the exchange "succeeded".
    let refresh_token = payload
        .refresh_token
        .filter(|token| !token.is_empty())
        .ok_or(ExchangeError::MissingRefreshToken)?;

    let email = fetch_user_email(client, endpoints, &payload.access_token).await;
    let expires_at = crate::now_ms() + payload.expires_in.unwrap_or(3600) * 1000;

    Ok(ExchangedTokens {
        refresh_token,
        access_token: payload.access_token,
        expires_at,
        email,
    })
}

/// Best-effort; a failed userinfo lookup only loses the display email.
async fn fetch_user_email(
    client: &wreq::Client,
    endpoints: &OAuthEndpoints,
    access_token: &str,
) -> Option<String> {
    let response = client
        .get(&endpoints.userinfo_url)
        .header("Authorization", format!("Bearer {access_token}"))
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let bytes = response.bytes().await.ok()?;
    let info = serde_json::from_slice::<UserInfo>(&bytes).ok()?;
    info.email
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_is_the_hashed_verifier() {
        let pkce = generate_pkce();
        let digest = Sha256::digest(pkce.verifier.as_bytes());
        assert_eq!(pkce.challenge, URL_SAFE_NO_PAD.encode(digest));
        assert!(pkce.verifier.len() >= 43);
        assert_ne!(generate_pkce().verifier, pkce.verifier);
    }

    #[test]
    fn state_roundtrips_for_printable_verifiers() {
        let long = "a".repeat(64);
        for verifier in ["abc123", "x", "!@#$%^&*()_+-=~ |<>/?", long.as_str()] {
            assert_eq!(decode_state(&encode_state(verifier)).unwrap(), verifier);
        }
    }

    #[test]
    fn state_decode_accepts_padded_input() {
        let padded = format!("{}==", encode_state("verifier-1"));
        assert_eq!(decode_state(&padded).unwrap(), "verifier-1");
    }

    #[test]
    fn state_decode_rejects_garbage() {
        assert!(matches!(
            decode_state("%%%not-base64%%%"),
            Err(ExchangeError::BadState(_))
        ));
        let no_verifier = URL_SAFE_NO_PAD.encode(b"{\"other\":1}");
        assert!(matches!(
            decode_state(&no_verifier),
            Err(ExchangeError::BadState(_))
        ));
    }

    #[test]
    fn authorization_url_carries_the_pkce_state() {
        let auth = authorize(&OAuthEndpoints::default());
        assert!(auth.url.starts_with(DEFAULT_AUTH_URL));
        assert!(auth.url.contains("code_challenge_method=S256"));
        assert!(auth.url.contains("access_type=offline"));
        assert!(auth.url.contains("prompt=consent"));

        let state = auth
            .url
            .split('&')
            .find_map(|pair| pair.strip_prefix("state="))
            .unwrap();
        let decoded = decode_state(&urlencoding::decode(state).unwrap()).unwrap();
        assert_eq!(decoded, auth.verifier);
    }
}
