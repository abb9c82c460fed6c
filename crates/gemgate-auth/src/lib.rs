//! OAuth credential lifecycle for the proxy: PKCE authorization, code
//! exchange, token refresh with revocation handling, and the local callback
//! listener that completes a login.

pub mod cache;
pub mod callback;
pub mod constants;
pub mod oauth;
pub mod token;

pub use cache::{CachedToken, TokenCache};
pub use callback::{
    CallbackError, CallbackListener, CallbackOutcome, ListenerConfig, StartedCallback,
};
pub use oauth::{authorize, Authorization, ExchangeError, ExchangedTokens, OAuthEndpoints};
pub use token::{TokenManager, TokenState};

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
