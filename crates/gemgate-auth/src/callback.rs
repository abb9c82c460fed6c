//! Short-lived HTTP listener that completes exactly one pending OAuth
//! authorization on the fixed callback port.
//!
//! State machine: Idle -> Listening -> {Succeeded | Failed | TimedOut} -> Idle.
//! Starting a new listen supersedes any prior one: the old promise resolves
//! as failed and its port is released before the new bind. The callback port
//! is a scarce, fixed resource, so at most one listener exists at a time.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use gemgate_storage::{CredentialPatch, CredentialStore};

use crate::constants::OAUTH_CALLBACK_PORT;
use crate::oauth::{self, OAuthEndpoints};

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const TEARDOWN_DELAY: Duration = Duration::from_millis(100);
const BIND_ATTEMPTS: u32 = 10;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Succeeded { email: Option<String> },
    Failed { error: String },
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("failed to bind callback port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: OAUTH_CALLBACK_PORT,
            timeout: CALLBACK_TIMEOUT,
        }
    }
}

/// A listening attempt: where it bound, and the one-shot outcome.
pub struct StartedCallback {
    pub addr: SocketAddr,
    pub outcome: oneshot::Receiver<CallbackOutcome>,
}

type ActiveSlot = Arc<Mutex<Option<oneshot::Sender<CallbackOutcome>>>>;

struct ListenerHandle {
    active: ActiveSlot,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
    timeout: JoinHandle<()>,
}

struct CallbackCtx {
    store: Arc<dyn CredentialStore>,
    client: wreq::Client,
    endpoints: OAuthEndpoints,
    expected_verifier: String,
    active: ActiveSlot,
    shutdown: watch::Sender<bool>,
    timeout_abort: AbortHandle,
}

pub struct CallbackListener {
    store: Arc<dyn CredentialStore>,
    client: wreq::Client,
    endpoints: OAuthEndpoints,
    config: ListenerConfig,
    slot: Mutex<Option<ListenerHandle>>,
}

impl CallbackListener {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client: wreq::Client,
        endpoints: OAuthEndpoints,
        config: ListenerConfig,
    ) -> Self {
        Self {
            store,
            client,
            endpoints,
            config,
            slot: Mutex::new(None),
        }
    }

    /// Binds the callback port and waits for a single provider redirect.
    ///
    /// `verifier` is the PKCE verifier issued alongside the authorization URL;
    /// the redirect's `state` parameter is the authoritative copy, the local
    /// one only backs a consistency warning.
    pub async fn start(&self, verifier: String) -> Result<StartedCallback, CallbackError> {
        self.supersede();

        let listener = self.bind().await?;
        let addr = listener
            .local_addr()
            .map_err(|source| CallbackError::Bind {
                port: self.config.port,
                source,
            })?;

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let active: ActiveSlot = Arc::new(Mutex::new(Some(outcome_tx)));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let timeout = tokio::spawn(run_timeout(
            self.config.timeout,
            active.clone(),
            shutdown_tx.clone(),
        ));

        let ctx = Arc::new(CallbackCtx {
            store: self.store.clone(),
            client: self.client.clone(),
            endpoints: self.endpoints.clone(),
            expected_verifier: verifier,
            active: active.clone(),
            shutdown: shutdown_tx.clone(),
            timeout_abort: timeout.abort_handle(),
        });

        let path = callback_path(&self.endpoints.redirect_uri);
        let app = Router::new()
            .route(&path, get(callback_handler))
            .fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
            .with_state(ctx);

        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %err, "oauth callback server exited with an error");
            }
        });

        info!(addr = %addr, "oauth callback listener ready");
        let handle = ListenerHandle {
            active,
            shutdown: shutdown_tx,
            server,
            timeout,
        };
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(handle);
        }

        Ok(StartedCallback {
            addr,
            outcome: outcome_rx,
        })
    }

    /// Whether a login attempt is currently waiting on the provider redirect.
    pub fn in_progress(&self) -> bool {
        self.slot
            .lock()
            .ok()
            .and_then(|slot| {
                slot.as_ref()
                    .map(|handle| handle.active.lock().map(|a| a.is_some()).unwrap_or(false))
            })
            .unwrap_or(false)
    }

    fn supersede(&self) {
        let previous = self.slot.lock().ok().and_then(|mut slot| slot.take());
        let Some(handle) = previous else {
            return;
        };
        if let Ok(mut active) = handle.active.lock()
            && let Some(sender) = active.take()
        {
            warn!("pending oauth callback superseded by a new login attempt");
            let _ = sender.send(CallbackOutcome::Failed {
                error: "superseded by a new login attempt".to_string(),
            });
        }
        handle.timeout.abort();
        let _ = handle.shutdown.send(true);
        handle.server.abort();
    }

    async fn bind(&self) -> Result<TcpListener, CallbackError> {
        let addr = (Ipv4Addr::UNSPECIFIED, self.config.port);
        let mut last_err = None;
        // A superseded listener may still be releasing the port.
        for _ in 0..BIND_ATTEMPTS {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(err) => {
                    last_err = Some(err);
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
            }
        }
        Err(CallbackError::Bind {
            port: self.config.port,
            source: last_err
                .unwrap_or_else(|| std::io::Error::other("bind retries exhausted")),
        })
    }
}

async fn run_timeout(timeout: Duration, active: ActiveSlot, shutdown: watch::Sender<bool>) {
    tokio::time::sleep(timeout).await;
    let sender = active.lock().ok().and_then(|mut slot| slot.take());
    if let Some(sender) = sender {
        warn!("oauth callback timed out");
        let _ = sender.send(CallbackOutcome::TimedOut);
    }
    let _ = shutdown.send(true);
}

async fn callback_handler(
    State(ctx): State<Arc<CallbackCtx>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<String>) {
    if ctx.active.lock().map(|a| a.is_none()).unwrap_or(true) {
        return (
            StatusCode::GONE,
            Html(error_html("this login attempt has already completed")),
        );
    }

    if let Some(error) = params.get("error") {
        let detail = params
            .get("error_description")
            .unwrap_or(error)
            .to_string();
        resolve(&ctx, CallbackOutcome::Failed { error: detail.clone() });
        return (StatusCode::OK, Html(error_html(&detail)));
    }

    let (Some(code), Some(state)) = (params.get("code"), params.get("state")) else {
        let message = "missing code or state in callback".to_string();
        resolve(&ctx, CallbackOutcome::Failed { error: message.clone() });
        return (StatusCode::OK, Html(error_html(&message)));
    };

    let verifier = match oauth::decode_state(state) {
        Ok(verifier) => verifier,
        Err(err) => {
            let message = err.to_string();
            resolve(&ctx, CallbackOutcome::Failed { error: message.clone() });
            return (StatusCode::OK, Html(error_html(&message)));
        }
    };
    if verifier != ctx.expected_verifier {
        warn!("callback state carries a different verifier than this listener issued");
    }

    match oauth::exchange_with_verifier(&ctx.client, &ctx.endpoints, code, &verifier).await {
        Ok(tokens) => {
            let email = tokens.email.clone();
            let saved = ctx
                .store
                .save(CredentialPatch {
                    refresh_token: tokens.refresh_token,
                    access_token: Some(tokens.access_token),
                    expires_at: Some(tokens.expires_at),
                    email: tokens.email,
                    ..Default::default()
                })
                .await;
            match saved {
                Ok(()) => {
                    info!(email = email.as_deref().unwrap_or(""), "login completed");
                    resolve(&ctx, CallbackOutcome::Succeeded { email });
                    (StatusCode::OK, Html(SUCCESS_HTML.to_string()))
                }
                Err(err) => {
                    let message = format!("failed to persist credential: {err}");
                    resolve(&ctx, CallbackOutcome::Failed { error: message.clone() });
                    (StatusCode::OK, Html(error_html(&message)))
                }
            }
        }
        Err(err) => {
            let message = err.to_string();
            resolve(&ctx, CallbackOutcome::Failed { error: message.clone() });
            (StatusCode::OK, Html(error_html(&message)))
        }
    }
}

/// Resolves the pending promise and schedules teardown, leaving a short grace
/// period so the HTML response flushes before the listener goes away.
fn resolve(ctx: &CallbackCtx, outcome: CallbackOutcome) {
    let sender = ctx.active.lock().ok().and_then(|mut slot| slot.take());
    let Some(sender) = sender else {
        return;
    };
    ctx.timeout_abort.abort();
    let _ = sender.send(outcome);
    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(TEARDOWN_DELAY).await;
        let _ = shutdown.send(true);
    });
}

fn callback_path(redirect_uri: &str) -> String {
    let rest = redirect_uri
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(redirect_uri);
    match rest.find('/') {
        Some(idx) => rest[idx..].to_string(),
        None => "/".to_string(),
    }
}

const SUCCESS_HTML: &str = "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\"><title>gemgate - login</title></head>\n<body style=\"font-family: monospace; text-align: center; padding-top: 4rem;\">\n<h1>Authentication successful</h1>\n<p>You can close this window and return to the proxy.</p>\n</body>\n</html>";

fn error_html(error: &str) -> String {
    let escaped = error
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\"><title>gemgate - login</title></head>\n<body style=\"font-family: monospace; text-align: center; padding-top: 4rem;\">\n<h1>Authentication failed</h1>\n<p>Please close this window and try again.</p>\n<pre>{escaped}</pre>\n</body>\n</html>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_path_comes_from_the_redirect_uri() {
        assert_eq!(
            callback_path("http://localhost:8085/oauth2callback"),
            "/oauth2callback"
        );
        assert_eq!(callback_path("http://localhost:8085"), "/");
        assert_eq!(callback_path("weird"), "/");
    }

    #[test]
    fn error_page_escapes_markup() {
        let html = error_html("<script>alert(1)</script>");
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
