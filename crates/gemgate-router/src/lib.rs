//! HTTP surface of the proxy: the two proxied prefixes plus the small
//! auth-control API.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use gemgate_auth::{authorize, CallbackListener, OAuthEndpoints, TokenManager};
use gemgate_core::{EngineBody, EngineResponse, ProxyCall, ProxyEngine};

const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub tokens: Arc<TokenManager>,
    pub callback: Arc<CallbackListener>,
    pub endpoints: OAuthEndpoints,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/codeassist/{*path}", any(proxy_handler))
        .route("/gemini/{*path}", any(proxy_handler))
        .route("/auth/login", get(auth_login))
        .route("/auth/status", get(auth_status))
        .route("/auth/logout", post(auth_logout))
        .fallback(unknown_path)
        .with_state(state)
}

async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to read request body");
            return error_json(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };
    let body = if method == Method::GET || method == Method::HEAD || bytes.is_empty() {
        None
    } else {
        Some(bytes)
    };

    let path = parts.uri.path();
    let api_path = path
        .strip_prefix("/codeassist")
        .or_else(|| path.strip_prefix("/gemini"))
        .unwrap_or(path)
        .to_string();
    info!(method = %method, path = %path, "proxying");

    let headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|value| (k.as_str().to_string(), value.to_string()))
        })
        .collect();

    let call = ProxyCall {
        method,
        api_path,
        query: parts.uri.query().map(|q| q.to_string()),
        headers,
        body,
    };
    into_response(state.engine.handle(call).await)
}

fn into_response(engine_response: EngineResponse) -> Response {
    let body = match engine_response.body {
        EngineBody::Bytes(bytes) => Body::from(bytes),
        EngineBody::Stream(rx) => {
            Body::from_stream(ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>))
        }
    };
    let mut response = Response::new(body);
    *response.status_mut() =
        StatusCode::from_u16(engine_response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in &engine_response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

/// Builds the authorization URL and arms the callback listener; the login
/// completes out of band when the provider redirects back.
async fn auth_login(State(state): State<AppState>) -> Response {
    let authorization = authorize(&state.endpoints);
    match state.callback.start(authorization.verifier).await {
        Ok(started) => {
            tokio::spawn(async move {
                match started.outcome.await {
                    Ok(outcome) => info!(?outcome, "login attempt finished"),
                    Err(_) => warn!("login attempt dropped without resolving"),
                }
            });
            Json(json!({
                "auth_url": authorization.url,
                "status": "listening",
            }))
            .into_response()
        }
        Err(err) => {
            error!(error = %err, "could not start the oauth callback listener");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn auth_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let token_state = state.tokens.token_state().await;
    Json(json!({
        "authenticated": token_state.has_token,
        "email": token_state.email,
        "expires_at": token_state.expires_at,
        "access_token_valid": !token_state.is_expired,
        "needs_refresh": token_state.needs_refresh,
        "oauth_in_progress": state.callback.in_progress(),
    }))
}

async fn auth_logout(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.tokens.purge().await;
    info!("logged out; credential state cleared");
    Json(json!({ "ok": true }))
}

async fn unknown_path(request: Request) -> Response {
    let path = request.uri().path().to_string();
    let body = json!({
        "error": {
            "code": 404,
            "message": format!(
                "Unknown path: {path}. Use /codeassist/* for the Code Assist API or /gemini/* for the standard Gemini API."
            ),
            "status": "NOT_FOUND",
        },
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

fn error_json(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "error": {
            "code": status.as_u16(),
            "message": message,
            "status": status.canonical_reason().unwrap_or("ERROR"),
        },
    });
    (status, Json(body)).into_response()
}
