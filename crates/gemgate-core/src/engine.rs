//! Per-request orchestration: valid token, project context, request
//! transform, upstream call, response transform.

use std::sync::Arc;

use bytes::Bytes;
use http::Method;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use gemgate_auth::TokenManager;
use gemgate_project::ProjectResolver;
use gemgate_transform::headers::header_get;
use gemgate_transform::{
    prepare_code_assist_request, strip_transport_headers, transform_json_response,
    SseLineRewriter, CODE_ASSIST_ENDPOINT,
};

use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamResponse};

const STANDARD_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

// Hop-by-hop and transport headers never forwarded upstream.
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "connection", "content-length", "accept-encoding"];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Code Assist internal endpoint; model calls are retargeted here.
    pub code_assist_base: String,
    /// Public API endpoint; non-model paths proxy here unchanged.
    pub standard_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            code_assist_base: CODE_ASSIST_ENDPOINT.to_string(),
            standard_base: STANDARD_ENDPOINT.to_string(),
        }
    }
}

/// One inbound call, already stripped of the local routing prefix.
#[derive(Debug)]
pub struct ProxyCall {
    pub method: Method,
    /// Upstream API path, e.g. `/v1beta/models/gemini-pro:generateContent`.
    pub api_path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

pub enum EngineBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

pub struct EngineResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: EngineBody,
}

impl EngineResponse {
    fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: EngineBody::Bytes(Bytes::from(body.to_string())),
        }
    }
}

/// Structured error in the upstream's own error envelope.
fn error_response(status: u16, message: &str, status_text: &str) -> EngineResponse {
    EngineResponse::json(
        status,
        json!({
            "error": { "code": status, "message": message, "status": status_text },
        }),
    )
}

pub struct ProxyEngine {
    tokens: Arc<TokenManager>,
    projects: Arc<ProjectResolver>,
    upstream: UpstreamClient,
    config: EngineConfig,
}

impl ProxyEngine {
    pub fn new(
        tokens: Arc<TokenManager>,
        projects: Arc<ProjectResolver>,
        upstream: UpstreamClient,
        config: EngineConfig,
    ) -> Self {
        Self {
            tokens,
            projects,
            upstream,
            config,
        }
    }

    pub async fn handle(&self, call: ProxyCall) -> EngineResponse {
        let Some(access_token) = self.tokens.ensure_valid_token().await else {
            return error_response(
                401,
                "Not authenticated. Start a login via GET /auth/login.",
                "UNAUTHENTICATED",
            );
        };

        let project_id = match self.projects.ensure_project_context(&access_token).await {
            Ok(project_id) => project_id,
            Err(err) => {
                error!(error = %err, "project context resolution failed");
                return error_response(500, &err.to_string(), "INTERNAL");
            }
        };

        let mut headers = call.headers;
        headers.retain(|(k, _)| {
            !SKIPPED_REQUEST_HEADERS
                .iter()
                .any(|skip| k.eq_ignore_ascii_case(skip))
        });

        let target_url = match &call.query {
            Some(query) if !query.is_empty() => {
                format!("{}{}?{}", self.config.standard_base, call.api_path, query)
            }
            _ => format!("{}{}", self.config.standard_base, call.api_path),
        };
        let prepared = prepare_code_assist_request(
            &target_url,
            call.method,
            &headers,
            call.body,
            &access_token,
            &project_id,
            &self.config.code_assist_base,
        );
        let streaming = prepared.streaming;
        let requested_model = prepared.requested_model.clone();
        debug!(url = %prepared.url, streaming, "proxying upstream");

        let response = match self.upstream.send(prepared).await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "upstream call failed");
                return error_response(500, &err.to_string(), "INTERNAL");
            }
        };
        info!(status = response.status, streaming, "upstream responded");

        self.transform_response(response, streaming, requested_model.as_deref())
            .await
    }

    async fn transform_response(
        &self,
        response: UpstreamResponse,
        streaming: bool,
        requested_model: Option<&str>,
    ) -> EngineResponse {
        let content_type = header_get(&response.headers, "content-type").unwrap_or("");
        let is_json = content_type.contains("application/json");
        let is_event_stream = content_type.contains("text/event-stream");
        let ok = (200..300).contains(&response.status);
        let UpstreamResponse {
            status,
            mut headers,
            body,
        } = response;

        if !is_json && !is_event_stream {
            return EngineResponse {
                status,
                headers,
                body: into_engine_body(body),
            };
        }

        let body = match body {
            UpstreamBody::Stream(upstream_rx) if streaming && ok && is_event_stream => {
                strip_transport_headers(&mut headers);
                return EngineResponse {
                    status,
                    headers,
                    body: EngineBody::Stream(spawn_sse_rewrite(upstream_rx)),
                };
            }
            other => other,
        };

        let text = collect_text(body).await;
        let rewrite = transform_json_response(status, &headers, &text, requested_model);
        EngineResponse {
            status,
            headers: rewrite.headers,
            body: EngineBody::Bytes(rewrite.body),
        }
    }
}

fn into_engine_body(body: UpstreamBody) -> EngineBody {
    match body {
        UpstreamBody::Bytes(bytes) => EngineBody::Bytes(bytes),
        UpstreamBody::Stream(rx) => EngineBody::Stream(rx),
    }
}

/// Pipes the upstream byte stream through the SSE line rewriter. Dropping the
/// returned receiver tears the whole chain down, cancelling the upstream read.
fn spawn_sse_rewrite(mut upstream_rx: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut rewriter = SseLineRewriter::new();
        while let Some(chunk) = upstream_rx.recv().await {
            let out = rewriter.push(&chunk);
            if !out.is_empty() && tx.send(out).await.is_err() {
                return;
            }
        }
        if let Some(tail) = rewriter.finish() {
            let _ = tx.send(tail).await;
        }
    });
    rx
}

async fn collect_text(body: UpstreamBody) -> String {
    let bytes = match body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(mut rx) => {
            let mut collected = Vec::new();
            while let Some(chunk) = rx.recv().await {
                collected.extend_from_slice(&chunk);
            }
            Bytes::from(collected)
        }
    };
    String::from_utf8_lossy(&bytes).into_owned()
}
