use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use http::Method;
use serde_json::{json, Value};

use gemgate_auth::{OAuthEndpoints, TokenManager};
use gemgate_core::{
    EngineBody, EngineConfig, ProxyCall, ProxyEngine, UpstreamClient, UpstreamClientConfig,
};
use gemgate_project::{ProjectResolver, ResolverConfig};
use gemgate_storage::{CredentialPatch, CredentialStore, MemoryStore};

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Default)]
struct StubState {
    generate_body: Arc<Mutex<Option<Value>>>,
}

async fn load_handler() -> Json<Value> {
    Json(json!({ "cloudaicompanionProject": "proj-1" }))
}

async fn generate_handler(State(state): State<StubState>, Json(body): Json<Value>) -> Json<Value> {
    *state.generate_body.lock().unwrap() = Some(body);
    Json(json!({
        "response": {
            "candidates": [{ "content": { "parts": [{ "text": "hi" }] } }],
            "usageMetadata": {
                "totalTokenCount": 12,
                "promptTokenCount": 10,
                "candidatesTokenCount": 2,
                "cachedContentTokenCount": 8,
            },
        },
    }))
}

async fn stream_handler() -> impl IntoResponse {
    // Chunk boundaries split a data line mid-payload.
    let chunks: Vec<Result<Bytes, Infallible>> = vec![
        Ok(Bytes::from_static(b"data: {\"response\":{\"candidates\":[{\"text\":\"he")),
        Ok(Bytes::from_static(b"llo\"}]}}\n\n")),
        Ok(Bytes::from_static(b"data: {\"untouched\":true}\n\n")),
        Ok(Bytes::from_static(b"data: {\"response\":{\"done\":true}}\n\n")),
    ];
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(tokio_stream::iter(chunks)),
    )
}

async fn plain_handler() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], "plain passthrough")
}

async fn spawn_stub(state: StubState) -> SocketAddr {
    let app = Router::new()
        .route("/v1internal:loadCodeAssist", post(load_handler))
        .route("/v1internal:generateContent", post(generate_handler))
        .route("/v1internal:streamGenerateContent", post(stream_handler))
        .route("/v1beta/other", get(plain_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn engine_for(addr: SocketAddr, authenticated: bool) -> ProxyEngine {
    let base = format!("http://{addr}");

    let store = Arc::new(MemoryStore::new());
    if authenticated {
        store
            .save(CredentialPatch {
                refresh_token: "refresh-1".to_string(),
                access_token: Some("access-1".to_string()),
                expires_at: Some(now_ms() + 600_000),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let upstream = UpstreamClient::new(UpstreamClientConfig::default()).unwrap();
    let resolver = Arc::new(ProjectResolver::with_config(
        store.clone(),
        upstream.http(),
        ResolverConfig {
            base_url: base.clone(),
            onboard_attempts: 1,
            poll_delay: std::time::Duration::ZERO,
        },
    ));
    let tokens = Arc::new(TokenManager::new(
        store,
        resolver.clone(),
        upstream.http(),
        OAuthEndpoints {
            // Unroutable: refresh must not happen in these tests.
            token_url: "http://127.0.0.1:9/token".to_string(),
            ..Default::default()
        },
    ));
    let config = EngineConfig {
        code_assist_base: base.clone(),
        standard_base: base,
    };
    ProxyEngine::new(tokens, resolver, upstream, config)
}

fn call(method: Method, api_path: &str, body: Option<Value>) -> ProxyCall {
    ProxyCall {
        method,
        api_path: api_path.to_string(),
        query: None,
        headers: vec![
            ("host".to_string(), "localhost:8888".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ],
        body: body.map(|value| Bytes::from(value.to_string())),
    }
}

fn body_bytes(response: gemgate_core::EngineResponse) -> Bytes {
    match response.body {
        EngineBody::Bytes(bytes) => bytes,
        EngineBody::Stream(_) => panic!("expected a buffered body"),
    }
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[tokio::test(flavor = "multi_thread")]
async fn generate_call_is_wrapped_and_unwrapped() {
    let state = StubState::default();
    let addr = spawn_stub(state.clone()).await;
    let engine = engine_for(addr, true).await;

    let response = engine
        .handle(call(
            Method::POST,
            "/v1beta/models/gemini-pro:generateContent",
            Some(json!({ "contents": [] })),
        ))
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(
        header(&response.headers, "x-gemini-cached-content-token-count"),
        Some("8")
    );
    let headers = response.headers.clone();
    let body: Value = serde_json::from_slice(&body_bytes(response)).unwrap();
    assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "hi");
    assert!(body.get("response").is_none());
    assert_eq!(header(&headers, "content-length"), None);

    // The upstream saw the wrapped internal shape with the resolved project.
    let seen = state.generate_body.lock().unwrap().clone().unwrap();
    assert_eq!(seen["project"], "proj-1");
    assert_eq!(seen["model"], "gemini-pro");
    assert_eq!(seen["request"], json!({ "contents": [] }));
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_call_rewrites_sse_lines() {
    let addr = spawn_stub(StubState::default()).await;
    let engine = engine_for(addr, true).await;

    let response = engine
        .handle(call(
            Method::POST,
            "/v1beta/models/gemini-pro:streamGenerateContent",
            Some(json!({ "contents": [] })),
        ))
        .await;

    assert_eq!(response.status, 200);
    let EngineBody::Stream(mut rx) = response.body else {
        panic!("expected a streaming body");
    };
    let mut collected = Vec::new();
    while let Some(chunk) = rx.recv().await {
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(
        String::from_utf8(collected).unwrap(),
        "data: {\"candidates\":[{\"text\":\"hello\"}]}\n\ndata: {\"untouched\":true}\n\ndata: {\"done\":true}\n\n"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unauthenticated_calls_get_a_structured_401() {
    let state = StubState::default();
    let addr = spawn_stub(state.clone()).await;
    let engine = engine_for(addr, false).await;

    let response = engine
        .handle(call(
            Method::POST,
            "/v1beta/models/gemini-pro:generateContent",
            Some(json!({ "contents": [] })),
        ))
        .await;

    assert_eq!(response.status, 401);
    let body: Value = serde_json::from_slice(&body_bytes(response)).unwrap();
    assert_eq!(body["error"]["status"], "UNAUTHENTICATED");
    assert_eq!(body["error"]["code"], 401);
    assert!(state.generate_body.lock().unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn non_json_responses_pass_through_untouched() {
    let addr = spawn_stub(StubState::default()).await;
    let engine = engine_for(addr, true).await;

    let response = engine
        .handle(call(Method::GET, "/v1beta/other", None))
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(&body_bytes(response)[..], b"plain passthrough");
}
