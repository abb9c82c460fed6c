//! Rewrites inbound Gemini API calls into the Code Assist internal shape.

use bytes::Bytes;
use http::Method;
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::headers::{header_remove, header_set};

pub const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";

const STREAM_ACTION: &str = "streamGenerateContent";

// Models the internal endpoint does not serve yet; substituted silently.
const MODEL_FALLBACKS: &[(&str, &str)] = &[("gemini-2.5-flash-image", "gemini-2.5-flash")];

const CODE_ASSIST_USER_AGENT: &str = "google-api-nodejs-client/9.15.1";
const CODE_ASSIST_API_CLIENT: &str = "gl-node/22.17.0";
const CODE_ASSIST_CLIENT_METADATA: &str =
    "ideType=IDE_UNSPECIFIED,platform=PLATFORM_UNSPECIFIED,pluginType=GEMINI";

/// An upstream-ready request produced from one inbound call.
#[derive(Debug)]
pub struct PreparedRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub streaming: bool,
    pub requested_model: Option<String>,
}

/// Prepares a Code Assist request from the original call.
///
/// Auth headers are always installed and client API keys stripped. When the
/// URL names `…/models/{model}:{action}`, the call is retargeted at the
/// internal endpoint and the body wrapped as `{project, model, request}`;
/// anything else passes through with auth only.
pub fn prepare_code_assist_request(
    original_url: &str,
    method: Method,
    original_headers: &[(String, String)],
    body: Option<Bytes>,
    access_token: &str,
    project_id: &str,
    code_assist_base: &str,
) -> PreparedRequest {
    let mut headers = original_headers.to_vec();
    header_remove(&mut headers, "x-goog-api-key");
    header_remove(&mut headers, "x-api-key");
    header_set(&mut headers, "Authorization", &format!("Bearer {access_token}"));

    let Some((raw_model, raw_action)) = parse_model_action(original_url) else {
        // Not a model request; pass through with auth.
        return PreparedRequest {
            url: original_url.to_string(),
            method,
            headers,
            body,
            streaming: false,
            requested_model: None,
        };
    };

    let effective_model = MODEL_FALLBACKS
        .iter()
        .find(|(from, _)| *from == raw_model)
        .map(|(_, to)| to.to_string())
        .unwrap_or_else(|| raw_model.clone());
    let streaming = raw_action == STREAM_ACTION;
    let url = format!(
        "{}/v1internal:{}{}",
        code_assist_base.trim_end_matches('/'),
        raw_action,
        if streaming { "?alt=sse" } else { "" }
    );

    let body = body.map(|bytes| transform_body(bytes, &effective_model, project_id));

    if streaming {
        header_set(&mut headers, "Accept", "text/event-stream");
    }
    header_set(&mut headers, "User-Agent", CODE_ASSIST_USER_AGENT);
    header_set(&mut headers, "X-Goog-Api-Client", CODE_ASSIST_API_CLIENT);
    header_set(&mut headers, "Client-Metadata", CODE_ASSIST_CLIENT_METADATA);

    PreparedRequest {
        url,
        method,
        headers,
        body,
        streaming,
        requested_model: Some(raw_model),
    }
}

/// Extracts `{model, action}` from a `…/models/{model}:{action}` URL.
fn parse_model_action(url: &str) -> Option<(String, String)> {
    let idx = url.find("/models/")?;
    let rest = &url[idx + "/models/".len()..];
    let colon = rest.find(':')?;
    let model = &rest[..colon];
    if model.is_empty() {
        return None;
    }
    let action: String = rest[colon + 1..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if action.is_empty() {
        return None;
    }
    Some((model.to_string(), action))
}

/// Wraps (or re-targets) a JSON body. Unparsable bodies pass through with a
/// warning: best-effort proxying beats a hard failure here.
fn transform_body(bytes: Bytes, effective_model: &str, project_id: &str) -> Bytes {
    let parsed: JsonValue = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "request body is not JSON; forwarding unmodified");
            return bytes;
        }
    };
    let JsonValue::Object(mut payload) = parsed else {
        warn!("request body is not a JSON object; forwarding unmodified");
        return bytes;
    };

    let is_wrapped = payload
        .get("project")
        .map(|value| value.is_string())
        .unwrap_or(false)
        && payload.contains_key("request");
    if is_wrapped {
        // Already in the internal shape; only the model field changes.
        payload.insert(
            "model".to_string(),
            JsonValue::String(effective_model.to_string()),
        );
        return to_bytes(JsonValue::Object(payload), bytes);
    }

    normalize_thinking(&mut payload);
    rename_system_instruction(&mut payload);
    normalize_cached_content(&mut payload);
    payload.remove("model");

    let wrapped = serde_json::json!({
        "project": project_id,
        "model": effective_model,
        "request": JsonValue::Object(payload),
    });
    to_bytes(wrapped, bytes)
}

fn to_bytes(value: JsonValue, fallback: Bytes) -> Bytes {
    match serde_json::to_vec(&value) {
        Ok(encoded) => Bytes::from(encoded),
        Err(err) => {
            warn!(error = %err, "failed to re-encode request body; forwarding original");
            fallback
        }
    }
}

/// Accepts both casings for the thinking settings, lower-cases the level, and
/// drops the config entirely when no recognized field remains.
fn normalize_thinking(payload: &mut Map<String, JsonValue>) {
    let Some(JsonValue::Object(generation_config)) = payload.get_mut("generationConfig") else {
        return;
    };
    let Some(raw) = generation_config.get("thinkingConfig") else {
        return;
    };

    let normalized = normalize_thinking_config(raw);
    match normalized {
        Some(config) => {
            generation_config.insert("thinkingConfig".to_string(), config);
        }
        None => {
            generation_config.remove("thinkingConfig");
        }
    }
}

fn normalize_thinking_config(raw: &JsonValue) -> Option<JsonValue> {
    let record = raw.as_object()?;

    let budget = record
        .get("thinkingBudget")
        .or_else(|| record.get("thinking_budget"))
        .and_then(|value| value.as_number())
        .filter(|number| number.as_f64().map(f64::is_finite).unwrap_or(false))
        .cloned();
    let level = record
        .get("thinkingLevel")
        .or_else(|| record.get("thinking_level"))
        .and_then(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_lowercase());
    let include = record
        .get("includeThoughts")
        .or_else(|| record.get("include_thoughts"))
        .and_then(|value| value.as_bool());

    if budget.is_none() && level.is_none() && include.is_none() {
        return None;
    }

    let mut normalized = Map::new();
    if let Some(budget) = budget {
        normalized.insert("thinkingBudget".to_string(), JsonValue::Number(budget));
    }
    if let Some(level) = level {
        normalized.insert("thinkingLevel".to_string(), JsonValue::String(level));
    }
    if let Some(include) = include {
        normalized.insert("includeThoughts".to_string(), JsonValue::Bool(include));
    }
    Some(JsonValue::Object(normalized))
}

fn rename_system_instruction(payload: &mut Map<String, JsonValue>) {
    if let Some(value) = payload.remove("system_instruction") {
        payload.insert("systemInstruction".to_string(), value);
    }
}

/// Canonicalizes a cached-content reference from any of its three source
/// locations into the one field the internal endpoint reads.
fn normalize_cached_content(payload: &mut Map<String, JsonValue>) {
    let not_null = |value: &JsonValue| !value.is_null();
    let from_extra = payload
        .get("extra_body")
        .and_then(|value| value.as_object())
        .and_then(|extra| {
            extra
                .get("cached_content")
                .cloned()
                .filter(not_null)
                .or_else(|| extra.get("cachedContent").cloned().filter(not_null))
        });
    let cached = payload
        .get("cached_content")
        .cloned()
        .filter(not_null)
        .or_else(|| payload.get("cachedContent").cloned().filter(not_null))
        .or(from_extra);

    if let Some(cached) = cached
        && is_usable_string(&cached)
    {
        payload.insert("cachedContent".to_string(), cached);
    }

    payload.remove("cached_content");
    if let Some(JsonValue::Object(extra)) = payload.get_mut("extra_body") {
        extra.remove("cached_content");
        extra.remove("cachedContent");
        if extra.is_empty() {
            payload.remove("extra_body");
        }
    }
}

fn is_usable_string(value: &JsonValue) -> bool {
    value.as_str().map(|s| !s.is_empty()).unwrap_or(false)
}
