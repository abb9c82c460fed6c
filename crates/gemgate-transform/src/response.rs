//! Rewrites upstream Code Assist responses back into the public shape:
//! unwraps the internal `{response: …}` envelope, surfaces retry hints and
//! usage counters as headers, and clarifies preview-access 404s.

use bytes::Bytes;
use serde_json::Value as JsonValue;

use crate::headers::header_set;

const RETRY_INFO_TYPE: &str = "type.googleapis.com/google.rpc.RetryInfo";
const PREVIEW_LINK: &str = "https://goo.gle/enable-preview-features";
const DEFAULT_PREVIEW_MESSAGE: &str =
    "Gemini 3 preview features are not enabled for this account.";

/// Outcome of the non-streaming rewrite: adjusted headers plus the body to
/// hand to the client.
#[derive(Debug)]
pub struct ResponseRewrite {
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Strips transport headers that stop being true once the body is rewritten.
pub fn strip_transport_headers(headers: &mut Vec<(String, String)>) {
    headers.retain(|(k, _)| {
        !k.eq_ignore_ascii_case("content-encoding") && !k.eq_ignore_ascii_case("content-length")
    });
}

/// Full non-streaming rewrite over the buffered body text.
pub fn transform_json_response(
    status: u16,
    headers: &[(String, String)],
    text: &str,
    requested_model: Option<&str>,
) -> ResponseRewrite {
    let mut headers = headers.to_vec();
    strip_transport_headers(&mut headers);

    let ok = (200..300).contains(&status);
    if !ok && !text.is_empty() {
        apply_retry_hints(&mut headers, text);
    }

    let parsed = parse_api_body(text);
    let patched = parsed
        .as_ref()
        .and_then(|body| rewrite_preview_access_error(body, status, requested_model));
    let effective = patched.as_ref().or(parsed.as_ref());

    if let Some(usage) = effective.and_then(extract_usage_metadata) {
        apply_usage_headers(&mut headers, &usage);
    }

    let body = match (parsed.as_ref(), effective) {
        (None, _) => Bytes::copy_from_slice(text.as_bytes()),
        (Some(_), Some(effective)) => {
            if let Some(inner) = effective.get("response") {
                encode(inner, text)
            } else if let Some(patched) = &patched {
                encode(patched, text)
            } else {
                Bytes::copy_from_slice(text.as_bytes())
            }
        }
        (Some(_), None) => Bytes::copy_from_slice(text.as_bytes()),
    };

    ResponseRewrite { headers, body }
}

fn encode(value: &JsonValue, fallback: &str) -> Bytes {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::copy_from_slice(fallback.as_bytes()))
}

/// Parses a response body, unwrapping the array framing the API sometimes
/// uses by taking its first object element.
pub fn parse_api_body(text: &str) -> Option<JsonValue> {
    let parsed: JsonValue = serde_json::from_str(text).ok()?;
    match parsed {
        JsonValue::Array(items) => items.into_iter().find(|item| item.is_object()),
        JsonValue::Object(_) => Some(parsed),
        _ => None,
    }
}

/// Token counters reported under `response.usageMetadata`.
#[derive(Debug, Default, PartialEq)]
pub struct UsageMetadata {
    pub total_token_count: Option<i64>,
    pub prompt_token_count: Option<i64>,
    pub candidates_token_count: Option<i64>,
    pub cached_content_token_count: Option<i64>,
}

pub fn extract_usage_metadata(body: &JsonValue) -> Option<UsageMetadata> {
    let usage = body.get("response")?.get("usageMetadata")?;
    if !usage.is_object() {
        return None;
    }
    let count = |key: &str| usage.get(key).and_then(|value| value.as_i64());
    Some(UsageMetadata {
        total_token_count: count("totalTokenCount"),
        prompt_token_count: count("promptTokenCount"),
        candidates_token_count: count("candidatesTokenCount"),
        cached_content_token_count: count("cachedContentTokenCount"),
    })
}

fn apply_usage_headers(headers: &mut Vec<(String, String)>, usage: &UsageMetadata) {
    let Some(cached) = usage.cached_content_token_count else {
        return;
    };
    header_set(headers, "x-gemini-cached-content-token-count", &cached.to_string());
    if let Some(total) = usage.total_token_count {
        header_set(headers, "x-gemini-total-token-count", &total.to_string());
    }
    if let Some(prompt) = usage.prompt_token_count {
        header_set(headers, "x-gemini-prompt-token-count", &prompt.to_string());
    }
    if let Some(candidates) = usage.candidates_token_count {
        header_set(
            headers,
            "x-gemini-candidates-token-count",
            &candidates.to_string(),
        );
    }
}

/// Propagates a structured retry hint as both whole-second and millisecond
/// headers so clients of either convention back off correctly.
fn apply_retry_hints(headers: &mut Vec<(String, String)>, text: &str) {
    let Ok(body) = serde_json::from_str::<JsonValue>(text) else {
        return;
    };
    let Some(details) = body
        .get("error")
        .and_then(|error| error.get("details"))
        .and_then(|details| details.as_array())
    else {
        return;
    };
    let retry_delay = details.iter().find_map(|detail| {
        if detail.get("@type").and_then(|t| t.as_str()) != Some(RETRY_INFO_TYPE) {
            return None;
        }
        detail.get("retryDelay").and_then(|delay| delay.as_str())
    });
    let Some(seconds) = retry_delay.and_then(parse_retry_delay_secs) else {
        return;
    };
    header_set(headers, "Retry-After", &(seconds.ceil() as i64).to_string());
    header_set(
        headers,
        "retry-after-ms",
        &((seconds * 1000.0).ceil() as i64).to_string(),
    );
}

/// Accepts the protobuf duration rendering `"<float>s"`, e.g. `"2.5s"`.
fn parse_retry_delay_secs(value: &str) -> Option<f64> {
    let digits = value.strip_suffix('s')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let seconds: f64 = digits.parse().ok()?;
    (seconds.is_finite() && seconds > 0.0).then_some(seconds)
}

/// Rewrites a 404 that really means "preview features not enabled" into an
/// actionable message with the enrollment link.
pub fn rewrite_preview_access_error(
    body: &JsonValue,
    status: u16,
    requested_model: Option<&str>,
) -> Option<JsonValue> {
    if status != 404 {
        return None;
    }
    let error_message = body
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(|message| message.as_str())
        .unwrap_or("");
    let applies = requested_model.map(is_gemini_three).unwrap_or(false)
        || is_gemini_three(error_message);
    if !applies {
        return None;
    }

    let trimmed = error_message.trim();
    let prefix = if trimmed.is_empty() {
        DEFAULT_PREVIEW_MESSAGE
    } else {
        trimmed
    };
    let message = format!(
        "{prefix} Request preview access at {PREVIEW_LINK} before using Gemini 3 models."
    );

    let mut patched = body.clone();
    let error = patched
        .as_object_mut()?
        .entry("error")
        .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
    if !error.is_object() {
        *error = JsonValue::Object(serde_json::Map::new());
    }
    error
        .as_object_mut()?
        .insert("message".to_string(), JsonValue::String(message));
    Some(patched)
}

/// Matches "gemini 3", "gemini-3", and "gemini3", case-insensitively.
fn is_gemini_three(target: &str) -> bool {
    let lower = target.to_lowercase();
    let mut rest = lower.as_str();
    while let Some(idx) = rest.find("gemini") {
        let after = &rest[idx + "gemini".len()..];
        let mut chars = after.chars();
        match chars.next() {
            Some('3') => return true,
            Some(c) if c.is_whitespace() || c == '-' => {
                if chars.next() == Some('3') {
                    return true;
                }
            }
            _ => {}
        }
        rest = &rest[idx + "gemini".len()..];
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers_with(values: &[(&str, &str)]) -> Vec<(String, String)> {
        values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        crate::headers::header_get(headers, name)
    }

    #[test]
    fn transport_headers_are_stripped() {
        let rewrite = transform_json_response(
            200,
            &headers_with(&[
                ("content-encoding", "gzip"),
                ("content-length", "100"),
                ("content-type", "application/json"),
            ]),
            "{}",
            None,
        );
        assert_eq!(header(&rewrite.headers, "content-encoding"), None);
        assert_eq!(header(&rewrite.headers, "content-length"), None);
        assert_eq!(
            header(&rewrite.headers, "content-type"),
            Some("application/json")
        );
    }

    #[test]
    fn wrapped_response_is_unwrapped() {
        let body = json!({ "response": { "candidates": [{ "index": 0 }] } }).to_string();
        let rewrite = transform_json_response(200, &[], &body, None);
        let out: JsonValue = serde_json::from_slice(&rewrite.body).unwrap();
        assert_eq!(out, json!({ "candidates": [{ "index": 0 }] }));
    }

    #[test]
    fn array_wrapped_body_uses_first_object() {
        let body = json!([{ "response": { "ok": true } }, { "other": 1 }]).to_string();
        let rewrite = transform_json_response(200, &[], &body, None);
        let out: JsonValue = serde_json::from_slice(&rewrite.body).unwrap();
        assert_eq!(out, json!({ "ok": true }));
    }

    #[test]
    fn unwrapped_body_passes_through_verbatim() {
        let body = r#"{"candidates": []}"#;
        let rewrite = transform_json_response(200, &[], body, None);
        assert_eq!(&rewrite.body[..], body.as_bytes());
    }

    #[test]
    fn non_json_body_passes_through_verbatim() {
        let rewrite = transform_json_response(200, &[], "plain text", None);
        assert_eq!(&rewrite.body[..], b"plain text");
    }

    #[test]
    fn retry_delay_sets_both_headers() {
        let body = json!({
            "error": {
                "code": 429,
                "details": [
                    { "@type": "type.googleapis.com/google.rpc.ErrorInfo" },
                    {
                        "@type": "type.googleapis.com/google.rpc.RetryInfo",
                        "retryDelay": "2.5s",
                    },
                ],
            },
        })
        .to_string();
        let rewrite = transform_json_response(429, &[], &body, None);
        assert_eq!(header(&rewrite.headers, "Retry-After"), Some("3"));
        assert_eq!(header(&rewrite.headers, "retry-after-ms"), Some("2500"));
    }

    #[test]
    fn malformed_retry_delays_are_ignored() {
        for delay in ["", "s", "2.5", "-1s", "NaNs", "2.5.s.x"] {
            let body = json!({
                "error": {
                    "details": [{
                        "@type": "type.googleapis.com/google.rpc.RetryInfo",
                        "retryDelay": delay,
                    }],
                },
            })
            .to_string();
            let rewrite = transform_json_response(429, &[], &body, None);
            assert_eq!(header(&rewrite.headers, "Retry-After"), None, "{delay:?}");
        }
    }

    #[test]
    fn usage_counters_become_headers() {
        let body = json!({
            "response": {
                "usageMetadata": {
                    "totalTokenCount": 120,
                    "promptTokenCount": 100,
                    "candidatesTokenCount": 20,
                    "cachedContentTokenCount": 64,
                },
            },
        })
        .to_string();
        let rewrite = transform_json_response(200, &[], &body, None);
        assert_eq!(
            header(&rewrite.headers, "x-gemini-cached-content-token-count"),
            Some("64")
        );
        assert_eq!(
            header(&rewrite.headers, "x-gemini-total-token-count"),
            Some("120")
        );
        assert_eq!(
            header(&rewrite.headers, "x-gemini-prompt-token-count"),
            Some("100")
        );
        assert_eq!(
            header(&rewrite.headers, "x-gemini-candidates-token-count"),
            Some("20")
        );
    }

    #[test]
    fn usage_headers_require_a_cached_content_count() {
        let body = json!({
            "response": { "usageMetadata": { "totalTokenCount": 120 } },
        })
        .to_string();
        let rewrite = transform_json_response(200, &[], &body, None);
        assert_eq!(header(&rewrite.headers, "x-gemini-total-token-count"), None);
    }

    #[test]
    fn preview_404_is_rewritten_for_gemini_three_models() {
        let body = json!({
            "error": { "code": 404, "message": "models/gemini-3-pro is not found" },
        })
        .to_string();
        let rewrite = transform_json_response(404, &[], &body, Some("gemini-3-pro"));
        let out: JsonValue = serde_json::from_slice(&rewrite.body).unwrap();
        let message = out["error"]["message"].as_str().unwrap();
        assert!(message.starts_with("models/gemini-3-pro is not found"));
        assert!(message.contains(PREVIEW_LINK));
    }

    #[test]
    fn preview_rewrite_triggers_on_the_error_text_alone() {
        let body = json!({
            "error": { "code": 404, "message": "Gemini 3 preview is unavailable" },
        })
        .to_string();
        let rewrite = transform_json_response(404, &[], &body, Some("unrelated-model"));
        let out: JsonValue = serde_json::from_slice(&rewrite.body).unwrap();
        assert!(out["error"]["message"].as_str().unwrap().contains(PREVIEW_LINK));
    }

    #[test]
    fn unrelated_404_is_untouched() {
        let body = json!({
            "error": { "code": 404, "message": "models/text-bison is not found" },
        })
        .to_string();
        let rewrite = transform_json_response(404, &[], &body, Some("text-bison"));
        assert_eq!(&rewrite.body[..], body.as_bytes());
    }

    #[test]
    fn non_404_statuses_never_rewrite() {
        let body = json!({
            "error": { "code": 403, "message": "gemini-3 access denied" },
        })
        .to_string();
        let rewrite = transform_json_response(403, &[], &body, Some("gemini-3-pro"));
        assert_eq!(&rewrite.body[..], body.as_bytes());
    }

    #[test]
    fn gemini_three_matching_variants() {
        for hit in ["gemini-3-pro", "Gemini 3", "GEMINI3", "try gemini-3 now"] {
            assert!(is_gemini_three(hit), "{hit:?}");
        }
        for miss in ["gemini-2.5-pro", "gem-3", "gemini", "gemini-x3", ""] {
            assert!(!is_gemini_three(miss), "{miss:?}");
        }
    }
}
