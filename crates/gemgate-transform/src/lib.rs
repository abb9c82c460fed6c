//! Bidirectional request/response transformation between the public Gemini
//! wire shape and the Code Assist internal shape, including the streaming
//! SSE rewrite.

pub mod headers;
pub mod request;
pub mod response;
pub mod sse;

pub use request::{prepare_code_assist_request, PreparedRequest, CODE_ASSIST_ENDPOINT};
pub use response::{
    parse_api_body, rewrite_preview_access_error, strip_transport_headers,
    transform_json_response, ResponseRewrite, UsageMetadata,
};
pub use sse::SseLineRewriter;
