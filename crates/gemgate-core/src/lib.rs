//! Proxy engine: orchestrates authentication, project resolution, and the
//! bidirectional transform around each upstream call.

pub mod engine;
pub mod upstream;

pub use engine::{EngineBody, EngineConfig, EngineResponse, ProxyCall, ProxyEngine};
pub use upstream::{
    UpstreamBody, UpstreamClient, UpstreamClientConfig, UpstreamError, UpstreamResponse,
};
