//! # Request and Response Model
//!
//! The value types that flow between the HTTP layer, the gateway manager and
//! provider bridges. The request payload is semantically an Anthropic-style
//! chat-completions body, but this crate treats it as an opaque
//! `serde_json::Value`: only the routing layer peeks at a handful of fields
//! (messages, tools, stream) to classify the request.
//!
//! ## Example
//!
//! ```rust
//! use polyrelay_core::{Request, Response};
//!
//! let request = Request::new("llama3.1-70b", serde_json::json!({
//!     "messages": [{ "role": "user", "content": "hi" }],
//!     "stream": false
//! }));
//!
//! let response = Response::ok("cerebras", 200, serde_json::json!({ "id": "msg_1" }), 85.0);
//! assert!(response.success);
//! assert_eq!(response.provider_name, "cerebras");
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A single upstream request as seen by the gateway core.
///
/// `data` carries the full chat-completions body. `model` is duplicated out
/// of the payload because provider filtering needs it without parsing the
/// body; an empty string means "let routing pick".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Requested model name; empty when the caller defers to routing
    pub model: String,
    /// HTTP-style method, almost always POST
    pub method: String,
    /// Opaque structured payload (messages, tools, stream flag, ...)
    pub data: serde_json::Value,
    /// Correlation id threaded through logs and metric records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Request {
    /// Create a POST request with a fresh correlation id.
    pub fn new(model: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            model: model.into(),
            method: "POST".to_string(),
            data,
            correlation_id: Some(Uuid::new_v4().to_string()),
        }
    }

    /// Replace the generated correlation id, e.g. with one supplied by the
    /// HTTP layer.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Whether the payload asks for a streamed reply.
    pub fn wants_streaming(&self) -> bool {
        self.data
            .get("stream")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// The `messages` array of the payload, when present.
    pub fn messages(&self) -> Option<&Vec<serde_json::Value>> {
        self.data.get("messages").and_then(serde_json::Value::as_array)
    }
}

/// A provider reply (or synthesized failure) in the envelope the gateway
/// hands back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// True iff the upstream call completed with a 2xx status
    pub success: bool,
    /// Provider that produced this response; empty when none was dispatched
    pub provider_name: String,
    /// HTTP-style status code
    pub status_code: u16,
    /// Wall-clock time spent on the upstream attempt(s)
    pub response_time_ms: f64,
    /// Provider reply body, opaque to the core
    pub data: serde_json::Value,
    /// Error description for failed responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Response {
    /// Successful reply from a provider.
    pub fn ok(
        provider: impl Into<String>,
        status_code: u16,
        data: serde_json::Value,
        response_time_ms: f64,
    ) -> Self {
        Self {
            success: true,
            provider_name: provider.into(),
            status_code,
            response_time_ms,
            data,
            error_message: None,
        }
    }

    /// Failed reply, either relayed from a provider or synthesized by the
    /// gateway itself.
    pub fn error(
        provider: impl Into<String>,
        status_code: u16,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            provider_name: provider.into(),
            status_code,
            response_time_ms: 0.0,
            data: serde_json::Value::Null,
            error_message: Some(message.into()),
        }
    }

    /// Attach the measured duration to a response.
    pub fn with_response_time(mut self, response_time_ms: f64) -> Self {
        self.response_time_ms = response_time_ms;
        self
    }
}

/// Rate-limit view reported by a bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// Requests consumed in the current window
    pub requests_used: u32,
    /// Requests allowed per window
    pub requests_limit: u32,
    /// When the window resets, if the provider reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Suggested backoff, if the provider reports it
    #[serde(
        with = "crate::common::duration_serde::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_after: Option<Duration>,
}
