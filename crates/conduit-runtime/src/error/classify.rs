//! Maps provider failure shapes onto the canonical taxonomy
//!
//! HTTP failures go through [`classify`]/[`classify_response`], in-stream
//! error frames through [`classify_frame`], and transport failures through
//! [`network`]. Runtime-originated failures have their own constructors.
//! Provider error details win over the HTTP status; the status table is the
//! fallback for bodies without a recognizable shape.

use std::time::Duration;

use http::HeaderMap;
use serde_json::Value;

use super::{CanonicalError, ErrorKind};
use crate::descriptor::{Protocol, ProviderDescriptor};

/// Classify a non-success HTTP response
pub fn classify(status: u16, body: &str, descriptor: &ProviderDescriptor) -> CanonicalError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| ErrorDetail::extract(&value, descriptor.protocol));

    let kind = detail
        .as_ref()
        .and_then(ErrorDetail::kind)
        .unwrap_or_else(|| kind_from_status(status));

    let message = detail
        .as_ref()
        .map(|d| d.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("{} returned HTTP {status}", descriptor.id));

    CanonicalError::new(kind, message)
        .with_status(status)
        .with_raw(body)
        .with_retry_after(detail.and_then(|d| d.retry_after))
        .for_provider(&descriptor.id)
}

/// Classify a non-success HTTP response, honoring `Retry-After` headers
///
/// The header takes precedence over any retry hint in the body.
pub fn classify_response(
    status: u16,
    headers: &HeaderMap,
    body: &str,
    descriptor: &ProviderDescriptor,
) -> CanonicalError {
    let error = classify(status, body, descriptor);
    match retry_after_header(headers) {
        Some(retry_after) => error.with_retry_after(Some(retry_after)),
        None => error,
    }
}

/// Classify an error object delivered inside a stream
pub fn classify_frame(frame: &Value, descriptor: &ProviderDescriptor) -> CanonicalError {
    let raw = frame.to_string();
    let Some(detail) = ErrorDetail::extract(frame, descriptor.protocol) else {
        return CanonicalError::new(ErrorKind::Unknown, "provider sent an unrecognized error frame")
            .with_raw(raw)
            .for_provider(&descriptor.id);
    };

    let kind = detail.kind().unwrap_or(ErrorKind::Unknown);
    let message = if detail.message.is_empty() {
        "provider sent an error frame".to_owned()
    } else {
        detail.message
    };

    CanonicalError::new(kind, message)
        .with_raw(raw)
        .with_retry_after(detail.retry_after)
        .for_provider(&descriptor.id)
}

/// Classify a transport-level failure
pub fn network(error: &reqwest::Error) -> CanonicalError {
    let kind = if error.is_timeout() {
        ErrorKind::Timeout
    } else if error.is_builder() {
        ErrorKind::MalformedRequest
    } else {
        ErrorKind::Transient
    };
    CanonicalError::new(kind, format!("transport error: {error}"))
}

/// A 2xx body that did not match the protocol's response shape
pub fn unexpected_body(status: u16, body: &str, error: &serde_json::Error) -> CanonicalError {
    CanonicalError::new(ErrorKind::Unknown, format!("unexpected response body: {error}"))
        .with_status(status)
        .with_raw(body)
}

/// Request rejected before it was sent
pub fn malformed_request(message: impl Into<String>) -> CanonicalError {
    CanonicalError::new(ErrorKind::MalformedRequest, message)
}

/// Provider configuration missing or invalid credentials
pub fn invalid_credentials(message: impl Into<String>) -> CanonicalError {
    CanonicalError::new(ErrorKind::InvalidCredentials, message)
}

/// Request needs a capability the provider does not offer
pub fn capability_unsupported(provider: &str, capability: impl std::fmt::Display) -> CanonicalError {
    CanonicalError::new(
        ErrorKind::CapabilityUnsupported,
        format!("provider '{provider}' does not support {capability}"),
    )
    .for_provider(provider)
}

/// One tool call's accumulated arguments were not valid JSON
pub fn tool_args_parse_failure(id: &str, name: &str, raw: &str, error: &serde_json::Error) -> CanonicalError {
    CanonicalError::new(
        ErrorKind::ToolArgsParseFailure,
        format!("arguments for tool call '{name}' are not valid JSON: {error}"),
    )
    .with_raw(raw)
    .with_tool_call_id(id)
}

/// Stream violated its protocol (truncated, unparseable tail, no finish)
pub fn malformed_stream(message: impl Into<String>, raw_tail: Option<&str>) -> CanonicalError {
    let error = CanonicalError::new(ErrorKind::MalformedStream, message);
    match raw_tail {
        Some(tail) => error.with_raw(tail),
        None => error,
    }
}

/// Structured output did not satisfy its schema after repair
pub fn schema_validation_failed(message: impl Into<String>, raw: &str) -> CanonicalError {
    CanonicalError::new(ErrorKind::SchemaValidationFailed, message).with_raw(raw)
}

/// Call exceeded its configured deadline
pub fn timeout(after: Duration) -> CanonicalError {
    CanonicalError::new(ErrorKind::Timeout, format!("no complete response within {after:?}"))
}

/// Caller cancelled the call
pub fn cancelled() -> CanonicalError {
    CanonicalError::new(ErrorKind::Cancelled, "call cancelled by caller")
}

/// Fallback category for a status code without a usable body
const fn kind_from_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::InvalidCredentials,
        402 => ErrorKind::QuotaExceeded,
        404 => ErrorKind::ModelNotFound,
        408 => ErrorKind::Timeout,
        413 => ErrorKind::ContextLengthExceeded,
        400 | 422 => ErrorKind::MalformedRequest,
        429 => ErrorKind::RateLimited,
        500 | 502 | 503 | 504 | 529 => ErrorKind::Transient,
        _ => ErrorKind::Unknown,
    }
}

/// Longest retry hint taken from an upstream
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Upstream-supplied seconds as a capped duration; negative or NaN is `None`
fn retry_secs(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    let duration = Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_AFTER);
    Some(duration.min(MAX_RETRY_AFTER))
}

/// Parse `retry-after` (seconds) or `retry-after-ms`
fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

    if let Some(retry_after) = header("retry-after")
        .and_then(|v| v.parse::<f64>().ok())
        .and_then(retry_secs)
    {
        return Some(retry_after);
    }

    header("retry-after-ms")
        .and_then(|v| v.parse::<u64>().ok())
        .map(|ms| Duration::from_millis(ms).min(MAX_RETRY_AFTER))
}

/// Parse a protobuf-style duration such as `"30s"` or `"1.5s"`
fn parse_proto_duration(raw: &str) -> Option<Duration> {
    raw.trim().strip_suffix('s')?.parse::<f64>().ok().and_then(retry_secs)
}

/// The parts of a provider error body the classifier looks at
#[derive(Debug, Default)]
struct ErrorDetail {
    message: String,
    /// Machine-readable markers: `code`, `type`, `status`, `reason` values
    markers: Vec<String>,
    retry_after: Option<Duration>,
}

impl ErrorDetail {
    fn extract(value: &Value, protocol: Protocol) -> Option<Self> {
        // Google occasionally wraps the error object in a one-element array
        let value = match value {
            Value::Array(items) => items.first()?,
            other => other,
        };

        match protocol {
            Protocol::Anthropic => Self::from_anthropic(value),
            Protocol::Google => Self::from_google(value),
            Protocol::OpenAi | Protocol::Ollama => Self::from_openai(value),
        }
        .or_else(|| Self::from_openai(value))
    }

    /// `{"error": {"message", "type", "code"}}`, `{"error": "text"}`, or `{"message": ...}`
    fn from_openai(value: &Value) -> Option<Self> {
        match value.get("error") {
            Some(Value::String(message)) => Some(Self {
                message: message.clone(),
                ..Self::default()
            }),
            Some(error @ Value::Object(_)) => {
                let mut detail = Self {
                    message: string_at(error, "message").unwrap_or_default(),
                    ..Self::default()
                };
                detail.push_markers(error, &["code", "type", "status"]);
                detail.retry_after = error.get("retry_after").and_then(Value::as_f64).and_then(retry_secs);
                Some(detail)
            }
            _ => {
                let message = string_at(value, "message")?;
                let mut detail = Self {
                    message,
                    ..Self::default()
                };
                detail.push_markers(value, &["code", "type"]);
                Some(detail)
            }
        }
    }

    /// `{"type": "error", "error": {"type", "message"}}`
    fn from_anthropic(value: &Value) -> Option<Self> {
        let error = value.get("error").filter(|e| e.is_object())?;
        let mut detail = Self {
            message: string_at(error, "message").unwrap_or_default(),
            ..Self::default()
        };
        detail.push_markers(error, &["type"]);
        Some(detail)
    }

    /// `{"error": {"code", "message", "status", "details": [...]}}`
    fn from_google(value: &Value) -> Option<Self> {
        let error = value.get("error").filter(|e| e.is_object())?;
        let mut detail = Self {
            message: string_at(error, "message").unwrap_or_default(),
            ..Self::default()
        };
        detail.push_markers(error, &["status"]);

        for item in error.get("details").and_then(Value::as_array).into_iter().flatten() {
            detail.push_markers(item, &["reason"]);
            if let Some(delay) = item.get("retryDelay").and_then(Value::as_str) {
                detail.retry_after = parse_proto_duration(delay);
            }
        }

        // Some SDK-fronted errors embed the status in the message instead
        if let Some(status) = bracketed_status(&detail.message) {
            detail.markers.push(status);
        }

        Some(detail)
    }

    fn push_markers(&mut self, value: &Value, keys: &[&str]) {
        for key in keys {
            match value.get(*key) {
                Some(Value::String(marker)) if !marker.is_empty() => self.markers.push(marker.clone()),
                Some(Value::Number(code)) => self.markers.push(code.to_string()),
                _ => {}
            }
        }
    }

    fn has_marker(&self, candidates: &[&str]) -> bool {
        self.markers
            .iter()
            .any(|m| candidates.iter().any(|c| m.eq_ignore_ascii_case(c)))
    }

    /// Category implied by the body, if the body is specific enough
    fn kind(&self) -> Option<ErrorKind> {
        let message = self.message.to_ascii_lowercase();
        let mentions = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

        if self.has_marker(&[
            "insufficient_quota",
            "billing_hard_limit_reached",
            "billing_not_active",
            "quota_exceeded",
        ]) || mentions(&["insufficient balance", "exceeded your current quota", "credit balance is too low"])
            || (self.has_marker(&["resource_exhausted"]) && message.contains("quota"))
        {
            return Some(ErrorKind::QuotaExceeded);
        }

        if self.has_marker(&["context_length_exceeded", "string_above_max_length", "request_too_large"])
            || mentions(&[
                "maximum context length",
                "prompt is too long",
                "context window",
                "input token count",
                "too many tokens",
            ])
        {
            return Some(ErrorKind::ContextLengthExceeded);
        }

        if self.has_marker(&[
            "invalid_api_key",
            "authentication_error",
            "permission_error",
            "api_key_invalid",
            "unauthenticated",
            "permission_denied",
        ]) || mentions(&["api key not valid", "invalid api key", "incorrect api key"])
        {
            return Some(ErrorKind::InvalidCredentials);
        }

        if self.has_marker(&["model_not_found", "not_found_error", "not_found"])
            || (message.contains("model") && (message.contains("not found") || message.contains("does not exist")))
        {
            return Some(ErrorKind::ModelNotFound);
        }

        if self.has_marker(&["content_filter", "content_policy_violation", "safety"])
            || mentions(&["content management policy", "safety system", "location is not supported"])
        {
            return Some(ErrorKind::ContentPolicyRejected);
        }

        if self.has_marker(&["rate_limit_exceeded", "rate_limit_error", "resource_exhausted", "429"]) {
            return Some(ErrorKind::RateLimited);
        }

        if self.has_marker(&[
            "overloaded_error",
            "api_error",
            "server_error",
            "unavailable",
            "internal",
            "deadline_exceeded",
            "500",
            "502",
            "503",
            "504",
        ]) {
            return Some(ErrorKind::Transient);
        }

        if self.has_marker(&["invalid_request_error", "invalid_argument", "failed_precondition", "400"]) {
            return Some(ErrorKind::MalformedRequest);
        }

        None
    }
}

fn string_at(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Pull `503` out of messages like `"[503 Service Unavailable] model is overloaded"`
fn bracketed_status(message: &str) -> Option<String> {
    let start = message.find('[')?;
    let code: String = message[start + 1..].chars().take_while(char::is_ascii_digit).collect();
    (code.len() == 3).then_some(code)
}
