//! Canonical error taxonomy
//!
//! Every failure a caller can observe is a [`CanonicalError`]. Instances are
//! only built by the [`classify`] module, so the mapping from provider
//! failure shapes to kinds lives in one place.

pub mod classify;

use std::time::Duration;

use serde::{Serialize, Serializer};
use strum::{Display, IntoStaticStr};
use thiserror::Error;

/// Stable error categories shared by every provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Missing, malformed, or rejected API key
    InvalidCredentials,
    /// Account has no remaining balance or quota
    QuotaExceeded,
    /// Request rate exceeded; see `retry_after`
    RateLimited,
    /// Input or output refused by a safety or policy system
    ContentPolicyRejected,
    /// Unknown or inaccessible model
    ModelNotFound,
    /// Prompt plus completion exceed the model's context window
    ContextLengthExceeded,
    /// Request rejected as invalid
    MalformedRequest,
    /// Provider lacks a capability the request needs
    CapabilityUnsupported,
    /// Structured output failed schema validation after repair
    SchemaValidationFailed,
    /// A single tool call's arguments were not valid JSON
    ToolArgsParseFailure,
    /// Stream ended or broke in a way the protocol does not allow
    MalformedStream,
    /// Temporary upstream or network failure
    Transient,
    /// Call exceeded its deadline
    Timeout,
    /// Caller cancelled the call
    Cancelled,
    /// Failure with no recognizable shape
    Unknown,
}

/// Provider-independent error
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct CanonicalError {
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_status: Option<u16>,
    #[serde(
        rename = "retry_after_secs",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_secs"
    )]
    retry_after: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
}

impl CanonicalError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider_raw: None,
            http_status: None,
            retry_after: None,
            tool_call_id: None,
            provider: None,
        }
    }

    fn with_raw(mut self, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if !raw.is_empty() {
            self.provider_raw = Some(raw);
        }
        self
    }

    const fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    #[must_use]
    pub(crate) const fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    /// Attribute the error to a provider, keeping an existing attribution
    #[must_use]
    pub(crate) fn for_provider(mut self, provider: &str) -> Self {
        if self.provider.is_none() {
            self.provider = Some(provider.to_owned());
        }
        self
    }

    /// Error category
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable description
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Untouched provider payload, for diagnostics
    pub fn provider_raw(&self) -> Option<&str> {
        self.provider_raw.as_deref()
    }

    /// Upstream HTTP status, when the failure came from a response
    pub const fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    /// How long the provider asked callers to wait
    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Tool call the failure belongs to
    pub fn tool_call_id(&self) -> Option<&str> {
        self.tool_call_id.as_deref()
    }

    /// Provider that produced the failure
    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// Whether the runtime may retry the call automatically
    ///
    /// Only `Transient` qualifies; rate limits are surfaced with their
    /// `retry_after` hint and left to the caller.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

#[allow(clippy::ref_option)]
fn serialize_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_u64(duration.as_secs()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_snake_case() {
        assert_eq!(ErrorKind::ContextLengthExceeded.to_string(), "context_length_exceeded");
        let name: &'static str = ErrorKind::RateLimited.into();
        assert_eq!(name, "rate_limited");
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = CanonicalError::new(ErrorKind::Timeout, "no response within 5s");
        assert_eq!(err.to_string(), "timeout: no response within 5s");
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(CanonicalError::new(ErrorKind::Transient, "x").is_retryable());
        assert!(!CanonicalError::new(ErrorKind::RateLimited, "x").is_retryable());
        assert!(!CanonicalError::new(ErrorKind::Timeout, "x").is_retryable());
    }

    #[test]
    fn provider_attribution_is_sticky() {
        let err = CanonicalError::new(ErrorKind::Unknown, "x").for_provider("openai").for_provider("groq");
        assert_eq!(err.provider(), Some("openai"));
    }

    #[test]
    fn serializes_retry_after_as_seconds() {
        let err =
            CanonicalError::new(ErrorKind::RateLimited, "slow down").with_retry_after(Some(Duration::from_secs(30)));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "rate_limited");
        assert_eq!(json["retry_after_secs"], 30);
        assert!(json.get("provider_raw").is_none());
    }
}
