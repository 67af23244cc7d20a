use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::CanonicalError;

/// Reason the model stopped generating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of generation
    Stop,
    /// Hit the token limit
    Length,
    /// Model decided to call tools
    ToolCalls,
    /// Output was withheld by a safety system
    ContentFilter,
    /// Provider-specific reason with no canonical counterpart
    Other(String),
}

impl FinishReason {
    /// Map a provider's finish/stop reason onto the canonical set
    ///
    /// Covers `OpenAI` (`stop`, `length`), Anthropic (`end_turn`, `tool_use`),
    /// Google (`STOP`, `MAX_TOKENS`, `SAFETY`), and Ollama `done_reason`
    /// values. Unknown reasons are preserved verbatim.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" | "stop_sequence" | "STOP" | "FINISH_REASON_STOP" => Self::Stop,
            "length" | "max_tokens" | "MAX_TOKENS" | "model_length" => Self::Length,
            "tool_calls" | "function_call" | "tool_use" => Self::ToolCalls,
            "content_filter" | "refusal" | "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
                Self::ContentFilter
            }
            other => Self::Other(other.to_owned()),
        }
    }

    /// Canonical string form
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Other(reason) => reason,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FinishReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt
    pub prompt_tokens: u32,
    /// Tokens generated in the completion
    pub completion_tokens: u32,
    /// Total tokens (prompt + completion)
    pub total_tokens: u32,
}

impl Usage {
    /// Build usage from prompt and completion counts
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// A tool call whose arguments parsed into a JSON value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedToolCall {
    /// Tool call identifier (provider-issued or generated)
    pub id: String,
    /// Function name
    pub name: String,
    /// Parsed arguments
    pub arguments: serde_json::Value,
}

/// Buffered chat completion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResponse {
    /// Response identifier
    pub id: String,
    /// Model that produced the response
    pub model: String,
    /// Generated text
    pub text: String,
    /// Reasoning text, for models that expose it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Tool calls whose arguments parsed successfully
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<CompletedToolCall>,
    /// Per-tool-call failures, isolated from the successful calls
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_call_errors: Vec<CanonicalError>,
    /// Why generation stopped
    pub finish_reason: FinishReason,
    /// Token usage, when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Non-fatal notices produced while adapting the request
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ChatResponse {
    /// Empty response that stopped normally
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: String::new(),
            text: String::new(),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_errors: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: None,
            warnings: Vec::new(),
        }
    }
}

/// Model advertised by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    /// Model identifier accepted in `ChatRequest::model`
    pub id: String,
    /// Display name, when the provider reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Owning organization, when the provider reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
}

impl ModelInfo {
    /// Model entry with only an id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            owned_by: None,
        }
    }
}

/// Embedding request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Embedding model (empty selects the provider default)
    #[serde(default)]
    pub model: String,
    /// Texts to embed
    pub input: Vec<String>,
}

/// Embedding vectors, in input order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingResponse {
    /// Model that produced the vectors
    pub model: String,
    /// One vector per input
    pub embeddings: Vec<Vec<f32>>,
    /// Token usage, when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Text-to-speech request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    /// Speech model
    pub model: String,
    /// Text to synthesize
    pub input: String,
    /// Voice name
    pub voice: String,
    /// Audio container (e.g. "mp3", "wav")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Playback speed multiplier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

/// Synthesized audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechResponse {
    /// Raw audio bytes
    pub audio: Bytes,
    /// MIME type reported by the provider
    pub content_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reasons_across_protocols() {
        assert_eq!(FinishReason::from_wire("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("STOP"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::from_wire("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(FinishReason::from_wire("tool_use"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_wire("SAFETY"), FinishReason::ContentFilter);
        assert_eq!(FinishReason::from_wire("pause_turn"), FinishReason::Other("pause_turn".into()));
    }

    #[test]
    fn finish_reason_serializes_as_string() {
        assert_eq!(serde_json::to_string(&FinishReason::ToolCalls).unwrap(), "\"tool_calls\"");
        assert_eq!(serde_json::to_string(&FinishReason::Other("x".into())).unwrap(), "\"x\"");
    }

    #[test]
    fn usage_total_saturates() {
        assert_eq!(Usage::new(u32::MAX, 1).total_tokens, u32::MAX);
        assert_eq!(Usage::new(3, 4).total_tokens, 7);
    }
}
