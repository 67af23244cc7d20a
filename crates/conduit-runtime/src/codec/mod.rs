//! Per-protocol encoders and decoders
//!
//! One codec per wire family turns a normalized [`ChatRequest`] into a
//! [`ProviderRequest`], parses buffered responses, and supplies a
//! [`FrameDecoder`] that maps streaming frames onto [`Decoded`] items. The
//! codecs are stateless; per-stream state lives in the decoder.

pub mod anthropic;
pub mod google;
pub mod ollama;
pub mod openai;

use std::sync::Arc;

use http::Method;
use serde::Serialize;
use serde_json::Value;

use crate::descriptor::{Capability, Protocol, ProviderDescriptor};
use crate::error::{CanonicalError, classify};
use crate::types::{
    ChatRequest, EmbeddingRequest, EmbeddingResponse, FinishReason, ModelInfo, SpeechRequest, Usage,
};

/// A fully encoded upstream request, minus authentication
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub method: Method,
    /// Path and query appended to the base URL (e.g. `/chat/completions`)
    pub path: String,
    /// Protocol headers; auth and configured headers are added by the transport
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Value>,
    /// Whether the response body is a stream
    pub stream: bool,
    /// Non-fatal adaptations made while normalizing
    pub warnings: Vec<String>,
}

impl ProviderRequest {
    /// POST with a JSON body
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            headers: Vec::new(),
            body: Some(body),
            stream: false,
            warnings: Vec::new(),
        }
    }

    /// GET without a body
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            stream: false,
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub(crate) fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    #[must_use]
    pub(crate) const fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// A tool call as it appears in a buffered response, arguments unparsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: String,
}

/// Protocol-neutral pieces of a buffered chat response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseParts {
    pub id: Option<String>,
    pub model: Option<String>,
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<RawToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

/// One decoded streaming item, before tool reconciliation and ordering
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Text(String),
    Reasoning(String),
    /// Tool-call fragment keyed by a stable per-stream index
    ToolDelta {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        fragment: String,
    },
    /// The provider signalled that a tool call is complete
    ToolDone { index: u32 },
    Usage(Usage),
    /// Finish signal; held until the stream ends
    Finish(FinishReason),
    /// Protocol end-of-stream marker
    End,
    /// Error object delivered inside the stream, classified by the pipeline
    Error(Value),
}

/// Stateful per-stream frame decoder
pub trait FrameDecoder: Send {
    /// Decode one parsed JSON frame
    fn decode(&mut self, frame: Value) -> Vec<Decoded>;

    /// Whether a raw frame is the protocol's end-of-stream sentinel
    fn is_sentinel(&self, _data: &str) -> bool {
        false
    }
}

/// Encoder/decoder for one wire protocol family
pub trait ProviderCodec: Send + Sync {
    /// Encode a normalized chat request
    fn chat_request(&self, request: &ChatRequest, descriptor: &ProviderDescriptor)
    -> Result<ProviderRequest, CanonicalError>;

    /// Parse a buffered chat response body
    fn parse_chat_response(&self, body: &[u8]) -> Result<ResponseParts, serde_json::Error>;

    /// Fresh decoder for one streaming response
    fn stream_decoder(&self) -> Box<dyn FrameDecoder>;

    /// Request for the model-listing endpoint
    fn models_request(&self) -> ProviderRequest;

    /// Parse the model-listing response
    fn parse_models(&self, body: &[u8]) -> Result<Vec<ModelInfo>, serde_json::Error>;

    /// Encode an embedding request
    fn embeddings_request(
        &self,
        _request: &EmbeddingRequest,
        descriptor: &ProviderDescriptor,
    ) -> Result<ProviderRequest, CanonicalError> {
        Err(classify::capability_unsupported(&descriptor.id, Capability::Embeddings))
    }

    /// Parse an embedding response
    fn parse_embeddings(&self, _body: &[u8], model: &str) -> Result<EmbeddingResponse, serde_json::Error> {
        Ok(EmbeddingResponse {
            model: model.to_owned(),
            embeddings: Vec::new(),
            usage: None,
        })
    }

    /// Encode a speech synthesis request
    fn speech_request(
        &self,
        _request: &SpeechRequest,
        descriptor: &ProviderDescriptor,
    ) -> Result<ProviderRequest, CanonicalError> {
        Err(classify::capability_unsupported(&descriptor.id, Capability::TextToSpeech))
    }
}

/// Codec for a protocol family
pub fn for_protocol(protocol: Protocol) -> Arc<dyn ProviderCodec> {
    match protocol {
        Protocol::OpenAi => Arc::new(openai::OpenAiCodec),
        Protocol::Anthropic => Arc::new(anthropic::AnthropicCodec),
        Protocol::Google => Arc::new(google::GoogleCodec),
        Protocol::Ollama => Arc::new(ollama::OllamaCodec),
    }
}

/// Temperature as sent on the wire
pub(crate) fn wire_temperature(request: &ChatRequest, descriptor: &ProviderDescriptor) -> Option<f64> {
    request
        .params
        .temperature
        .map(|t| t * descriptor.bounds.temperature_scale)
}

/// Resolve the model id, falling back to the descriptor default
pub(crate) fn resolve_model(request: &ChatRequest, descriptor: &ProviderDescriptor) -> Result<String, CanonicalError> {
    if !request.model.trim().is_empty() {
        return Ok(request.model.clone());
    }
    descriptor
        .default_model
        .clone()
        .ok_or_else(|| classify::malformed_request(format!("provider '{}' needs an explicit model", descriptor.id)))
}

/// Stop sequences, or `None` when empty
pub(crate) fn stop_sequences(request: &ChatRequest) -> Option<Vec<String>> {
    (!request.params.stop.is_empty()).then(|| request.params.stop.clone())
}

/// Serialize a wire body
pub(crate) fn encode<T: Serialize>(body: &T) -> Result<Value, CanonicalError> {
    serde_json::to_value(body).map_err(|e| classify::malformed_request(format!("failed to encode request: {e}")))
}

/// Tool arguments as a JSON value, `{}` when empty or unparseable
pub(crate) fn arguments_value(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

/// Object-valued arguments as wire text; a missing value becomes empty
pub(crate) fn arguments_text(arguments: &Value) -> String {
    if arguments.is_null() {
        String::new()
    } else {
        arguments.to_string()
    }
}

/// Position in a list as a wire index
pub(crate) fn position(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}
