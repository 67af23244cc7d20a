//! `OpenAI` chat completion API wire format types
//!
//! Response-side structs default every field that compatible backends are
//! known to omit.

use serde::{Deserialize, Serialize};

// -- Request types --

/// `OpenAI` chat completion request
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<OpenAiTool>>,
    /// `"none"`, `"auto"`, `"required"`, or a function selector object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    /// Stream options (e.g. `include_usage`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<OpenAiStreamOptions>,
}

/// `OpenAI` stream options
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiStreamOptions {
    /// Include usage statistics in the final chunk
    pub include_usage: bool,
}

/// Message within a request
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiMessage {
    pub role: &'static str,
    /// Content; assistant turns that only call tools send `null`
    pub content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Content can be a string or array of content parts
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

/// Individual content part
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

/// Image reference
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiImageUrl {
    /// Image URL or base64 data URI
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Tool definition
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiTool {
    /// Always "function"
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: OpenAiFunction,
}

/// Function definition
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiFunction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// Tool call within a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiToolCall {
    /// Missing on some compatible backends
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: OpenAiFunctionCall,
}

fn function_type() -> String {
    "function".to_owned()
}

/// Function call details within a tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiFunctionCall {
    pub name: String,
    /// JSON-encoded arguments
    #[serde(default)]
    pub arguments: String,
}

// -- Response types --

/// Chat completion response
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<OpenAiChoice>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

/// Choice within a response
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChoice {
    pub message: OpenAiChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Message within a response choice
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
    /// Reasoning text (`DeepSeek`, `Moonshot`, and compatibles)
    #[serde(default, alias = "reasoning")]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
}

/// Token usage
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

// -- Streaming types --

/// Streaming chunk
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiStreamChunk {
    #[serde(default)]
    pub choices: Vec<OpenAiStreamChoice>,
    /// Present on the final chunk when `stream_options.include_usage` is set
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

/// Choice within a streaming chunk
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiStreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: OpenAiStreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Delta content within a streaming choice
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiStreamDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "reasoning")]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

/// Tool call fragment within a streaming delta
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiStreamToolCall {
    /// Position in the `tool_calls` array; some backends omit it
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<OpenAiStreamFunctionCall>,
}

/// Partial function call within a streaming tool call
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiStreamFunctionCall {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

// -- Models list types --

/// Models list response
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiModelList {
    #[serde(default)]
    pub data: Vec<OpenAiModel>,
}

/// Model entry
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiModel {
    pub id: String,
    #[serde(default)]
    pub owned_by: Option<String>,
    /// `OpenRouter` and others report a display name
    #[serde(default)]
    pub name: Option<String>,
}

// -- Embeddings --

/// Embeddings request
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiEmbeddingRequest {
    pub model: String,
    pub input: Vec<String>,
    pub encoding_format: &'static str,
}

/// Embeddings response
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiEmbeddingResponse {
    #[serde(default)]
    pub model: Option<String>,
    pub data: Vec<OpenAiEmbedding>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

/// One embedding vector
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiEmbedding {
    #[serde(default)]
    pub index: usize,
    pub embedding: Vec<f32>,
}

// -- Speech --

/// Text-to-speech request
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiSpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}
