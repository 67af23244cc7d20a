use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::message::Message;
use super::tool::{ToolChoice, ToolDefinition};
use crate::error::{CanonicalError, classify};

/// Parameters controlling text generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Frequency penalty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    /// Presence penalty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    /// Random seed for deterministic generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Requested shape of the model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Free-form text
    Text,
    /// Any valid JSON object
    JsonObject,
    /// JSON conforming to a schema
    JsonSchema {
        /// Schema name
        name: String,
        /// JSON Schema document
        schema: serde_json::Value,
        /// Ask the provider for strict schema adherence
        #[serde(default)]
        strict: bool,
    },
}

/// Provider-agnostic chat request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier (empty selects the provider default)
    #[serde(default)]
    pub model: String,
    /// Conversation messages
    pub messages: Vec<Message>,
    /// Generation parameters
    #[serde(default)]
    pub params: SamplingParams,
    /// Tool definitions available to the model
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// How the model should select tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Output shape constraint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Non-streaming request for a model
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            params: SamplingParams::default(),
            tools: Vec::new(),
            tool_choice: None,
            response_format: None,
            stream: false,
        }
    }

    /// Switch the request to streaming mode
    #[must_use]
    pub const fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Attach tool definitions
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Set the sampling parameters
    #[must_use]
    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    /// Whether any message carries an image part
    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|m| m.content.has_images())
    }

    /// Reject requests no provider could serve
    ///
    /// # Errors
    ///
    /// Returns `MalformedRequest` for an empty conversation, a nameless tool,
    /// duplicate tool names, or a forced tool choice naming an unknown tool.
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.messages.is_empty() {
            return Err(classify::malformed_request("request must contain at least one message"));
        }

        let mut seen = HashSet::with_capacity(self.tools.len());
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(classify::malformed_request("tool names must not be empty"));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(classify::malformed_request(format!("duplicate tool name: {}", tool.name)));
            }
        }

        if let Some(ToolChoice::Function(name)) = &self.tool_choice
            && !seen.contains(name.as_str())
        {
            return Err(classify::malformed_request(format!(
                "tool_choice names unknown tool: {name}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{Message, ToolDefinition};

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition::new(name, "test tool", serde_json::json!({"type": "object"}))
    }

    #[test]
    fn empty_messages_rejected() {
        let err = ChatRequest::new("gpt-4o", vec![]).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRequest);
    }

    #[test]
    fn duplicate_tool_names_rejected() {
        let request = ChatRequest::new("gpt-4o", vec![Message::user("hi")]).with_tools(vec![tool("a"), tool("a")]);
        let err = request.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRequest);
        assert!(err.message().contains("duplicate tool name: a"));
    }

    #[test]
    fn forced_unknown_tool_rejected() {
        let mut request = ChatRequest::new("gpt-4o", vec![Message::user("hi")]).with_tools(vec![tool("a")]);
        request.tool_choice = Some(ToolChoice::Function("b".into()));
        assert!(request.validate().is_err());
    }

    #[test]
    fn valid_request_passes() {
        let request = ChatRequest::new("gpt-4o", vec![Message::user("hi")]).with_tools(vec![tool("a"), tool("b")]);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn response_format_wire_shape() {
        let format: ResponseFormat =
            serde_json::from_str(r#"{"type":"json_schema","name":"person","schema":{"type":"object"}}"#).unwrap();
        assert!(matches!(format, ResponseFormat::JsonSchema { strict: false, .. }));
    }
}
