//! `OpenAI` chat completions codec, shared by every compatible backend

use serde_json::{Value, json};
use tracing::debug;

use super::{
    Decoded, FrameDecoder, ProviderCodec, ProviderRequest, RawToolCall, ResponseParts, encode, position,
    resolve_model, stop_sequences, wire_temperature,
};
use crate::descriptor::ProviderDescriptor;
use crate::error::{CanonicalError, classify};
use crate::protocol::openai::{
    OpenAiContent, OpenAiContentPart, OpenAiEmbeddingRequest, OpenAiEmbeddingResponse, OpenAiFunction,
    OpenAiFunctionCall, OpenAiImageUrl, OpenAiMessage, OpenAiModelList, OpenAiRequest, OpenAiResponse,
    OpenAiSpeechRequest, OpenAiStreamChunk, OpenAiStreamOptions, OpenAiTool, OpenAiToolCall, OpenAiUsage,
};
use crate::types::{
    ChatRequest, Content, ContentPart, EmbeddingRequest, EmbeddingResponse, FinishReason, Message, ModelInfo,
    ResponseFormat, Role, SpeechRequest, ToolChoice, Usage,
};

/// Codec for `/chat/completions` style APIs
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiCodec;

impl ProviderCodec for OpenAiCodec {
    fn chat_request(
        &self,
        request: &ChatRequest,
        descriptor: &ProviderDescriptor,
    ) -> Result<ProviderRequest, CanonicalError> {
        let tools = (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .map(|t| OpenAiTool {
                    tool_type: "function",
                    function: OpenAiFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect()
        });

        let body = OpenAiRequest {
            model: resolve_model(request, descriptor)?,
            messages: request.messages.iter().map(encode_message).collect(),
            temperature: wire_temperature(request, descriptor),
            top_p: request.params.top_p,
            max_tokens: request.params.max_tokens,
            stop: stop_sequences(request),
            frequency_penalty: request.params.frequency_penalty,
            presence_penalty: request.params.presence_penalty,
            seed: request.params.seed,
            stream: request.stream.then_some(true),
            tools,
            tool_choice: request.tool_choice.as_ref().map(encode_tool_choice),
            response_format: request.response_format.as_ref().and_then(encode_response_format),
            stream_options: (request.stream && descriptor.quirks.stream_usage)
                .then_some(OpenAiStreamOptions { include_usage: true }),
        };

        Ok(ProviderRequest::post("/chat/completions", encode(&body)?).streaming(request.stream))
    }

    fn parse_chat_response(&self, body: &[u8]) -> Result<ResponseParts, serde_json::Error> {
        let response: OpenAiResponse = serde_json::from_slice(body)?;

        let mut parts = ResponseParts {
            id: response.id,
            model: response.model,
            usage: response.usage.map(usage),
            ..ResponseParts::default()
        };

        if let Some(choice) = response.choices.into_iter().next() {
            parts.text = choice.message.content.unwrap_or_default();
            parts.reasoning = choice.message.reasoning_content.filter(|r| !r.is_empty());
            parts.tool_calls = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| RawToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect();
            parts.finish_reason = choice.finish_reason.as_deref().map(FinishReason::from_wire);
        }

        Ok(parts)
    }

    fn stream_decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(OpenAiDecoder)
    }

    fn models_request(&self) -> ProviderRequest {
        ProviderRequest::get("/models")
    }

    fn parse_models(&self, body: &[u8]) -> Result<Vec<ModelInfo>, serde_json::Error> {
        let list: OpenAiModelList = serde_json::from_slice(body)?;
        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                display_name: m.name,
                owned_by: m.owned_by,
            })
            .collect())
    }

    fn embeddings_request(
        &self,
        request: &EmbeddingRequest,
        _descriptor: &ProviderDescriptor,
    ) -> Result<ProviderRequest, CanonicalError> {
        let body = OpenAiEmbeddingRequest {
            model: request.model.clone(),
            input: request.input.clone(),
            encoding_format: "float",
        };
        Ok(ProviderRequest::post("/embeddings", encode(&body)?))
    }

    fn parse_embeddings(&self, body: &[u8], model: &str) -> Result<EmbeddingResponse, serde_json::Error> {
        let mut response: OpenAiEmbeddingResponse = serde_json::from_slice(body)?;
        response.data.sort_by_key(|e| e.index);
        Ok(EmbeddingResponse {
            model: response.model.unwrap_or_else(|| model.to_owned()),
            embeddings: response.data.into_iter().map(|e| e.embedding).collect(),
            usage: response.usage.map(|u| Usage::new(u.prompt_tokens, 0)),
        })
    }

    fn speech_request(
        &self,
        request: &SpeechRequest,
        _descriptor: &ProviderDescriptor,
    ) -> Result<ProviderRequest, CanonicalError> {
        let body = OpenAiSpeechRequest {
            model: request.model.clone(),
            input: request.input.clone(),
            voice: request.voice.clone(),
            response_format: request.format.clone(),
            speed: request.speed,
        };
        Ok(ProviderRequest::post("/audio/speech", encode(&body)?))
    }
}

fn encode_message(message: &Message) -> OpenAiMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let tool_calls = (!message.tool_calls.is_empty()).then(|| {
        message
            .tool_calls
            .iter()
            .map(|call| OpenAiToolCall {
                id: Some(call.id.clone()),
                tool_type: "function".to_owned(),
                function: OpenAiFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect::<Vec<_>>()
    });

    // Assistant turns that only call tools carry `null` content
    let content = if tool_calls.is_some() && message.content.is_empty() {
        None
    } else {
        Some(encode_content(&message.content))
    };

    OpenAiMessage {
        role,
        content,
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn encode_content(content: &Content) -> OpenAiContent {
    match content {
        Content::Text(text) => OpenAiContent::Text(text.clone()),
        Content::Parts(parts) => OpenAiContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => OpenAiContentPart::Text { text: text.clone() },
                    ContentPart::Image { url, detail } => OpenAiContentPart::ImageUrl {
                        image_url: OpenAiImageUrl {
                            url: url.clone(),
                            detail: detail.clone(),
                        },
                    },
                })
                .collect(),
        ),
    }
}

fn encode_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::None => json!("none"),
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Function(name) => json!({"type": "function", "function": {"name": name}}),
    }
}

fn encode_response_format(format: &ResponseFormat) -> Option<Value> {
    match format {
        ResponseFormat::Text => None,
        ResponseFormat::JsonObject => Some(json!({"type": "json_object"})),
        ResponseFormat::JsonSchema { name, schema, strict } => Some(json!({
            "type": "json_schema",
            "json_schema": {"name": name, "schema": schema, "strict": strict},
        })),
    }
}

const fn usage(usage: OpenAiUsage) -> Usage {
    Usage::new(usage.prompt_tokens, usage.completion_tokens)
}

/// Decoder for `chat.completion.chunk` frames
///
/// Only the first choice is surfaced. Tool fragments are forwarded with the
/// provider's `index`, falling back to their position in the delta.
struct OpenAiDecoder;

impl FrameDecoder for OpenAiDecoder {
    fn decode(&mut self, frame: Value) -> Vec<Decoded> {
        if frame.get("error").is_some_and(|e| !e.is_null()) {
            return vec![Decoded::Error(frame)];
        }

        let chunk: OpenAiStreamChunk = match serde_json::from_value(frame) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping unrecognized stream frame");
                return Vec::new();
            }
        };

        let mut decoded = Vec::new();

        for choice in chunk.choices.into_iter().filter(|c| c.index == 0) {
            if let Some(reasoning) = choice.delta.reasoning_content
                && !reasoning.is_empty()
            {
                decoded.push(Decoded::Reasoning(reasoning));
            }

            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                decoded.push(Decoded::Text(text));
            }

            for (pos, call) in choice.delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
                let (name, fragment) = call
                    .function
                    .map_or((None, String::new()), |f| (f.name, f.arguments.unwrap_or_default()));
                decoded.push(Decoded::ToolDelta {
                    index: call.index.unwrap_or_else(|| position(pos)),
                    id: call.id,
                    name,
                    fragment,
                });
            }

            if let Some(reason) = choice.finish_reason {
                decoded.push(Decoded::Finish(FinishReason::from_wire(&reason)));
            }
        }

        if let Some(u) = chunk.usage {
            decoded.push(Decoded::Usage(usage(u)));
        }

        decoded
    }

    fn is_sentinel(&self, data: &str) -> bool {
        data.trim() == "[DONE]"
    }
}
