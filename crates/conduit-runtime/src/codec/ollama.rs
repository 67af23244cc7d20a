//! Ollama native API codec (`/api/chat`, NDJSON streaming)

use serde_json::{Value, json};
use tracing::debug;

use super::{
    Decoded, FrameDecoder, ProviderCodec, ProviderRequest, RawToolCall, ResponseParts, arguments_text, arguments_value,
    encode, resolve_model, stop_sequences, wire_temperature,
};
use crate::descriptor::ProviderDescriptor;
use crate::error::{CanonicalError, classify};
use crate::protocol::ollama::{
    OllamaChatResponse, OllamaEmbedRequest, OllamaEmbedResponse, OllamaFunction, OllamaFunctionCall, OllamaMessage,
    OllamaOptions, OllamaRequest, OllamaTags, OllamaTool, OllamaToolCall,
};
use crate::types::{
    ChatRequest, Content, ContentPart, EmbeddingRequest, EmbeddingResponse, FinishReason, Message, ModelInfo,
    ResponseFormat, Role, Usage, message::split_data_uri,
};

/// Codec for the Ollama chat API
#[derive(Debug, Clone, Copy, Default)]
pub struct OllamaCodec;

impl ProviderCodec for OllamaCodec {
    fn chat_request(
        &self,
        request: &ChatRequest,
        descriptor: &ProviderDescriptor,
    ) -> Result<ProviderRequest, CanonicalError> {
        let messages = request
            .messages
            .iter()
            .map(|m| encode_message(m, descriptor))
            .collect::<Result<Vec<_>, _>>()?;

        let tools = (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .map(|t| OllamaTool {
                    tool_type: "function",
                    function: OllamaFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect()
        });

        let format = match &request.response_format {
            Some(ResponseFormat::JsonObject) => Some(json!("json")),
            Some(ResponseFormat::JsonSchema { schema, .. }) => Some(schema.clone()),
            Some(ResponseFormat::Text) | None => None,
        };

        let body = OllamaRequest {
            model: resolve_model(request, descriptor)?,
            messages,
            // Ollama streams unless told otherwise
            stream: request.stream,
            tools,
            format,
            options: OllamaOptions {
                temperature: wire_temperature(request, descriptor),
                top_p: request.params.top_p,
                num_predict: request.params.max_tokens,
                stop: stop_sequences(request),
                seed: request.params.seed,
                frequency_penalty: request.params.frequency_penalty,
                presence_penalty: request.params.presence_penalty,
            },
        };

        Ok(ProviderRequest::post("/api/chat", encode(&body)?).streaming(request.stream))
    }

    fn parse_chat_response(&self, body: &[u8]) -> Result<ResponseParts, serde_json::Error> {
        let response: OllamaChatResponse = serde_json::from_slice(body)?;
        let message = response.message.unwrap_or_default();

        let tool_calls: Vec<RawToolCall> = message
            .tool_calls
            .into_iter()
            .map(|call| RawToolCall {
                id: None,
                name: call.function.name,
                arguments: arguments_text(&call.function.arguments),
            })
            .collect();

        Ok(ResponseParts {
            id: None,
            model: response.model,
            text: message.content,
            reasoning: message.thinking.filter(|t| !t.is_empty()),
            finish_reason: Some(finish_reason(response.done_reason.as_deref(), !tool_calls.is_empty())),
            tool_calls,
            usage: usage(response.prompt_eval_count, response.eval_count),
        })
    }

    fn stream_decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(OllamaDecoder::default())
    }

    fn models_request(&self) -> ProviderRequest {
        ProviderRequest::get("/api/tags")
    }

    fn parse_models(&self, body: &[u8]) -> Result<Vec<ModelInfo>, serde_json::Error> {
        let tags: OllamaTags = serde_json::from_slice(body)?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.model.unwrap_or_else(|| m.name.clone()),
                display_name: Some(m.name),
                owned_by: None,
            })
            .collect())
    }

    fn embeddings_request(
        &self,
        request: &EmbeddingRequest,
        _descriptor: &ProviderDescriptor,
    ) -> Result<ProviderRequest, CanonicalError> {
        let body = OllamaEmbedRequest {
            model: request.model.clone(),
            input: request.input.clone(),
        };
        Ok(ProviderRequest::post("/api/embed", encode(&body)?))
    }

    fn parse_embeddings(&self, body: &[u8], model: &str) -> Result<EmbeddingResponse, serde_json::Error> {
        let response: OllamaEmbedResponse = serde_json::from_slice(body)?;
        Ok(EmbeddingResponse {
            model: response.model.unwrap_or_else(|| model.to_owned()),
            embeddings: response.embeddings,
            usage: response.prompt_eval_count.map(|prompt| Usage::new(prompt, 0)),
        })
    }
}

fn encode_message(message: &Message, descriptor: &ProviderDescriptor) -> Result<OllamaMessage, CanonicalError> {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    // Images travel as bare base64 next to the text
    let mut images = Vec::new();
    if let Content::Parts(parts) = &message.content {
        for part in parts {
            if let ContentPart::Image { url, .. } = part {
                let (_, data) = split_data_uri(url).ok_or_else(|| {
                    classify::capability_unsupported(&descriptor.id, "image URLs (inline base64 images only)")
                })?;
                images.push(data.to_owned());
            }
        }
    }

    Ok(OllamaMessage {
        role: role.to_owned(),
        content: message.content.as_text(),
        images,
        tool_calls: message
            .tool_calls
            .iter()
            .map(|call| OllamaToolCall {
                function: OllamaFunctionCall {
                    name: call.name.clone(),
                    arguments: arguments_value(&call.arguments),
                },
            })
            .collect(),
        thinking: None,
    })
}

fn finish_reason(done_reason: Option<&str>, saw_tool_calls: bool) -> FinishReason {
    match done_reason.map_or(FinishReason::Stop, FinishReason::from_wire) {
        FinishReason::Stop if saw_tool_calls => FinishReason::ToolCalls,
        other => other,
    }
}

fn usage(prompt: Option<u32>, completion: Option<u32>) -> Option<Usage> {
    (prompt.is_some() || completion.is_some())
        .then(|| Usage::new(prompt.unwrap_or_default(), completion.unwrap_or_default()))
}

/// Decoder for `/api/chat` NDJSON lines
///
/// The final line carries `done: true` with usage counters; it also ends the
/// stream since Ollama has no separate sentinel.
#[derive(Debug, Default)]
struct OllamaDecoder {
    next_tool_index: u32,
}

impl FrameDecoder for OllamaDecoder {
    fn decode(&mut self, frame: Value) -> Vec<Decoded> {
        if frame.get("error").is_some() {
            return vec![Decoded::Error(frame)];
        }

        let chunk: OllamaChatResponse = match serde_json::from_value(frame) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping unrecognized stream frame");
                return Vec::new();
            }
        };

        let mut decoded = Vec::new();

        if let Some(message) = chunk.message {
            if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
                decoded.push(Decoded::Reasoning(thinking));
            }
            if !message.content.is_empty() {
                decoded.push(Decoded::Text(message.content));
            }
            for call in message.tool_calls {
                let index = self.next_tool_index;
                self.next_tool_index += 1;
                decoded.push(Decoded::ToolDelta {
                    index,
                    id: None,
                    name: Some(call.function.name),
                    fragment: arguments_text(&call.function.arguments),
                });
                decoded.push(Decoded::ToolDone { index });
            }
        }

        if chunk.done {
            if let Some(usage) = usage(chunk.prompt_eval_count, chunk.eval_count) {
                decoded.push(Decoded::Usage(usage));
            }
            decoded.push(Decoded::Finish(finish_reason(
                chunk.done_reason.as_deref(),
                self.next_tool_index > 0,
            )));
            decoded.push(Decoded::End);
        }

        decoded
    }
}
