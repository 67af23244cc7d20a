//! Google Generative Language API codec

use std::collections::HashMap;

use serde_json::{Value, json};
use tracing::debug;

use super::{
    Decoded, FrameDecoder, ProviderCodec, ProviderRequest, RawToolCall, ResponseParts, arguments_text, arguments_value,
    encode, resolve_model, stop_sequences, wire_temperature,
};
use crate::descriptor::ProviderDescriptor;
use crate::error::CanonicalError;
use crate::protocol::google::{
    GoogleBatchEmbedRequest, GoogleBatchEmbedResponse, GoogleContent, GoogleEmbedRequest, GoogleFileData,
    GoogleFunctionCall, GoogleFunctionCallingConfig, GoogleFunctionDeclaration, GoogleFunctionResponse,
    GoogleGenerationConfig, GoogleInlineData, GoogleModelList, GooglePart, GoogleRequest, GoogleResponse, GoogleTool,
    GoogleToolConfig, GoogleUsageMetadata,
};
use crate::types::{
    ChatRequest, Content, ContentPart, EmbeddingRequest, EmbeddingResponse, FinishReason, Message, ModelInfo,
    ResponseFormat, Role, ToolChoice, Usage, message::split_data_uri,
};

/// Codec for `generateContent`
#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleCodec;

impl ProviderCodec for GoogleCodec {
    fn chat_request(
        &self,
        request: &ChatRequest,
        descriptor: &ProviderDescriptor,
    ) -> Result<ProviderRequest, CanonicalError> {
        let model = resolve_model(request, descriptor)?;
        let model = model.strip_prefix("models/").unwrap_or(&model);

        let system: Vec<GooglePart> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| GooglePart::from_text(m.content.as_text()))
            .collect();

        let tools = (!request.tools.is_empty()).then(|| {
            vec![GoogleTool {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| GoogleFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        });

        let (response_mime_type, response_schema) = match &request.response_format {
            Some(ResponseFormat::JsonObject) => (Some("application/json"), None),
            Some(ResponseFormat::JsonSchema { schema, .. }) => (Some("application/json"), Some(schema.clone())),
            Some(ResponseFormat::Text) | None => (None, None),
        };

        let body = GoogleRequest {
            contents: encode_contents(&request.messages),
            system_instruction: (!system.is_empty()).then_some(GoogleContent {
                role: None,
                parts: system,
            }),
            generation_config: Some(GoogleGenerationConfig {
                temperature: wire_temperature(request, descriptor),
                top_p: request.params.top_p,
                max_output_tokens: request.params.max_tokens,
                stop_sequences: stop_sequences(request),
                frequency_penalty: request.params.frequency_penalty,
                presence_penalty: request.params.presence_penalty,
                seed: request.params.seed,
                response_mime_type,
                response_schema,
            }),
            tools,
            tool_config: request.tool_choice.as_ref().map(encode_tool_choice),
        };

        let path = if request.stream {
            format!("/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("/models/{model}:generateContent")
        };

        Ok(ProviderRequest::post(path, encode(&body)?).streaming(request.stream))
    }

    fn parse_chat_response(&self, body: &[u8]) -> Result<ResponseParts, serde_json::Error> {
        let response: GoogleResponse = serde_json::from_slice(body)?;

        let mut parts = ResponseParts {
            id: response.response_id,
            model: response.model_version,
            usage: response.usage_metadata.map(usage),
            ..ResponseParts::default()
        };

        let blocked = response
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .is_some();

        let mut reasoning = String::new();
        let mut finish = None;
        if let Some(candidate) = response.candidates.into_iter().next() {
            for part in candidate.content.parts {
                match part {
                    GooglePart {
                        function_call: Some(call),
                        ..
                    } => parts.tool_calls.push(RawToolCall {
                        id: None,
                        name: call.name,
                        arguments: arguments_text(&call.args),
                    }),
                    GooglePart {
                        text: Some(text),
                        thought: true,
                        ..
                    } => reasoning.push_str(&text),
                    GooglePart { text: Some(text), .. } => parts.text.push_str(&text),
                    _ => {}
                }
            }
            finish = candidate.finish_reason;
        }

        parts.reasoning = (!reasoning.is_empty()).then_some(reasoning);
        parts.finish_reason = if blocked {
            Some(FinishReason::ContentFilter)
        } else {
            finish.map(|reason| finish_reason(&reason, !parts.tool_calls.is_empty()))
        };

        Ok(parts)
    }

    fn stream_decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(GoogleDecoder::default())
    }

    fn models_request(&self) -> ProviderRequest {
        ProviderRequest::get("/models?pageSize=1000")
    }

    fn parse_models(&self, body: &[u8]) -> Result<Vec<ModelInfo>, serde_json::Error> {
        let list: GoogleModelList = serde_json::from_slice(body)?;
        Ok(list
            .models
            .into_iter()
            .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
            .map(|m| ModelInfo {
                id: m.name.strip_prefix("models/").unwrap_or(&m.name).to_owned(),
                display_name: m.display_name,
                owned_by: Some("google".to_owned()),
            })
            .collect())
    }

    fn embeddings_request(
        &self,
        request: &EmbeddingRequest,
        _descriptor: &ProviderDescriptor,
    ) -> Result<ProviderRequest, CanonicalError> {
        let model = request.model.strip_prefix("models/").unwrap_or(&request.model);
        let body = GoogleBatchEmbedRequest {
            requests: request
                .input
                .iter()
                .map(|text| GoogleEmbedRequest {
                    model: format!("models/{model}"),
                    content: GoogleContent {
                        role: None,
                        parts: vec![GooglePart::from_text(text.clone())],
                    },
                })
                .collect(),
        };
        Ok(ProviderRequest::post(
            format!("/models/{model}:batchEmbedContents"),
            encode(&body)?,
        ))
    }

    fn parse_embeddings(&self, body: &[u8], model: &str) -> Result<EmbeddingResponse, serde_json::Error> {
        let response: GoogleBatchEmbedResponse = serde_json::from_slice(body)?;
        Ok(EmbeddingResponse {
            model: model.to_owned(),
            embeddings: response.embeddings.into_iter().map(|e| e.values).collect(),
            usage: None,
        })
    }
}

/// Encode non-system messages, merging consecutive turns of the same role
fn encode_contents(messages: &[Message]) -> Vec<GoogleContent> {
    // Function responses are matched by name, not id
    let call_names: HashMap<&str, &str> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .map(|call| (call.id.as_str(), call.name.as_str()))
        .collect();

    let mut contents: Vec<GoogleContent> = Vec::new();

    for message in messages.iter().filter(|m| m.role != Role::System) {
        let role = if message.role == Role::Assistant { "model" } else { "user" };
        let parts = encode_parts(message, &call_names);
        if parts.is_empty() {
            continue;
        }

        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(GoogleContent {
                role: Some(role.to_owned()),
                parts,
            }),
        }
    }

    contents
}

fn encode_parts(message: &Message, call_names: &HashMap<&str, &str>) -> Vec<GooglePart> {
    if message.role == Role::Tool {
        let id = message.tool_call_id.as_deref().unwrap_or_default();
        let text = message.content.as_text();
        let response = match serde_json::from_str::<Value>(&text) {
            Ok(value @ Value::Object(_)) => value,
            _ => json!({ "content": text }),
        };
        return vec![GooglePart {
            function_response: Some(GoogleFunctionResponse {
                name: call_names.get(id).copied().unwrap_or(id).to_owned(),
                response,
            }),
            ..GooglePart::default()
        }];
    }

    let mut parts = match &message.content {
        Content::Text(text) if text.is_empty() => Vec::new(),
        Content::Text(text) => vec![GooglePart::from_text(text.clone())],
        Content::Parts(content) => content.iter().map(encode_part).collect(),
    };

    parts.extend(message.tool_calls.iter().map(|call| GooglePart {
        function_call: Some(GoogleFunctionCall {
            name: call.name.clone(),
            args: arguments_value(&call.arguments),
        }),
        ..GooglePart::default()
    }));

    parts
}

fn encode_part(part: &ContentPart) -> GooglePart {
    match part {
        ContentPart::Text { text } => GooglePart::from_text(text.clone()),
        ContentPart::Image { url, .. } => match split_data_uri(url) {
            Some((mime_type, data)) => GooglePart {
                inline_data: Some(GoogleInlineData {
                    mime_type: mime_type.to_owned(),
                    data: data.to_owned(),
                }),
                ..GooglePart::default()
            },
            None => GooglePart {
                file_data: Some(GoogleFileData {
                    mime_type: None,
                    file_uri: url.clone(),
                }),
                ..GooglePart::default()
            },
        },
    }
}

fn encode_tool_choice(choice: &ToolChoice) -> GoogleToolConfig {
    let (mode, allowed_function_names) = match choice {
        ToolChoice::None => ("NONE", None),
        ToolChoice::Auto => ("AUTO", None),
        ToolChoice::Required => ("ANY", None),
        ToolChoice::Function(name) => ("ANY", Some(vec![name.clone()])),
    };
    GoogleToolConfig {
        function_calling_config: GoogleFunctionCallingConfig {
            mode,
            allowed_function_names,
        },
    }
}

/// Google reports `STOP` even when the turn ended in function calls
fn finish_reason(reason: &str, saw_tool_calls: bool) -> FinishReason {
    match FinishReason::from_wire(reason) {
        FinishReason::Stop if saw_tool_calls => FinishReason::ToolCalls,
        other => other,
    }
}

const fn usage(usage: GoogleUsageMetadata) -> Usage {
    Usage::new(usage.prompt_token_count, usage.candidates_token_count)
}

/// Decoder for `streamGenerateContent?alt=sse`
///
/// Each frame is a full response fragment; function calls arrive whole, so
/// they are emitted as a single fragment followed by completion.
#[derive(Debug, Default)]
struct GoogleDecoder {
    next_tool_index: u32,
}

impl FrameDecoder for GoogleDecoder {
    fn decode(&mut self, frame: Value) -> Vec<Decoded> {
        if frame.get("error").is_some() {
            return vec![Decoded::Error(frame)];
        }

        let response: GoogleResponse = match serde_json::from_value(frame) {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "skipping unrecognized stream frame");
                return Vec::new();
            }
        };

        let mut decoded = Vec::new();

        if let Some(candidate) = response.candidates.into_iter().next() {
            for part in candidate.content.parts {
                if let Some(call) = part.function_call {
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    decoded.push(Decoded::ToolDelta {
                        index,
                        id: None,
                        name: Some(call.name),
                        fragment: arguments_text(&call.args),
                    });
                    decoded.push(Decoded::ToolDone { index });
                } else if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    decoded.push(if part.thought {
                        Decoded::Reasoning(text)
                    } else {
                        Decoded::Text(text)
                    });
                }
            }

            if let Some(reason) = candidate.finish_reason {
                decoded.push(Decoded::Finish(finish_reason(&reason, self.next_tool_index > 0)));
            }
        }

        if let Some(metadata) = response.usage_metadata {
            decoded.push(Decoded::Usage(usage(metadata)));
        }

        if response.prompt_feedback.and_then(|f| f.block_reason).is_some() {
            decoded.push(Decoded::Finish(FinishReason::ContentFilter));
        }

        decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::builtin;
    use crate::types::{ToolCall, ToolDefinition};

    fn encode_request(request: &ChatRequest) -> ProviderRequest {
        GoogleCodec.chat_request(request, &builtin("google").unwrap()).unwrap()
    }

    #[test]
    fn stream_path_uses_sse() {
        let request = ChatRequest::new("models/gemini-2.0-flash", vec![Message::user("hi")]).streaming();
        let encoded = encode_request(&request);
        assert_eq!(encoded.path, "/models/gemini-2.0-flash:streamGenerateContent?alt=sse");
        assert!(encoded.stream);
    }

    #[test]
    fn roles_and_system_instruction() {
        let request = ChatRequest::new(
            "gemini",
            vec![Message::system("be kind"), Message::user("hi"), Message::assistant("hello")],
        );
        let body = encode_request(&request).body.unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be kind");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
    }

    #[test]
    fn function_responses_carry_the_call_name() {
        let call = ToolCall {
            id: "call_9".to_owned(),
            name: "weather".to_owned(),
            arguments: r#"{"city":"Oslo"}"#.to_owned(),
        };
        let request = ChatRequest::new(
            "gemini",
            vec![
                Message::user("weather?"),
                Message::assistant_tool_calls(vec![call]),
                Message::tool_result("call_9", "rainy"),
            ],
        )
        .with_tools(vec![ToolDefinition::new("weather", "w", json!({"type": "object"}))]);

        let body = encode_request(&request).body.unwrap();
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["args"]["city"], "Oslo");
        let response = &body["contents"][2]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "weather");
        assert_eq!(response["response"]["content"], "rainy");
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "weather");
    }

    #[test]
    fn forced_function_uses_any_mode() {
        let mut request = ChatRequest::new("gemini", vec![Message::user("hi")])
            .with_tools(vec![ToolDefinition::new("f", "d", json!({"type": "object"}))]);
        request.tool_choice = Some(ToolChoice::Function("f".to_owned()));
        let body = encode_request(&request).body.unwrap();
        let config = &body["toolConfig"]["functionCallingConfig"];
        assert_eq!(config["mode"], "ANY");
        assert_eq!(config["allowedFunctionNames"][0], "f");
    }

    #[test]
    fn stop_with_function_call_means_tool_calls() {
        let raw = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"functionCall": {"name": "f", "args": {"a": 1}}}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 4, "totalTokenCount": 7}
        });
        let parts = GoogleCodec.parse_chat_response(raw.to_string().as_bytes()).unwrap();
        assert_eq!(parts.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(parts.tool_calls[0].id, None);
        assert_eq!(parts.usage, Some(Usage::new(3, 4)));
    }

    #[test]
    fn blocked_prompt_is_content_filter() {
        let raw = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let parts = GoogleCodec.parse_chat_response(raw.to_string().as_bytes()).unwrap();
        assert_eq!(parts.finish_reason, Some(FinishReason::ContentFilter));
    }

    #[test]
    fn decoder_splits_thoughts_from_text() {
        let mut decoder = GoogleCodec.stream_decoder();
        let decoded = decoder.decode(json!({
            "candidates": [{"content": {"parts": [
                {"text": "thinking...", "thought": true},
                {"text": "Answer"}
            ]}}]
        }));
        assert_eq!(
            decoded,
            vec![
                Decoded::Reasoning("thinking...".to_owned()),
                Decoded::Text("Answer".to_owned())
            ]
        );
    }

    #[test]
    fn models_are_filtered_to_generate_content() {
        let raw = json!({"models": [
            {"name": "models/gemini-2.0-flash", "supportedGenerationMethods": ["generateContent"]},
            {"name": "models/text-embedding-004", "supportedGenerationMethods": ["embedContent"]}
        ]});
        let models = GoogleCodec.parse_models(raw.to_string().as_bytes()).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "gemini-2.0-flash");
    }
}
