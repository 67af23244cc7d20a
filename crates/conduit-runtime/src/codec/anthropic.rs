//! Anthropic Messages API codec

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::{
    Decoded, FrameDecoder, ProviderCodec, ProviderRequest, RawToolCall, ResponseParts, arguments_value, encode,
    resolve_model, stop_sequences, wire_temperature,
};
use crate::descriptor::ProviderDescriptor;
use crate::error::CanonicalError;
use crate::protocol::anthropic::{
    ANTHROPIC_VERSION, AnthropicContent, AnthropicContentBlock, AnthropicImageSource, AnthropicMessage,
    AnthropicRequest, AnthropicResponse, AnthropicResponseBlock, AnthropicStreamContentBlock, AnthropicStreamDelta,
    AnthropicStreamEvent, AnthropicTool, AnthropicToolChoice, AnthropicUsage,
};
use crate::types::{
    ChatRequest, Content, ContentPart, FinishReason, Message, ModelInfo, Role, ToolChoice, Usage,
    message::split_data_uri,
};

/// Default max tokens when not specified (Anthropic requires this field)
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Codec for the Anthropic Messages API
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicCodec;

impl ProviderCodec for AnthropicCodec {
    fn chat_request(
        &self,
        request: &ChatRequest,
        descriptor: &ProviderDescriptor,
    ) -> Result<ProviderRequest, CanonicalError> {
        let system = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_text())
            .collect::<Vec<_>>();

        let tools = (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect()
        });

        let body = AnthropicRequest {
            model: resolve_model(request, descriptor)?,
            max_tokens: request.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages: encode_messages(&request.messages),
            temperature: wire_temperature(request, descriptor),
            top_p: request.params.top_p,
            stop_sequences: stop_sequences(request),
            stream: request.stream.then_some(true),
            tools,
            tool_choice: request.tool_choice.as_ref().map(encode_tool_choice),
        };

        Ok(ProviderRequest::post("/messages", encode(&body)?)
            .with_header("anthropic-version", ANTHROPIC_VERSION)
            .streaming(request.stream))
    }

    fn parse_chat_response(&self, body: &[u8]) -> Result<ResponseParts, serde_json::Error> {
        let response: AnthropicResponse = serde_json::from_slice(body)?;

        let mut parts = ResponseParts {
            id: response.id,
            model: response.model,
            finish_reason: response.stop_reason.as_deref().map(FinishReason::from_wire),
            usage: response.usage.map(usage),
            ..ResponseParts::default()
        };

        let mut reasoning = String::new();
        for block in response.content {
            match block {
                AnthropicResponseBlock::Text { text } => parts.text.push_str(&text),
                AnthropicResponseBlock::Thinking { thinking } => reasoning.push_str(&thinking),
                AnthropicResponseBlock::ToolUse { id, name, input } => parts.tool_calls.push(RawToolCall {
                    id: Some(id),
                    name,
                    arguments: input.to_string(),
                }),
                AnthropicResponseBlock::Unsupported => {}
            }
        }
        parts.reasoning = (!reasoning.is_empty()).then_some(reasoning);

        Ok(parts)
    }

    fn stream_decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(AnthropicDecoder::default())
    }

    fn models_request(&self) -> ProviderRequest {
        ProviderRequest::get("/models").with_header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn parse_models(&self, body: &[u8]) -> Result<Vec<ModelInfo>, serde_json::Error> {
        #[derive(serde::Deserialize)]
        struct Listed {
            id: String,
            #[serde(default)]
            display_name: Option<String>,
        }
        #[derive(serde::Deserialize)]
        struct Page {
            #[serde(default)]
            data: Vec<Listed>,
        }

        let page: Page = serde_json::from_slice(body)?;
        Ok(page
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                display_name: m.display_name,
                owned_by: Some("anthropic".to_owned()),
            })
            .collect())
    }
}

/// Encode non-system messages, merging consecutive tool results into one
/// user turn as the API requires
fn encode_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
    let mut encoded: Vec<AnthropicMessage> = Vec::new();

    for message in messages.iter().filter(|m| m.role != Role::System) {
        if message.role == Role::Tool {
            let block = AnthropicContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.content.as_text(),
            };
            if let Some(AnthropicMessage {
                role: "user",
                content: AnthropicContent::Blocks(blocks),
            }) = encoded.last_mut()
                && blocks.iter().all(|b| matches!(b, AnthropicContentBlock::ToolResult { .. }))
            {
                blocks.push(block);
            } else {
                encoded.push(AnthropicMessage {
                    role: "user",
                    content: AnthropicContent::Blocks(vec![block]),
                });
            }
            continue;
        }

        encoded.push(encode_message(message));
    }

    encoded
}

fn encode_message(message: &Message) -> AnthropicMessage {
    let role = if message.role == Role::Assistant { "assistant" } else { "user" };

    if !message.tool_calls.is_empty() {
        let mut blocks = Vec::new();
        let text = message.content.as_text();
        if !text.trim().is_empty() {
            blocks.push(AnthropicContentBlock::Text { text });
        }
        blocks.extend(message.tool_calls.iter().map(|call| AnthropicContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: arguments_value(&call.arguments),
        }));
        return AnthropicMessage {
            role,
            content: AnthropicContent::Blocks(blocks),
        };
    }

    let content = match &message.content {
        Content::Text(text) => AnthropicContent::Text(text.clone()),
        Content::Parts(parts) => AnthropicContent::Blocks(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => AnthropicContentBlock::Text { text: text.clone() },
                    ContentPart::Image { url, .. } => AnthropicContentBlock::Image {
                        source: split_data_uri(url).map_or_else(
                            || AnthropicImageSource::Url { url: url.clone() },
                            |(media_type, data)| AnthropicImageSource::Base64 {
                                media_type: media_type.to_owned(),
                                data: data.to_owned(),
                            },
                        ),
                    },
                })
                .collect(),
        ),
    };

    AnthropicMessage { role, content }
}

fn encode_tool_choice(choice: &ToolChoice) -> AnthropicToolChoice {
    let (choice_type, name) = match choice {
        ToolChoice::None => ("none", None),
        ToolChoice::Auto => ("auto", None),
        ToolChoice::Required => ("any", None),
        ToolChoice::Function(name) => ("tool", Some(name.clone())),
    };
    AnthropicToolChoice { choice_type, name }
}

const fn usage(usage: AnthropicUsage) -> Usage {
    Usage::new(usage.input_tokens, usage.output_tokens)
}

/// Stream state for Anthropic SSE events
///
/// Content block indices are shared by text, thinking, and tool blocks, so
/// tool calls get their own sequential index.
#[derive(Debug, Default)]
struct AnthropicDecoder {
    /// Content block index to tool call index
    tool_blocks: HashMap<u32, u32>,
    next_tool_index: u32,
    usage: AnthropicUsage,
}

impl AnthropicDecoder {
    fn merge_usage(&mut self, update: AnthropicUsage) -> Decoded {
        if update.input_tokens > 0 {
            self.usage.input_tokens = update.input_tokens;
        }
        if update.output_tokens > 0 {
            self.usage.output_tokens = update.output_tokens;
        }
        Decoded::Usage(usage(self.usage))
    }
}

impl FrameDecoder for AnthropicDecoder {
    fn decode(&mut self, frame: Value) -> Vec<Decoded> {
        if frame.get("type").and_then(Value::as_str) == Some("error") {
            return vec![Decoded::Error(frame)];
        }

        let event: AnthropicStreamEvent = match serde_json::from_value(frame) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "skipping unrecognized stream frame");
                return Vec::new();
            }
        };

        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                message.usage.map(|u| self.merge_usage(u)).into_iter().collect()
            }

            AnthropicStreamEvent::ContentBlockStart { index, content_block } => match content_block {
                AnthropicStreamContentBlock::Text { text } if !text.is_empty() => vec![Decoded::Text(text)],
                AnthropicStreamContentBlock::Thinking { thinking } if !thinking.is_empty() => {
                    vec![Decoded::Reasoning(thinking)]
                }
                AnthropicStreamContentBlock::ToolUse { id, name } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_blocks.insert(index, tool_index);
                    vec![Decoded::ToolDelta {
                        index: tool_index,
                        id: Some(id),
                        name: Some(name),
                        fragment: String::new(),
                    }]
                }
                _ => Vec::new(),
            },

            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicStreamDelta::TextDelta { text } => vec![Decoded::Text(text)],
                AnthropicStreamDelta::ThinkingDelta { thinking } => vec![Decoded::Reasoning(thinking)],
                AnthropicStreamDelta::InputJsonDelta { partial_json } => match self.tool_blocks.get(&index) {
                    Some(&tool_index) => vec![Decoded::ToolDelta {
                        index: tool_index,
                        id: None,
                        name: None,
                        fragment: partial_json,
                    }],
                    None => {
                        debug!(block = index, "input delta for a block that is not a tool call");
                        Vec::new()
                    }
                },
                AnthropicStreamDelta::Unsupported => Vec::new(),
            },

            AnthropicStreamEvent::ContentBlockStop { index } => self
                .tool_blocks
                .get(&index)
                .map(|&tool_index| Decoded::ToolDone { index: tool_index })
                .into_iter()
                .collect(),

            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                let mut decoded = Vec::new();
                if let Some(u) = usage {
                    decoded.push(self.merge_usage(u));
                }
                if let Some(reason) = delta.stop_reason {
                    decoded.push(Decoded::Finish(FinishReason::from_wire(&reason)));
                }
                decoded
            }

            AnthropicStreamEvent::MessageStop => vec![Decoded::End],

            AnthropicStreamEvent::Ping | AnthropicStreamEvent::Unknown => Vec::new(),
        }
    }
}
