//! Request normalizer
//!
//! Adapts a canonical [`ChatRequest`] to a provider's declared capabilities
//! and quirks, then hands it to the protocol codec. Everything that can be
//! rejected is rejected here, before any network traffic.

use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::{self, ProviderRequest};
use crate::descriptor::{Capability, ProviderDescriptor, SamplingBounds, ToolPolicy};
use crate::error::{CanonicalError, classify};
use crate::types::{ChatRequest, Content, ContentPart, Message, ResponseFormat, Role};

/// A request adapted to one provider, plus the warnings produced on the way
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub request: ChatRequest,
    pub warnings: Vec<String>,
}

/// Encode a canonical request for a provider
///
/// # Errors
///
/// `MalformedRequest` for invalid requests, `CapabilityUnsupported` when the
/// request needs something the descriptor does not offer.
pub fn normalize(request: &ChatRequest, descriptor: &ProviderDescriptor) -> Result<ProviderRequest, CanonicalError> {
    let Prepared { request, warnings } = prepare(request, descriptor)?;
    let mut encoded = codec::for_protocol(descriptor.protocol).chat_request(&request, descriptor)?;
    encoded.warnings = warnings;
    Ok(encoded)
}

/// Apply capability checks and quirks without encoding
///
/// # Errors
///
/// See [`normalize`].
pub fn prepare(request: &ChatRequest, descriptor: &ProviderDescriptor) -> Result<Prepared, CanonicalError> {
    request.validate()?;

    if request.has_images() && (!descriptor.supports(Capability::Vision) || descriptor.quirks.string_content_only) {
        return Err(classify::capability_unsupported(&descriptor.id, Capability::Vision));
    }

    if matches!(
        request.response_format,
        Some(ResponseFormat::JsonObject | ResponseFormat::JsonSchema { .. })
    ) && !descriptor.supports(Capability::StructuredOutput)
    {
        return Err(classify::capability_unsupported(&descriptor.id, Capability::StructuredOutput));
    }

    let mut request = request.clone();
    let mut warnings = Vec::new();

    if !descriptor.supports(Capability::ToolCalls) {
        apply_tool_policy(&mut request, descriptor, &mut warnings)?;
    }

    if descriptor.quirks.no_system_role {
        fold_system_messages(&mut request.messages);
    }

    if descriptor.quirks.string_content_only {
        for message in &mut request.messages {
            if let Content::Parts(_) = message.content {
                message.content = Content::Text(message.content.as_text());
            }
        }
    }

    if descriptor.quirks.empty_assistant_placeholder {
        for message in request.messages.iter_mut().filter(|m| m.role == Role::Assistant) {
            if message.content.is_empty() {
                message.content = Content::Text(" ".to_owned());
            }
        }
    }

    clamp_params(&mut request, &descriptor.bounds);

    Ok(Prepared { request, warnings })
}

/// Handle tools for a provider without native tool calling
fn apply_tool_policy(
    request: &mut ChatRequest,
    descriptor: &ProviderDescriptor,
    warnings: &mut Vec<String>,
) -> Result<(), CanonicalError> {
    let has_tool_history = request
        .messages
        .iter()
        .any(|m| m.role == Role::Tool || !m.tool_calls.is_empty());

    if request.tools.is_empty() && !has_tool_history {
        request.tool_choice = None;
        return Ok(());
    }

    match descriptor.quirks.tool_policy {
        ToolPolicy::Native => {
            return Err(classify::capability_unsupported(&descriptor.id, Capability::ToolCalls));
        }
        ToolPolicy::Drop => {
            if !request.tools.is_empty() {
                let names: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
                warn!(provider = %descriptor.id, tools = ?names, "dropping tool definitions");
                warnings.push(format!(
                    "provider '{}' does not support tool calls; dropped tools: {}",
                    descriptor.id,
                    names.join(", ")
                ));
            }
        }
        ToolPolicy::InPrompt => {
            if !request.tools.is_empty() {
                debug!(provider = %descriptor.id, count = request.tools.len(), "rendering tools into the prompt");
                let instruction = render_tool_instruction(request);
                prepend_system(&mut request.messages, instruction);
                warnings.push(format!(
                    "provider '{}' does not support tool calls; tools were described in the system prompt",
                    descriptor.id
                ));
            }
        }
    }

    request.tools.clear();
    request.tool_choice = None;
    flatten_tool_history(&mut request.messages);
    Ok(())
}

fn render_tool_instruction(request: &ChatRequest) -> String {
    let mut text = String::from(
        "You can call the following tools. To call one, reply with only a JSON object of the form \
         {\"tool\": \"<name>\", \"arguments\": {...}}.\n",
    );
    for tool in &request.tools {
        text.push_str("\n- ");
        text.push_str(&tool.name);
        if let Some(description) = &tool.description {
            text.push_str(": ");
            text.push_str(description);
        }
        text.push_str("\n  parameters: ");
        text.push_str(&tool.parameters.to_string());
    }
    text
}

/// Rewrite tool calls and tool results as plain conversation text
fn flatten_tool_history(messages: &mut [Message]) {
    for message in messages {
        if !message.tool_calls.is_empty() {
            let mut text = message.content.as_text();
            for call in message.tool_calls.drain(..) {
                if !text.is_empty() {
                    text.push('\n');
                }
                let arguments = serde_json::from_str::<Value>(&call.arguments)
                    .map_or_else(|_| call.arguments.clone(), |v| v.to_string());
                text.push_str(&format!("{{\"tool\": \"{}\", \"arguments\": {arguments}}}", call.name));
            }
            message.content = Content::Text(text);
        }

        if message.role == Role::Tool {
            let id = message.tool_call_id.take().unwrap_or_default();
            message.role = Role::User;
            message.content = Content::Text(format!("Tool result ({id}): {}", message.content.as_text()));
        }
    }
}

fn prepend_system(messages: &mut Vec<Message>, text: String) {
    match messages.iter_mut().find(|m| m.role == Role::System) {
        Some(system) => {
            let existing = system.content.as_text();
            system.content = Content::Text(format!("{existing}\n\n{text}"));
        }
        None => messages.insert(0, Message::system(text)),
    }
}

/// Merge every system message into the first user message
///
/// System text is never dropped: with no user message it becomes one.
fn fold_system_messages(messages: &mut Vec<Message>) {
    let system: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_text())
        .filter(|t| !t.is_empty())
        .collect();
    messages.retain(|m| m.role != Role::System);

    if system.is_empty() {
        return;
    }
    let preamble = system.join("\n\n");

    match messages.iter_mut().find(|m| m.role == Role::User) {
        Some(user) => {
            user.content = match std::mem::replace(&mut user.content, Content::Text(String::new())) {
                Content::Text(text) => Content::Text(format!("{preamble}\n\n{text}")),
                Content::Parts(mut parts) => {
                    parts.insert(0, ContentPart::Text {
                        text: format!("{preamble}\n\n"),
                    });
                    Content::Parts(parts)
                }
            };
        }
        None => messages.insert(0, Message::user(preamble)),
    }
}

/// Clamp sampling parameters to the provider's bounds
///
/// Idempotent: clamping an already clamped request changes nothing.
pub fn clamp_params(request: &mut ChatRequest, bounds: &SamplingBounds) {
    let params = &mut request.params;

    params.temperature = params
        .temperature
        .filter(|t| t.is_finite())
        .map(|t| t.clamp(bounds.temperature_min, bounds.temperature_max));
    params.top_p = params.top_p.filter(|p| p.is_finite()).map(|p| p.clamp(0.0, 1.0));

    if let Some(max_tokens) = params.max_tokens {
        let cap = bounds.max_tokens_cap.unwrap_or(u32::MAX);
        params.max_tokens = Some(max_tokens.clamp(1, cap.max(1)));
    }

    if let Some(limit) = bounds.max_stop_sequences {
        params.stop.truncate(limit);
    }

    if bounds.penalties {
        let clamp_penalty = |p: Option<f64>| p.filter(|v| v.is_finite()).map(|v| v.clamp(-2.0, 2.0));
        params.frequency_penalty = clamp_penalty(params.frequency_penalty);
        params.presence_penalty = clamp_penalty(params.presence_penalty);
    } else {
        params.frequency_penalty = None;
        params.presence_penalty = None;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::descriptor::builtin;
    use crate::error::ErrorKind;
    use crate::types::{SamplingParams, ToolCall, ToolDefinition};

    fn lookup_tool() -> ToolDefinition {
        ToolDefinition::new("lookup", "search the web", json!({"type": "object"}))
    }

    fn no_system_descriptor() -> ProviderDescriptor {
        let mut descriptor = builtin("openai").unwrap();
        descriptor.quirks.no_system_role = true;
        descriptor
    }

    #[test]
    fn system_is_folded_into_first_user_message() {
        let request = ChatRequest::new(
            "m",
            vec![Message::system("be terse"), Message::user("hi"), Message::user("again")],
        );
        let prepared = prepare(&request, &no_system_descriptor()).unwrap();

        assert_eq!(prepared.request.messages.len(), 2);
        assert_eq!(prepared.request.messages[0].content.as_text(), "be terse\n\nhi");
        assert_eq!(prepared.request.messages[1].content.as_text(), "again");
    }

    #[test]
    fn system_without_user_becomes_user_message() {
        let request = ChatRequest::new("m", vec![Message::system("rules"), Message::assistant("ok")]);
        let prepared = prepare(&request, &no_system_descriptor()).unwrap();

        assert_eq!(prepared.request.messages[0].role, Role::User);
        assert_eq!(prepared.request.messages[0].content.as_text(), "rules");
    }

    #[test]
    fn user_only_request_is_unchanged_by_fold() {
        let request = ChatRequest::new("m", vec![Message::user("hi")]);
        let prepared = prepare(&request, &no_system_descriptor()).unwrap();
        assert_eq!(prepared.request.messages, request.messages);
    }

    #[test]
    fn images_rejected_without_vision() {
        let request = ChatRequest::new(
            "m",
            vec![Message::user_parts(vec![ContentPart::Image {
                url: "https://example.com/a.png".to_owned(),
                detail: None,
            }])],
        );
        let err = prepare(&request, &builtin("deepseek").unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityUnsupported);
        assert_eq!(err.provider(), Some("deepseek"));
    }

    #[test]
    fn drop_policy_removes_tools_with_warning() {
        let request = ChatRequest::new("sonar", vec![Message::user("hi")]).with_tools(vec![lookup_tool()]);
        let prepared = prepare(&request, &builtin("perplexity").unwrap()).unwrap();

        assert!(prepared.request.tools.is_empty());
        assert_eq!(prepared.warnings.len(), 1);
        assert!(prepared.warnings[0].contains("lookup"));
    }

    #[test]
    fn native_policy_without_support_fails() {
        let mut descriptor = builtin("openai").unwrap();
        descriptor.capabilities.tool_calls = false;
        let request = ChatRequest::new("m", vec![Message::user("hi")]).with_tools(vec![lookup_tool()]);
        let err = prepare(&request, &descriptor).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityUnsupported);
    }

    #[test]
    fn in_prompt_policy_describes_tools() {
        let mut descriptor = builtin("openai").unwrap();
        descriptor.capabilities.tool_calls = false;
        descriptor.quirks.tool_policy = ToolPolicy::InPrompt;

        let call = ToolCall {
            id: "c1".to_owned(),
            name: "lookup".to_owned(),
            arguments: r#"{"q": "x"}"#.to_owned(),
        };
        let request = ChatRequest::new(
            "m",
            vec![
                Message::user("find x"),
                Message::assistant_tool_calls(vec![call]),
                Message::tool_result("c1", "x is 1"),
            ],
        )
        .with_tools(vec![lookup_tool()]);
        let prepared = prepare(&request, &descriptor).unwrap();
        let messages = &prepared.request.messages;

        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.as_text().contains("lookup: search the web"));
        assert!(messages[2].tool_calls.is_empty());
        assert!(messages[2].content.as_text().contains(r#""tool": "lookup""#));
        assert_eq!(messages[3].role, Role::User);
        assert_eq!(prepared.warnings.len(), 1);
    }

    #[test]
    fn string_only_providers_get_flat_content() {
        let request = ChatRequest::new(
            "sonar",
            vec![Message::user_parts(vec![
                ContentPart::Text { text: "a".to_owned() },
                ContentPart::Text { text: "b".to_owned() },
            ])],
        );
        let prepared = prepare(&request, &builtin("perplexity").unwrap()).unwrap();
        assert_eq!(prepared.request.messages[0].content, Content::Text("ab".to_owned()));
    }

    #[test]
    fn empty_assistant_gets_placeholder() {
        let request = ChatRequest::new("m", vec![Message::user("hi"), Message::assistant(""), Message::user("?")]);
        let prepared = prepare(&request, &builtin("moonshot").unwrap()).unwrap();
        assert_eq!(prepared.request.messages[1].content.as_text(), " ");
    }

    #[test]
    fn structured_output_requires_capability() {
        let mut request = ChatRequest::new("claude", vec![Message::user("hi")]);
        request.response_format = Some(ResponseFormat::JsonObject);
        let err = prepare(&request, &builtin("anthropic").unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityUnsupported);
    }

    #[test]
    fn clamping_is_deterministic_and_idempotent() {
        let bounds = builtin("anthropic").unwrap().bounds;
        let mut request = ChatRequest::new("m", vec![Message::user("hi")]).with_params(SamplingParams {
            temperature: Some(1.7),
            top_p: Some(1.5),
            max_tokens: Some(0),
            frequency_penalty: Some(1.0),
            ..SamplingParams::default()
        });

        clamp_params(&mut request, &bounds);
        let once = request.clone();
        clamp_params(&mut request, &bounds);

        assert_eq!(request, once);
        assert_eq!(request.params.temperature, Some(1.0));
        assert_eq!(request.params.top_p, Some(1.0));
        assert_eq!(request.params.max_tokens, Some(1));
        assert_eq!(request.params.frequency_penalty, None);
    }

    #[test]
    fn stop_sequences_are_truncated() {
        let mut request = ChatRequest::new("m", vec![Message::user("hi")]).with_params(SamplingParams {
            stop: (0..6).map(|i| i.to_string()).collect(),
            ..SamplingParams::default()
        });
        clamp_params(&mut request, &SamplingBounds::default());
        assert_eq!(request.params.stop, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn normalize_attaches_warnings() {
        let request = ChatRequest::new("sonar", vec![Message::user("hi")]).with_tools(vec![lookup_tool()]);
        let encoded = normalize(&request, &builtin("perplexity").unwrap()).unwrap();
        assert_eq!(encoded.warnings.len(), 1);
        assert!(encoded.body.unwrap().get("tools").is_none());
    }

    #[test]
    fn empty_messages_fail_before_encoding() {
        let request = ChatRequest::new("m", vec![]);
        let err = normalize(&request, &builtin("openai").unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRequest);
    }
}
