//! Structured-output adapter
//!
//! A request whose `response_format` is a JSON schema is rewritten either
//! to the provider's native schema parameter or, for providers that only
//! offer tool calls, into a single forced tool whose parameters are the
//! schema. The payload that comes back is validated against the schema and
//! gets one repair pass before the call fails with `SchemaValidationFailed`.

use serde_json::Value;
use tracing::debug;

use crate::descriptor::{Capability, ProviderDescriptor, ToolPolicy};
use crate::error::{CanonicalError, ErrorKind, classify};
use crate::types::{ChatRequest, ChatResponse, ResponseFormat, ToolChoice, ToolDefinition};

const DEFAULT_TOOL_NAME: &str = "structured_output";

/// How the schema reaches the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Provider's own schema-constrained generation
    Native,
    /// One forced tool call carrying the payload as its arguments
    ToolCall,
}

/// A rewritten request plus what is needed to read its answer
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub strategy: Strategy,
    pub request: ChatRequest,
    pub tool_name: String,
    pub schema: Value,
}

/// A schema-conforming payload
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOutput {
    pub value: Value,
    /// The raw payload only validated after repair
    pub repaired: bool,
}

/// Pick the strategy a provider supports
///
/// # Errors
///
/// `CapabilityUnsupported` when the provider has neither native structured
/// output nor native tool calls.
pub fn strategy(descriptor: &ProviderDescriptor) -> Result<Strategy, CanonicalError> {
    if descriptor.supports(Capability::StructuredOutput) {
        Ok(Strategy::Native)
    } else if descriptor.supports(Capability::ToolCalls) && descriptor.quirks.tool_policy == ToolPolicy::Native {
        Ok(Strategy::ToolCall)
    } else {
        Err(classify::capability_unsupported(&descriptor.id, Capability::StructuredOutput))
    }
}

/// Rewrite a JSON-schema request for a provider
///
/// The rewritten request is always buffered.
///
/// # Errors
///
/// `MalformedRequest` when the request carries no JSON schema or the schema
/// does not compile; see [`strategy`] for capability errors.
pub fn plan(request: &ChatRequest, descriptor: &ProviderDescriptor) -> Result<Plan, CanonicalError> {
    let Some(ResponseFormat::JsonSchema { name, schema, .. }) = &request.response_format else {
        return Err(classify::malformed_request(
            "structured output requires a JSON schema response format",
        ));
    };
    jsonschema::validator_for(schema).map_err(|e| classify::malformed_request(format!("invalid JSON schema: {e}")))?;

    let strategy = strategy(descriptor)?;
    let tool_name = if name.is_empty() { DEFAULT_TOOL_NAME } else { name.as_str() }.to_owned();

    let mut rewritten = request.clone();
    rewritten.stream = false;

    if strategy == Strategy::ToolCall {
        rewritten.response_format = None;
        rewritten.tools = vec![ToolDefinition::new(
            tool_name.clone(),
            "Respond by calling this tool with the requested data",
            schema.clone(),
        )];
        rewritten.tool_choice = Some(ToolChoice::Function(tool_name.clone()));
    }

    Ok(Plan {
        strategy,
        request: rewritten,
        tool_name,
        schema: schema.clone(),
    })
}

impl Plan {
    /// Validate the response payload, repairing it once if needed
    ///
    /// # Errors
    ///
    /// `SchemaValidationFailed` with the raw payload preserved.
    pub fn read(&self, response: &ChatResponse) -> Result<StructuredOutput, CanonicalError> {
        let (raw, parsed) = self.payload(response);
        conform(&raw, parsed, &self.schema)
    }

    fn payload(&self, response: &ChatResponse) -> (String, Option<Value>) {
        if self.strategy == Strategy::ToolCall {
            if let Some(call) = response.tool_calls.iter().find(|c| c.name == self.tool_name) {
                return (call.arguments.to_string(), Some(call.arguments.clone()));
            }
            if let Some(raw) = response
                .tool_call_errors
                .iter()
                .find(|e| e.kind() == ErrorKind::ToolArgsParseFailure)
                .and_then(CanonicalError::provider_raw)
            {
                return (raw.to_owned(), None);
            }
        }
        (response.text.clone(), None)
    }
}

/// Validate a payload against a schema with one repair pass
///
/// # Errors
///
/// `MalformedRequest` for an invalid schema, `SchemaValidationFailed` when
/// the payload does not conform even after repair.
pub fn conform(raw: &str, parsed: Option<Value>, schema: &Value) -> Result<StructuredOutput, CanonicalError> {
    let validator =
        jsonschema::validator_for(schema).map_err(|e| classify::malformed_request(format!("invalid JSON schema: {e}")))?;

    if let Some(value) = parsed.or_else(|| serde_json::from_str(raw).ok())
        && validator.is_valid(&value)
    {
        return Ok(StructuredOutput { value, repaired: false });
    }

    let repaired = repair_json(raw);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) if validator.is_valid(&value) => {
            debug!("structured output validated after repair");
            Ok(StructuredOutput { value, repaired: true })
        }
        Ok(value) => {
            let reasons: Vec<String> = validator.iter_errors(&value).take(3).map(|e| e.to_string()).collect();
            Err(classify::schema_validation_failed(
                format!("output does not match schema: {}", reasons.join("; ")),
                raw,
            ))
        }
        Err(e) => Err(classify::schema_validation_failed(
            format!("output is not valid JSON: {e}"),
            raw,
        )),
    }
}

/// Best-effort fix-up of model-produced JSON
///
/// Strips code fences and surrounding prose, drops trailing commas, and
/// closes unterminated strings, arrays and objects.
pub fn repair_json(raw: &str) -> String {
    let text = strip_fences(raw.trim());
    let Some(start) = text.find(['{', '[']) else {
        return text.to_owned();
    };

    let mut out = String::with_capacity(text.len());
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text[start..].chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if closers.last() != Some(&c) {
                    continue;
                }
                closers.pop();
                drop_trailing_comma(&mut out);
                out.push(c);
                if closers.is_empty() {
                    return out;
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    let len = out.trim_end().len();
    out.truncate(len);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    while let Some(close) = closers.pop() {
        drop_trailing_comma(&mut out);
        out.push(close);
    }
    out
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body).trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

fn drop_trailing_comma(out: &mut String) {
    let len = out.trim_end().len();
    if out[..len].ends_with(',') {
        out.truncate(len - 1);
    } else {
        out.truncate(len);
    }
}
