//! Provider descriptor table
//!
//! Each provider is data: its wire protocol, authentication, framing,
//! capabilities, quirks, and sampling bounds. The adapters are shared per
//! protocol family and branch on these fields, never on provider ids.

use std::sync::OnceLock;

use strum::{Display, EnumIter, IntoEnumIterator};
use url::Url;

use crate::error::{CanonicalError, classify};

/// Wire protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Protocol {
    /// `OpenAI` chat completions and compatibles
    OpenAi,
    /// Anthropic Messages API
    Anthropic,
    /// Google Generative Language API
    Google,
    /// Ollama native API
    Ollama,
}

/// How the API key is attached to requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// Key in a named header
    Header(String),
    /// Key in a named query parameter
    QueryParam(String),
    /// No authentication
    None,
}

/// Streaming body framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Server-sent events
    Sse,
    /// Newline-delimited JSON
    NdJson,
}

/// Optional features a request may need
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    /// Incremental responses
    Streaming,
    /// Native tool/function calling
    ToolCalls,
    /// Native JSON-schema constrained output
    StructuredOutput,
    /// Image inputs
    Vision,
    /// Embedding vectors
    Embeddings,
    /// Speech synthesis
    TextToSpeech,
    /// Model enumeration
    ListModels,
}

/// Capability flags for a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    pub streaming: bool,
    pub tool_calls: bool,
    pub structured_output: bool,
    pub vision: bool,
    pub embeddings: bool,
    pub text_to_speech: bool,
    pub list_models: bool,
}

impl Capabilities {
    /// Whether a capability is offered
    pub const fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Streaming => self.streaming,
            Capability::ToolCalls => self.tool_calls,
            Capability::StructuredOutput => self.structured_output,
            Capability::Vision => self.vision,
            Capability::Embeddings => self.embeddings,
            Capability::TextToSpeech => self.text_to_speech,
            Capability::ListModels => self.list_models,
        }
    }

    /// Offered capabilities, in declaration order
    pub fn offered(self) -> impl Iterator<Item = Capability> {
        Capability::iter().filter(move |c| self.supports(*c))
    }

    /// Capabilities offered by either side
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            streaming: self.streaming || other.streaming,
            tool_calls: self.tool_calls || other.tool_calls,
            structured_output: self.structured_output || other.structured_output,
            vision: self.vision || other.vision,
            embeddings: self.embeddings || other.embeddings,
            text_to_speech: self.text_to_speech || other.text_to_speech,
            list_models: self.list_models || other.list_models,
        }
    }
}

/// What happens to tool definitions on a provider without native tool calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolPolicy {
    /// Send tools natively; tool requests fail if the provider lacks them
    #[default]
    Native,
    /// Remove tools and emit a warning
    Drop,
    /// Describe tools in the system prompt and emit a warning
    InPrompt,
}

/// Request adaptations a provider needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Quirks {
    /// Fold system messages into the first user message
    pub no_system_role: bool,
    /// Flatten multipart content to plain strings
    pub string_content_only: bool,
    /// Handling of tools when `tool_calls` is not supported
    pub tool_policy: ToolPolicy,
    /// Replace empty assistant content with a single space
    pub empty_assistant_placeholder: bool,
    /// Ask for usage in the final stream chunk (`stream_options`)
    pub stream_usage: bool,
}

/// Accepted ranges for sampling parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingBounds {
    pub temperature_min: f64,
    pub temperature_max: f64,
    /// Multiplier from canonical to wire temperature, applied after clamping
    pub temperature_scale: f64,
    pub max_tokens_cap: Option<u32>,
    pub max_stop_sequences: Option<usize>,
    /// Whether frequency/presence penalties are forwarded at all
    pub penalties: bool,
}

impl Default for SamplingBounds {
    fn default() -> Self {
        Self {
            temperature_min: 0.0,
            temperature_max: 2.0,
            temperature_scale: 1.0,
            max_tokens_cap: None,
            max_stop_sequences: Some(4),
            penalties: true,
        }
    }
}

/// Where the model list comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Provider's model-listing endpoint
    Endpoint,
    /// Fixed list
    Static(Vec<String>),
}

/// Static description of one provider
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub default_base_url: String,
    pub auth: AuthStyle,
    pub framing: Framing,
    pub capabilities: Capabilities,
    pub default_model: Option<String>,
    pub quirks: Quirks,
    pub bounds: SamplingBounds,
    pub models: ModelSource,
    /// Model listing failures yield an empty list instead of an error
    pub models_fallback_empty: bool,
    pub default_max_retries: u32,
    /// Requests are sent without credentials
    pub keyless: bool,
}

impl ProviderDescriptor {
    /// Whether the provider offers a capability
    pub const fn supports(&self, capability: Capability) -> bool {
        self.capabilities.supports(capability)
    }

    /// Parsed default base URL
    ///
    /// # Errors
    ///
    /// Returns `MalformedRequest` if the descriptor's URL is not valid
    pub fn base_url(&self) -> Result<Url, CanonicalError> {
        Url::parse(&self.default_base_url).map_err(|e| {
            classify::malformed_request(format!("invalid base URL for provider '{}': {e}", self.id))
        })
    }

    /// Descriptor for a user-defined provider speaking a known protocol
    ///
    /// Starts from the protocol family's reference descriptor, so quirks and
    /// capabilities are conservative defaults the config cannot alter.
    pub fn compatible(id: &str, protocol: Protocol, base_url: &Url, keyless: bool) -> Self {
        let template = match protocol {
            Protocol::OpenAi => openai_compatible("openai-compatible", "OpenAI-compatible", ""),
            Protocol::Anthropic => anthropic(),
            Protocol::Google => google(),
            Protocol::Ollama => ollama(),
        };

        let auth = match (&template.auth, keyless) {
            (_, true) => AuthStyle::None,
            (AuthStyle::None, false) => AuthStyle::Bearer,
            (auth, false) => auth.clone(),
        };

        // Third-party compatibles commonly reject `stream_options`
        let quirks = Quirks {
            stream_usage: false,
            ..template.quirks
        };

        Self {
            id: id.to_owned(),
            name: id.to_owned(),
            default_base_url: base_url.as_str().to_owned(),
            auth,
            quirks,
            default_model: None,
            models: ModelSource::Endpoint,
            models_fallback_empty: true,
            keyless,
            ..template
        }
    }
}

/// All built-in descriptors
pub fn builtin_descriptors() -> &'static [ProviderDescriptor] {
    static TABLE: OnceLock<Vec<ProviderDescriptor>> = OnceLock::new();
    TABLE.get_or_init(|| {
        vec![
            openai(),
            anthropic(),
            google(),
            ProviderDescriptor {
                default_model: Some("deepseek-chat".to_owned()),
                capabilities: Capabilities {
                    vision: false,
                    structured_output: false,
                    ..chat_capabilities()
                },
                ..openai_compatible("deepseek", "DeepSeek", "https://api.deepseek.com/v1")
            },
            ProviderDescriptor {
                default_model: Some("llama-3.3-70b-versatile".to_owned()),
                quirks: Quirks {
                    stream_usage: false,
                    ..Quirks::default()
                },
                ..openai_compatible("groq", "Groq", "https://api.groq.com/openai/v1")
            },
            ProviderDescriptor {
                default_model: Some("mistral-small-latest".to_owned()),
                capabilities: Capabilities {
                    embeddings: true,
                    ..chat_capabilities()
                },
                quirks: Quirks {
                    stream_usage: false,
                    ..Quirks::default()
                },
                bounds: SamplingBounds {
                    temperature_scale: 0.5,
                    ..SamplingBounds::default()
                },
                ..openai_compatible("mistral", "Mistral", "https://api.mistral.ai/v1")
            },
            ProviderDescriptor {
                default_model: Some("moonshot-v1-8k".to_owned()),
                capabilities: Capabilities {
                    vision: false,
                    structured_output: false,
                    ..chat_capabilities()
                },
                quirks: Quirks {
                    empty_assistant_placeholder: true,
                    stream_usage: false,
                    ..Quirks::default()
                },
                bounds: SamplingBounds {
                    temperature_scale: 0.5,
                    ..SamplingBounds::default()
                },
                ..openai_compatible("moonshot", "Moonshot", "https://api.moonshot.cn/v1")
            },
            openai_compatible("openrouter", "OpenRouter", "https://openrouter.ai/api/v1"),
            ProviderDescriptor {
                capabilities: Capabilities {
                    embeddings: true,
                    ..chat_capabilities()
                },
                quirks: Quirks {
                    stream_usage: false,
                    ..Quirks::default()
                },
                ..openai_compatible("together", "Together AI", "https://api.together.xyz/v1")
            },
            ProviderDescriptor {
                default_model: Some("sonar".to_owned()),
                capabilities: Capabilities {
                    streaming: true,
                    ..Capabilities::default()
                },
                quirks: Quirks {
                    string_content_only: true,
                    tool_policy: ToolPolicy::Drop,
                    stream_usage: false,
                    ..Quirks::default()
                },
                bounds: SamplingBounds {
                    temperature_max: 1.99,
                    penalties: false,
                    ..SamplingBounds::default()
                },
                models: ModelSource::Static(
                    ["sonar", "sonar-pro", "sonar-reasoning", "sonar-reasoning-pro", "sonar-deep-research"]
                        .map(str::to_owned)
                        .to_vec(),
                ),
                ..openai_compatible("perplexity", "Perplexity", "https://api.perplexity.ai")
            },
            ProviderDescriptor {
                default_model: Some("grok-3-mini".to_owned()),
                ..openai_compatible("xai", "xAI", "https://api.x.ai/v1")
            },
            ollama(),
            ProviderDescriptor {
                auth: AuthStyle::None,
                keyless: true,
                models_fallback_empty: true,
                default_max_retries: 0,
                capabilities: Capabilities {
                    vision: false,
                    embeddings: true,
                    ..chat_capabilities()
                },
                quirks: Quirks {
                    stream_usage: false,
                    ..Quirks::default()
                },
                ..openai_compatible("lmstudio", "LM Studio", "http://127.0.0.1:1234/v1")
            },
        ]
    })
}

/// Clone of a built-in descriptor
pub fn builtin(id: &str) -> Option<ProviderDescriptor> {
    builtin_descriptors().iter().find(|d| d.id == id).cloned()
}

const fn chat_capabilities() -> Capabilities {
    Capabilities {
        streaming: true,
        tool_calls: true,
        structured_output: true,
        vision: true,
        embeddings: false,
        text_to_speech: false,
        list_models: true,
    }
}

fn openai_compatible(id: &str, name: &str, base_url: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        id: id.to_owned(),
        name: name.to_owned(),
        protocol: Protocol::OpenAi,
        default_base_url: base_url.to_owned(),
        auth: AuthStyle::Bearer,
        framing: Framing::Sse,
        capabilities: chat_capabilities(),
        default_model: None,
        quirks: Quirks {
            stream_usage: true,
            ..Quirks::default()
        },
        bounds: SamplingBounds::default(),
        models: ModelSource::Endpoint,
        models_fallback_empty: false,
        default_max_retries: 2,
        keyless: false,
    }
}

fn openai() -> ProviderDescriptor {
    ProviderDescriptor {
        default_model: Some("gpt-4o-mini".to_owned()),
        capabilities: Capabilities {
            embeddings: true,
            text_to_speech: true,
            ..chat_capabilities()
        },
        ..openai_compatible("openai", "OpenAI", "https://api.openai.com/v1")
    }
}

fn anthropic() -> ProviderDescriptor {
    ProviderDescriptor {
        id: "anthropic".to_owned(),
        name: "Anthropic".to_owned(),
        protocol: Protocol::Anthropic,
        default_base_url: "https://api.anthropic.com/v1".to_owned(),
        auth: AuthStyle::Header("x-api-key".to_owned()),
        framing: Framing::Sse,
        capabilities: Capabilities {
            structured_output: false,
            ..chat_capabilities()
        },
        default_model: Some("claude-3-5-haiku-20241022".to_owned()),
        quirks: Quirks::default(),
        bounds: SamplingBounds {
            temperature_max: 1.0,
            max_stop_sequences: None,
            penalties: false,
            ..SamplingBounds::default()
        },
        models: ModelSource::Static(
            [
                "claude-sonnet-4-20250514",
                "claude-3-5-sonnet-20241022",
                "claude-3-5-haiku-20241022",
                "claude-3-opus-20240229",
                "claude-3-haiku-20240307",
            ]
            .map(str::to_owned)
            .to_vec(),
        ),
        models_fallback_empty: false,
        default_max_retries: 2,
        keyless: false,
    }
}

fn google() -> ProviderDescriptor {
    ProviderDescriptor {
        id: "google".to_owned(),
        name: "Google Gemini".to_owned(),
        protocol: Protocol::Google,
        default_base_url: "https://generativelanguage.googleapis.com/v1beta".to_owned(),
        auth: AuthStyle::Header("x-goog-api-key".to_owned()),
        framing: Framing::Sse,
        capabilities: Capabilities {
            embeddings: true,
            ..chat_capabilities()
        },
        default_model: Some("gemini-2.0-flash".to_owned()),
        quirks: Quirks::default(),
        bounds: SamplingBounds {
            max_stop_sequences: Some(5),
            ..SamplingBounds::default()
        },
        models: ModelSource::Endpoint,
        models_fallback_empty: false,
        default_max_retries: 2,
        keyless: false,
    }
}

fn ollama() -> ProviderDescriptor {
    ProviderDescriptor {
        id: "ollama".to_owned(),
        name: "Ollama".to_owned(),
        protocol: Protocol::Ollama,
        default_base_url: "http://127.0.0.1:11434".to_owned(),
        auth: AuthStyle::None,
        framing: Framing::NdJson,
        capabilities: Capabilities {
            embeddings: true,
            ..chat_capabilities()
        },
        default_model: None,
        quirks: Quirks::default(),
        bounds: SamplingBounds {
            max_stop_sequences: None,
            ..SamplingBounds::default()
        },
        models: ModelSource::Endpoint,
        models_fallback_empty: true,
        default_max_retries: 1,
        keyless: true,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<_> = builtin_descriptors().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids.len(), builtin_descriptors().len());
    }

    #[test]
    fn every_base_url_parses() {
        for descriptor in builtin_descriptors() {
            assert!(descriptor.base_url().is_ok(), "{}", descriptor.id);
        }
    }

    #[test]
    fn native_tool_policy_implies_tool_support() {
        for descriptor in builtin_descriptors() {
            if !descriptor.capabilities.tool_calls {
                assert_ne!(descriptor.quirks.tool_policy, ToolPolicy::Native, "{}", descriptor.id);
            }
        }
    }

    #[test]
    fn keyless_descriptors_send_no_auth() {
        for descriptor in builtin_descriptors().iter().filter(|d| d.keyless) {
            assert_eq!(descriptor.auth, AuthStyle::None, "{}", descriptor.id);
        }
    }

    #[test]
    fn mistral_halves_temperature() {
        let mistral = builtin("mistral").unwrap();
        assert!((mistral.bounds.temperature_scale - 0.5).abs() < f64::EPSILON);
        assert!(!mistral.quirks.stream_usage);
    }

    #[test]
    fn compatible_descriptor_inherits_protocol_defaults() {
        let url = Url::parse("http://gpu-box:11434").unwrap();
        let custom = ProviderDescriptor::compatible("gpu-box", Protocol::Ollama, &url, true);
        assert_eq!(custom.framing, Framing::NdJson);
        assert_eq!(custom.auth, AuthStyle::None);
        assert_eq!(custom.default_base_url, "http://gpu-box:11434/");
        assert!(custom.models_fallback_empty);
    }

    #[test]
    fn offered_capabilities_follow_flags() {
        let perplexity = builtin("perplexity").unwrap();
        let offered: Vec<Capability> = perplexity.capabilities.offered().collect();
        assert_eq!(offered, vec![Capability::Streaming]);
    }

    #[test]
    fn unknown_builtin_is_none() {
        assert!(builtin("watsonx").is_none());
    }
}
