//! Unified model-runtime gateway
//!
//! One canonical request/response protocol over many LLM backends. A
//! [`ProviderRegistry`] turns a provider id and a [`ProviderConfig`] into a
//! [`Runtime`]; the runtime adapts each [`ChatRequest`] to the provider's
//! capabilities and wire format and hands back either a buffered
//! [`ChatResponse`] or an ordered, cancellable stream of [`StreamEvent`]s.
//! Every failure is a [`CanonicalError`].
//!
//! [`ProviderConfig`]: conduit_config::ProviderConfig

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod advisory;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod normalize;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod stream;
pub mod structured;
pub mod transport;
pub mod types;

pub use descriptor::{Capability, Protocol, ProviderDescriptor};
pub use error::{CanonicalError, ErrorKind};
pub use registry::{ProviderRegistry, RouterEntry};
pub use router::{Route, RouterRuntime};
pub use runtime::{ChatOutput, ModelRuntime, Runtime};
pub use structured::StructuredOutput;
pub use transport::CallOptions;
pub use types::{
    ChatRequest, ChatResponse, Content, ContentPart, EmbeddingRequest, EmbeddingResponse, EventStream, FinishReason,
    Message, ModelInfo, ResponseFormat, Role, SamplingParams, SpeechRequest, SpeechResponse, StreamEvent, ToolChoice,
    ToolDefinition, Usage,
};
