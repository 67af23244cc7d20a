//! Canonical, provider-agnostic request and response types
//!
//! Every wire format converts to and from these; nothing outside the codecs
//! sees a provider's native shapes.

pub mod message;
pub mod request;
pub mod response;
pub mod stream;
pub mod tool;

pub use message::{Content, ContentPart, Message, Role, ToolCall};
pub use request::{ChatRequest, ResponseFormat, SamplingParams};
pub use response::{
    ChatResponse, CompletedToolCall, EmbeddingRequest, EmbeddingResponse, FinishReason, ModelInfo, SpeechRequest,
    SpeechResponse, Usage,
};
pub use stream::{EventStream, StreamEvent};
pub use tool::{ToolChoice, ToolDefinition};
