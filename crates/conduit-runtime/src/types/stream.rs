use std::pin::Pin;

use futures_util::Stream;
use serde::Serialize;

use super::response::{FinishReason, Usage};
use crate::error::{CanonicalError, ErrorKind};

/// Canonical streaming event
///
/// Every stream ends with exactly one terminal event: `FinishReason`,
/// `Error` (other than a per-tool-call `ToolArgsParseFailure`), or
/// `Cancelled`. Nothing follows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text
    TextDelta {
        /// Text fragment
        text: String,
    },
    /// Incremental reasoning text
    ReasoningDelta {
        /// Reasoning fragment
        text: String,
    },
    /// Raw tool-call fragment, forwarded as received
    ToolCallDelta {
        /// Stable per-stream tool call index
        index: u32,
        /// Tool call id (usually only on the first fragment)
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Function name (usually only on the first fragment)
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Partial JSON arguments
        args_fragment: String,
    },
    /// Tool call with fully parsed arguments
    ToolCallComplete {
        /// Tool call identifier
        id: String,
        /// Function name
        name: String,
        /// Parsed arguments
        args: serde_json::Value,
    },
    /// Token usage for the whole response
    Usage(Usage),
    /// Non-fatal adaptation notice
    Warning {
        /// What was changed and why
        message: String,
    },
    /// Normal completion
    FinishReason {
        /// Why generation stopped
        reason: FinishReason,
    },
    /// Failure
    Error(CanonicalError),
    /// Caller cancelled the call
    Cancelled,
}

impl StreamEvent {
    /// Whether this event ends the stream
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::FinishReason { .. } | Self::Cancelled => true,
            Self::Error(error) => error.kind() != ErrorKind::ToolArgsParseFailure,
            _ => false,
        }
    }
}

/// Stream of canonical events
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;
