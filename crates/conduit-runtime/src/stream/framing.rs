//! Wire framing: raw body bytes into discrete frames
//!
//! SSE bodies are split with `eventsource-stream`; newline-delimited JSON
//! bodies are split on `\n`. Either way the output is one string per frame,
//! with keep-alives and blank lines already dropped.

use std::pin::Pin;

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt, stream};
use serde_json::Value;
use tracing::debug;

use crate::descriptor::Framing;
use crate::error::{CanonicalError, classify};

/// Upstream body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, CanonicalError>> + Send>>;

/// Frame payloads, one per SSE event or NDJSON line
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, CanonicalError>> + Send>>;

/// Upper bound for a JSON frame held across transport chunks
const MAX_PENDING_FRAME: usize = 1024 * 1024;

/// Split a body into frames
pub fn frames(body: ByteStream, framing: Framing) -> FrameStream {
    match framing {
        Framing::Sse => sse(body),
        Framing::NdJson => ndjson(body),
    }
}

fn sse(body: ByteStream) -> FrameStream {
    Box::pin(body.eventsource().filter_map(|event| async move {
        match event {
            Ok(event) if event.data.trim().is_empty() => None,
            Ok(event) => Some(Ok(event.data)),
            Err(EventStreamError::Transport(e)) => Some(Err(e)),
            Err(e) => Some(Err(classify::malformed_stream(format!("invalid event stream: {e}"), None))),
        }
    }))
}

struct LineState {
    body: ByteStream,
    buffer: Vec<u8>,
    done: bool,
}

fn ndjson(body: ByteStream) -> FrameStream {
    let state = LineState {
        body,
        buffer: Vec::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line).trim().to_owned();
                if line.is_empty() {
                    continue;
                }
                return Some((Ok(line), state));
            }

            if state.done {
                let tail = String::from_utf8_lossy(&std::mem::take(&mut state.buffer))
                    .trim()
                    .to_owned();
                return (!tail.is_empty()).then_some((Ok(tail), state));
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    state.buffer.clear();
                    return Some((Err(e), state));
                }
                None => state.done = true,
            }
        }
    }))
}

/// Reassembles JSON frames that arrive split across transport chunks
///
/// A frame that fails to parse only because it ends early is held and
/// retried with the next frame appended. Frames with a real syntax error are
/// skipped.
#[derive(Debug, Default)]
pub struct JsonFrameBuffer {
    pending: String,
}

impl JsonFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame; `Ok(None)` while a frame is still incomplete
    ///
    /// # Errors
    ///
    /// `MalformedStream` when an incomplete frame grows past the buffer limit.
    pub fn push(&mut self, data: &str) -> Result<Option<Value>, CanonicalError> {
        self.pending.push_str(data);

        match serde_json::from_str::<Value>(&self.pending) {
            Ok(value) => {
                self.pending.clear();
                Ok(Some(value))
            }
            Err(e) if e.is_eof() => {
                if self.pending.len() > MAX_PENDING_FRAME {
                    let tail = std::mem::take(&mut self.pending);
                    return Err(classify::malformed_stream(
                        "incomplete stream frame exceeds buffer limit",
                        Some(&tail),
                    ));
                }
                Ok(None)
            }
            Err(e) => {
                debug!(error = %e, data = %self.pending, "skipping unparseable stream frame");
                self.pending.clear();
                Ok(None)
            }
        }
    }

    /// Take whatever is still buffered
    pub fn take_tail(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.pending);
        (!tail.trim().is_empty()).then_some(tail)
    }
}
