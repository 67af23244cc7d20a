//! Stream event normalizer
//!
//! Frames from [`framing`] go through the protocol's [`FrameDecoder`] and the
//! [`ToolCallReconciler`] and come out as canonical [`StreamEvent`]s. The
//! pipeline guarantees exactly one terminal event; the driver adds
//! cancellation and the call deadline on top and drops the connection as
//! soon as the stream has ended.

pub mod framing;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{StreamExt, stream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::framing::{FrameStream, JsonFrameBuffer};
use crate::codec::{Decoded, FrameDecoder};
use crate::descriptor::ProviderDescriptor;
use crate::error::{CanonicalError, classify};
use crate::reconcile::{Reconciled, ToolCallReconciler};
use crate::types::{ChatResponse, EventStream, FinishReason, StreamEvent, Usage};

/// Per-response state turning frames into canonical events
pub struct EventPipeline {
    descriptor: Arc<ProviderDescriptor>,
    decoder: Box<dyn FrameDecoder>,
    json: JsonFrameBuffer,
    reconciler: ToolCallReconciler,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
    completed_tools: bool,
    ended: bool,
}

impl EventPipeline {
    pub fn new(descriptor: Arc<ProviderDescriptor>, decoder: Box<dyn FrameDecoder>) -> Self {
        Self {
            descriptor,
            decoder,
            json: JsonFrameBuffer::new(),
            reconciler: ToolCallReconciler::new(),
            finish: None,
            usage: None,
            completed_tools: false,
            ended: false,
        }
    }

    /// Whether a terminal event has been produced
    pub const fn is_ended(&self) -> bool {
        self.ended
    }

    /// Map one frame to zero or more events
    pub fn push_frame(&mut self, data: &str) -> Vec<StreamEvent> {
        if self.ended {
            return Vec::new();
        }
        if self.decoder.is_sentinel(data.trim()) {
            if let Some(tail) = self.json.take_tail() {
                return self.fail(classify::malformed_stream(
                    "stream ended inside an incomplete frame",
                    Some(&tail),
                ));
            }
            return self.end();
        }

        let frame = match self.json.push(data) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Vec::new(),
            Err(e) => return self.fail(e),
        };

        let mut events = Vec::new();
        for item in self.decoder.decode(frame) {
            match item {
                Decoded::Text(text) => events.push(StreamEvent::TextDelta { text }),
                Decoded::Reasoning(text) => events.push(StreamEvent::ReasoningDelta { text }),
                Decoded::ToolDelta {
                    index,
                    id,
                    name,
                    fragment,
                } => {
                    self.reconciler
                        .on_delta(index, id.as_deref(), name.as_deref(), &fragment);
                    events.push(StreamEvent::ToolCallDelta {
                        index,
                        id,
                        name,
                        args_fragment: fragment,
                    });
                }
                Decoded::ToolDone { index } => {
                    if let Some(result) = self.reconciler.complete(index) {
                        events.push(self.completed(result));
                    }
                }
                Decoded::Usage(usage) => self.usage = Some(usage),
                Decoded::Finish(reason) => self.finish = Some(reason),
                Decoded::End => {
                    events.extend(self.end());
                    return events;
                }
                Decoded::Error(frame) => {
                    let error = classify::classify_frame(&frame, &self.descriptor);
                    events.extend(self.fail(error));
                    return events;
                }
            }
        }
        events
    }

    /// The transport closed; end the stream if the protocol allowed it
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.ended {
            return Vec::new();
        }
        if let Some(tail) = self.json.take_tail() {
            return self.fail(classify::malformed_stream(
                "stream closed inside an incomplete frame",
                Some(&tail),
            ));
        }
        if self.finish.is_none() {
            return self.fail(classify::malformed_stream("stream closed before a finish signal", None));
        }
        self.end()
    }

    /// End the stream with an error
    pub fn fail(&mut self, error: CanonicalError) -> Vec<StreamEvent> {
        if self.ended {
            return Vec::new();
        }
        self.ended = true;
        vec![StreamEvent::Error(error.for_provider(&self.descriptor.id))]
    }

    fn end(&mut self) -> Vec<StreamEvent> {
        self.ended = true;

        let mut events: Vec<StreamEvent> = self
            .reconciler
            .on_finish()
            .into_iter()
            .map(|result| self.completed(result))
            .collect();

        if let Some(usage) = self.usage.take() {
            events.push(StreamEvent::Usage(usage));
        }

        let reason = self.finish.take().unwrap_or(if self.completed_tools {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        });
        events.push(StreamEvent::FinishReason { reason });
        events
    }

    fn completed(&mut self, result: Reconciled) -> StreamEvent {
        match result {
            Ok(call) => {
                self.completed_tools = true;
                StreamEvent::ToolCallComplete {
                    id: call.id,
                    name: call.name,
                    args: call.arguments,
                }
            }
            Err(error) => StreamEvent::Error(error.for_provider(&self.descriptor.id)),
        }
    }
}

/// Future that opens the upstream connection
pub type Connect = BoxFuture<'static, Result<FrameStream, CanonicalError>>;

/// Deadline and cancellation for one call
#[derive(Debug, Clone)]
pub struct Limits {
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

struct DriveState {
    connect: Option<Connect>,
    frames: Option<FrameStream>,
    pipeline: EventPipeline,
    queue: VecDeque<StreamEvent>,
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
    done: bool,
}

enum Step {
    Cancelled,
    TimedOut,
    Connected(Result<FrameStream, CanonicalError>),
    Frame(Option<Result<String, CanonicalError>>),
}

/// Drive a streaming call from connect to its terminal event
///
/// The deadline starts now. `warnings` are emitted before anything else.
pub fn drive(connect: Connect, pipeline: EventPipeline, limits: Limits, warnings: Vec<String>) -> EventStream {
    let state = DriveState {
        connect: Some(connect),
        frames: None,
        pipeline,
        queue: warnings
            .into_iter()
            .map(|message| StreamEvent::Warning { message })
            .collect(),
        cancel: limits.cancel,
        deadline: limits.timeout.map(|t| (Instant::now() + t, t)),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                if event.is_terminal() {
                    state.done = true;
                    state.queue.clear();
                    state.connect = None;
                    state.frames = None;
                }
                return Some((event, state));
            }
            if state.done {
                return None;
            }

            let deadline = state.deadline.map(|(at, _)| at);
            let step = if let Some(connect) = state.connect.as_mut() {
                tokio::select! {
                    biased;
                    () = state.cancel.cancelled() => Step::Cancelled,
                    () = elapsed(deadline) => Step::TimedOut,
                    result = connect => Step::Connected(result),
                }
            } else if let Some(frames) = state.frames.as_mut() {
                tokio::select! {
                    biased;
                    () = state.cancel.cancelled() => Step::Cancelled,
                    () = elapsed(deadline) => Step::TimedOut,
                    frame = frames.next() => Step::Frame(frame),
                }
            } else {
                return None;
            };

            match step {
                Step::Cancelled => {
                    debug!(provider = %state.pipeline.descriptor.id, "stream cancelled by caller");
                    state.connect = None;
                    state.frames = None;
                    state.queue.push_back(StreamEvent::Cancelled);
                }
                Step::TimedOut => {
                    let after = state.deadline.map_or(Duration::ZERO, |(_, t)| t);
                    state.queue.extend(state.pipeline.fail(classify::timeout(after)));
                }
                Step::Connected(Ok(frames)) => {
                    state.connect = None;
                    state.frames = Some(frames);
                }
                Step::Connected(Err(e)) => state.queue.extend(state.pipeline.fail(e)),
                Step::Frame(Some(Ok(data))) => state.queue.extend(state.pipeline.push_frame(&data)),
                Step::Frame(Some(Err(e))) => state.queue.extend(state.pipeline.fail(e)),
                Step::Frame(None) => state.queue.extend(state.pipeline.finish()),
            }

            if state.pipeline.is_ended() {
                state.connect = None;
                state.frames = None;
            }
        }
    }))
}

async fn elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Canonical events for a buffered response
///
/// Used when a streaming request goes to a provider that cannot stream.
pub fn synthesize_events(response: ChatResponse) -> Vec<StreamEvent> {
    let mut events: Vec<StreamEvent> = response
        .warnings
        .into_iter()
        .map(|message| StreamEvent::Warning { message })
        .collect();

    if let Some(text) = response.reasoning.filter(|r| !r.is_empty()) {
        events.push(StreamEvent::ReasoningDelta { text });
    }
    if !response.text.is_empty() {
        events.push(StreamEvent::TextDelta { text: response.text });
    }
    events.extend(response.tool_calls.into_iter().map(|call| StreamEvent::ToolCallComplete {
        id: call.id,
        name: call.name,
        args: call.arguments,
    }));
    events.extend(response.tool_call_errors.into_iter().map(StreamEvent::Error));
    if let Some(usage) = response.usage {
        events.push(StreamEvent::Usage(usage));
    }
    events.push(StreamEvent::FinishReason {
        reason: response.finish_reason,
    });
    events
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::codec;
    use crate::descriptor::builtin;
    use crate::error::ErrorKind;
    use crate::types::CompletedToolCall;

    fn pipeline(id: &str) -> EventPipeline {
        let descriptor = Arc::new(builtin(id).unwrap());
        let decoder = codec::for_protocol(descriptor.protocol).stream_decoder();
        EventPipeline::new(descriptor, decoder)
    }

    fn run(pipeline: &mut EventPipeline, frames: &[&str]) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = frames.iter().flat_map(|f| pipeline.push_frame(f)).collect();
        events.extend(pipeline.finish());
        events
    }

    fn text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn openai_text_stream() {
        let mut p = pipeline("openai");
        let events = run(
            &mut p,
            &[
                r#"{"choices":[{"index":0,"delta":{"content":"Hello"}}]}"#,
                r#"{"choices":[{"index":0,"delta":{"content":" there"}}]}"#,
                r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
                "[DONE]",
            ],
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta { text: "Hello".into() },
                StreamEvent::TextDelta { text: " there".into() },
                StreamEvent::FinishReason {
                    reason: FinishReason::Stop
                },
            ]
        );
    }

    #[test]
    fn openai_tool_fragments_reconcile() {
        let mut p = pipeline("openai");
        let events = run(
            &mut p,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"f","arguments":"{\"a\":"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"1}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "[DONE]",
            ],
        );
        assert!(events.contains(&StreamEvent::ToolCallComplete {
            id: "call_1".into(),
            name: "f".into(),
            args: json!({"a": 1}),
        }));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::FinishReason {
                reason: FinishReason::ToolCalls
            })
        );
    }

    #[test]
    fn broken_tool_call_keeps_text_and_siblings() {
        let mut p = pipeline("openai");
        let events = run(
            &mut p,
            &[
                r#"{"choices":[{"delta":{"content":"checking"}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"f","arguments":"{\"x\":"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"g","arguments":"{}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "[DONE]",
            ],
        );

        assert_eq!(text(&events), "checking");
        let failure = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::Error(err) => Some(err),
                _ => None,
            })
            .unwrap();
        assert_eq!(failure.kind(), ErrorKind::ToolArgsParseFailure);
        assert_eq!(failure.tool_call_id(), Some("a"));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::ToolCallComplete { id, .. } if id == "b")));
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn split_frame_is_buffered() {
        let mut p = pipeline("openai");
        assert!(p.push_frame(r#"{"choices":[{"delta":{"con"#).is_empty());
        let events = p.push_frame(r#"tent":"hi"}}]}"#);
        assert_eq!(events, vec![StreamEvent::TextDelta { text: "hi".into() }]);
    }

    #[test]
    fn truncated_stream_is_malformed() {
        let mut p = pipeline("openai");
        let events = run(&mut p, &[r#"{"choices":[{"delta":{"content":"Hel"}}]}"#]);
        let StreamEvent::Error(err) = events.last().unwrap() else {
            panic!("expected error, got {events:?}");
        };
        assert_eq!(err.kind(), ErrorKind::MalformedStream);
        assert_eq!(err.provider(), Some("openai"));
    }

    #[test]
    fn unparseable_tail_is_preserved() {
        let mut p = pipeline("openai");
        let events = run(&mut p, &[r#"{"choices":[{"delta":{"content":"#]);
        let StreamEvent::Error(err) = &events[0] else {
            panic!("expected error");
        };
        assert_eq!(err.kind(), ErrorKind::MalformedStream);
        assert!(err.provider_raw().unwrap().starts_with("{\"choices\""));
    }

    #[test]
    fn sentinel_after_partial_frame_is_malformed() {
        let mut p = pipeline("openai");
        let events = run(&mut p, &[r#"{"choices":[{"delta":{"content":"#, "[DONE]"]);

        assert_eq!(events.len(), 1);
        let StreamEvent::Error(err) = &events[0] else {
            panic!("expected error, got {events:?}");
        };
        assert_eq!(err.kind(), ErrorKind::MalformedStream);
        assert_eq!(err.provider_raw(), Some(r#"{"choices":[{"delta":{"content":"#));
    }

    #[test]
    fn anthropic_error_frame_after_text() {
        let mut p = pipeline("anthropic");
        let events = run(
            &mut p,
            &[
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial"}}"#,
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"never"}}"#,
            ],
        );
        assert_eq!(text(&events), "partial");
        let StreamEvent::Error(err) = events.last().unwrap() else {
            panic!("expected error");
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn nothing_follows_a_terminal_event() {
        let mut p = pipeline("openai");
        p.push_frame("[DONE]");
        assert!(p.push_frame(r#"{"choices":[{"delta":{"content":"late"}}]}"#).is_empty());
        assert!(p.finish().is_empty());
    }

    fn body(chunks: Vec<&'static str>) -> FrameStream {
        let chunks: Vec<Result<Bytes, CanonicalError>> =
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
        framing::frames(Box::pin(stream::iter(chunks)), crate::descriptor::Framing::Sse)
    }

    fn limits() -> Limits {
        Limits {
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn warnings_come_first() {
        let frames = body(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        let connect: Connect = async move { Ok(frames) }.boxed();
        let events: Vec<StreamEvent> = drive(connect, pipeline("openai"), limits(), vec!["tools dropped".into()])
            .collect()
            .await;
        assert_eq!(
            events[0],
            StreamEvent::Warning {
                message: "tools dropped".into()
            }
        );
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn connect_failure_is_terminal() {
        let connect: Connect = async { Err(classify::cancelled()) }.boxed();
        let events: Vec<StreamEvent> = drive(connect, pipeline("openai"), limits(), Vec::new()).collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }

    #[tokio::test]
    async fn cancellation_ends_with_cancelled() {
        let limits = limits();
        let cancel = limits.cancel.clone();
        let connect: Connect = async { Ok(Box::pin(stream::pending::<Result<String, CanonicalError>>()) as FrameStream) }.boxed();
        let mut events = drive(connect, pipeline("openai"), limits, Vec::new());

        cancel.cancel();
        assert_eq!(events.next().await, Some(StreamEvent::Cancelled));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out() {
        let limits = Limits {
            cancel: CancellationToken::new(),
            timeout: Some(Duration::from_secs(5)),
        };
        let connect: Connect = async { Ok(Box::pin(stream::pending::<Result<String, CanonicalError>>()) as FrameStream) }.boxed();
        let events: Vec<StreamEvent> = drive(connect, pipeline("openai"), limits, Vec::new()).collect().await;

        assert_eq!(events.len(), 1);
        let StreamEvent::Error(err) = &events[0] else {
            panic!("expected timeout");
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn buffered_response_becomes_events() {
        let mut response = ChatResponse::new("r1");
        response.text = "Hello there".into();
        response.tool_calls.push(CompletedToolCall {
            id: "c".into(),
            name: "f".into(),
            arguments: json!({}),
        });
        response.usage = Some(Usage::new(3, 2));
        response.finish_reason = FinishReason::ToolCalls;

        let events = synthesize_events(response);
        assert_eq!(events[0], StreamEvent::TextDelta { text: "Hello there".into() });
        assert!(matches!(events[1], StreamEvent::ToolCallComplete { .. }));
        assert_eq!(events[2], StreamEvent::Usage(Usage::new(3, 2)));
        assert_eq!(
            events[3],
            StreamEvent::FinishReason {
                reason: FinishReason::ToolCalls
            }
        );
    }
}
