//! Mock upstream provider for integration tests
//!
//! Speaks just enough of the OpenAI, Anthropic and Ollama wire formats to
//! return canned responses, with switches for failures and stalls.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Response behavior of the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Canned success responses
    Normal,
    /// Every chat request is rate limited with this `Retry-After`
    RateLimited(u32),
    /// Every chat request fails with a body no provider would send
    Garbage,
    /// Streams send one chunk and then never finish
    Stall,
    /// Anthropic streams fail with `overloaded_error` after the text
    Overloaded,
    /// Chat requests get a 401 whose body breaks off mid-read
    BrokenErrorBody,
}

/// Mock backend bound to a random local port
pub struct MockUpstream {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockState>,
}

struct MockState {
    request_count: AtomicU32,
    /// Requests still to fail with `fail_status`
    fail_remaining: AtomicU32,
    fail_status: StatusCode,
    mode: Mode,
    /// Text chunks streamed in order; joined for buffered responses
    chunks: Vec<String>,
    last_body: Mutex<Option<Value>>,
    last_headers: Mutex<Option<HeaderMap>>,
    /// Set once the server drops a stalled response body
    body_dropped: AtomicBool,
}

/// Builder for a [`MockUpstream`]
pub struct MockBuilder {
    fail_count: u32,
    fail_status: StatusCode,
    mode: Mode,
    chunks: Vec<String>,
}

impl MockBuilder {
    /// Fail the first `n` chat requests with `status`
    pub fn failing(mut self, n: u32, status: u16) -> Self {
        self.fail_count = n;
        self.fail_status = StatusCode::from_u16(status).expect("valid status");
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Content chunks to stream
    pub fn chunks(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks.iter().map(|c| (*c).to_owned()).collect();
        self
    }

    /// Buffered response content
    pub fn content(self, content: &str) -> Self {
        self.chunks(&[content])
    }

    pub async fn start(self) -> anyhow::Result<MockUpstream> {
        let state = Arc::new(MockState {
            request_count: AtomicU32::new(0),
            fail_remaining: AtomicU32::new(self.fail_count),
            fail_status: self.fail_status,
            mode: self.mode,
            chunks: self.chunks,
            last_body: Mutex::new(None),
            last_headers: Mutex::new(None),
            body_dropped: AtomicBool::new(false),
        });

        let app = Router::new()
            .route("/v1/chat/completions", routing::post(handle_openai_chat))
            .route("/v1/models", routing::get(handle_openai_models))
            .route("/v1/embeddings", routing::post(handle_openai_embeddings))
            .route("/v1/messages", routing::post(handle_anthropic_messages))
            .route("/api/chat", routing::post(handle_ollama_chat))
            .route("/api/tags", routing::get(handle_ollama_tags))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(MockUpstream { addr, shutdown, state })
    }
}

impl MockUpstream {
    pub fn builder() -> MockBuilder {
        MockBuilder {
            fail_count: 0,
            fail_status: StatusCode::SERVICE_UNAVAILABLE,
            mode: Mode::Normal,
            chunks: vec!["Hello".to_owned(), " there".to_owned()],
        }
    }

    /// Start a mock with canned success responses
    pub async fn start() -> anyhow::Result<Self> {
        Self::builder().start().await
    }

    /// Base URL for OpenAI- and Anthropic-style providers
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    /// Base URL for Ollama, which has no version prefix
    pub fn root_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of requests received on any route
    pub fn request_count(&self) -> u32 {
        self.state.request_count.load(Ordering::Relaxed)
    }

    /// Body of the most recent JSON request
    pub fn last_body(&self) -> Option<Value> {
        self.state.last_body.lock().expect("lock").clone()
    }

    /// Headers of the most recent request
    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.state.last_headers.lock().expect("lock").clone()
    }

    /// Whether the server has let go of a stalled streaming body
    pub fn body_dropped(&self) -> bool {
        self.state.body_dropped.load(Ordering::SeqCst)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// -- Request shapes --

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    tools: Option<Vec<Value>>,
    #[serde(default)]
    stream_options: Option<Value>,
}

// -- Shared helpers --

impl MockState {
    /// Count and record a request; `Some` when it must fail
    fn observe(&self, headers: &HeaderMap, body: &Value) -> Option<Response> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_body.lock().expect("lock") = Some(body.clone());
        *self.last_headers.lock().expect("lock") = Some(headers.clone());

        let remaining = self.fail_remaining.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::Relaxed);
            let body = json!({"error": {"message": "mock upstream unavailable", "type": "server_error"}});
            return Some((self.fail_status, Json(body)).into_response());
        }

        match self.mode {
            Mode::RateLimited(secs) => {
                let body = json!({"error": {"message": "Rate limit reached", "type": "rate_limit_exceeded"}});
                Some(
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        [(header::RETRY_AFTER, secs.to_string())],
                        Json(body),
                    )
                        .into_response(),
                )
            }
            Mode::Garbage => Some((StatusCode::IM_A_TEAPOT, "<html>teapot</html>").into_response()),
            Mode::BrokenErrorBody => {
                let body = stream::iter([
                    Ok(Bytes::from_static(br#"{"error": {"message": "#)),
                    Err(std::io::Error::other("connection reset")),
                ]);
                Some((StatusCode::UNAUTHORIZED, Body::from_stream(body)).into_response())
            }
            _ => None,
        }
    }

    fn text(&self) -> String {
        self.chunks.concat()
    }
}

fn parse(body: &Value) -> ChatRequest {
    serde_json::from_value(body.clone()).expect("chat request")
}

fn sse_data(value: &Value) -> String {
    format!("data: {value}\n\n")
}

fn sse_event(event: &str, value: &Value) -> String {
    format!("event: {event}\ndata: {value}\n\n")
}

fn streaming(content_type: &'static str, body: String) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
}

/// Flags the mock state when the body holding it is dropped
struct DropFlag(Arc<MockState>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.body_dropped.store(true, Ordering::SeqCst);
    }
}

/// A body that sends `first` and then hangs
fn stalled(state: &Arc<MockState>, content_type: &'static str, first: String) -> Response {
    let flag = DropFlag(Arc::clone(state));
    let body = stream::once(async move { Ok::<_, Infallible>(Bytes::from(first)) })
        .chain(stream::pending())
        .map(move |chunk| {
            let _held = &flag;
            chunk
        });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(body),
    )
        .into_response()
}

// -- OpenAI --

fn openai_chunk(delta: &Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "mock-model",
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
    })
}

async fn handle_openai_chat(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(failure) = state.observe(&headers, &body) {
        return failure;
    }
    let req = parse(&body);
    let tools = req.tools.as_ref().is_some_and(|t| !t.is_empty());

    if !req.stream.unwrap_or(false) {
        let message = if tools {
            json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_mock",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"a\":1}"}
                }]
            })
        } else {
            json!({"role": "assistant", "content": state.text()})
        };
        return Json(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": req.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": if tools { "tool_calls" } else { "stop" }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }))
        .into_response();
    }

    if state.mode == Mode::Stall {
        let first = sse_data(&openai_chunk(&json!({"content": "Hel"}), None));
        return stalled(&state, "text/event-stream", first);
    }

    let mut out = String::new();
    if tools {
        out.push_str(&sse_data(&openai_chunk(
            &json!({"tool_calls": [{"index": 0, "id": "call_mock", "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"a\":"}}]}),
            None,
        )));
        out.push_str(&sse_data(&openai_chunk(
            &json!({"tool_calls": [{"index": 0, "function": {"arguments": "1}"}}]}),
            None,
        )));
        out.push_str(&sse_data(&openai_chunk(&json!({}), Some("tool_calls"))));
    } else {
        out.push_str(&sse_data(&openai_chunk(&json!({"role": "assistant", "content": ""}), None)));
        for chunk in &state.chunks {
            out.push_str(&sse_data(&openai_chunk(&json!({"content": chunk}), None)));
        }
        out.push_str(&sse_data(&openai_chunk(&json!({}), Some("stop"))));
    }

    if req.stream_options.is_some() {
        out.push_str(&sse_data(&json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion.chunk",
            "choices": [],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })));
    }
    out.push_str(": keep-alive\n\n");
    out.push_str("data: [DONE]\n\n");
    streaming("text/event-stream", out)
}

async fn handle_openai_models(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if let Some(failure) = state.observe(&headers, &Value::Null) {
        return failure;
    }
    Json(json!({
        "object": "list",
        "data": [
            {"id": "mock-model-1", "object": "model", "created": 1_700_000_000, "owned_by": "mock"},
            {"id": "mock-model-2", "object": "model", "created": 1_700_000_000, "owned_by": "mock"}
        ]
    }))
    .into_response()
}

async fn handle_openai_embeddings(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(failure) = state.observe(&headers, &body) {
        return failure;
    }
    let inputs = body["input"].as_array().map_or(0, Vec::len);
    // Reverse order to check that the runtime sorts by index
    let data: Vec<Value> = (0..inputs)
        .rev()
        .map(|i| json!({"object": "embedding", "index": i, "embedding": [i as f32, 0.5]}))
        .collect();
    Json(json!({
        "object": "list",
        "data": data,
        "model": body["model"],
        "usage": {"prompt_tokens": 8, "total_tokens": 8}
    }))
    .into_response()
}

// -- Anthropic --

async fn handle_anthropic_messages(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(failure) = state.observe(&headers, &body) {
        return failure;
    }
    let req = parse(&body);

    if !req.stream.unwrap_or(false) {
        let content = match req.tools.as_ref().and_then(|t| t.first()) {
            Some(tool) => json!([{
                "type": "tool_use",
                "id": "toolu_mock",
                "name": tool["name"],
                "input": {"city": "Lima", "temp": 18}
            }]),
            None => json!([{"type": "text", "text": state.text()}]),
        };
        return Json(json!({
            "id": "msg_mock",
            "type": "message",
            "role": "assistant",
            "model": req.model,
            "content": content,
            "stop_reason": if req.tools.is_some() { "tool_use" } else { "end_turn" },
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }))
        .into_response();
    }

    let mut out = String::new();
    out.push_str(&sse_event(
        "message_start",
        &json!({"type": "message_start", "message": {"id": "msg_mock", "usage": {"input_tokens": 10, "output_tokens": 1}}}),
    ));
    out.push_str(&sse_event(
        "content_block_start",
        &json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
    ));
    out.push_str("event: ping\ndata: {\"type\": \"ping\"}\n\n");
    for chunk in &state.chunks {
        out.push_str(&sse_event(
            "content_block_delta",
            &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": chunk}}),
        ));
    }

    if state.mode == Mode::Overloaded {
        out.push_str(&sse_event(
            "error",
            &json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
        ));
        return streaming("text/event-stream", out);
    }

    out.push_str(&sse_event(
        "content_block_stop",
        &json!({"type": "content_block_stop", "index": 0}),
    ));
    out.push_str(&sse_event(
        "message_delta",
        &json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 5}}),
    ));
    out.push_str(&sse_event("message_stop", &json!({"type": "message_stop"})));
    streaming("text/event-stream", out)
}

// -- Ollama --

async fn handle_ollama_chat(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(failure) = state.observe(&headers, &body) {
        return failure;
    }
    let req = parse(&body);

    let done = json!({
        "model": req.model,
        "message": {"role": "assistant", "content": ""},
        "done": true,
        "done_reason": "stop",
        "prompt_eval_count": 10,
        "eval_count": 5
    });

    if !req.stream.unwrap_or(true) {
        let mut done = done;
        done["message"]["content"] = json!(state.text());
        return Json(done).into_response();
    }

    let mut out = String::new();
    for chunk in &state.chunks {
        let line = json!({
            "model": req.model,
            "message": {"role": "assistant", "content": chunk},
            "done": false
        });
        out.push_str(&format!("{line}\n"));
    }
    out.push_str(&format!("{done}\n"));
    streaming("application/x-ndjson", out)
}

async fn handle_ollama_tags(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if let Some(failure) = state.observe(&headers, &Value::Null) {
        return failure;
    }
    Json(json!({
        "models": [{"name": "llama3:latest", "model": "llama3:latest"}]
    }))
    .into_response()
}
