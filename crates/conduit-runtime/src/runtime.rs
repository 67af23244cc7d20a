//! The provider runtime: one object per provider and credential set
//!
//! Wires the normalizer, codec, transport, stream pipeline and reconciler
//! behind [`ModelRuntime`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt, stream};
use http::header::CONTENT_TYPE;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::advisory::RateLimitBook;
use crate::codec::{self, ProviderCodec, ProviderRequest, ResponseParts};
use crate::descriptor::{Capability, ModelSource, ProviderDescriptor};
use crate::error::{CanonicalError, ErrorKind, classify};
use crate::normalize;
use crate::reconcile::ToolCallReconciler;
use crate::stream::{self as event_stream, Connect, EventPipeline, Limits, framing};
use crate::structured::{self, StructuredOutput};
use crate::transport::{CallOptions, RawResponse, Transport};
use crate::types::{
    ChatRequest, ChatResponse, CompletedToolCall, EmbeddingRequest, EmbeddingResponse, EventStream, FinishReason, ModelInfo,
    SpeechRequest, SpeechResponse, StreamEvent,
};

/// Result of a chat completion: a live stream or a buffered response
pub enum ChatOutput {
    Stream(EventStream),
    Response(ChatResponse),
}

impl ChatOutput {
    /// View the output as a canonical event stream
    pub fn into_stream(self) -> EventStream {
        match self {
            Self::Stream(stream) => stream,
            Self::Response(response) => Box::pin(stream::iter(event_stream::synthesize_events(response))),
        }
    }

    /// Collect the output into a buffered response
    ///
    /// # Errors
    ///
    /// The stream's terminal error, or `Cancelled`.
    pub async fn into_response(self) -> Result<ChatResponse, CanonicalError> {
        let mut stream = match self {
            Self::Response(response) => return Ok(response),
            Self::Stream(stream) => stream,
        };

        let mut response = ChatResponse::new(format!("resp_{}", Uuid::new_v4().simple()));
        let mut reasoning = String::new();

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta { text } => response.text.push_str(&text),
                StreamEvent::ReasoningDelta { text } => reasoning.push_str(&text),
                StreamEvent::ToolCallDelta { .. } => {}
                StreamEvent::ToolCallComplete { id, name, args } => {
                    response.tool_calls.push(CompletedToolCall {
                        id,
                        name,
                        arguments: args,
                    });
                }
                StreamEvent::Usage(usage) => response.usage = Some(usage),
                StreamEvent::Warning { message } => response.warnings.push(message),
                StreamEvent::FinishReason { reason } => {
                    response.finish_reason = reason;
                    break;
                }
                StreamEvent::Error(error) if error.kind() == ErrorKind::ToolArgsParseFailure => {
                    response.tool_call_errors.push(error);
                }
                StreamEvent::Error(error) => return Err(error),
                StreamEvent::Cancelled => return Err(classify::cancelled()),
            }
        }

        if !reasoning.is_empty() {
            response.reasoning = Some(reasoning);
        }
        Ok(response)
    }
}

/// Canonical interface every provider runtime implements
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Static description of the provider behind this runtime
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Run a chat completion; streams when the request asks to
    async fn chat_completion(&self, request: &ChatRequest, options: &CallOptions)
    -> Result<ChatOutput, CanonicalError>;

    /// Models the provider offers
    async fn list_models(&self, options: &CallOptions) -> Result<Vec<ModelInfo>, CanonicalError>;

    /// Embed a batch of texts
    async fn embeddings(
        &self,
        request: &EmbeddingRequest,
        options: &CallOptions,
    ) -> Result<EmbeddingResponse, CanonicalError>;

    /// Synthesize speech
    async fn text_to_speech(
        &self,
        request: &SpeechRequest,
        options: &CallOptions,
    ) -> Result<SpeechResponse, CanonicalError>;
}

/// Runtime for one provider, built by the registry
pub struct Runtime {
    descriptor: Arc<ProviderDescriptor>,
    codec: Arc<dyn ProviderCodec>,
    transport: Arc<Transport>,
    rate_limits: Arc<RateLimitBook>,
    models_fallback_empty: bool,
}

impl Runtime {
    pub(crate) fn new(
        descriptor: Arc<ProviderDescriptor>,
        transport: Transport,
        rate_limits: Arc<RateLimitBook>,
        models_fallback_empty: bool,
    ) -> Self {
        Self {
            codec: codec::for_protocol(descriptor.protocol),
            descriptor,
            transport: Arc::new(transport),
            rate_limits,
            models_fallback_empty,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.descriptor.supports(capability)
    }

    /// How long the provider asked callers to back off, if it still applies
    pub fn advisory_wait(&self) -> Option<Duration> {
        self.rate_limits.advisory_wait(&self.descriptor.id)
    }

    /// Generate a JSON value conforming to the request's schema
    ///
    /// The request's `response_format` must be a JSON schema. Uses native
    /// schema support or a forced tool call, then validates with one repair
    /// pass.
    ///
    /// # Errors
    ///
    /// `CapabilityUnsupported`, `SchemaValidationFailed`, or any error of the
    /// underlying call.
    pub async fn generate_object(
        &self,
        request: &ChatRequest,
        options: &CallOptions,
    ) -> Result<StructuredOutput, CanonicalError> {
        let plan = structured::plan(request, &self.descriptor).map_err(|e| self.attribute(e))?;
        debug!(provider = %self.descriptor.id, strategy = ?plan.strategy, "generating structured output");

        let response = self.chat_completion(&plan.request, options).await?.into_response().await?;
        plan.read(&response).map_err(|e| self.attribute(e))
    }

    fn ensure(&self, capability: Capability) -> Result<(), CanonicalError> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(classify::capability_unsupported(&self.descriptor.id, capability))
        }
    }

    fn attribute(&self, error: CanonicalError) -> CanonicalError {
        error.for_provider(&self.descriptor.id)
    }

    async fn send(&self, request: &ProviderRequest, options: &CallOptions) -> Result<RawResponse, CanonicalError> {
        let result = self.transport.send(request, options).await.map_err(|e| self.attribute(e));
        match &result {
            Ok(_) => self.rate_limits.record_success(&self.descriptor.id),
            Err(e) => self.rate_limits.record(&self.descriptor.id, e),
        }
        result
    }

    fn unexpected(&self, raw: &RawResponse, error: &serde_json::Error) -> CanonicalError {
        warn!(provider = %self.descriptor.id, error = %error, "unparseable upstream response");
        self.attribute(classify::unexpected_body(
            raw.status,
            &String::from_utf8_lossy(&raw.body),
            error,
        ))
    }

    async fn complete(
        &self,
        request: &ProviderRequest,
        model: &str,
        options: &CallOptions,
    ) -> Result<ChatResponse, CanonicalError> {
        let raw = self.send(request, options).await?;
        let parts = self
            .codec
            .parse_chat_response(&raw.body)
            .map_err(|e| self.unexpected(&raw, &e))?;

        let mut response = assemble(parts, model, &self.descriptor.id);
        response.warnings.clone_from(&request.warnings);
        Ok(response)
    }

    fn open(&self, mut request: ProviderRequest, options: &CallOptions) -> EventStream {
        let warnings = std::mem::take(&mut request.warnings);
        let transport = Arc::clone(&self.transport);
        let rate_limits = Arc::clone(&self.rate_limits);
        let provider = self.descriptor.id.clone();
        let framing = self.descriptor.framing;

        let connect: Connect = async move {
            match transport.open_stream(&request).await {
                Ok(body) => {
                    rate_limits.record_success(&provider);
                    Ok(framing::frames(body, framing))
                }
                Err(e) => {
                    rate_limits.record(&provider, &e);
                    Err(e)
                }
            }
        }
        .boxed();

        let pipeline = EventPipeline::new(Arc::clone(&self.descriptor), self.codec.stream_decoder());
        let limits = Limits {
            cancel: options.cancel.clone(),
            timeout: self.transport.timeout_for(options),
        };
        event_stream::drive(connect, pipeline, limits, warnings)
    }
}

#[async_trait]
impl ModelRuntime for Runtime {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn chat_completion(
        &self,
        request: &ChatRequest,
        options: &CallOptions,
    ) -> Result<ChatOutput, CanonicalError> {
        let fallback = request.stream && !self.supports(Capability::Streaming);
        let encoded = if fallback {
            let mut buffered = request.clone();
            buffered.stream = false;
            normalize::normalize(&buffered, &self.descriptor)
        } else {
            normalize::normalize(request, &self.descriptor)
        }
        .map_err(|e| self.attribute(e))?;

        if encoded.stream {
            return Ok(ChatOutput::Stream(self.open(encoded, options)));
        }

        let model = codec::resolve_model(request, &self.descriptor).map_err(|e| self.attribute(e))?;
        let result = self.complete(&encoded, &model, options).await;

        if !fallback {
            return result.map(ChatOutput::Response);
        }

        debug!(provider = %self.descriptor.id, "provider cannot stream; replaying buffered response as events");
        let events = match result {
            Ok(response) => event_stream::synthesize_events(response),
            Err(e) if e.kind() == ErrorKind::Cancelled => vec![StreamEvent::Cancelled],
            Err(e) => vec![StreamEvent::Error(e)],
        };
        Ok(ChatOutput::Stream(Box::pin(stream::iter(events))))
    }

    async fn list_models(&self, options: &CallOptions) -> Result<Vec<ModelInfo>, CanonicalError> {
        self.ensure(Capability::ListModels)?;

        if let ModelSource::Static(models) = &self.descriptor.models {
            return Ok(models.iter().cloned().map(ModelInfo::new).collect());
        }

        let request = self.codec.models_request();
        let result = match self.send(&request, options).await {
            Ok(raw) => self.codec.parse_models(&raw.body).map_err(|e| self.unexpected(&raw, &e)),
            Err(e) => Err(e),
        };

        match result {
            Err(e) if self.models_fallback_empty && e.kind() != ErrorKind::Cancelled => {
                warn!(provider = %self.descriptor.id, error = %e, "model listing failed, returning an empty list");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn embeddings(
        &self,
        request: &EmbeddingRequest,
        options: &CallOptions,
    ) -> Result<EmbeddingResponse, CanonicalError> {
        self.ensure(Capability::Embeddings)?;
        if request.input.is_empty() {
            return Err(self.attribute(classify::malformed_request("embedding input must not be empty")));
        }

        let encoded = self
            .codec
            .embeddings_request(request, &self.descriptor)
            .map_err(|e| self.attribute(e))?;
        let raw = self.send(&encoded, options).await?;
        self.codec
            .parse_embeddings(&raw.body, &request.model)
            .map_err(|e| self.unexpected(&raw, &e))
    }

    async fn text_to_speech(
        &self,
        request: &SpeechRequest,
        options: &CallOptions,
    ) -> Result<SpeechResponse, CanonicalError> {
        self.ensure(Capability::TextToSpeech)?;
        if request.input.trim().is_empty() {
            return Err(self.attribute(classify::malformed_request("speech input must not be empty")));
        }

        let encoded = self
            .codec
            .speech_request(request, &self.descriptor)
            .map_err(|e| self.attribute(e))?;
        let raw = self.send(&encoded, options).await?;

        let content_type = raw
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_owned();
        Ok(SpeechResponse {
            audio: raw.body,
            content_type,
        })
    }
}

/// Build a buffered response, reconciling tool calls like a stream would
fn assemble(parts: ResponseParts, model: &str, provider: &str) -> ChatResponse {
    let mut reconciler = ToolCallReconciler::new();
    for (index, call) in parts.tool_calls.iter().enumerate() {
        reconciler.on_delta(
            codec::position(index),
            call.id.as_deref(),
            Some(&call.name),
            &call.arguments,
        );
    }

    let mut tool_calls = Vec::new();
    let mut tool_call_errors = Vec::new();
    for result in reconciler.on_finish() {
        match result {
            Ok(call) => tool_calls.push(call),
            Err(e) => tool_call_errors.push(e.for_provider(provider)),
        }
    }

    let finish_reason = parts.finish_reason.unwrap_or(if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolCalls
    });

    ChatResponse {
        id: parts
            .id
            .unwrap_or_else(|| format!("resp_{}", Uuid::new_v4().simple())),
        model: parts.model.unwrap_or_else(|| model.to_owned()),
        text: parts.text,
        reasoning: parts.reasoning,
        tool_calls,
        tool_call_errors,
        finish_reason,
        usage: parts.usage,
        warnings: Vec::new(),
    }
}
