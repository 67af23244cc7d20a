//! Router runtime: one provider id in front of several runtimes
//!
//! Each route names the models it serves. Chat, embedding and speech calls
//! go to the first route listing the requested model, or to the last route
//! when none does. Model listing asks the first route.

use std::iter;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::descriptor::ProviderDescriptor;
use crate::error::{CanonicalError, classify};
use crate::runtime::{ChatOutput, ModelRuntime};
use crate::transport::CallOptions;
use crate::types::{ChatRequest, EmbeddingRequest, EmbeddingResponse, ModelInfo, SpeechRequest, SpeechResponse};

/// A sub-runtime and the models it serves
#[derive(Clone)]
pub struct Route {
    models: Vec<String>,
    runtime: Arc<dyn ModelRuntime>,
}

impl Route {
    pub fn new<I, S>(runtime: impl ModelRuntime + 'static, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
            runtime: Arc::new(runtime),
        }
    }

    fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

/// Runtime dispatching each call to a sub-runtime by model
pub struct RouterRuntime {
    descriptor: ProviderDescriptor,
    routes: Vec<Route>,
    /// Last route; takes every model no other route claims
    fallback: Route,
}

impl RouterRuntime {
    /// Build a router from its routes, in priority order
    ///
    /// # Errors
    ///
    /// `MalformedRequest` when `routes` is empty.
    pub fn new(id: &str, mut routes: Vec<Route>) -> Result<Self, CanonicalError> {
        let Some(fallback) = routes.pop() else {
            return Err(classify::malformed_request(format!("router '{id}' has empty providers")).for_provider(id));
        };

        let first = routes.first().unwrap_or(&fallback);
        let mut descriptor = first.runtime.descriptor().clone();
        descriptor.id = id.to_owned();
        descriptor.name = id.to_owned();
        descriptor.capabilities = routes
            .iter()
            .chain(iter::once(&fallback))
            .fold(descriptor.capabilities, |caps, route| {
                caps.union(route.runtime.descriptor().capabilities)
            });

        debug!(router = %id, routes = routes.len() + 1, "router runtime created");
        Ok(Self {
            descriptor,
            routes,
            fallback,
        })
    }

    /// Sub-runtime that serves `model`
    pub fn route(&self, model: &str) -> &dyn ModelRuntime {
        let route = self.routes.iter().find(|r| r.serves(model)).unwrap_or(&self.fallback);
        debug!(router = %self.descriptor.id, model, provider = %route.runtime.descriptor().id, "routing call");
        route.runtime.as_ref()
    }

    fn first(&self) -> &dyn ModelRuntime {
        self.routes.first().unwrap_or(&self.fallback).runtime.as_ref()
    }
}

#[async_trait]
impl ModelRuntime for RouterRuntime {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn chat_completion(
        &self,
        request: &ChatRequest,
        options: &CallOptions,
    ) -> Result<ChatOutput, CanonicalError> {
        self.route(&request.model).chat_completion(request, options).await
    }

    async fn list_models(&self, options: &CallOptions) -> Result<Vec<ModelInfo>, CanonicalError> {
        self.first().list_models(options).await
    }

    async fn embeddings(
        &self,
        request: &EmbeddingRequest,
        options: &CallOptions,
    ) -> Result<EmbeddingResponse, CanonicalError> {
        self.route(&request.model).embeddings(request, options).await
    }

    async fn text_to_speech(
        &self,
        request: &SpeechRequest,
        options: &CallOptions,
    ) -> Result<SpeechResponse, CanonicalError> {
        self.route(&request.model).text_to_speech(request, options).await
    }
}
