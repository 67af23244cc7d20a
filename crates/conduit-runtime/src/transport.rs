//! HTTP transport adapter
//!
//! Sends encoded [`ProviderRequest`]s with the provider's authentication,
//! configured headers and proxy. Buffered calls may retry `Transient`
//! failures before a success body is read; streaming calls never retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_config::{MAX_RETRIES_LIMIT, ProviderConfig};
use futures_util::StreamExt;
use http::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::codec::ProviderRequest;
use crate::descriptor::{AuthStyle, Framing, ProviderDescriptor};
use crate::error::{CanonicalError, classify};
use crate::stream::framing::ByteStream;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(4);

/// Per-call cancellation and deadline
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Cooperative cancellation; cancelling ends the call with `Cancelled`
    pub cancel: CancellationToken,
    /// Deadline measured from the start of the call, overriding the
    /// provider's configured timeout
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully read upstream response
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HTTP client bound to one provider and one set of credentials
#[derive(Debug)]
pub struct Transport {
    client: reqwest::Client,
    descriptor: Arc<ProviderDescriptor>,
    base_url: Url,
    api_key: Option<SecretString>,
    headers: HeaderMap,
    timeout: Option<Duration>,
    max_retries: u32,
}

impl Transport {
    /// Build the client for a provider
    ///
    /// # Errors
    ///
    /// `MalformedRequest` for unusable URLs, proxies or header values.
    pub fn new(descriptor: Arc<ProviderDescriptor>, config: &ProviderConfig) -> Result<Self, CanonicalError> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| classify::malformed_request(format!("invalid proxy URL: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| classify::malformed_request(format!("failed to build HTTP client: {e}")))?;

        let base_url = match &config.base_url {
            Some(url) => url.clone(),
            None => descriptor.base_url()?,
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| classify::malformed_request(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| classify::malformed_request(format!("invalid value for header '{name}': {e}")))?;
            headers.insert(name, value);
        }

        let max_retries = config
            .max_retries
            .unwrap_or(descriptor.default_max_retries)
            .min(MAX_RETRIES_LIMIT);

        Ok(Self {
            client,
            base_url,
            api_key: if descriptor.keyless { None } else { config.api_key.clone() },
            headers,
            timeout: config.timeout,
            max_retries,
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Effective deadline for a call
    pub fn timeout_for(&self, options: &CallOptions) -> Option<Duration> {
        options.timeout.or(self.timeout)
    }

    /// Send a buffered request, retrying `Transient` failures
    ///
    /// # Errors
    ///
    /// The classified upstream or transport error, `Timeout`, or `Cancelled`.
    pub async fn send(&self, request: &ProviderRequest, options: &CallOptions) -> Result<RawResponse, CanonicalError> {
        let work = async {
            let response = self.connect_with_retry(request).await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|e| self.network(&e))?;
            Ok(RawResponse { status, headers, body })
        };
        limited(work, &options.cancel, self.timeout_for(options)).await
    }

    /// Open a streaming response
    ///
    /// The returned body is not bounded by the call deadline; the stream
    /// driver owns that.
    ///
    /// # Errors
    ///
    /// The classified upstream or transport error. Nothing is retried.
    pub async fn open_stream(&self, request: &ProviderRequest) -> Result<ByteStream, CanonicalError> {
        let response = self.connect(request).await?;
        let provider = self.descriptor.id.clone();
        Ok(Box::pin(response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                error!(provider = %provider, error = %e, "upstream stream failed");
                classify::network(&e).for_provider(&provider)
            })
        })))
    }

    async fn connect_with_retry(&self, request: &ProviderRequest) -> Result<reqwest::Response, CanonicalError> {
        let mut attempt = 0;
        loop {
            match self.connect(request).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff(attempt);
                    warn!(
                        provider = %self.descriptor.id,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "retrying upstream request"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// Send once; non-success statuses are read and classified
    async fn connect(&self, request: &ProviderRequest) -> Result<reqwest::Response, CanonicalError> {
        debug!(provider = %self.descriptor.id, method = %request.method, path = %request.path, "sending upstream request");

        let response = self.build(request)?.send().await.map_err(|e| self.network(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(provider = %self.descriptor.id, error = %e, "failed to read error body");
                String::new()
            }
        };
        warn!(provider = %self.descriptor.id, status = %status, "upstream returned error");
        Err(classify::classify_response(status.as_u16(), &headers, &body, &self.descriptor))
    }

    fn build(&self, request: &ProviderRequest) -> Result<reqwest::RequestBuilder, CanonicalError> {
        let mut url = self.url(&request.path)?;
        if let (AuthStyle::QueryParam(name), Some(key)) = (&self.descriptor.auth, &self.api_key) {
            url.query_pairs_mut().append_pair(name, key.expose_secret());
        }

        let mut builder = self.client.request(request.method.clone(), url).headers(self.headers.clone());
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if request.stream && self.descriptor.framing == Framing::Sse {
            builder = builder.header(ACCEPT, "text/event-stream");
        }

        builder = match (&self.descriptor.auth, &self.api_key) {
            (AuthStyle::Bearer, Some(key)) => builder.bearer_auth(key.expose_secret()),
            (AuthStyle::Header(name), Some(key)) => builder.header(name.as_str(), key.expose_secret()),
            _ => builder,
        };

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }

    /// Base URL with the request path appended (base path segments are kept)
    fn url(&self, path: &str) -> Result<Url, CanonicalError> {
        let joined = format!("{}{path}", self.base_url.as_str().trim_end_matches('/'));
        Url::parse(&joined).map_err(|e| classify::malformed_request(format!("invalid request URL '{joined}': {e}")))
    }

    fn network(&self, e: &reqwest::Error) -> CanonicalError {
        error!(provider = %self.descriptor.id, error = %e, "upstream request failed");
        classify::network(e).for_provider(&self.descriptor.id)
    }
}

/// Run `work` under cancellation and an optional deadline
async fn limited<T>(
    work: impl Future<Output = Result<T, CanonicalError>>,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<T, CanonicalError> {
    let bounded = async {
        match timeout {
            Some(after) => tokio::time::timeout(after, work)
                .await
                .unwrap_or_else(|_| Err(classify::timeout(after))),
            None => work.await,
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(classify::cancelled()),
        result = bounded => result,
    }
}

/// Exponential backoff with +/-25% jitter
fn backoff(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt)).min(BACKOFF_MAX);
    let jitter = rand::rng().random_range(0.75..=1.25);
    base.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::descriptor::builtin;
    use crate::error::ErrorKind;

    fn transport(id: &str, config: &ProviderConfig) -> Transport {
        Transport::new(Arc::new(builtin(id).unwrap()), config).unwrap()
    }

    fn built(transport: &Transport, request: &ProviderRequest) -> reqwest::Request {
        transport.build(request).unwrap().build().unwrap()
    }

    #[test]
    fn base_path_is_preserved() {
        let t = transport("openai", &ProviderConfig::new("openai").with_api_key("sk-test"));
        let request = built(&t, &ProviderRequest::get("/models"));
        assert_eq!(request.url().as_str(), "https://api.openai.com/v1/models");
    }

    #[test]
    fn bearer_auth_and_configured_headers() {
        let config = ProviderConfig::new("openai")
            .with_api_key("sk-test")
            .with_header("x-team", "core");
        let t = transport("openai", &config);
        let request = built(&t, &ProviderRequest::post("/chat/completions", json!({})).streaming(true));

        assert_eq!(request.headers()["authorization"], "Bearer sk-test");
        assert_eq!(request.headers()["x-team"], "core");
        assert_eq!(request.headers()["accept"], "text/event-stream");
    }

    #[test]
    fn header_auth() {
        let t = transport("anthropic", &ProviderConfig::new("anthropic").with_api_key("sk-ant"));
        let request = built(&t, &ProviderRequest::get("/models").with_header("anthropic-version", "2023-06-01"));
        assert_eq!(request.headers()["x-api-key"], "sk-ant");
        assert_eq!(request.headers()["anthropic-version"], "2023-06-01");
        assert!(request.headers().get("authorization").is_none());
    }

    #[test]
    fn query_param_auth_keeps_existing_query() {
        let mut descriptor = builtin("google").unwrap();
        descriptor.auth = AuthStyle::QueryParam("key".to_owned());
        let t = Transport::new(Arc::new(descriptor), &ProviderConfig::new("google").with_api_key("g-key")).unwrap();
        let request = built(&t, &ProviderRequest::get("/models/gemini:streamGenerateContent?alt=sse"));
        let query: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![("alt".into(), "sse".into()), ("key".into(), "g-key".into())]
        );
    }

    #[test]
    fn google_key_header() {
        let t = transport("google", &ProviderConfig::new("google").with_api_key("g-key"));
        let request = built(&t, &ProviderRequest::get("/models"));
        assert_eq!(request.headers()["x-goog-api-key"], "g-key");
    }

    #[test]
    fn keyless_providers_send_no_credentials() {
        let t = transport("ollama", &ProviderConfig::new("ollama").with_api_key("ignored"));
        let request = built(&t, &ProviderRequest::get("/api/tags"));
        assert!(request.headers().get("authorization").is_none());
    }

    #[test]
    fn configured_base_url_wins() {
        let url = Url::parse("http://127.0.0.1:9000/v1/").unwrap();
        let t = transport("openai", &ProviderConfig::new("openai").with_api_key("k").with_base_url(url));
        let request = built(&t, &ProviderRequest::get("/models"));
        assert_eq!(request.url().as_str(), "http://127.0.0.1:9000/v1/models");
    }

    #[test]
    fn retries_are_capped() {
        let t = transport("openai", &ProviderConfig::new("openai").with_api_key("k").with_max_retries(9));
        assert_eq!(t.max_retries(), MAX_RETRIES_LIMIT);
    }

    #[test]
    fn invalid_header_is_rejected() {
        let config = ProviderConfig::new("openai").with_api_key("k").with_header("bad header", "x");
        let err = Transport::new(Arc::new(builtin("openai").unwrap()), &config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRequest);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        for attempt in 0..3 {
            let delay = backoff(attempt);
            let nominal = BACKOFF_BASE * 2u32.pow(attempt);
            assert!(delay >= nominal.mul_f64(0.75) && delay <= nominal.mul_f64(1.25));
        }
        assert!(backoff(30) <= BACKOFF_MAX.mul_f64(1.25));
    }

    #[test]
    fn call_timeout_overrides_config() {
        let config = ProviderConfig::new("openai")
            .with_api_key("k")
            .with_timeout(Duration::from_secs(60));
        let t = transport("openai", &config);
        assert_eq!(t.timeout_for(&CallOptions::new()), Some(Duration::from_secs(60)));
        assert_eq!(
            t.timeout_for(&CallOptions::new().with_timeout(Duration::from_secs(1))),
            Some(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = limited(std::future::pending(), &cancel, None).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_timeout() {
        let result: Result<(), _> =
            limited(std::future::pending(), &CancellationToken::new(), Some(Duration::from_secs(2))).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }
}
