//! Request orchestration.
//!
//! [`InferenceService`] ties the pool, the retry policy and the stream
//! decoder together.  It is an ordinary value: build one from [`Settings`]
//! (or from an existing pool) and pass it, or an `Arc` of it, to whatever
//! needs to talk to the model.
//!
//! Every stream the service opens is tracked in its [`StreamRegistry`], and
//! an optional [`InferenceObserver`] sees retries and stream progress.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;

use crate::config::Settings;
use crate::error::{InferenceError, Result};
use crate::observer::InferenceObserver;
use crate::pool::ClientPool;
use crate::registry::StreamRegistry;
use crate::retry::{Attempt, RetryPolicy};
use crate::streaming::ChunkStream;
use crate::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, GenerationParams,
    GenerationResponse, HealthStatus, ModelInfo,
};

/// High-level entry point for chat completions.
#[derive(Clone)]
pub struct InferenceService {
    pool: Arc<ClientPool>,
    retry: RetryPolicy,
    defaults: GenerationParams,
    model: String,
    chunk_timeout: Duration,
    streams: Arc<StreamRegistry>,
    observer: Option<Arc<dyn InferenceObserver>>,
}

impl std::fmt::Debug for InferenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceService")
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .field("model", &self.model)
            .field("chunk_timeout", &self.chunk_timeout)
            .field("streams", &self.streams.len())
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl InferenceService {
    /// Wrap an existing pool with default retry and generation settings.
    pub fn new(pool: Arc<ClientPool>, model: impl Into<String>) -> Self {
        let chunk_timeout = pool.client_config().chunk_timeout;
        Self {
            pool,
            retry: RetryPolicy::default(),
            defaults: GenerationParams::default(),
            model: model.into(),
            chunk_timeout,
            streams: Arc::new(StreamRegistry::new()),
            observer: None,
        }
    }

    /// Validate `settings` and build a service with a fresh, lazily
    /// initialized pool.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let pool = ClientPool::new(settings.client.clone(), settings.pool.clone());
        Ok(Self::new(Arc::new(pool), settings.server.request_model())
            .with_retry(settings.retry.clone())
            .with_defaults(settings.generation.clone()))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Generation parameters used when a call passes `None`.
    pub fn with_defaults(mut self, defaults: GenerationParams) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_chunk_timeout(mut self, chunk_timeout: Duration) -> Self {
        self.chunk_timeout = chunk_timeout;
        self
    }

    /// Report retries and stream events to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn InferenceObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Track streams in `streams` instead of a registry of the service's own.
    pub fn with_registry(mut self, streams: Arc<StreamRegistry>) -> Self {
        self.streams = streams;
        self
    }

    /// Streams opened by this service.
    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn defaults(&self) -> &GenerationParams {
        &self.defaults
    }

    /// Build a request for the service's model.
    pub fn request(
        &self,
        messages: Vec<ChatMessage>,
        params: Option<GenerationParams>,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest::new(self.model.clone(), messages)
            .with_params(params.unwrap_or_else(|| self.defaults.clone()))
    }

    fn retry_hook(&self) -> impl FnMut(u32, &InferenceError, Duration) + '_ {
        let observer = self.observer.as_deref();
        move |retry, err, delay| {
            if let Some(observer) = observer {
                observer.on_retry(retry, err, delay);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Chat completions
    // -----------------------------------------------------------------------

    /// Run a non-streaming chat completion.
    pub async fn chat_completion(
        &self,
        messages: Vec<ChatMessage>,
        params: Option<GenerationParams>,
    ) -> Result<ChatCompletionResponse> {
        self.send(self.request(messages, params)).await
    }

    /// Send a fully built request.  Validation happens before any network
    /// traffic; transient failures are retried per the policy.
    pub async fn send(&self, request: ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let request = request.streaming(false);
        request.validate()?;

        let pool = &self.pool;
        let request = &request;
        let response = self
            .retry
            .run_with(
                move |attempt| async move {
                    let client = match pool.acquire().await {
                        Ok(client) => client,
                        Err(err) => return Attempt::Fatal(err),
                    };
                    tracing::debug!(attempt, client = client.id(), "dispatching chat completion");
                    client.chat_completion(request).await
                },
                self.retry_hook(),
            )
            .await?;

        tracing::debug!(
            id = %response.id,
            choices = response.choices.len(),
            usage = ?response.usage,
            "chat completion received"
        );
        Ok(response)
    }

    /// Open a streaming chat completion.
    pub async fn chat_completion_stream(
        &self,
        messages: Vec<ChatMessage>,
        params: Option<GenerationParams>,
    ) -> Result<ChunkStream> {
        self.send_stream(self.request(messages, params)).await
    }

    /// Open a stream for a fully built request.
    ///
    /// Retries cover connecting and the status line only.  Once the stream
    /// is returned, any error ends it and nothing is replayed.  The stream
    /// is registered in [`streams`](Self::streams) under a fresh id, and
    /// entries of streams that already finished are dropped first.
    pub async fn send_stream(&self, request: ChatCompletionRequest) -> Result<ChunkStream> {
        let request = request.streaming(true);
        request.validate()?;

        let pool = &self.pool;
        let request = &request;
        let (lease, response, attempt) = self
            .retry
            .run_with(
                move |attempt| async move {
                    let client = match pool.acquire().await {
                        Ok(client) => client,
                        Err(err) => return Attempt::Fatal(err),
                    };
                    tracing::debug!(attempt, client = client.id(), "dispatching stream request");
                    let opened = client.open_stream(request).await;
                    opened.map(|resp| (client, resp, attempt))
                },
                self.retry_hook(),
            )
            .await?;

        let mut stream = ChunkStream::from_response(response, self.chunk_timeout, Some(lease));
        stream.set_retries(attempt);
        if let Some(observer) = &self.observer {
            stream.add_observer(Arc::clone(observer));
        }
        self.streams.cleanup_completed();
        self.streams.track(&mut stream);
        Ok(stream)
    }

    // -----------------------------------------------------------------------
    // Single-prompt generation
    // -----------------------------------------------------------------------

    /// Generate text for one user prompt.
    pub async fn generate(
        &self,
        prompt: &str,
        params: Option<GenerationParams>,
    ) -> Result<GenerationResponse> {
        let response = self
            .chat_completion(vec![ChatMessage::user(prompt)], params)
            .await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::Parse {
                reason: "completion has no choices".into(),
            })?;
        let text = choice.message.map(|m| m.content).unwrap_or_default();
        Ok(GenerationResponse {
            text,
            finish_reason: choice.finish_reason,
            usage: response.usage,
            request_id: response.id,
        })
    }

    /// Stream the text of a generation for one user prompt.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        params: Option<GenerationParams>,
    ) -> Result<impl Stream<Item = Result<String>> + Send + use<>> {
        let stream = self
            .chat_completion_stream(vec![ChatMessage::user(prompt)], params)
            .await?;
        Ok(stream.into_text())
    }

    // -----------------------------------------------------------------------
    // Endpoint metadata
    // -----------------------------------------------------------------------

    /// Models served by the endpoint.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let pool = &self.pool;
        self.retry
            .run_with(
                move |_| async move {
                    match pool.acquire().await {
                        Ok(client) => client.list_models().await,
                        Err(err) => Attempt::Fatal(err),
                    }
                },
                self.retry_hook(),
            )
            .await
    }

    /// Check the endpoint once, without retries.
    pub async fn health_check(&self) -> Result<HealthStatus> {
        let client = self.pool.acquire().await?;
        let status = client.health().await.into_result();
        match &status {
            Ok(health) => tracing::debug!(status = %health.status, "health check passed"),
            Err(err) => tracing::warn!(error = %err, "health check failed"),
        }
        status
    }

    /// Shut the pool down.  In-flight leases drop their handles on return.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, PoolConfig};

    fn service() -> InferenceService {
        let pool = ClientPool::new(ClientConfig::new("http://127.0.0.1:9"), PoolConfig::default());
        InferenceService::new(Arc::new(pool), "qwen")
    }

    #[test]
    fn request_uses_service_defaults() {
        let svc = service().with_defaults(GenerationParams {
            max_tokens: 64,
            ..GenerationParams::default()
        });
        let req = svc.request(vec![ChatMessage::user("hi")], None);
        assert_eq!(req.model, "qwen");
        assert_eq!(req.params.max_tokens, 64);
        assert!(!req.stream);

        let explicit = GenerationParams {
            temperature: 0.1,
            ..GenerationParams::default()
        };
        let req = svc.request(vec![ChatMessage::user("hi")], Some(explicit));
        assert_eq!(req.params.temperature, 0.1);
        assert_eq!(req.params.max_tokens, 1024);
    }

    #[test]
    fn from_settings_uses_served_model_name() {
        let mut settings = Settings::default();
        settings.server.served_model_name = Some("travel".into());
        settings.pool.size = 2;
        let svc = InferenceService::from_settings(&settings).unwrap();
        assert_eq!(svc.model(), "travel");
        assert_eq!(svc.pool().size(), 2);
        assert!(!svc.pool().is_initialized());
    }

    #[test]
    fn from_settings_rejects_invalid_config() {
        let mut settings = Settings::default();
        settings.retry.backoff_multiplier = 0.0;
        assert!(InferenceService::from_settings(&settings).is_err());
    }

    #[tokio::test]
    async fn invalid_request_fails_before_network() {
        let svc = service();
        let err = svc.chat_completion(Vec::new(), None).await.unwrap_err();
        assert!(matches!(err, InferenceError::InvalidRequest { .. }));
        // Validation happens before the pool is touched.
        assert!(!svc.pool().is_initialized());

        let bad = GenerationParams {
            temperature: 3.0,
            ..GenerationParams::default()
        };
        let err = svc
            .chat_completion_stream(vec![ChatMessage::user("hi")], Some(bad))
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::InvalidRequest { .. }));
    }
}
