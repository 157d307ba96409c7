//! A single HTTP client handle bound to one inference endpoint.
//!
//! Every call returns an [`Attempt`] so the retry loop can pattern-match on
//! the outcome: transport failures and 5xx statuses are retryable, 4xx
//! statuses and undecodable bodies are fatal.

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};

use crate::config::ClientConfig;
use crate::error::{InferenceError, Result};
use crate::retry::Attempt;
use crate::types::{ChatCompletionRequest, ChatCompletionResponse, HealthStatus, ModelInfo, ModelList};

/// Path of the chat completions endpoint.
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Path of the model listing endpoint.
pub const MODELS_PATH: &str = "/v1/models";

/// Path of the liveness check.
pub const HEALTH_PATH: &str = "/health";

/// One configured HTTP client.  Owned by the pool, lent to one caller at a
/// time.
#[derive(Debug)]
pub struct InferenceClient {
    id: usize,
    base_url: String,
    http: reqwest::Client,
}

impl InferenceClient {
    /// Build a handle with the base URL, auth header, user agent and timeout
    /// from `config`.
    pub fn new(id: usize, config: &ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).map_err(|e| InferenceError::Config {
                reason: format!("invalid user agent: {e}"),
            })?,
        );
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
                InferenceError::Config {
                    reason: format!("invalid authorization header: {e}"),
                }
            })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| InferenceError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            id,
            base_url: config.trimmed_base_url().to_owned(),
            http,
        })
    }

    /// Position of this handle in its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Non-streaming chat completion.
    pub async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Attempt<ChatCompletionResponse> {
        tracing::debug!(
            client = self.id,
            model = %request.model,
            messages = request.messages.len(),
            "sending chat completion"
        );
        Attempt::from_result(self.try_chat_completion(request).await)
    }

    /// Open a streaming chat completion.  Returns the response once the
    /// status line has been checked; the body is left unread.
    pub async fn open_stream(&self, request: &ChatCompletionRequest) -> Attempt<reqwest::Response> {
        tracing::debug!(client = self.id, model = %request.model, "opening completion stream");
        Attempt::from_result(self.try_open_stream(request).await)
    }

    /// List the models served by the endpoint.
    pub async fn list_models(&self) -> Attempt<Vec<ModelInfo>> {
        Attempt::from_result(self.try_list_models().await)
    }

    /// Query the server's health endpoint.
    pub async fn health(&self) -> Attempt<HealthStatus> {
        Attempt::from_result(self.try_health().await)
    }

    async fn try_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let resp = self
            .http
            .post(self.url(CHAT_COMPLETIONS_PATH))
            .json(request)
            .send()
            .await?;
        let body = success_body(resp).await?;
        ChatCompletionResponse::from_completion_json(&body)
    }

    async fn try_open_stream(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(self.url(CHAT_COMPLETIONS_PATH))
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;
        check_status(resp).await
    }

    async fn try_list_models(&self) -> Result<Vec<ModelInfo>> {
        let resp = self.http.get(self.url(MODELS_PATH)).send().await?;
        let body = success_body(resp).await?;
        let list: ModelList = serde_json::from_str(&body).map_err(|e| InferenceError::Parse {
            reason: format!("invalid model list: {e}"),
        })?;
        Ok(list.data)
    }

    async fn try_health(&self) -> Result<HealthStatus> {
        let resp = self.http.get(self.url(HEALTH_PATH)).send().await?;
        let body = success_body(resp).await?;
        if body.trim().is_empty() {
            return Ok(HealthStatus::ok());
        }
        Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "health body is not JSON, treating as ok");
            HealthStatus::ok()
        }))
    }
}

/// Turn a non-success status into the matching error, keeping the body for
/// diagnostics.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(InferenceError::from_status(status.as_u16(), body))
}

async fn success_body(resp: reqwest::Response) -> Result<String> {
    let resp = check_status(resp).await?;
    Ok(resp.text().await?)
}
