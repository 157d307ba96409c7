//! Wire types for the OpenAI-compatible chat completions API.
//!
//! Requests are validated before they are sent; responses are decoded into
//! typed records and then checked against the invariants the rest of the
//! crate relies on (non-empty choices, consistent usage, known object kind).
//! A body that does not match is rejected rather than partially accepted.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{InferenceError, Result};

/// `object` value of a non-streaming completion.
pub const OBJECT_COMPLETION: &str = "chat.completion";

/// `object` value of a streaming delta record.
pub const OBJECT_CHUNK: &str = "chat.completion.chunk";

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,

    /// Message text.  A `null` content on the wire decodes as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,

    /// Optional participant name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    /// Create a message with an explicit role.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Generation parameters
// ---------------------------------------------------------------------------

/// Stop condition: a single sequence or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

/// Sampling and decoding parameters sent with every request.
///
/// Also used as the `[generation]` table of the configuration file, so every
/// field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub repetition_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    /// Number of candidates to generate.
    pub n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_of: Option<u32>,
    pub use_beam_search: bool,
    pub length_penalty: f32,
    pub early_stopping: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f32>>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
            top_k: Some(50),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repetition_penalty: 1.0,
            stop: None,
            n: 1,
            best_of: None,
            use_beam_search: false,
            length_penalty: 1.0,
            early_stopping: false,
            user: None,
            logit_bias: None,
        }
    }
}

impl GenerationParams {
    /// Check every parameter against its documented range.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(invalid("max_tokens must be at least 1"));
        }
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        check_range("top_p", self.top_p, 0.0, 1.0)?;
        if self.top_k == Some(0) {
            return Err(invalid("top_k must be at least 1"));
        }
        check_range("frequency_penalty", self.frequency_penalty, -2.0, 2.0)?;
        check_range("presence_penalty", self.presence_penalty, -2.0, 2.0)?;
        check_range("repetition_penalty", self.repetition_penalty, 0.0, 2.0)?;
        if !(1..=10).contains(&self.n) {
            return Err(invalid(format!("n must be within 1..=10, got {}", self.n)));
        }
        if self.best_of == Some(0) {
            return Err(invalid("best_of must be at least 1"));
        }
        if !self.length_penalty.is_finite() {
            return Err(invalid("length_penalty must be finite"));
        }
        Ok(())
    }
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    // NaN fails both comparisons and is rejected here.
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be within [{min}, {max}], got {value}")))
    }
}

fn invalid(reason: impl Into<String>) -> InferenceError {
    InferenceError::InvalidRequest {
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A `POST /v1/chat/completions` request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub params: GenerationParams,
    pub stream: bool,
}

impl ChatCompletionRequest {
    /// Create a request with default generation parameters.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            params: GenerationParams::default(),
            stream: false,
        }
    }

    /// Replace the generation parameters.
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Set the stream flag.
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Validate the request before it is put on the wire.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(invalid("model must not be empty"));
        }
        if self.messages.is_empty() {
            return Err(invalid("messages must not be empty"));
        }
        self.params.validate()
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Token accounting returned by the server.  Passed through, never computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Whether `total == prompt + completion`.
    pub fn is_consistent(&self) -> bool {
        self.prompt_tokens.checked_add(self.completion_tokens) == Some(self.total_tokens)
    }
}

/// Incremental message content carried by a streaming record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One candidate in a completion or streaming record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Value>,
}

/// A chat completion: either the full non-streaming response or a single
/// streaming delta record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    #[serde(default)]
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub system_fingerprint: Option<String>,
}

impl ChatCompletionResponse {
    /// Decode and validate a non-streaming completion body.
    pub fn from_completion_json(body: &str) -> Result<Self> {
        let resp: Self = serde_json::from_str(body).map_err(|e| InferenceError::Parse {
            reason: format!("invalid completion body: {e}"),
        })?;
        resp.validate_completion()?;
        Ok(resp)
    }

    /// Decode and validate a streaming record from an already parsed value.
    pub fn from_chunk_value(value: Value) -> Result<Self> {
        let chunk: Self =
            serde_json::from_value(value).map_err(|e| InferenceError::StreamProtocol {
                reason: format!("invalid stream record: {e}"),
            })?;
        chunk
            .validate_chunk()
            .map_err(|e| InferenceError::StreamProtocol {
                reason: e.to_string(),
            })?;
        Ok(chunk)
    }

    /// Invariants of a non-streaming completion.
    pub fn validate_completion(&self) -> Result<()> {
        if self.object != OBJECT_COMPLETION {
            return Err(parse_error(format!(
                "unexpected object `{}`, expected `{OBJECT_COMPLETION}`",
                self.object
            )));
        }
        if self.choices.is_empty() {
            return Err(parse_error("completion has no choices"));
        }
        self.validate_usage()
    }

    /// Invariants of a streaming record.
    pub fn validate_chunk(&self) -> Result<()> {
        if self.object != OBJECT_CHUNK {
            return Err(parse_error(format!(
                "unexpected object `{}`, expected `{OBJECT_CHUNK}`",
                self.object
            )));
        }
        self.validate_usage()
    }

    fn validate_usage(&self) -> Result<()> {
        match self.usage {
            Some(usage) if !usage.is_consistent() => Err(parse_error(format!(
                "usage total {} != prompt {} + completion {}",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            ))),
            _ => Ok(()),
        }
    }

    /// Text of the first choice: `message.content` for completions,
    /// `delta.content` for streaming records.
    pub fn first_text(&self) -> Option<&str> {
        let choice = self.choices.first()?;
        if let Some(msg) = &choice.message {
            return Some(msg.content.as_str());
        }
        choice.delta.as_ref()?.content.as_deref()
    }
}

fn parse_error(reason: impl Into<String>) -> InferenceError {
    InferenceError::Parse {
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Models and health
// ---------------------------------------------------------------------------

/// A model served by the endpoint (`GET /v1/models`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default = "default_model_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub owned_by: String,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

fn default_model_object() -> String {
    "model".into()
}

/// The `/v1/models` listing envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// Result of a `/health` check.
///
/// vLLM answers with an empty `200`; richer servers send a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub engine_ready: Option<bool>,
    #[serde(default)]
    pub version: Option<String>,
}

impl HealthStatus {
    /// Status reported for an empty success body.
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
            model: None,
            engine_ready: None,
            version: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Generation result
// ---------------------------------------------------------------------------

/// Result of a single-prompt generation, flattened from the first choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion_body(usage: &str) -> String {
        format!(
            r#"{{"id":"cmpl-1","object":"chat.completion","created":1,"model":"qwen",
               "choices":[{{"index":0,"message":{{"role":"assistant","content":"hi"}},"finish_reason":"stop"}}],
               "usage":{usage}}}"#
        )
    }

    #[test]
    fn request_serializes_flattened_params() {
        let req = ChatCompletionRequest::new("qwen", vec![ChatMessage::user("hello")]);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["model"], "qwen");
        assert_eq!(v["messages"][0]["role"], "user");
        assert_eq!(v["max_tokens"], 1024);
        assert_eq!(v["top_k"], 50);
        assert_eq!(v["stream"], false);
        assert!(v.get("stop").is_none());
        assert!(v.get("params").is_none());
    }

    #[test]
    fn stop_sequences_accept_string_or_list() {
        let one: StopSequences = serde_json::from_str(r#""END""#).unwrap();
        assert_eq!(one, StopSequences::One("END".into()));
        let many: StopSequences = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(many, StopSequences::Many(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn empty_messages_rejected() {
        let req = ChatCompletionRequest::new("qwen", Vec::new());
        assert!(matches!(
            req.validate(),
            Err(InferenceError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn out_of_range_params_rejected() {
        let base = ChatCompletionRequest::new("qwen", vec![ChatMessage::user("x")]);
        assert!(base.validate().is_ok());

        let mut params = GenerationParams::default();
        params.temperature = -0.1;
        assert!(base.clone().with_params(params).validate().is_err());

        let mut params = GenerationParams::default();
        params.top_p = 1.5;
        assert!(base.clone().with_params(params).validate().is_err());

        let mut params = GenerationParams::default();
        params.temperature = f32::NAN;
        assert!(base.clone().with_params(params).validate().is_err());

        let mut params = GenerationParams::default();
        params.n = 11;
        assert!(base.with_params(params).validate().is_err());
    }

    #[test]
    fn completion_usage_passes_through() {
        let body =
            completion_body(r#"{"prompt_tokens":12,"completion_tokens":30,"total_tokens":42}"#);
        let resp = ChatCompletionResponse::from_completion_json(&body).unwrap();
        let usage = resp.usage.unwrap();
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
        assert_eq!(resp.first_text(), Some("hi"));
    }

    #[test]
    fn inconsistent_usage_rejected() {
        let body =
            completion_body(r#"{"prompt_tokens":12,"completion_tokens":30,"total_tokens":40}"#);
        assert!(matches!(
            ChatCompletionResponse::from_completion_json(&body),
            Err(InferenceError::Parse { .. })
        ));
    }

    #[test]
    fn empty_choices_rejected() {
        let body = r#"{"id":"c","object":"chat.completion","model":"m","choices":[]}"#;
        assert!(ChatCompletionResponse::from_completion_json(body).is_err());
    }

    #[test]
    fn missing_required_fields_rejected() {
        let body = r#"{"object":"chat.completion","choices":[]}"#;
        assert!(ChatCompletionResponse::from_completion_json(body).is_err());
    }

    #[test]
    fn chunk_with_wrong_object_is_protocol_error() {
        let v = serde_json::json!({
            "id": "c", "object": "chat.completion", "model": "m",
            "choices": [{"index": 0, "delta": {"content": "x"}}]
        });
        assert!(matches!(
            ChatCompletionResponse::from_chunk_value(v),
            Err(InferenceError::StreamProtocol { .. })
        ));
    }

    #[test]
    fn chunk_delta_text_extracted() {
        let v = serde_json::json!({
            "id": "c", "object": "chat.completion.chunk", "model": "m",
            "choices": [{"index": 0, "delta": {"content": "Hel"}, "finish_reason": null}]
        });
        let chunk = ChatCompletionResponse::from_chunk_value(v).unwrap();
        assert_eq!(chunk.first_text(), Some("Hel"));
    }

    #[test]
    fn null_message_content_decodes_empty() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"role":"assistant","content":null}"#).unwrap();
        assert!(msg.content.is_empty());
    }
}
