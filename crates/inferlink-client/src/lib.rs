//! Resilient client for OpenAI-compatible inference servers.
//!
//! Talks to a vLLM (or any OpenAI-compatible) endpoint through a fixed pool
//! of HTTP clients, retries transient failures with backoff, and decodes
//! `text/event-stream` completions into typed records.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ InferenceService │── chat_completion / generate / *_stream
//! └───┬─────────┬────┘
//!     │         │
//! ┌───┴───┐ ┌───┴────────┐     ┌──────────────────┐
//! │ Retry │ │ ClientPool │────>│ InferenceClient  │── HTTP
//! └───────┘ └────────────┘     └────────┬─────────┘
//!                                       │ response body
//!                               ┌───────┴───────┐
//!                               │  ChunkStream  │
//!                               └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`service`] -- Request orchestration over the pool and retry policy.
//! - [`pool`] -- Fixed-size client pool with RAII leases.
//! - [`transport`] -- A single HTTP client handle and failure classification.
//! - [`retry`] -- Backoff strategies and the retry driver.
//! - [`streaming`] -- SSE line decoder and the typed chunk stream.
//! - [`observer`] -- Hooks for retries and stream progress.
//! - [`registry`] -- Registry of open streams, keyed by id.
//! - [`prompt`] -- Prompt templates for the travel-planning assistant.
//! - [`types`] -- Wire types for requests, responses and metadata.
//! - [`config`] -- Settings from TOML and `VLLM_*` environment variables.
//! - [`error`] -- Error types.

pub mod config;
pub mod error;
pub mod observer;
pub mod pool;
pub mod prompt;
pub mod registry;
pub mod retry;
pub mod service;
pub mod streaming;
pub mod transport;
pub mod types;

pub use config::{ClientConfig, PoolConfig, ServerConfig, Settings};
pub use error::{ErrorKind, InferenceError, Result};
pub use observer::InferenceObserver;
pub use pool::{ClientPool, PooledClient};
pub use prompt::{AttractionQuery, FoodQuery, PromptKind, PromptLibrary, PromptTemplate, TravelPlan};
pub use registry::{StreamEntry, StreamRegistry};
pub use retry::{Attempt, RetryPolicy, RetryStrategy};
pub use service::InferenceService;
pub use streaming::{
    ChunkStream, ContentBuffer, DecodeStep, DecoderState, LineSplitter, StreamDecoder, StreamStats,
    decode_lines,
};
pub use transport::InferenceClient;
pub use types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Delta, GenerationParams,
    GenerationResponse, HealthStatus, ModelInfo, Role, StopSequences, Usage,
};
