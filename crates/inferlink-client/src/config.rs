//! Configuration loading.
//!
//! Settings come from three layers, later layers winning:
//!
//! 1. Built-in defaults.
//! 2. An optional TOML file with `[server]`, `[client]`, `[pool]`, `[retry]`
//!    and `[generation]` tables.
//! 3. `VLLM_*` environment variables.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, Result};
use crate::retry::RetryPolicy;
use crate::types::GenerationParams;

/// Default endpoint of a locally running vLLM server.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8001";

/// Default model served by the endpoint.
pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-7B-Instruct";

// ---------------------------------------------------------------------------
// Server description
// ---------------------------------------------------------------------------

/// Description of the inference server deployment.
///
/// Most fields are informational on the client side; `host`, `port`,
/// `api_key` and the model names decide where and how requests are sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub model_name: String,
    pub model_path: Option<String>,
    pub host: String,
    pub port: u16,
    pub tensor_parallel_size: u32,
    pub pipeline_parallel_size: u32,
    pub max_model_len: u32,
    pub max_num_seqs: u32,
    /// Fraction of GPU memory the engine may claim, within `(0, 1]`.
    pub gpu_memory_utilization: f64,
    pub enable_prefix_caching: bool,
    /// Swap space in GiB.
    pub swap_space: u32,
    pub cpu_offload_gb: u32,
    pub disable_log_stats: bool,
    pub trust_remote_code: bool,
    pub api_key: Option<String>,
    pub served_model_name: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL.into(),
            model_path: None,
            host: "0.0.0.0".into(),
            port: 8001,
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
            max_model_len: 4096,
            max_num_seqs: 256,
            gpu_memory_utilization: 0.8,
            enable_prefix_caching: true,
            swap_space: 4,
            cpu_offload_gb: 0,
            disable_log_stats: false,
            trust_remote_code: true,
            api_key: None,
            served_model_name: None,
        }
    }
}

impl ServerConfig {
    /// URL a client on the same machine uses to reach this server.
    pub fn connect_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" | "" => "localhost",
            other => other,
        };
        format!("http://{host}:{}", self.port)
    }

    /// The model name requests should carry.
    pub fn request_model(&self) -> &str {
        self.served_model_name
            .as_deref()
            .unwrap_or(self.model_name.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.gpu_memory_utilization > 0.0 && self.gpu_memory_utilization <= 1.0) {
            return Err(config_error(format!(
                "gpu_memory_utilization must be within (0, 1], got {}",
                self.gpu_memory_utilization
            )));
        }
        if self.tensor_parallel_size == 0 || self.pipeline_parallel_size == 0 {
            return Err(config_error("parallel sizes must be at least 1"));
        }
        if self.max_model_len == 0 || self.max_num_seqs == 0 {
            return Err(config_error("max_model_len and max_num_seqs must be at least 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client, pool
// ---------------------------------------------------------------------------

/// Settings shared by every pooled client handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Overall bound on a single request.
    #[serde(with = "serde_secs")]
    pub timeout: Duration,
    /// Bound on the wait for each streamed chunk.
    #[serde(with = "serde_secs")]
    pub chunk_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: None,
            timeout: Duration::from_secs(300),
            chunk_timeout: Duration::from_secs(30),
            user_agent: concat!("inferlink/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Base URL without a trailing slash.
    pub fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of client handles created at initialization.
    pub size: usize,
    /// How long [`crate::pool::ClientPool::acquire`] waits for a free handle.
    #[serde(with = "serde_secs")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregate settings
// ---------------------------------------------------------------------------

/// Everything needed to build an [`crate::service::InferenceService`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub generation: GenerationParams,
}

impl Settings {
    /// Parse settings from TOML text.  Missing tables keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| config_error(format!("invalid TOML: {e}")))
    }

    /// Read settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            config_error(format!("failed to read {}: {e}", path.display()))
        })?;
        let settings = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "settings file loaded");
        Ok(settings)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.  Empty values count as
    /// unset.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let s = &mut self.server;
        if let Some(v) = get("VLLM_MODEL_NAME") {
            s.model_name = v;
        }
        if let Some(v) = get("VLLM_MODEL_PATH") {
            s.model_path = Some(v);
        }
        let host = get("VLLM_HOST");
        let port = get("VLLM_PORT");
        if let Some(v) = &host {
            s.host = v.clone();
        }
        if let Some(v) = &port {
            s.port = parse_env("VLLM_PORT", v)?;
        }
        if let Some(v) = get("VLLM_TENSOR_PARALLEL_SIZE") {
            s.tensor_parallel_size = parse_env("VLLM_TENSOR_PARALLEL_SIZE", &v)?;
        }
        if let Some(v) = get("VLLM_PIPELINE_PARALLEL_SIZE") {
            s.pipeline_parallel_size = parse_env("VLLM_PIPELINE_PARALLEL_SIZE", &v)?;
        }
        if let Some(v) = get("VLLM_MAX_MODEL_LEN") {
            s.max_model_len = parse_env("VLLM_MAX_MODEL_LEN", &v)?;
        }
        if let Some(v) = get("VLLM_MAX_NUM_SEQS") {
            s.max_num_seqs = parse_env("VLLM_MAX_NUM_SEQS", &v)?;
        }
        if let Some(v) = get("VLLM_GPU_MEMORY_UTILIZATION") {
            s.gpu_memory_utilization = parse_env("VLLM_GPU_MEMORY_UTILIZATION", &v)?;
        }
        if let Some(v) = get("VLLM_ENABLE_PREFIX_CACHING") {
            s.enable_prefix_caching = v.trim().eq_ignore_ascii_case("true");
        }
        if let Some(v) = get("VLLM_SERVED_MODEL_NAME") {
            s.served_model_name = Some(v);
        }
        if let Some(v) = get("VLLM_API_KEY") {
            s.api_key = Some(v.clone());
            self.client.api_key = Some(v);
        }

        // An explicit base URL wins over host/port.
        if let Some(v) = get("VLLM_BASE_URL") {
            self.client.base_url = v;
        } else if host.is_some() || port.is_some() {
            self.client.base_url = self.server.connect_url();
        }
        if let Some(v) = get("VLLM_TIMEOUT_SECS") {
            self.client.timeout = parse_secs("VLLM_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("VLLM_CHUNK_TIMEOUT_SECS") {
            self.client.chunk_timeout = parse_secs("VLLM_CHUNK_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("VLLM_POOL_SIZE") {
            self.pool.size = parse_env("VLLM_POOL_SIZE", &v)?;
        }
        if let Some(v) = get("VLLM_ACQUIRE_TIMEOUT_SECS") {
            self.pool.acquire_timeout = parse_secs("VLLM_ACQUIRE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("VLLM_MAX_RETRIES") {
            self.retry.max_retries = parse_env("VLLM_MAX_RETRIES", &v)?;
        }
        Ok(())
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.retry.validate()?;
        self.generation.validate()?;
        if self.pool.size == 0 {
            return Err(config_error("pool size must be at least 1"));
        }
        if self.client.base_url.trim().is_empty() {
            return Err(config_error("base_url must not be empty"));
        }
        for (name, value) in [
            ("client.timeout", self.client.timeout),
            ("client.chunk_timeout", self.client.chunk_timeout),
            ("pool.acquire_timeout", self.pool.acquire_timeout),
        ] {
            if value.is_zero() {
                return Err(config_error(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| config_error(format!("{key}={value:?} is invalid: {e}")))
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    let secs: f64 = parse_env(key, value)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| config_error(format!("{key}={value:?} is not a valid number of seconds: {e}")))
}

fn config_error(reason: impl Into<String>) -> InferenceError {
    InferenceError::Config {
        reason: reason.into(),
    }
}

/// Serialize a [`Duration`] as fractional seconds.
pub(crate) mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
