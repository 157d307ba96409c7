//! Shared helpers for the `inferlink` binary.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::StreamExt;
use inferlink_client::{ChunkStream, GenerationParams, PromptLibrary, Settings};
use tracing_subscriber::EnvFilter;

/// Settings file picked up from the working directory when `--config` is
/// not given.
pub const DEFAULT_CONFIG_FILE: &str = "inferlink.toml";

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Install the global subscriber.  `RUST_LOG` overrides `default_level`.
/// Logs go to stderr so completions on stdout stay clean.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Overrides taken from global command-line flags.
#[derive(Debug, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

/// Resolve settings: file (explicit or `inferlink.toml`), then `VLLM_*`
/// environment, then command-line flags.
pub fn load_settings(overrides: &Overrides) -> Result<Settings> {
    let mut settings = match &overrides.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            Settings::load(Path::new(DEFAULT_CONFIG_FILE))
                .with_context(|| format!("failed to load {DEFAULT_CONFIG_FILE}"))?
        }
        None => Settings::default(),
    };

    settings
        .apply_env()
        .context("invalid VLLM_* environment variable")?;

    if let Some(url) = overrides.base_url.as_deref().filter(|u| !u.is_empty()) {
        settings.client.base_url = url.to_owned();
    }
    if let Some(key) = overrides.api_key.as_deref().filter(|k| !k.is_empty()) {
        settings.client.api_key = Some(key.to_owned());
    }

    settings.validate().context("invalid settings")?;
    tracing::debug!(
        base_url = %settings.client.base_url,
        model = %settings.server.request_model(),
        pool_size = settings.pool.size,
        "settings resolved"
    );
    Ok(settings)
}

/// Built-in templates plus any found in `dir`.
pub fn load_library(dir: Option<&Path>) -> Result<PromptLibrary> {
    match dir {
        Some(dir) => PromptLibrary::with_dir(dir)
            .with_context(|| format!("failed to load templates from {}", dir.display())),
        None => Ok(PromptLibrary::new()),
    }
}

/// Apply per-command sampling overrides on top of the configured defaults.
pub fn sampling(
    defaults: &GenerationParams,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
) -> GenerationParams {
    let mut params = defaults.clone();
    if let Some(n) = max_tokens {
        params.max_tokens = n;
    }
    if let Some(t) = temperature {
        params.temperature = t;
    }
    params
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Print a completion stream to stdout as it arrives.
pub async fn print_stream(mut stream: ChunkStream) -> Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("completion stream failed")?;
        if let Some(text) = chunk.first_text() {
            write!(stdout, "{text}").context("failed to write to stdout")?;
            stdout.flush().context("failed to flush stdout")?;
        }
    }
    writeln!(stdout)?;

    let stats = stream.stats();
    tracing::info!(
        records = stats.records,
        malformed = stats.malformed_lines,
        tokens_per_second = ?stats.tokens_per_second(),
        "stream complete"
    );
    Ok(())
}
