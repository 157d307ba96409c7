//! CLI entry point for inferlink.
//!
//! This binary provides the `inferlink` command for chatting with an
//! OpenAI-compatible inference server, generating travel plans from the
//! built-in prompt templates, and inspecting the endpoint.

mod helpers;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use inferlink_client::{
    ChatCompletionRequest, ChatMessage, InferenceService, PromptLibrary, TravelPlan,
};
use tracing::info;

use crate::helpers::{Overrides, init_tracing, load_library, load_settings, print_stream, sampling};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Resilient client for OpenAI-compatible inference servers.
#[derive(Parser)]
#[command(name = "inferlink", version, about)]
struct Cli {
    /// Settings file (defaults to ./inferlink.toml when present).
    #[arg(long, global = true, env = "INFERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Server base URL, overriding the settings file and VLLM_BASE_URL.
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// API key sent as a bearer token.
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Extra directory of JSON prompt templates.
    #[arg(long, global = true, env = "INFERLINK_TEMPLATES_DIR")]
    templates_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one chat message and print the reply.
    Chat {
        prompt: String,

        /// System message to prepend.
        #[arg(long)]
        system: Option<String>,

        /// Model name, overriding the configured one.
        #[arg(long)]
        model: Option<String>,

        /// Print the reply as it is generated.
        #[arg(long)]
        stream: bool,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        temperature: Option<f32>,
    },

    /// Ask the model for a travel plan.
    Plan {
        #[arg(long)]
        destination: String,

        /// Trip length, e.g. "3 days".
        #[arg(long)]
        duration: String,

        #[arg(long)]
        budget: Option<String>,

        #[arg(long)]
        travelers: Option<String>,

        #[arg(long)]
        interests: Option<String>,

        #[arg(long)]
        special_requirements: Option<String>,

        #[arg(long)]
        stream: bool,
    },

    /// List the models served by the endpoint.
    Models,

    /// Check the endpoint's health.
    Health,

    /// Inspect and export prompt templates.
    Templates {
        #[command(subcommand)]
        action: TemplateAction,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// List template names.
    List,

    /// Print one template.
    Show { name: String },

    /// Write every template to DIR as JSON.
    Export { dir: PathBuf },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing("info");

    let library = load_library(cli.templates_dir.as_deref())?;
    if let Commands::Templates { action } = &cli.command {
        return cmd_templates(&library, action);
    }

    let settings = load_settings(&Overrides {
        config: cli.config,
        base_url: cli.base_url,
        api_key: cli.api_key,
    })?;
    let service = InferenceService::from_settings(&settings)
        .context("failed to build inference service")?;

    let result = match cli.command {
        Commands::Chat {
            prompt,
            system,
            model,
            stream,
            max_tokens,
            temperature,
        } => {
            let mut messages = Vec::with_capacity(2);
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt));
            let params = sampling(service.defaults(), max_tokens, temperature);
            let mut request = service.request(messages, Some(params));
            if let Some(model) = model {
                request.model = model;
            }
            cmd_chat(&service, request, stream).await
        }
        Commands::Plan {
            destination,
            duration,
            budget,
            travelers,
            interests,
            special_requirements,
            stream,
        } => {
            let mut plan = TravelPlan::new(destination, duration);
            if let Some(v) = budget {
                plan.budget = v;
            }
            if let Some(v) = travelers {
                plan.travelers = v;
            }
            if let Some(v) = interests {
                plan.interests = v;
            }
            if let Some(v) = special_requirements {
                plan.special_requirements = v;
            }
            cmd_plan(&service, &library, &plan, stream).await
        }
        Commands::Models => cmd_models(&service).await,
        Commands::Health => cmd_health(&service).await,
        Commands::Templates { .. } => Ok(()),
    };

    service.shutdown();
    result
}

// ---------------------------------------------------------------------------
// Subcommand: chat / plan
// ---------------------------------------------------------------------------

async fn cmd_chat(
    service: &InferenceService,
    request: ChatCompletionRequest,
    stream: bool,
) -> Result<()> {
    info!(model = %request.model, stream, "sending chat request");

    if stream {
        let chunks = service
            .send_stream(request)
            .await
            .context("failed to open completion stream")?;
        return print_stream(chunks).await;
    }

    let response = service.send(request).await.context("chat completion failed")?;
    let text = response
        .first_text()
        .context("completion carried no text")?;
    println!("{text}");
    if let Some(usage) = response.usage {
        info!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            "completion usage"
        );
    }
    Ok(())
}

async fn cmd_plan(
    service: &InferenceService,
    library: &PromptLibrary,
    plan: &TravelPlan,
    stream: bool,
) -> Result<()> {
    let prompt = library
        .travel_planning_prompt(plan)
        .context("failed to render travel_planning template")?;

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = library.get("travel_system") {
        messages.push(ChatMessage::system(system.template.clone()));
    }
    messages.push(ChatMessage::user(prompt));

    let request = service.request(messages, None);
    cmd_chat(service, request, stream).await
}

// ---------------------------------------------------------------------------
// Subcommand: models / health
// ---------------------------------------------------------------------------

async fn cmd_models(service: &InferenceService) -> Result<()> {
    let models = service.list_models().await.context("failed to list models")?;
    if models.is_empty() {
        println!("  (no models served)");
        return Ok(());
    }
    for model in models {
        if model.owned_by.is_empty() {
            println!("  {}", model.id);
        } else {
            println!("  {:<40} {}", model.id, model.owned_by);
        }
    }
    Ok(())
}

async fn cmd_health(service: &InferenceService) -> Result<()> {
    let base_url = service.pool().client_config().trimmed_base_url().to_owned();
    match service.health_check().await {
        Ok(health) => {
            println!("  {base_url}: {}", health.status);
            if let Some(model) = health.model {
                println!("  model:   {model}");
            }
            if let Some(version) = health.version {
                println!("  version: {version}");
            }
            Ok(())
        }
        Err(e) => bail!("{base_url} is unhealthy: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: templates
// ---------------------------------------------------------------------------

fn cmd_templates(library: &PromptLibrary, action: &TemplateAction) -> Result<()> {
    match action {
        TemplateAction::List => {
            for name in library.names() {
                let description = library
                    .get(name)
                    .and_then(|t| t.description.as_deref())
                    .unwrap_or("");
                println!("  {name:<28} {description}");
            }
        }
        TemplateAction::Show { name } => {
            let template = library
                .get(name)
                .with_context(|| format!("no template named {name:?}"))?;
            if let Some(vars) = &template.variables {
                println!("# variables: {}", vars.join(", "));
            }
            println!("{}", template.template);
        }
        TemplateAction::Export { dir } => {
            let count = library
                .export_all(dir)
                .with_context(|| format!("failed to export templates to {}", dir.display()))?;
            println!("  exported {count} templates to {}", dir.display());
        }
    }
    Ok(())
}
