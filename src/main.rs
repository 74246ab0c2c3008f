//! Lacquer server binary.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lacquer::catalog::ModelCatalog;
use lacquer::config::ServerConfig;
use lacquer::engine::{ExecutionManager, WorkflowRunner};
use lacquer::error::LacquerError;
use lacquer::expression::TemplateEngine;
use lacquer::parser::{YamlParser, load_workflows};
use lacquer::providers::anthropic::{AnthropicConfig, AnthropicProvider};
use lacquer::providers::claude_code::{ClaudeCodeConfig, ClaudeCodeProvider};
use lacquer::providers::ProviderRegistry;
use lacquer::server::{AppState, serve};
use lacquer::telemetry::Metrics;
use lacquer::types::model::resolve_model_id;
use lacquer::types::workflow::Workflow;

#[derive(Debug, Parser)]
#[command(name = "lacquer", about = "Declarative LLM workflow execution server")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory scanned for *.laq.yaml workflow files.
    #[arg(long)]
    workflow_dir: Option<PathBuf>,

    /// Individual workflow files to load (repeatable).
    #[arg(short = 'f', long = "workflow-file")]
    workflow_files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(Cli::parse()).await {
        error!(error = %err, "startup failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), LacquerError> {
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if cli.workflow_dir.is_some() {
        config.workflow_dir = cli.workflow_dir;
    }
    config.workflow_files.extend(cli.workflow_files);

    let parser = YamlParser::new();
    let workflows = load_workflows(
        &parser,
        &config.workflow_files,
        config.workflow_dir.as_deref(),
    )?;
    info!(count = workflows.len(), "workflows loaded");

    let registry = Arc::new(build_registry(&config));
    if registry.is_empty() {
        return Err(LacquerError::Configuration(
            "no providers available".to_string(),
        ));
    }

    let catalog = ModelCatalog::new(config.cache_root()).with_disabled(config.disable_model_cache);
    check_agent_models(&workflows, &registry, &catalog).await;

    let metrics = Arc::new(Metrics::new()?);
    let manager = Arc::new(ExecutionManager::new(config.concurrency, metrics.clone()));
    let runner = Arc::new(WorkflowRunner::new(
        registry.clone(),
        Arc::new(TemplateEngine::new()),
    ));

    let state = AppState {
        workflows: Arc::new(workflows),
        manager,
        runner,
        metrics,
        enable_metrics: config.enable_metrics,
    };

    serve(&config, state).await?;

    registry.close_all().await;
    info!("shutdown complete");
    Ok(())
}

fn build_registry(config: &ServerConfig) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    let anthropic_settings = config.provider("anthropic");
    match AnthropicProvider::new(AnthropicConfig {
        api_key: anthropic_settings.api_key.clone(),
        base_url: anthropic_settings.base_url.clone(),
        timeout: anthropic_settings
            .timeout_duration()
            .or(Some(Duration::from_secs(120))),
    }) {
        Ok(provider) => registry.register(Arc::new(provider)),
        Err(err) => info!(error = %err, "anthropic provider not registered"),
    }

    let cli_settings = config.provider("claude_code");
    let mut cli_config = ClaudeCodeConfig::default();
    if let Some(command) = cli_settings.command {
        cli_config.command = command;
    }
    registry.register(Arc::new(ClaudeCodeProvider::new(cli_config)));

    registry
}

/// Best-effort warning for agents pointing at models their provider does not
/// advertise. Never fatal: catalogs are advisory and backends get the final
/// say.
async fn check_agent_models(
    workflows: &std::collections::HashMap<String, Arc<Workflow>>,
    registry: &ProviderRegistry,
    catalog: &ModelCatalog,
) {
    let mut referenced: HashSet<&str> = HashSet::new();
    for workflow in workflows.values() {
        for agent in workflow.agents.values() {
            referenced.insert(agent.provider.as_str());
        }
    }

    for provider_name in referenced {
        let Ok(provider) = registry.get(provider_name) else {
            warn!(provider = %provider_name, "workflow references unregistered provider");
            continue;
        };
        let models = match catalog.get(provider.as_ref()).await {
            Ok(models) => models,
            Err(err) => {
                warn!(provider = %provider_name, error = %err, "could not list models");
                continue;
            }
        };
        if models.is_empty() {
            continue;
        }
        for workflow in workflows.values() {
            for (name, agent) in &workflow.agents {
                if agent.provider != provider_name {
                    continue;
                }
                let resolved = resolve_model_id(&agent.model, &models);
                if resolved == agent.model && !models.iter().any(|m| m.id == agent.model) {
                    warn!(
                        workflow_id = %workflow.id,
                        agent = %name,
                        model = %agent.model,
                        provider = %provider_name,
                        "model not advertised by provider"
                    );
                }
            }
        }
    }
}
