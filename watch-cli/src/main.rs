//! Thin binary wiring [`watch_runtime::controller::Controller`] to the demo
//! collectors and sinks in this crate: config loading, CLI parsing,
//! pipeline wiring, and process-level shutdown all live in this one file.

mod collectors;
mod sinks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use watch_runtime::config::Config;
use watch_runtime::controller::Controller;
use watch_runtime::model::DeliveryEvent;
use watch_runtime::pipeline::retry::RetryPolicy;
use watch_runtime::pipeline::router::EventRouter;
use watch_runtime::pipeline::stage::{FnProcessor, StageConfig};
use watch_runtime::pipeline::{DeliveryPipeline, PipelineConfig, StageSpec};
use watch_runtime::sink::Sink;

#[derive(Debug, Parser)]
#[command(name = "watch-cli", about = "Runs the infrastructure-state watch pipeline")]
struct Args {
    /// Path to a YAML config file. Falls back to defaults with all four
    /// demo providers enabled.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Delivery sink to run events through.
    #[arg(long, value_enum, default_value_t = SinkChoice::Terminal)]
    sink: SinkChoice,

    /// Target URL for `--sink webhook`.
    #[arg(long)]
    webhook_url: Option<String>,

    /// Stop automatically after this many seconds; runs until Ctrl-C if unset.
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkChoice {
    Terminal,
    Json,
    Webhook,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read config file {path}: {source}")]
    ReadConfig { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseConfig { path: PathBuf, source: serde_yaml::Error },
    #[error("--webhook-url is required when --sink webhook is selected")]
    MissingWebhookUrl,
    #[error("invalid --webhook-url: {0}")]
    InvalidWebhookUrl(#[from] http::uri::InvalidUri),
    #[error(transparent)]
    Config(#[from] watch_runtime::error::ConfigError),
    #[error(transparent)]
    Controller(#[from] watch_runtime::error::ControllerError),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if config.providers.is_empty() {
        config.providers = vec!["terraform".into(), "aws".into(), "gcp".into(), "kubernetes".into()];
    }

    let controller = Controller::new(config.clone())?;
    register_collectors(&controller, &config).await?;

    let events = controller.events().await.expect("events stream is taken exactly once, here");
    controller.start().await?;
    info!(providers = ?controller.active_providers().await, "watch pipeline started");

    let sink: Arc<dyn Sink> = build_sink(args.sink, args.webhook_url.as_deref())?;
    let pipeline = build_pipeline(sink);
    let mut pipeline_errors = pipeline.errors();
    tokio::spawn(async move {
        while let Ok(err) = pipeline_errors.recv().await {
            warn!(stage = %err.stage, event_id = %err.event_id, reason = %err.reason, "event permanently failed");
        }
    });

    let forward = tokio::spawn(forward_events(events, pipeline));

    match args.duration_secs {
        Some(secs) => {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!(secs, "configured duration elapsed, shutting down");
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
            info!("ctrl-c received, shutting down");
        }
    }

    controller.stop().await?;
    forward.abort();
    Ok(())
}

async fn forward_events(mut events: ReceiverStream<watch_runtime::model::WatchEvent>, pipeline: DeliveryPipeline) {
    while let Some(event) = events.next().await {
        let outcome = pipeline.submit(DeliveryEvent::new(event));
        if !matches!(outcome, watch_runtime::pipeline::SubmitOutcome::Accepted) {
            warn!(?outcome, "event not accepted into delivery pipeline");
        }
    }
    pipeline.stop().await;
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config, CliError> {
    let Some(path) = path else { return Ok(Config::default()) };
    let text = std::fs::read_to_string(path).map_err(|source| CliError::ReadConfig { path: path.to_path_buf(), source })?;
    let config: Config =
        serde_yaml::from_str(&text).map_err(|source| CliError::ParseConfig { path: path.to_path_buf(), source })?;
    config.validate()?;
    Ok(config)
}

async fn register_collectors(controller: &Controller, config: &Config) -> Result<(), CliError> {
    for provider in &config.providers {
        let collector: Arc<dyn watch_runtime::collector::Collector> = match provider.as_str() {
            "terraform" => Arc::new(collectors::TerraformCollector::default()),
            "aws" => Arc::new(collectors::AwsCollector::default()),
            "gcp" => Arc::new(collectors::GcpCollector::default()),
            "kubernetes" => Arc::new(collectors::KubernetesCollector::default()),
            other => {
                error!(provider = other, "no demo collector registered for this provider, skipping");
                continue;
            }
        };
        controller.add_provider(provider.clone(), collector).await?;
    }
    Ok(())
}

fn build_sink(choice: SinkChoice, webhook_url: Option<&str>) -> Result<Arc<dyn Sink>, CliError> {
    Ok(match choice {
        SinkChoice::Terminal => Arc::new(sinks::TerminalSink),
        SinkChoice::Json => Arc::new(sinks::JsonSink::new(tokio::io::stdout())),
        SinkChoice::Webhook => {
            let url = webhook_url.ok_or(CliError::MissingWebhookUrl)?;
            Arc::new(sinks::WebhookSink::new(url.parse()?))
        }
    })
}

/// A single enrichment stage (stamps a `delivered-by` tag) feeding the
/// chosen sink. Real deployments would configure more stages via
/// `PipelineSettings`; this binary only needs one to exercise the pipeline.
fn build_pipeline(sink: Arc<dyn Sink>) -> DeliveryPipeline {
    let stage = StageConfig {
        id: "enrich".to_string(),
        name: "default".to_string(),
        concurrency: 4,
        buffer: 256,
        per_event_timeout: Duration::from_secs(5),
        retry_policy: RetryPolicy::default(),
        enabled: true,
    };
    let processor = FnProcessor(|mut event: DeliveryEvent| async move {
        event.tags.push("delivered-by=watch-cli".to_string());
        Ok(event)
    });
    let config = PipelineConfig {
        stages: vec![StageSpec { config: stage, processor: Arc::new(processor) }],
        backpressure: Default::default(),
        circuit: Default::default(),
        shutdown_grace: Duration::from_secs(5),
    };
    DeliveryPipeline::start(config, EventRouter::new("default"), sink)
}
