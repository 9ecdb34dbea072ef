use clap::{Args, Parser};
use config::{Config, ConfigError, SourceConfig, SourceType};
use file_source::FileDiscovery;
use metrics_exporter_statsd::StatsdBuilder;
use provider::{DiscoveryError, MetadataCache, Provider, TemplateFunctions, ValidationError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod file_source;

const METRICS_PREFIX: &str = "gantry";

#[derive(Parser)]
#[command(name = "gantry", about = "Routing configuration from instance labels")]
enum CliCommand {
    /// Refresh every source periodically and print each published configuration.
    Run(RunArgs),
    /// Run a single cycle per source and print the result.
    Render(RenderArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(Args)]
struct RenderArgs {
    #[arg(long, short)]
    config: PathBuf,
    /// Print the configuration as labels instead of JSON.
    #[arg(long)]
    labels: bool,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not build statsd recorder: {0}")]
    Metrics(#[from] metrics_exporter_statsd::StatsdError),
    #[error("could not install metrics recorder: {0}")]
    Recorder(String),
    #[error("source {source_name}: {error}")]
    Discovery {
        source_name: String,
        error: DiscoveryError,
    },
    #[error("could not encode labels: {0}")]
    Encode(#[from] labels::EncodeError),
    #[error("could not serialize configuration: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();
    let path = match &cli {
        CliCommand::Run(args) => &args.config,
        CliCommand::Render(args) => &args.config,
    };

    let config = match load_config(path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::FAILURE;
        }
    };

    let _sentry = init_logging(&config);

    match execute(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "Exiting");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &std::path::Path) -> Result<Config, ConfigError> {
    let config = Config::from_file(path)?;
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &Config) -> Option<sentry::ClientInitGuard> {
    let dsn = config
        .common
        .logging
        .as_ref()
        .and_then(|logging| logging.sentry_dsn.clone());

    let guard = dsn.map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(config: &Config) -> Result<(), CliError> {
    let Some(metrics) = &config.common.metrics else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(metrics.statsd_host.clone(), metrics.statsd_port)
        .build(Some(METRICS_PREFIX))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Recorder(e.to_string()))?;
    shared::metrics_defs::describe_all(provider::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "Metrics enabled"
    );
    Ok(())
}

fn execute(cli: CliCommand, config: Config) -> Result<(), CliError> {
    init_metrics(&config)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli {
        CliCommand::Run(_) => rt.block_on(run(config)),
        CliCommand::Render(args) => rt.block_on(render(config, args.labels)),
    }
}

fn build_provider(
    source: &SourceConfig,
    config: &Config,
    cache: &Arc<MetadataCache>,
) -> Result<Provider<FileDiscovery>, ValidationError> {
    let discovery = match &source.r#type {
        SourceType::File { path } => FileDiscovery::new(&source.name, path, source.port_policy),
    };

    Provider::new(
        discovery,
        &config.provider,
        TemplateFunctions::new(),
        Arc::clone(cache),
    )
}

async fn run(config: Config) -> Result<(), CliError> {
    let cache = Arc::new(config.provider.cache.build());
    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    for source in &config.sources {
        let provider = build_provider(source, &config, &cache)?;
        let (tx, rx) = provider::channel();

        tracing::info!(
            source = %source.name,
            interval = ?config.provider.refresh_interval(),
            "Starting discovery"
        );
        tasks.spawn(provider.run(tx, shutdown.clone()));
        tasks.spawn(publish(rx));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(error) = result {
            tracing::error!(%error, "Task failed");
        }
    }

    Ok(())
}

async fn publish(mut rx: mpsc::Receiver<provider::Message>) {
    while let Some(message) = rx.recv().await {
        let line = serde_json::json!({
            "source": message.source,
            "configuration": message.configuration,
        });
        println!("{line}");

        tracing::info!(
            source = %message.source,
            routers = message.configuration.http.routers.len()
                + message.configuration.tcp.routers.len()
                + message.configuration.udp.routers.len(),
            conflicts = message.conflicts.len(),
            "Published configuration"
        );
    }
}

async fn render(config: Config, as_labels: bool) -> Result<(), CliError> {
    let cache = Arc::new(config.provider.cache.build());
    let mut rendered = BTreeMap::new();

    for source in &config.sources {
        let provider = build_provider(source, &config, &cache)?;
        let message = provider
            .cycle()
            .await
            .map_err(|error| CliError::Discovery {
                source_name: source.name.clone(),
                error,
            })?;

        for conflict in &message.conflicts {
            eprintln!("{}: {conflict}", message.source);
        }
        rendered.insert(message.source, message.configuration);
    }

    if as_labels {
        for (source, configuration) in &rendered {
            println!("# {source}");
            for (key, value) in labels::encode(configuration, &config.provider.label_prefix)? {
                println!("{key}={value}");
            }
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&rendered)?);
    }

    Ok(())
}
