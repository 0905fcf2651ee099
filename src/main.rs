use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use whisper_dispatch::config::{ConfigOverrides, ServiceConfig};

/// Whisper Dispatch: asynchronous transcription dispatch with scale-to-zero
#[derive(Parser)]
#[command(name = "whisper-dispatch", version, about)]
struct Cli {
    /// Path to configuration file (.hcl)
    #[arg(short, long, default_value = "whisper.hcl", env = "WHISPER_CONFIG")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the store bucket
    #[arg(long, env = "WHISPER_BUCKET")]
    bucket: Option<String>,

    /// Override the queue name
    #[arg(long, env = "WHISPER_QUEUE")]
    queue: Option<String>,

    /// Override the queue URL
    #[arg(long, env = "WHISPER_QUEUE_URL")]
    queue_url: Option<String>,

    /// Override the inference endpoint name
    #[arg(long, env = "WHISPER_ENDPOINT")]
    endpoint: Option<String>,

    /// Override the endpoint variant name
    #[arg(long, env = "WHISPER_VARIANT")]
    variant: Option<String>,

    /// Override the region
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Account id added to the registry ids for credential exchange
    #[arg(long, env = "AWS_ACCOUNT_ID")]
    account_id: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the job queue and run the scaling controller (default)
    Run {
        /// Periodically write Prometheus text metrics to this file
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },
    /// Create the queue and wire the bucket's notifications to it
    Bootstrap,
    /// Validate the configuration without starting anything
    Validate,
    /// Print the effective scaling policy as JSON
    Policy,
    /// Print fresh container registry credentials as JSON
    Credentials,
    /// Show what handling a saved queue message body would do
    DispatchFile {
        /// File containing one queue message body
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> whisper_dispatch::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for command output
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }

    let config = load_config(&cli).await?;

    match cli.command.unwrap_or(Commands::Run { metrics_file: None }) {
        Commands::Validate => validate_config(&cli.config, &config),
        Commands::Policy => {
            println!("{}", serde_json::to_string_pretty(&config.scaling)?);
            Ok(())
        }
        Commands::DispatchFile { file } => dispatch_file(&config, &file).await,
        Commands::Run { metrics_file } => run(config, metrics_file).await,
        Commands::Bootstrap => bootstrap(config).await,
        Commands::Credentials => credentials(config).await,
    }
}

/// Load the configuration file (defaults when absent) and apply overrides
async fn load_config(cli: &Cli) -> whisper_dispatch::Result<ServiceConfig> {
    let mut config = if Path::new(&cli.config).exists() {
        tracing::debug!(config = cli.config, "Loading configuration");
        ServiceConfig::from_file(&cli.config).await?
    } else {
        tracing::debug!(config = cli.config, "Config file not found, using defaults");
        ServiceConfig::default()
    };

    config.apply_overrides(ConfigOverrides {
        bucket: cli.bucket.clone(),
        queue: cli.queue.clone(),
        queue_url: cli.queue_url.clone(),
        endpoint: cli.endpoint.clone(),
        variant: cli.variant.clone(),
        region: cli.region.clone(),
        account_id: cli.account_id.clone(),
    });
    Ok(config)
}

/// Validate the effective configuration and print a summary
fn validate_config(path: &str, config: &ServiceConfig) -> whisper_dispatch::Result<()> {
    if let Err(e) = config.validate() {
        eprintln!("✗ Validation error: {}", e);
        std::process::exit(1);
    }

    println!("✓ Configuration is valid ({})", path);
    println!();
    println!("  Bucket:    {}", config.store.bucket);
    println!(
        "  Queue:     {}",
        config.queue.url.as_deref().unwrap_or(&config.queue.name)
    );
    println!(
        "  Endpoint:  {} (variant {})",
        config.endpoint.name, config.endpoint.variant
    );
    println!(
        "  Prefixes:  {}",
        config.dispatch.prefixes().join(", ")
    );
    println!(
        "  Scaling:   {} [{}..={}] target {} scale-in cooldown {}s",
        if config.scaling.enabled { "on" } else { "off" },
        config.scaling.min_capacity,
        config.scaling.max_capacity,
        config.scaling.target_value,
        config.scaling.scale_in_cooldown_secs
    );
    println!("  Registry:  {}", config.registry_ids().join(", "));
    println!("  Sink:      {:?}", config.sink.kind);

    Ok(())
}

/// Classify a saved message body offline
async fn dispatch_file(config: &ServiceConfig, file: &Path) -> whisper_dispatch::Result<()> {
    let body = tokio::fs::read_to_string(file).await?;
    let actions = whisper_dispatch::dispatch::plan(
        &body,
        &config.endpoint,
        &config.dispatch,
        &config.store.location_scheme,
    )?;
    println!("{}", serde_json::to_string_pretty(&actions)?);
    Ok(())
}

#[cfg(feature = "aws")]
async fn run(config: ServiceConfig, metrics_file: Option<PathBuf>) -> whisper_dispatch::Result<()> {
    tracing::info!("Whisper Dispatch v{}", env!("CARGO_PKG_VERSION"));

    let backends = whisper_dispatch::Backends::aws(&config).await?;
    let mut service = whisper_dispatch::DispatchService::new(config, backends)?;
    if let Some(path) = metrics_file {
        service = service.with_metrics_file(path);
    }
    service.start().await?;

    tracing::info!("Dispatch ready, press Ctrl+C to stop");
    service.wait_for_shutdown().await;
    Ok(())
}

#[cfg(feature = "aws")]
async fn bootstrap(config: ServiceConfig) -> whisper_dispatch::Result<()> {
    use std::sync::Arc;
    use whisper_dispatch::backend::aws::{load_sdk_config, S3SqsProvisioner};
    use whisper_dispatch::bootstrap::{Bootstrap, Topology};

    let sdk = load_sdk_config(&config.aws).await;
    let bootstrap = Bootstrap::new(Arc::new(S3SqsProvisioner::new(&sdk)));
    let report = bootstrap.apply(&Topology::from_config(&config)).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(feature = "aws")]
async fn credentials(config: ServiceConfig) -> whisper_dispatch::Result<()> {
    use std::sync::Arc;
    use whisper_dispatch::backend::aws::{load_sdk_config, EcrRegistryAuth};
    use whisper_dispatch::registry::CredentialBroker;

    let sdk = load_sdk_config(&config.aws).await;
    let broker = CredentialBroker::new(
        Arc::new(EcrRegistryAuth::new(&sdk)),
        config.registry_ids(),
        config.registry.username.clone(),
    );
    println!("{}", serde_json::to_string(&broker.exchange().await?)?);
    Ok(())
}

#[cfg(not(feature = "aws"))]
async fn run(_config: ServiceConfig, _metrics_file: Option<PathBuf>) -> whisper_dispatch::Result<()> {
    Err(requires_aws("run"))
}

#[cfg(not(feature = "aws"))]
async fn bootstrap(_config: ServiceConfig) -> whisper_dispatch::Result<()> {
    Err(requires_aws("bootstrap"))
}

#[cfg(not(feature = "aws"))]
async fn credentials(_config: ServiceConfig) -> whisper_dispatch::Result<()> {
    Err(requires_aws("credentials"))
}

#[cfg(not(feature = "aws"))]
fn requires_aws(command: &str) -> whisper_dispatch::DispatchError {
    whisper_dispatch::DispatchError::Config(format!(
        "'{}' needs cloud backends; rebuild with `--features aws`",
        command
    ))
}
