use clap::Parser;
use std::path::PathBuf;
use std::process;

use proxy::config::parse_internal_config;
use proxy::registry::ConfigPaths;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Sidecar HTTP caching proxy.
#[derive(Parser)]
#[command(name = "casper", version)]
struct Cli {
    /// Directory with per-destination configs and casper.internal.yaml
    /// (defaults to $SRV_CONFIGS_PATH)
    #[arg(long)]
    srv_configs_path: Option<PathBuf>,

    /// SmartStack registry file (defaults to $SERVICES_YAML_PATH)
    #[arg(long)]
    services_yaml_path: Option<PathBuf>,

    /// Directory with envoy_client.yaml (defaults to $ENVOY_CONFIGS_PATH)
    #[arg(long)]
    envoy_configs_path: Option<PathBuf>,

    /// Zero-based id of this worker process
    #[arg(long, default_value_t = 0)]
    worker_id: usize,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Failed to load config: {0}")]
    Config(#[from] proxy::config::ConfigError),
    #[error("Failed to read {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to create runtime: {0}")]
    Runtime(std::io::Error),
    #[error("{0}")]
    Proxy(#[from] proxy::errors::ProxyError),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let args = Cli::parse();

    let mut paths = ConfigPaths::from_env();
    if let Some(path) = args.srv_configs_path {
        paths.srv_configs = path;
    }
    if let Some(path) = args.services_yaml_path {
        paths.services_yaml = path;
    }
    if let Some(path) = args.envoy_configs_path {
        paths.envoy_configs = path;
    }

    // The worker count decides the runtime shape, so the internal config is
    // read once synchronously before anything async exists
    let internal_path = paths.srv_configs.join("casper.internal.yaml");
    let data = std::fs::read(&internal_path).map_err(|source| CliError::ConfigRead {
        path: internal_path.clone(),
        source,
    })?;
    let internal = parse_internal_config(&data)?;

    let listen = format!("{}:{}", internal.main.listen.host, internal.main.listen.port);
    tracing::info!(workers = internal.main.workers, listen = %listen, "Starting casper");

    let runtime = runtime_for(internal.main.workers).map_err(CliError::Runtime)?;
    runtime.block_on(proxy::run(paths, args.worker_id))?;
    Ok(())
}

fn runtime_for(workers: usize) -> std::io::Result<tokio::runtime::Runtime> {
    if workers <= 1 {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .enable_all()
            .build()
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
