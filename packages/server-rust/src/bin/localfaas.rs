//! `localfaas`: serves the functions of a manifest on a local port.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use localfaas_core::Manifest;
use localfaas_server::network::TlsConfig;
use localfaas_server::{Emulator, EmulatorConfig, NetworkConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "localfaas", version, about = "Local function-as-a-service emulator")]
struct Args {
    /// Path to the JSON function manifest.
    #[arg(long, env = "LOCALFAAS_MANIFEST")]
    manifest: PathBuf,

    #[arg(long, env = "LOCALFAAS_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "LOCALFAAS_PORT", default_value_t = 3000)]
    port: u16,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Disable invocation timeouts (for stepping through handlers).
    #[arg(long)]
    no_timeout: bool,

    /// Do not respawn subprocess runners when handler files change.
    #[arg(long)]
    no_watch: bool,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "LOCALFAAS_METRICS_PORT")]
    metrics_port: Option<u16>,

    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    #[arg(long, env = "LOCALFAAS_REGION", default_value = "us-east-1")]
    region: String,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

fn install_metrics(host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid metrics address {host}:{port}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(%addr, "metrics exporter listening");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    if let Some(port) = args.metrics_port {
        install_metrics(&args.host, port)?;
    }

    let manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("failed to load manifest {}", args.manifest.display()))?;

    let mut config = EmulatorConfig {
        region: args.region,
        watch_sources: !args.no_watch,
        ..EmulatorConfig::default()
    };
    if args.no_timeout {
        config.timeouts_enabled = false;
    }

    let emulator = Emulator::new(manifest, config)?;

    let tls = match (args.tls_cert, args.tls_key) {
        (Some(cert_path), Some(key_path)) => Some(TlsConfig { cert_path, key_path }),
        _ => None,
    };
    let mut network = emulator.network(NetworkConfig {
        host: args.host,
        port: args.port,
        tls,
        ..NetworkConfig::default()
    });
    let port = network.start().await?;
    emulator.start_sources();
    info!(
        port,
        functions = emulator.registry().len(),
        queues = emulator.queues().names().len(),
        "localfaas ready"
    );

    network.serve(shutdown_signal()).await?;
    emulator.shutdown().await;
    Ok(())
}
