use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use net_discovery_rs::config::SettingsLoader;
use net_discovery_rs::orchestrator::{ScanOrchestrator, StopReason};
use net_discovery_rs::probe::TcpProber;
use net_discovery_rs::publisher::{EventBus, HttpEventBus, LogEventBus, Publisher};
use net_discovery_rs::server;
use net_discovery_rs::types::{ScanRequest, ScanSummary};

/// net-discovery-rs: autonomous network discovery collector.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "net-discovery-rs",
    version,
    about = "Autonomous network discovery collector: probes subnets, publishes discoveries, reports progress.",
    long_about = None
)]
struct Cli {
    /// TOML settings file. Defaults to `discovery.toml` in the working directory if present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Environment file loaded before settings are read.
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,

    /// Override the control surface bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Run one legacy scan with the configured defaults, print a summary and exit.
    #[arg(long = "scan-once", default_value_t = false)]
    scan_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut loader = SettingsLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    let mut settings = loader.load().context("failed to load settings")?;
    if let Some(bind) = cli.bind.clone() {
        settings.server.bind = bind;
    }
    let settings = Arc::new(settings);

    let bus: Arc<dyn EventBus> = match settings.bus.url.as_deref() {
        Some(url) => Arc::new(HttpEventBus::new(url, &settings.bus).context("failed to build event bus client")?),
        None => {
            warn!("no event bus url configured; discoveries will only be logged");
            Arc::new(LogEventBus)
        }
    };
    let publisher = Arc::new(Publisher::new(bus, settings.bus.exchange.clone(), settings.collector.source.clone()));
    let orchestrator = ScanOrchestrator::new(settings.clone(), Arc::new(TcpProber::new()), publisher);

    info!(
        collector = %settings.collector.name,
        exchange = %settings.bus.exchange,
        rate_limit_pps = settings.scan.rate_limit_pps,
        max_concurrent_hosts = settings.scan.max_concurrent_hosts,
        "collector configured"
    );

    if cli.scan_once {
        let handle = orchestrator.start(ScanRequest::Legacy)?;
        let stopper = orchestrator.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = stopper.stop(None, StopReason::Requested);
        });
        let summary = handle.wait().await.context("scan task failed")?;
        print_summary_table(&summary);
        return Ok(());
    }

    server::spawn_server(&settings.server.bind, orchestrator).await
}

fn print_summary_table(summary: &ScanSummary) {
    let mut subnet_w = "subnet".len();
    for s in &summary.subnets {
        subnet_w = subnet_w.max(s.subnet.len());
    }
    let num_w = 10usize;

    println!(
        "\nScan {} finished: {:?} (hosts probed: {}, open ports: {}, discoveries published: {})",
        summary.scan_id,
        summary.status,
        summary.probed(),
        summary.open_ports(),
        summary.discovery_count
    );
    println!(
        "{:<subnet_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}",
        "subnet",
        "enumerated",
        "excluded",
        "probed",
        "open",
        "published",
        subnet_w = subnet_w,
        num_w = num_w
    );
    println!(
        "{:-<subnet_w$}  {:-<num_w$}  {:-<num_w$}  {:-<num_w$}  {:-<num_w$}  {:-<num_w$}",
        "",
        "",
        "",
        "",
        "",
        "",
        subnet_w = subnet_w,
        num_w = num_w
    );
    for s in &summary.subnets {
        println!(
            "{:<subnet_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}",
            s.subnet,
            s.enumerated,
            s.excluded,
            s.probed,
            s.open_ports,
            s.published,
            subnet_w = subnet_w,
            num_w = num_w
        );
    }
    for bad in &summary.invalid_subnets {
        println!("skipped: {bad}");
    }
    if let Some(msg) = &summary.error_message {
        println!("error: {msg}");
    }
}
