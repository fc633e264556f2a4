use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pagepulse::{build_relay, build_router, server, AppConfig, RelayError, BUILD_DATE, GIT_HASH};
use pagepulse_beacon::{BeaconSink, MemorySink};
use pagepulse_health_breaker::{HealthProxy, HttpHealthProbe};

#[derive(Parser)]
#[command(name = "pagepulse", about = "Telemetry and self-healing refresh relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server and the refresh poller.
    Serve {
        /// Listen port, overriding PAGEPULSE_LISTEN_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
    /// One-shot breaker-guarded health check, printed as JSON.
    Check,
    /// Print version and build information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port } => {
            let mut config = AppConfig::from_env();
            if let Some(port) = port {
                config.listen_port = port;
            }
            serve(config).await?;
        }
        Command::Check => check().await?,
        Command::Version => {
            println!(
                "pagepulse {} ({}, built {})",
                env!("CARGO_PKG_VERSION"),
                GIT_HASH,
                BUILD_DATE
            );
        }
    }
    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    pagepulse::metrics::register_metrics();

    let relay = build_relay(&config);
    let poller_handle = relay.poller.spawn();
    let router = build_router(relay.state);

    let addr: SocketAddr = ([0, 0, 0, 0], config.listen_port).into();
    let listener = TcpListener::bind(addr).await.map_err(|source| {
        RelayError::Bind {
            addr: addr.to_string(),
            source,
        }
    })?;
    info!(%addr, api_url = %config.api_url, "relay listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down: stopping poller and flushing queued beacons");
    poller_handle.shutdown().await;
    relay.sink.flush(Duration::from_secs(2)).await;
    relay.worker.shutdown().await;
    Ok(())
}

async fn check() -> Result<()> {
    let config = AppConfig::from_env();
    let client = reqwest::Client::new();
    let breaker_config = config.breaker_config();
    let probe_timeout = Duration::from_millis(breaker_config.probe_timeout_ms);
    // One-shot: beacons from a single check stay local.
    let sink = MemorySink::new();
    let proxy = HealthProxy::new(
        breaker_config,
        Arc::new(HttpHealthProbe::new(
            client,
            config.health_url(),
            probe_timeout,
        )),
        sink as Arc<dyn BeaconSink>,
        config.api_url.clone(),
        BUILD_DATE.to_string(),
    );

    let report = proxy.check().await;
    let (status, body) = server::report_body(&report, proxy.api_url());
    println!("{}", serde_json::to_string_pretty(&body)?);
    if status.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
