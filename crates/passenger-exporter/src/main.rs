//! Prometheus exporter for Phusion Passenger running behind nginx.

use anyhow::Context as _;
use clap::Parser;
use passenger_exporter::{PassengerExporter, PidFileCollector, StatusCommand};
use tokio::net::lookup_host;
use tracing_subscriber::EnvFilter;

use std::{
    future,
    io::{self, IsTerminal as _},
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

/// Prometheus exporter for Phusion Passenger running behind nginx.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Command producing Passenger status XML. Split on whitespace; no shell expansion is performed.
    #[arg(
        long = "passenger.command",
        value_name = "COMMAND",
        default_value = StatusCommand::DEFAULT_COMMAND
    )]
    command: String,
    /// Timeout for the status command, e.g. `500ms` or `2s`.
    #[arg(
        long = "passenger.command.timeout",
        value_name = "DURATION",
        default_value = "500ms",
        value_parser = humantime::parse_duration
    )]
    command_timeout: Duration,
    /// Path to the PID file of the Passenger / nginx process. If specified, standard process metrics
    /// are reported for this process.
    #[arg(long = "passenger.pid-file", value_name = "PATH")]
    pid_file: Option<PathBuf>,
    /// Path under which to expose metrics.
    #[arg(
        long = "web.telemetry-path",
        value_name = "PATH",
        default_value = PassengerExporter::DEFAULT_TELEMETRY_PATH
    )]
    telemetry_path: String,
    /// Address to listen on for HTTP requests, as `<host>:<port>`. The host may be a name
    /// (e.g., `localhost`); `:<port>` listens on all IPv4 interfaces.
    #[arg(
        long = "web.listen-address",
        value_name = "ADDR",
        default_value = ":9106",
        value_parser = parse_listen_address
    )]
    listen_address: String,
    /// Logging directives, e.g. `info` or `passenger_exporter=debug`. Overridden by the `RUST_LOG` env var.
    #[arg(long = "log.level", value_name = "FILTER", default_value = "info")]
    log_level: String,
}

/// Normalizes a listen address to the `<host>:<port>` form accepted by [`lookup_host()`].
fn parse_listen_address(raw: &str) -> Result<String, String> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("missing port in `{raw}`"))?;
    port.parse::<u16>()
        .map_err(|err| format!("invalid port in `{raw}`: {err}"))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

async fn resolve_listen_address(address: &str) -> anyhow::Result<SocketAddr> {
    lookup_host(address)
        .await
        .with_context(|| format!("failed resolving listen address `{address}`"))?
        .next()
        .with_context(|| format!("listen address `{address}` resolved to no addresses"))
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid `--log.level` directives: `{log_level}`"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "Failed listening for Ctrl+C; graceful shutdown is disabled");
        future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Passenger exporter"
    );

    let command = StatusCommand::new(&cli.command, cli.command_timeout)
        .context("invalid `--passenger.command`")?;
    tracing::info!(
        command = %command.command_line(),
        timeout = ?command.timeout(),
        "Configured Passenger status command"
    );

    let mut exporter = PassengerExporter::new(command)
        .with_telemetry_path(&cli.telemetry_path)
        .with_graceful_shutdown(wait_for_shutdown());
    if let Some(pid_file) = cli.pid_file {
        tracing::info!(
            pid_file = %pid_file.display(),
            "Reporting metrics for the host process"
        );
        exporter = exporter.with_host_process(PidFileCollector::new(pid_file));
    }

    let bind_address = resolve_listen_address(&cli.listen_address).await?;
    let server = exporter
        .bind(bind_address)
        .await
        .with_context(|| format!("failed binding to {bind_address}"))?;
    tracing::info!(
        local_addr = %server.local_addr(),
        telemetry_path = %cli.telemetry_path,
        "Passenger exporter is listening"
    );
    server.start().await.context("exporter server failed")?;
    tracing::info!("Passenger exporter shut down");
    Ok(())
}
