use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use envoy_core::{GatewayReader, HttpTransport, ReaderConfig, ReqwestTransport, Snapshot};
use tokio::time::{interval_at, Instant};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "envoyd")]
#[command(about = "Enphase Envoy gateway poller (read-only)")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Hostname or IP of the gateway on the local network.
    #[arg(long)]
    host: String,

    /// Enlighten account email, or a local account name for legacy
    /// firmware.
    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Previously issued bearer token, to avoid a cloud round-trip.
    #[arg(long)]
    token: Option<String>,

    #[arg(long, default_value_t = 60)]
    interval_secs: u64,

    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[arg(long, default_value_t = 3600)]
    refresh_check_secs: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the device identity document and exit.
    Info,
    /// Authenticate, run a single update cycle and print a snapshot.
    Once {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// Poll continuously at the configured interval.
    Watch {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let config = ReaderConfig {
        request_timeout: Duration::from_secs(cli.timeout_secs),
        update_interval: Duration::from_secs(cli.interval_secs),
        refresh_check_interval: Duration::from_secs(cli.refresh_check_secs),
        ..ReaderConfig::default()
    };

    let transport = ReqwestTransport::new(config.request_timeout)?;
    let mut reader = GatewayReader::with_config(cli.host.clone(), transport, config);

    match cli.command {
        Command::Info => {
            let info = reader.fetch_info().await?;
            let out = serde_json::json!({
                "serial_number": info.serial,
                "part_number": info.part,
                "firmware_version": info.firmware.as_ref().map(|f| f.to_string()),
                "imeter": info.imeter,
                "web_tokens": info.web_tokens,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Once { format } => {
            reader
                .authenticate(cli.username, cli.password, cli.token)
                .await?;
            reader.update().await?;
            print_snapshot(&reader.snapshot()?, format)?;
        }
        Command::Watch { format } => {
            reader
                .authenticate(cli.username, cli.password, cli.token)
                .await?;
            stream_loop(&mut reader, format).await?;
        }
    }

    Ok(())
}

async fn stream_loop<T: HttpTransport>(
    reader: &mut GatewayReader<T>,
    format: OutputFormat,
) -> Result<()> {
    let update_every = reader.config().update_interval;
    let refresh_every = reader.config().refresh_check_interval;

    let start = Instant::now() + Duration::from_millis(50);
    let mut update_tick = interval_at(start, update_every);
    let mut refresh_tick = interval_at(Instant::now() + refresh_every, refresh_every);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = refresh_tick.tick() => {
                if let Err(err) = reader.refresh_auth_if_stale().await {
                    warn!(%err, "proactive auth refresh failed");
                }
            }
            _ = update_tick.tick() => {
                match reader.update().await {
                    Ok(()) => print_snapshot(&reader.snapshot()?, format)?,
                    Err(err) => warn!(%err, "update cycle failed"),
                }
            }
        }
    }

    Ok(())
}

fn print_snapshot(snapshot: &Snapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(snapshot)?);
        }
        OutputFormat::Ndjson => {
            println!("{}", serde_json::to_string(snapshot)?);
        }
        OutputFormat::Human => {
            println!("=== Envoy Snapshot ===");
            println!("Time:     {}", snapshot.ts.to_rfc3339());
            println!(
                "Device:   {} ({})",
                snapshot.device.serial_number.as_deref().unwrap_or("unknown"),
                snapshot.device.model
            );
            println!(
                "Firmware: {}",
                snapshot.device.firmware_version.as_deref().unwrap_or("unknown")
            );
            for (name, value) in &snapshot.values {
                if let Some(value) = value {
                    println!("  {name:<26} {value}");
                }
            }
        }
    }

    Ok(())
}
