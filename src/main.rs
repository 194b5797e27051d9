use anyhow::Context;
use clap::{ArgAction, Parser};
use log::LevelFilter;
use netbear::{
    config::DirtyRelayConfig,
    connector,
    relay::{self, RelayOutcome},
    resolver::Endpoint,
};
use std::{path::PathBuf, process::ExitCode};
use tokio::runtime::Builder;

/// Connects to a TCP destination and relays standard input and output over the connection.
/// The relay ends once both directions reach end of stream.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Host name or address to connect to.
    destination: String,

    /// Port number or TCP service name.
    port: String,

    /// Seconds to wait for a connection attempt and for any activity during the relay.
    ///
    /// Without it, both waits are unbounded.
    #[arg(short = 'w', long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Path to a config file in JSON format.
    ///
    /// The config is a JSON object with optional keys "timeout", "keepalive", "nodelay" and "retry".
    /// Values given on the command line take precedence.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable TCP keep-alive probes on the connection.
    #[arg(short, long)]
    keepalive: bool,

    /// Keep retrying to resolve and connect, with backoff, for up to this many seconds.
    #[arg(long, value_name = "SECS")]
    retry: Option<u64>,

    /// Log more diagnostics to stderr. Repeat for more detail.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn run(args: Args) -> anyhow::Result<RelayOutcome> {
    let defaults = args
        .config
        .as_deref()
        .map(DirtyRelayConfig::from_file)
        .transpose()?;
    let config = DirtyRelayConfig {
        timeout: args.timeout,
        keepalive: args.keepalive.then_some(true),
        nodelay: None,
        retry: args.retry,
    }
    .clean(defaults.as_ref())
    .context("invalid configuration")?;

    let endpoint = Endpoint::new(args.destination, args.port);

    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    let result: anyhow::Result<RelayOutcome> = runtime.block_on(async move {
        let connection = match config.retry {
            Some(budget) => {
                connector::establish_with_retry(&endpoint, &config.connect, budget).await
            }
            None => connector::establish(&endpoint, &config.connect).await,
        }
        .with_context(|| format!("could not connect to {}", endpoint))?;

        log::info!("relaying data to {}", connection.peer);
        let report = relay::relay_stdio(connection.stream, config.relay).await;
        log::info!(
            "connection to {} closed ({:?}): {} bytes sent, {} bytes received",
            connection.peer,
            report.outcome,
            report.bytes_sent,
            report.bytes_received
        );

        Ok(report.outcome)
    });

    // A blocking stdin read may still be pending on the runtime's thread pool.
    runtime.shutdown_background();

    result
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(args) {
        Ok(RelayOutcome::Drained | RelayOutcome::IdleTimeout) => ExitCode::SUCCESS,
        Ok(RelayOutcome::SinkFailed(_)) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
