use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use stationhub::{
    config::{DEFAULT_PORT, EXPIRY, MAX_RECORDS},
    Client, Config, Outcome, Reading, Retention, Server,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

/// Aggregates weather readings from many content sources behind a Lamport
/// clock.
#[derive(Parser)]
#[command(name = "stationhub-cli", version, about)]
struct Cli {
    /// Logging verbosity (trace, debug, info, warn, error) or a full filter.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the aggregator.
    Serve(ServeArgs),
    /// Submit a station file as a content source.
    Put(PutArgs),
    /// Fetch the latest reading.
    Get(GetArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Address to bind on.
    #[arg(long, default_value = "0.0.0.0")]
    host: std::net::IpAddr,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    #[arg(long, default_value_t = MAX_RECORDS)]
    max_records: usize,
    /// Seconds of silence after which a source is evicted.
    #[arg(long, default_value_t = EXPIRY.as_secs())]
    expiry: u64,
    /// Seconds between sweeps for silent sources.
    #[arg(long, default_value_t = 1)]
    sweep_interval: u64,
    /// Keep every submission rather than only the latest per source.
    #[arg(long)]
    full_history: bool,
}

#[derive(Args)]
struct PutArgs {
    /// Aggregator address, `host:port`.
    #[arg(short, long)]
    server: String,
    /// Station file of `key:value` lines.
    #[arg(short, long)]
    file: PathBuf,
    /// Re-read and resubmit the file every this many seconds, forever.
    #[arg(long)]
    interval: Option<u64>,
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

#[derive(Args)]
struct GetArgs {
    /// Aggregator address, `host:port`.
    #[arg(short, long)]
    server: String,
    /// Only readings from this station.
    #[arg(long)]
    id: Option<String>,
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(false).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Serve(args) => serve(args).await,
            Command::Put(args) => put(args).await,
            Command::Get(args) => get(args).await,
        }
    })
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = Config::builder()
        .listen_addr(SocketAddr::new(args.host, args.port))
        .data_dir(args.data_dir)
        .max_records(args.max_records)
        .expiry(Duration::from_secs(args.expiry))
        .sweep_interval(Duration::from_secs(args.sweep_interval.max(1)))
        .retention(if args.full_history {
            Retention::FullHistory
        } else {
            Retention::LatestPerSource
        })
        .build();

    let server = Server::bind(&config)
        .await
        .with_context(|| format!("starting aggregator on {}", config.listen_addr))?;
    server.run(shutdown_token()).await.context("serving")
}

/// A token cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not listen for SIGTERM");
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT, shutting down");
        }
        cancel.cancel();
    });
    token
}

async fn put(args: PutArgs) -> Result<()> {
    let client = Client::builder()
        .server(args.server)
        .retries(args.retries)
        .build();
    loop {
        let text = tokio::fs::read_to_string(&args.file)
            .await
            .with_context(|| format!("reading {}", args.file.display()))?;
        let reading = Reading::from_station_text(&text)
            .with_context(|| format!("parsing {}", args.file.display()))?;
        let response = client.put(&reading).await.context("submitting reading")?;
        match response.outcome {
            Outcome::Created | Outcome::Updated => {
                tracing::info!(id = reading.id(), outcome = ?response.outcome, clock = response.clock, "submitted");
            }
            other => bail!("aggregator refused reading: {other:?}"),
        }
        match args.interval {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs.max(1))).await,
            None => return Ok(()),
        }
    }
}

async fn get(args: GetArgs) -> Result<()> {
    let client = Client::builder()
        .server(args.server)
        .retries(args.retries)
        .build();
    let response = client.get(args.id.as_deref()).await.context("querying aggregator")?;
    match response.outcome {
        Outcome::Found(reading) => {
            for (key, value) in reading.fields() {
                println!("{key}: {value}");
            }
            Ok(())
        }
        Outcome::NotFound => bail!("no data"),
        other => bail!("aggregator refused query: {other:?}"),
    }
}
