use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use weather_ingest::{AnySource, AnyStore, Driver, HttpFetcher, IngestConfig, Store};

#[derive(Debug, Parser)]
#[command(name = "weather-ingest", version, about)]
struct Cli {
    /// TOML configuration file. `INGEST_*` environment variables override it.
    #[arg(short, long, env = "INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Default log level; `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Wait for the destination, backfill if it is empty, then poll.
    Run,
    /// Backfill regardless of existing coverage, then exit.
    Backfill {
        /// Oldest instant to reach (RFC 3339). Defaults to the configured history.
        #[arg(long)]
        stop: Option<DateTime<Utc>>,
    },
    /// Poll the incremental window.
    Poll {
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },
    /// Probe the destination once.
    Check,
}

type IngestDriver = Driver<HttpFetcher<AnySource>, AnyStore>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .parse_default_env()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = IngestConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let (fetcher, store) = config
        .build_pipeline()
        .context("Failed to set up source and destination")?;

    if let Command::Check = cli.command {
        store
            .health()
            .await
            .with_context(|| format!("Destination {} is not healthy", store.name()))?;
        info!("Destination {} is healthy", store.name());
        return Ok(());
    }

    let driver = Driver::builder()
        .fetcher(fetcher)
        .store(store)
        .metrics(config.source.metrics.clone())
        .backfill(config.backfill_settings())
        .poll(config.poll_settings())
        .readiness(config.readiness.clone())
        .derive_wind_chill(config.derive.wind_chill)
        .flush_retries(config.destination.flush_retries)
        .flush_retry_delay(Duration::from_millis(config.destination.flush_retry_delay_ms))
        .build();

    let cancel = driver.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stop requested, finishing the current step");
            cancel.cancel();
        }
    });

    let mut states = driver.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!("Driver is {}", state);
        }
    });

    let result = match cli.command {
        Command::Run => driver.run().await.map_err(anyhow::Error::from),
        Command::Backfill { stop } => backfill(&driver, &config, stop).await,
        Command::Poll { once } => poll(&driver, once).await,
        Command::Check => Ok(()),
    };

    info!(
        "Session ended {}: {}",
        driver.state(),
        driver.stats().snapshot()
    );
    result
}

async fn backfill(
    driver: &IngestDriver,
    config: &IngestConfig,
    stop: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    driver.ready().await?;
    let now = Utc::now();
    let stop = stop.unwrap_or_else(|| config.backfill_settings().stop_for(now));
    let report = driver
        .backfill(now, stop)
        .await
        .with_context(|| format!("Backfill down to {} failed", stop))?;
    info!(
        "Backfill processed {} window(s){}",
        report.windows,
        if report.cancelled { ", stopped early" } else { "" }
    );
    Ok(())
}

async fn poll(driver: &IngestDriver, once: bool) -> anyhow::Result<()> {
    driver.ready().await?;
    if once {
        let outcome = driver.poll_once(Utc::now()).await?;
        info!("Poll tick: {:?}", outcome);
    } else {
        driver.poll_loop().await;
    }
    Ok(())
}
