//! NDL Ingest - SHARADAR loader

use anyhow::Result;
use clap::{Parser, Subcommand};
use ndl_common::logging::{init_logging, LogConfig};
use ndl_common::IngestOutcome;
use ndl_ingest::config::IngestSettings;
use ndl_ingest::service::{DailyRequest, FundamentalsRequest, IngestService};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "ndl-ingest")]
#[command(author, version, about = "Load SHARADAR datatables into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Concurrent page requests for streaming runs
    #[arg(long, global = true, env = "INGEST_FETCH_CONCURRENCY")]
    fetch_concurrency: Option<usize>,

    /// Concurrent database writes for streaming runs
    #[arg(long, global = true, env = "INGEST_WRITE_CONCURRENCY")]
    write_concurrency: Option<usize>,

    /// Rows per upsert statement
    #[arg(long, global = true, env = "INGEST_BATCH_SIZE")]
    batch_size: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh company metadata (SHARADAR/TICKERS)
    Tickers {
        /// Only these tickers (default: all)
        #[arg(value_delimiter = ',')]
        tickers: Vec<String>,
    },

    /// Load fundamentals (SHARADAR/SF1)
    Fundamentals {
        /// Only these tickers (default: all active companies)
        #[arg(short, long, value_delimiter = ',')]
        tickers: Vec<String>,

        /// Dimensions such as ARQ,MRQ (default: INGEST_DIMENSIONS)
        #[arg(short, long, value_delimiter = ',')]
        dimensions: Vec<String>,

        /// Fetch full history instead of changes since the last run
        #[arg(long)]
        full: bool,
    },

    /// Load daily prices (SHARADAR/DAILY)
    Daily {
        /// Only these tickers (default: all active companies)
        #[arg(short, long, value_delimiter = ',')]
        tickers: Vec<String>,

        /// Fetch full history instead of changes since the last run
        #[arg(long)]
        full: bool,
    },

    /// Load benchmark prices for the tickers in the benchmarks table
    Benchmarks {
        #[arg(long)]
        full: bool,
    },

    /// Load current S&P 500 membership (SHARADAR/SP500)
    Index,

    /// Show stored row counts and latest dates
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let log_config = LogConfig::for_binary("ndl-ingest")
        .with_level(log_level)
        .with_filter("sqlx=warn")
        .merge_env()?;
    let log_guard = init_logging(&log_config)?;

    let mut settings = IngestSettings::load()?;
    if let Some(n) = cli.fetch_concurrency {
        settings.pipeline.fetch_concurrency = n;
    }
    if let Some(n) = cli.write_concurrency {
        settings.pipeline.write_concurrency = n;
    }
    if let Some(n) = cli.batch_size {
        settings.pipeline.batch_size = n;
    }
    settings.validate()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling outstanding requests");
            on_signal.cancel();
        }
    });

    let service = IngestService::connect(&settings, cancel).await?;

    let outcome = match cli.command {
        Command::Tickers { tickers } => service.ingest_tickers(&tickers).await,
        Command::Fundamentals {
            tickers,
            dimensions,
            full,
        } => {
            service
                .ingest_fundamentals(FundamentalsRequest {
                    tickers,
                    dimensions,
                    full,
                })
                .await
        },
        Command::Daily { tickers, full } => {
            service.ingest_daily(DailyRequest { tickers, full }).await
        },
        Command::Benchmarks { full } => service.ingest_benchmarks(full).await,
        Command::Index => service.ingest_index_membership().await,
        Command::Status => {
            let status = service.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        },
    };

    print_outcome(&outcome)?;
    if !outcome.success {
        drop(log_guard);
        std::process::exit(1);
    }

    info!("Ingestion complete");
    Ok(())
}

fn print_outcome(outcome: &IngestOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}
