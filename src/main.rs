use clap::{Parser, ValueEnum};
use endorse::application::pipeline::{Pipeline, Stores};
use endorse::config::{LogFormat, Settings};
use endorse::infrastructure::clock::SystemClock;
use endorse::infrastructure::insurer::SimulatedInsurer;
use endorse::interfaces::csv::account_writer::AccountWriter;
use endorse::interfaces::csv::request_reader::{InputRecord, RequestReader};
use endorse::interfaces::csv::request_writer::RequestWriter;
use endorse::telemetry;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Report {
    /// One line per employer account
    Accounts,
    /// One line per endorsement request
    Requests,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input CSV of endorsement requests and top-ups
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `info` or `endorse=debug`
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Which report to print on stdout
    #[arg(long, value_enum, default_value = "accounts")]
    report: Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path).into_diagnostic()?,
        None => Settings::default(),
    };
    if let Some(level) = cli.log_level {
        settings.log.level = level;
    }
    if let Some(format) = cli.log_format {
        settings.log.format = format;
    }
    telemetry::init(&settings.log).into_diagnostic()?;

    let stores = open_stores(cli.db_path, &settings)?;
    let pipeline = Pipeline::new(
        &settings,
        stores,
        Arc::new(SimulatedInsurer::new()),
        Arc::new(SystemClock),
    );
    pipeline.recover().await.into_diagnostic()?;

    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = RequestReader::new(file);
    for (line, record) in reader.records().enumerate() {
        let outcome = match record {
            Ok(InputRecord::TopUp {
                employer_id,
                amount,
                external_ref,
            }) => pipeline
                .ledger()
                .top_up(&employer_id, amount, &external_ref)
                .await
                .map(|_| ()),
            Ok(InputRecord::Endorsement(new)) => pipeline.submit(new).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            warn!(line = line + 1, error = %e, "input record skipped");
        }
    }

    // Batch input has no later arrivals to wait for, so windows close now.
    pipeline.run_until_idle().await.into_diagnostic()?;
    let flushed = pipeline.scheduler().flush_all().await.into_diagnostic()?;
    let processed = pipeline.run_until_idle().await.into_diagnostic()?;
    info!(flushed, processed, "input processed");

    let stdout = io::stdout();
    match cli.report {
        Report::Accounts => {
            let accounts = pipeline.ledger().accounts().await.into_diagnostic()?;
            AccountWriter::new(stdout.lock())
                .write_accounts(&accounts)
                .into_diagnostic()?;
        }
        Report::Requests => {
            let requests = pipeline.requests().all().await.into_diagnostic()?;
            RequestWriter::new(stdout.lock())
                .write_requests(&requests)
                .into_diagnostic()?;
        }
    }

    Ok(())
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>, settings: &Settings) -> Result<Stores> {
    use endorse::infrastructure::rocksdb::RocksDBStore;

    let partitions = settings.event_log.partitions;
    match db_path {
        Some(path) => {
            let store = RocksDBStore::open(path).into_diagnostic()?;
            Ok(Stores::rocksdb(store, partitions))
        }
        None => Ok(Stores::in_memory(partitions)),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>, settings: &Settings) -> Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Stores::in_memory(settings.event_log.partitions))
}
