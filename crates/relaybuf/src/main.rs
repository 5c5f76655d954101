//! relaybuf - operator CLI for the proxy telemetry buffer

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use relaybuf_core::clock::epoch_secs;
use relaybuf_core::error::format_error_with_remediation;
use relaybuf_core::logging::init_logging;
use relaybuf_core::record::PerStream;
use relaybuf_core::worker::DrainReport;
use relaybuf_core::{
    BufferConfig, BufferMode, DurableStore, ExportWorker, Exporter, HousekeepReport,
    JsonLinesTransport, ProxyBuffer, SqliteStore, Stream,
};

/// Inspect, drain and maintain a relaybuf buffer database
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (TOML). Built-in defaults are used when omitted.
    #[arg(short, long, global = true, env = "RELAYBUF_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the default configuration, or validate a config file
    Config {
        /// Validate this file instead of printing defaults
        #[arg(long)]
        validate: Option<PathBuf>,
    },

    /// Show per-stream backlog in the database
    Inspect {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Export everything buffered to a JSON lines file
    Drain {
        /// Output file, appended to
        #[arg(short, long)]
        out: PathBuf,

        /// Stop after this many export cycles
        #[arg(long, default_value = "1000")]
        max_cycles: usize,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Run the export worker until interrupted
    Run {
        /// Output file, appended to
        #[arg(short, long)]
        out: PathBuf,

        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Delete sent rows and expire records older than the offline buffer
    Housekeep {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
struct StreamBacklog {
    stream: Stream,
    table: &'static str,
    max_id: u64,
    last_sent_id: u64,
    unsent: u64,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    mode: BufferMode,
    database: PathBuf,
    streams: Vec<StreamBacklog>,
}

fn load_config(path: Option<&Path>, log_level: Option<&str>) -> Result<BufferConfig> {
    let mut config = match path {
        Some(path) => BufferConfig::load(path).map_err(relaybuf_core::Error::from)?,
        None => BufferConfig::default(),
    };
    if let Some(level) = log_level {
        config.log.level = level.to_string();
        config.validate().map_err(relaybuf_core::Error::from)?;
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_config(validate: Option<&Path>) -> Result<()> {
    match validate {
        Some(path) => {
            BufferConfig::load(path).map_err(relaybuf_core::Error::from)?;
            println!("{}: ok", path.display());
        }
        None => {
            let text = BufferConfig::default()
                .to_toml_string()
                .map_err(relaybuf_core::Error::from)?;
            print!("{text}");
        }
    }
    Ok(())
}

fn cmd_inspect(config: &BufferConfig, format: OutputFormat) -> Result<()> {
    let path = &config.database.path;
    if !path.exists() {
        bail!("database {} does not exist", path.display());
    }
    let store = SqliteStore::open(path, config.database.busy_timeout())
        .map_err(relaybuf_core::Error::from)?;

    let mut streams = Vec::with_capacity(Stream::ALL.len());
    for stream in Stream::ALL {
        let last_sent_id = store.last_sent_id(stream).map_err(relaybuf_core::Error::from)?;
        streams.push(StreamBacklog {
            stream,
            table: store.tables().get(stream).table,
            max_id: store.max_id(stream).map_err(relaybuf_core::Error::from)?,
            last_sent_id,
            unsent: store
                .count_after(stream, last_sent_id)
                .map_err(relaybuf_core::Error::from)?,
        });
    }
    let report = InspectReport {
        mode: config.mode,
        database: path.clone(),
        streams,
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            println!("mode:     {}", report.mode);
            println!("database: {}", report.database.display());
            println!("{:<10} {:<22} {:>10} {:>10} {:>10}", "STREAM", "TABLE", "MAX_ID", "SENT", "UNSENT");
            for row in &report.streams {
                println!(
                    "{:<10} {:<22} {:>10} {:>10} {:>10}",
                    row.stream, row.table, row.max_id, row.last_sent_id, row.unsent
                );
            }
        }
    }
    Ok(())
}

fn open_exporter(config: BufferConfig, out: &Path) -> Result<Exporter> {
    let max_payload = config.export.max_payload_bytes;
    let buffer = Arc::new(ProxyBuffer::from_config(config)?);
    let transport = JsonLinesTransport::append_to(out, max_payload)
        .map_err(relaybuf_core::Error::from)
        .with_context(|| format!("opening {}", out.display()))?;
    Ok(Exporter::new(buffer, Arc::new(transport)))
}

fn print_per_stream<T: std::fmt::Display>(label: &str, values: &PerStream<T>) {
    for (stream, value) in values.iter() {
        println!("{label} {stream:<10} {value}");
    }
}

fn cmd_drain(config: BufferConfig, out: &Path, max_cycles: usize, format: OutputFormat) -> Result<()> {
    let exporter = open_exporter(config, out)?;
    let report: DrainReport = exporter.drain(max_cycles);
    info!(
        cycles = report.cycles,
        failed_sends = report.failed_sends,
        data_loss_gaps = report.data_loss_gaps,
        "Drain finished"
    );

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            println!("cycles: {}", report.cycles);
            print_per_stream("exported", &report.records);
            if report.data_loss_gaps > 0 {
                println!("data loss gaps: {}", report.data_loss_gaps);
            }
        }
    }
    if report.failed_sends > 0 {
        bail!("{} upload(s) failed; unsent records remain buffered", report.failed_sends);
    }
    Ok(())
}

async fn cmd_run(config: BufferConfig, out: &Path, duration: Option<Duration>) -> Result<()> {
    let exporter = Arc::new(open_exporter(config, out)?);
    let worker = ExportWorker::new(Arc::clone(&exporter));
    let shutdown = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        flag.store(true, Ordering::Relaxed);
    });

    worker.run(shutdown).await;

    let flushed = exporter.buffer().flush()?;
    if flushed > 0 {
        info!(rows = flushed, "Memory records flushed to database");
    }
    Ok(())
}

fn cmd_housekeep(config: BufferConfig, format: OutputFormat) -> Result<()> {
    let buffer = ProxyBuffer::from_config(config)?;
    let report: HousekeepReport = buffer.housekeep(epoch_secs())?;
    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            print_per_stream("deleted", &report.deleted);
            print_per_stream("expired", &report.expired);
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Config { validate } = &cli.command {
        return cmd_config(validate.as_deref());
    }

    let config = load_config(cli.config.as_deref(), cli.log_level.as_deref())?;
    init_logging(&config.log)?;

    match cli.command {
        Commands::Config { .. } => Ok(()),
        Commands::Inspect { format } => cmd_inspect(&config, format),
        Commands::Drain {
            out,
            max_cycles,
            format,
        } => cmd_drain(config, &out, max_cycles, format),
        Commands::Run { out, duration_secs } => {
            cmd_run(config, &out, duration_secs.map(Duration::from_secs)).await
        }
        Commands::Housekeep { format } => cmd_housekeep(config, format),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<relaybuf_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
