//! # elastistack CLI
//!
//! Parses standard Go stack trace dump text and imports it as structured
//! documents into a running Elasticsearch instance.
//!
//! The parser ignores non-stack-trace content in the input file, so there
//! is no need to clean up a larger log file or captured stdout that
//! contains a Go stack trace alongside other output.
//!
//! ## Usage
//!
//! ```bash
//! elastistack import --input ./crash.log
//! elastistack import -i ./crash.log --host es.internal --port 9200 --workers 8
//! elastistack --config ./elastistack.toml --log-level info import -i ./crash.log
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use elastistack::config::{self, Config};
use elastistack::import;
use elastistack::logging::{self, LogFormat, LogLevel};
use elastistack::progress::ProgressMode;

/// Import Golang stack trace data into Elasticsearch.
#[derive(Parser)]
#[command(
    name = "elastistack",
    about = "Import Golang stack trace data into Elasticsearch",
    version,
    long_about = "This program can parse standard Go stack trace dump text data and import it \
    as structured documents to a running Elasticsearch instance.\n\n\
    The parsing code ignores non-stack-trace content in the input file, so there is no need to \
    clean up a larger logfile or standard output that includes both a Go stack trace and other data."
)]
struct Cli {
    /// Path to an optional configuration file (TOML).
    ///
    /// Every setting has a default; flags override values from the file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Logging level: trace, debug, info, warn, or error.
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log output format: text or json.
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a stack trace into Elasticsearch.
    ///
    /// Parses the input file and inserts one document per goroutine. Each
    /// document's timestamp is the import time minus the goroutine's
    /// reported wait duration.
    Import {
        /// Input file containing Golang stack trace data.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Hostname for the Elasticsearch endpoint.
        #[arg(short = 'e', long)]
        host: Option<String>,

        /// Port for the Elasticsearch endpoint.
        #[arg(short, long)]
        port: Option<u16>,

        /// Index to write documents into.
        #[arg(long)]
        index: Option<String>,

        /// Mapping type sent with each document (empty to omit).
        #[arg(long)]
        doc_type: Option<String>,

        /// Number of concurrent bulk delivery workers.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Progress output on stderr: off, human, or json.
        /// Defaults to human when stderr is a terminal.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(level) = cli.log_level {
        cfg.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        cfg.logging.format = format;
    }
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Import {
            input,
            host,
            port,
            index,
            doc_type,
            workers,
            progress,
        } => {
            if let Some(host) = host {
                cfg.backend.host = host;
            }
            if let Some(port) = port {
                cfg.backend.port = port;
            }
            if let Some(index) = index {
                cfg.backend.index = index;
            }
            if let Some(doc_type) = doc_type {
                cfg.backend.doc_type = doc_type;
            }
            if let Some(workers) = workers {
                cfg.delivery.workers = workers;
            }
            config::validate(&cfg)?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling import");
                    on_signal.cancel();
                }
            });

            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            import::run_import(&cfg, input.as_deref(), progress, cancel).await?;
        }
    }

    Ok(())
}
