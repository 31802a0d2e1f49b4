//! Command-line front end for the runlog pipeline.
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runlog::{EventPipeline, RelayAdapter};
use runlog_common::{LogConfig, PipelineConfig, RelayEnvelope, RelayReply, WriteBackend, init_logging};
use runlog_store::{MemoryBackend, SqliteBackend};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "runlog", version, about = "Asynchronous test-execution event logging")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "RUNLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay relayed events from a JSON Lines file through the pipeline
    Replay {
        /// One relay envelope per line
        #[arg(long)]
        input: PathBuf,

        /// SQLite database to write to (in-memory store when omitted)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Print the effective configuration and where each value came from
    Config {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

/// Result of a replay, printed as JSON.
#[derive(Debug, Default, Serialize)]
struct ReplayReport {
    envelopes: usize,
    replies: BTreeMap<&'static str, usize>,
    failures: Vec<String>,
    unclaimed_errors: Vec<String>,
    stored: BTreeMap<String, i64>,
}

const MAX_REPORTED_FAILURES: usize = 20;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let loaded = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay { input, db } => {
            let report = replay(&input, db.as_deref(), loaded.config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&loaded.sources)?);
            } else {
                for entry in &loaded.sources {
                    println!("{:<28} {:<24} {}", entry.key, entry.value, entry.source);
                }
            }
        }
    }

    Ok(())
}

enum Store {
    Memory(Arc<MemoryBackend>),
    Sqlite(Arc<SqliteBackend>),
}

impl Store {
    fn open(db: Option<&Path>, config: &PipelineConfig) -> Result<Self> {
        Ok(match db {
            Some(path) => Self::Sqlite(Arc::new(
                SqliteBackend::open(path, config.max_cached_events)
                    .with_context(|| format!("failed to open database {}", path.display()))?,
            )),
            None => Self::Memory(Arc::new(
                MemoryBackend::new().with_max_cached(config.max_cached_events),
            )),
        })
    }

    fn backend(&self) -> Arc<dyn WriteBackend> {
        match self {
            Self::Memory(backend) => backend.clone(),
            Self::Sqlite(backend) => backend.clone(),
        }
    }

    fn counts(&self) -> Result<BTreeMap<String, i64>> {
        let mut counts = BTreeMap::new();
        match self {
            Self::Memory(backend) => {
                let summary = backend.summary();
                for (table, rows) in [
                    ("runs", summary.runs),
                    ("suites", summary.suites),
                    ("testcases", summary.testcases),
                    ("messages", summary.messages),
                    ("checkpoints", summary.checkpoints),
                    ("statistics", summary.statistics),
                ] {
                    counts.insert(table.to_string(), rows as i64);
                }
            }
            Self::Sqlite(backend) => {
                for table in ["runs", "suites", "testcases", "messages", "checkpoints", "statistics"] {
                    counts.insert(table.to_string(), backend.count(table)?);
                }
            }
        }
        Ok(counts)
    }
}

fn replay(input: &Path, db: Option<&Path>, config: PipelineConfig) -> Result<ReplayReport> {
    let file = File::open(input)
        .with_context(|| format!("failed to open {}", input.display()))?;
    let store = Store::open(db, &config)?;
    let pipeline = Arc::new(EventPipeline::new(store.backend(), config));
    let relay = RelayAdapter::new(pipeline.clone());

    let mut report = ReplayReport::default();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", input.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let envelope: RelayEnvelope = serde_json::from_str(&line)
            .with_context(|| format!("line {}: invalid relay envelope", index + 1))?;
        report.envelopes += 1;

        let reply = relay.handle(envelope);
        let status = match &reply {
            RelayReply::Accepted => "accepted",
            RelayReply::Completed(_) => "completed",
            RelayReply::TimedOut => "timed_out",
            RelayReply::Failed(_) => "failed",
        };
        *report.replies.entry(status).or_default() += 1;
        if let RelayReply::Failed(err) = reply {
            warn!(line = index + 1, code = %err.code, message = %err.message, "event rejected");
            if report.failures.len() < MAX_REPORTED_FAILURES {
                report.failures.push(format!("line {}: {}", index + 1, err.message));
            }
        }
    }

    let channels: Vec<_> = pipeline
        .channel_ids()
        .iter()
        .map(|id| pipeline.channel(id))
        .collect();
    pipeline.close();
    for channel in channels {
        if let Some(err) = channel.take_last_error() {
            report.unclaimed_errors.push(format!("{}: {err}", channel.id()));
        }
    }

    report.stored = store.counts()?;
    info!(envelopes = report.envelopes, "replay finished");
    Ok(report)
}
