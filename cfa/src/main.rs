//! # CFA Daemon Binary
//!
//! Hosts the trusted side of a control-flow attestation session, or drives
//! a synthetic untrusted producer against one.
//!
//! # Usage
//!
//! ```bash
//! # Create the session region and run the consumer
//! cfa --config config/cfa.toml serve
//!
//! # From another process, publish 10000 synthetic transfers
//! cfa produce --count 10000 --modules 4
//!
//! # List sessions whose creator is alive
//! cfa sessions --json
//! ```

use cfa::{ConsumerLoop, DaemonError, DaemonResult, load_config, run_synthetic};
use cfa_common::config::{AttestationConfig, LogLevel};
use cfa_common::logging::init_tracing;
use cfa_pipeline::{
    AttestationEngine, BackoffPolicy, PipelineError, RingBuffer, SharedRegion, digest_hex,
    list_sessions,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// CFA - control-flow attestation daemon
#[derive(Parser, Debug)]
#[command(name = "cfa")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Shared-memory control-flow attestation: trusted consumer and test producer")]
#[command(long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "config/cfa.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs (and the session list) in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the session region and run the trusted consumer
    Serve,
    /// Attach to a session and publish synthetic transfers
    Produce {
        /// Number of transfers to record
        #[arg(short = 'n', long, default_value_t = 1000)]
        count: u64,
        /// Number of synthetic modules the targets are spread over
        #[arg(short, long, default_value_t = 4)]
        modules: u32,
    },
    /// List sessions whose creator is still running
    Sessions,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("cfa failed: {}", e);
        eprintln!("cfa: {e}");
        std::process::exit(1);
    }
}

async fn run() -> DaemonResult<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        config.shared.log_level
    };
    init_tracing(level, args.json);

    info!(
        service = %config.shared.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "cfa starting"
    );

    match args.command {
        Command::Serve => serve(&config).await,
        Command::Produce { count, modules } => produce(&config, count, modules),
        Command::Sessions => sessions(args.json),
    }
}

async fn serve(config: &AttestationConfig) -> DaemonResult<()> {
    let region = Arc::new(SharedRegion::open(
        &config.region.name,
        config.region.capacity,
    )?);
    let engine = Arc::new(AttestationEngine::attach(
        region,
        BackoffPolicy::from(config.backoff),
    )?);

    let quote = engine.quote();
    info!(
        session = %config.region.name,
        capacity = config.region.capacity,
        generation = quote.generation,
        "trusted consumer attached"
    );

    let consumer = ConsumerLoop::new(Arc::clone(&engine), config.consumer);
    let mut task = tokio::task::spawn_blocking(move || consumer.run());

    let joined = tokio::select! {
        joined = &mut task => joined,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    info!("shutdown signal received, draining");
                    engine.close();
                }
                Err(e) => error!("unable to listen for shutdown signal: {}", e),
            }
            task.await
        }
    };

    let summary = joined.map_err(|e| DaemonError::Task(e.to_string()))??;
    let quote = engine.quote();
    info!(
        retired = summary.retired,
        rebaselines = summary.rebaselines,
        dropped = summary.stats.ring.dropped_total,
        generation = quote.generation,
        sequence = quote.sequence,
        tip = %digest_hex(&quote.tip),
        "consumer stopped"
    );
    Ok(())
}

fn produce(config: &AttestationConfig, count: u64, modules: u32) -> DaemonResult<()> {
    let region = Arc::new(SharedRegion::attach(&config.region.name)?);
    let ring = RingBuffer::new(region, BackoffPolicy::from(config.backoff));

    let report = run_synthetic(ring, count, modules, config.producer.retry_limit)?;
    info!(
        recorded = report.recorded,
        batches = report.flushed_batches,
        dropped = report.dropped,
        "producer finished"
    );
    if report.dropped > 0 {
        warn!(
            dropped = report.dropped,
            "ring was full, raise region.capacity or producer.retry_limit"
        );
    }
    Ok(())
}

fn sessions(json: bool) -> DaemonResult<()> {
    let sessions = list_sessions()?;
    if json {
        let out = serde_json::to_string_pretty(&sessions).map_err(PipelineError::from)?;
        println!("{out}");
        return Ok(());
    }
    if sessions.is_empty() {
        println!("no live sessions");
        return Ok(());
    }

    println!("{:<24} {:>10} {:>8} {:>10}", "NAME", "CAPACITY", "PID", "GENERATION");
    for session in sessions {
        println!(
            "{:<24} {:>10} {:>8} {:>10}",
            session.name, session.capacity, session.creator_pid, session.generation
        );
    }
    Ok(())
}
