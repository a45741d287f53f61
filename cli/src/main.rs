//! wireplay: record, replay, and monitor document database wire traffic.

mod monitor;
mod play;
mod record;

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use wireplay_core::config::{default_config, load_config, EngineConfig};

/// Exit code for capture-quality problems (packets dropped), distinct from
/// tool failure so CI can tell them apart.
const EXIT_PACKETS_DROPPED: i32 = 3;

#[derive(Parser)]
#[clap(name = "wireplay", version, about = "Capture and replay wire traffic against a document database")]
struct Cli {
    /// Path to a TOML config file; flags override individual fields.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture wire traffic into a trace file.
    Record(RecordArgs),
    /// Replay a recorded trace against a live server.
    Play(PlayArgs),
    /// Produce per-operation stats from a trace or a live capture.
    Monitor(MonitorArgs),
}

#[derive(Args)]
pub struct RecordArgs {
    /// Read packets from a pcap file.
    #[clap(short = 'f', long, conflicts_with = "interface")]
    pcap: Option<PathBuf>,

    /// Capture packets live from this network interface.
    #[clap(short = 'i', long, required_unless_present = "pcap")]
    interface: Option<String>,

    /// BPF filter expression for live capture, e.g. "port 27017".
    #[clap(short = 'e', long)]
    expr: Option<String>,

    /// OS capture buffer size in bytes for live capture.
    #[clap(short = 'b', long)]
    buf_size: Option<i32>,

    /// Gzip-compress the trace stream.
    #[clap(long)]
    gzip: bool,

    /// Output trace path.
    #[clap(short, long)]
    out: PathBuf,
}

#[derive(Args)]
pub struct PlayArgs {
    /// Trace file to replay.
    trace: PathBuf,

    /// Target server, as host:port or a connection URI.
    #[clap(long)]
    host: String,

    /// Number of times to replay the trace.
    #[clap(long)]
    repeat: Option<u32>,

    /// Playback speed multiplier.
    #[clap(long)]
    speed: Option<f64>,

    /// Share cursor mappings across generations instead of isolating them.
    #[clap(long)]
    shared_cursors: bool,

    /// Write stat records (JSON lines) to this file instead of stdout.
    #[clap(long)]
    report: Option<PathBuf>,
}

#[derive(Args)]
pub struct MonitorArgs {
    /// Read operations from a trace file.
    #[clap(short = 't', long, conflicts_with_all = &["pcap", "interface"])]
    trace: Option<PathBuf>,

    /// Read packets from a pcap file.
    #[clap(short = 'f', long, conflicts_with = "interface")]
    pcap: Option<PathBuf>,

    /// Capture packets live from this network interface.
    #[clap(short = 'i', long)]
    interface: Option<String>,

    /// BPF filter expression for live capture.
    #[clap(short = 'e', long)]
    expr: Option<String>,

    /// Pair each request with its reply and emit one record per pair.
    #[clap(long)]
    paired: bool,

    /// Render a terminal table instead of JSON lines.
    #[clap(long)]
    terminal: bool,
}

fn load(cli: &Cli) -> Result<EngineConfig> {
    match &cli.config {
        Some(path) => load_config(path),
        None => Ok(default_config()),
    }
}

/// Set on SIGINT/SIGTERM; every pipeline drains and exits cleanly.
fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        log::info!("termination signal received");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("installing signal handler")?;
    Ok(flag)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = (|| -> Result<i32> {
        let config = load(&cli)?;
        let shutdown = shutdown_flag()?;
        match &cli.command {
            Command::Record(args) => record::run(args, config, shutdown),
            Command::Play(args) => play::run(args, config, shutdown),
            Command::Monitor(args) => monitor::run(args, config, shutdown),
        }
    })();

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            log::error!("{:#}", e);
            process::exit(1);
        }
    }
}
