//! The `monitor` subcommand: per-operation stats from a trace or a capture.

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use wireplay_core::capture::{spawn_pipeline, PacketSource};
use wireplay_core::config::EngineConfig;
use wireplay_core::stats::{spawn_recorder, LiveAggregator, StatFormat, StatSink};
use wireplay_core::trace::TraceReader;

use crate::MonitorArgs;

pub fn run(args: &MonitorArgs, config: EngineConfig, shutdown: Arc<AtomicBool>) -> Result<i32> {
    let stat_format = if args.terminal {
        StatFormat::Terminal
    } else {
        StatFormat::JsonLines
    };
    let (stats, stat_rx) = StatSink::channel(config.stats.queue_depth);
    let recorder = spawn_recorder(stat_rx, stat_format, Box::new(io::stdout()));
    let mut aggregator = LiveAggregator::new(args.paired);

    if let Some(trace) = &args.trace {
        let mut reader = TraceReader::open(trace)?;
        while let Some(record) = reader.next_op()? {
            for stat in aggregator.observe(&record, Instant::now()) {
                stats.record(stat);
            }
        }
    } else {
        let source = match (&args.pcap, &args.interface) {
            (Some(path), _) => PacketSource::from_file(&path.to_string_lossy())?,
            (None, Some(interface)) => {
                PacketSource::from_interface(interface, &config.capture, args.expr.as_deref())?
            }
            (None, None) => bail!("monitor needs a trace, a pcap file, or an interface"),
        };
        let (ops, capture) = spawn_pipeline(source, &config.capture, shutdown);
        for record in ops.iter() {
            for stat in aggregator.observe(&record, Instant::now()) {
                stats.record(stat);
            }
        }
        match capture.join() {
            Ok(summary) => {
                summary?;
            }
            Err(_) => bail!("capture thread panicked"),
        }
    }

    for stat in aggregator.finish() {
        stats.record(stat);
    }
    drop(stats);

    match recorder.join() {
        Ok(written) => log::info!("{} stat records", written?),
        Err(_) => log::error!("stat recorder panicked"),
    }
    Ok(0)
}
