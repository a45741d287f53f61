//! The `record` subcommand: capture pipeline into a trace file.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use wireplay_core::capture::{spawn_pipeline, PacketSource};
use wireplay_core::config::EngineConfig;
use wireplay_core::trace::{TraceHeader, TraceWriter};

use crate::{RecordArgs, EXIT_PACKETS_DROPPED};

pub fn run(args: &RecordArgs, mut config: EngineConfig, shutdown: Arc<AtomicBool>) -> Result<i32> {
    if let Some(buf_size) = args.buf_size {
        config.capture.buffer_size = buf_size;
    }
    config.validate()?;

    let source = match (&args.pcap, &args.interface) {
        (Some(path), _) => PacketSource::from_file(&path.to_string_lossy())?,
        (None, Some(interface)) => {
            PacketSource::from_interface(interface, &config.capture, args.expr.as_deref())?
        }
        (None, None) => bail!("record needs either a pcap file or an interface"),
    };

    let mut writer = TraceWriter::create(&args.out, &TraceHeader::default(), args.gzip)
        .with_context(|| format!("creating trace {}", args.out.display()))?;

    let (ops, capture) = spawn_pipeline(source, &config.capture, shutdown);
    for op in ops.iter() {
        writer.write_op(&op)?;
    }
    let records = writer.records();
    writer.finish()?;

    let summary = match capture.join() {
        Ok(summary) => summary?,
        Err(_) => bail!("capture thread panicked"),
    };
    log::info!(
        "wrote {} records ({} messages framed) to {}",
        records,
        summary.messages,
        args.out.display()
    );

    if summary.pcap_dropped > 0 {
        log::warn!("{} packets dropped during capture", summary.pcap_dropped);
        return Ok(EXIT_PACKETS_DROPPED);
    }
    Ok(0)
}
