//! The capture pipeline: packet source to time-sorted operation stream.
//!
//! A pcap source (file or live interface) feeds one capture thread that
//! parses frames, reassembles half-flows, and frames wire messages through
//! the demuxer. A second thread merges the per-connection output into one
//! time-sorted stream through the bounded heap. Consumers receive
//! [`RecordedOp`]s on a bounded channel; a slow consumer backpressures the
//! whole pipeline.

pub mod conn_id;
pub mod demux;
pub mod packet;
pub mod reassembly;
pub mod sort;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, tick, Receiver};
use pcap::{Activated, Capture};

use self::demux::{BidiDemuxer, CaptureCounters, DemuxConfig};
use self::packet::SegmentContext;
use crate::config::CaptureConfig;
use crate::time::CaptureTime;
use crate::trace::RecordedOp;

/// Totals reported when the pipeline finishes.
#[derive(Debug, Default, Clone)]
pub struct CaptureSummary {
    pub packets: u64,
    pub bytes: u64,
    pub malformed_frames: u64,
    pub desync_events: u64,
    pub messages: u64,
    /// Packets the OS reported dropping on a live capture. Nonzero maps to
    /// exit code 3 so CI can tell capture quality from tool failure.
    pub pcap_dropped: u64,
}

/// A source of timestamped frames: a pcap file or a live interface.
pub struct PacketSource {
    cap: Capture<dyn Activated>,
    live: bool,
}

// `Capture<dyn Activated>` erases the concrete capture type, which drops the
// `Send` the concrete `Active`/`Offline` types have. `PacketSource` is only
// ever owned by one thread at a time (it is moved wholesale into the capture
// thread in `spawn_pipeline`), so it is safe to send across threads.
unsafe impl Send for PacketSource {}

impl PacketSource {
    pub fn from_file(path: &str) -> Result<PacketSource> {
        let cap = Capture::from_file(path).with_context(|| format!("opening pcap {}", path))?;
        Ok(PacketSource {
            cap: cap.into(),
            live: false,
        })
    }

    /// Opens a live capture on `interface`, optionally constrained by a BPF
    /// expression.
    pub fn from_interface(
        interface: &str,
        config: &CaptureConfig,
        bpf: Option<&str>,
    ) -> Result<PacketSource> {
        let cap = Capture::from_device(interface)
            .with_context(|| format!("opening device {}", interface))?
            .promisc(true)
            .snaplen(config.snaplen)
            .buffer_size(config.buffer_size)
            .timeout(1000)
            .open()
            .with_context(|| format!("activating capture on {}", interface))?;
        let mut cap: Capture<dyn Activated> = cap.into();
        if let Some(expr) = bpf {
            cap.filter(expr)
                .with_context(|| format!("compiling BPF filter {:?}", expr))?;
        }
        Ok(PacketSource { cap, live: true })
    }

    fn dropped(&mut self) -> u64 {
        if !self.live {
            return 0;
        }
        match self.cap.stats() {
            Ok(stats) => stats.dropped as u64 + stats.if_dropped as u64,
            Err(e) => {
                log::warn!("could not read capture stats: {}", e);
                0
            }
        }
    }
}

/// Spawns the capture and sorting threads. Returns the time-sorted operation
/// stream and a handle resolving to the capture summary.
pub fn spawn_pipeline(
    mut source: PacketSource,
    config: &CaptureConfig,
    shutdown: Arc<AtomicBool>,
) -> (Receiver<RecordedOp>, JoinHandle<Result<CaptureSummary>>) {
    let (demux_tx, demux_rx) = bounded::<RecordedOp>(4096);
    let (sorted_tx, sorted_rx) = bounded::<RecordedOp>(4096);

    let heap_capacity = config.sort_heap_capacity;
    let sorter = thread::Builder::new()
        .name("sorter".to_string())
        .spawn(move || sort::run_sorter(demux_rx, sorted_tx, heap_capacity))
        .expect("spawn sorter thread");

    let demux_config = DemuxConfig::from(config);
    let flush_resolution = config.flush_resolution;
    let handle = thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            let counters = Arc::new(CaptureCounters::default());
            let mut demuxer = BidiDemuxer::new(demux_config, Arc::clone(&counters));
            let flush_ticker = tick(Duration::from_millis(flush_resolution as u64));

            let mut summary = CaptureSummary::default();
            let mut last_seen = CaptureTime::ZERO;

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    log::info!("capture interrupted, draining");
                    break;
                }
                if flush_ticker.try_recv().is_ok() {
                    let now = if source.live { CaptureTime::now() } else { last_seen };
                    for op in demuxer.flush_stale(now) {
                        if demux_tx.send(op).is_err() {
                            anyhow::bail!("message pipeline closed unexpectedly");
                        }
                    }
                }

                let frame = match source.cap.next() {
                    Ok(frame) => frame,
                    Err(pcap::Error::NoMorePackets) => break,
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        // a live handle can hiccup; a file source cannot
                        if source.live {
                            log::warn!("capture read error: {}", e);
                            continue;
                        }
                        return Err(e).context("reading capture");
                    }
                };

                summary.packets += 1;
                summary.bytes += frame.data.len() as u64;
                let seen = CaptureTime::from_timeval(
                    frame.header.ts.tv_sec as i64,
                    frame.header.ts.tv_usec as i64,
                );
                last_seen = seen;

                let ctxt = match SegmentContext::parse(frame.data) {
                    Ok(ctxt) => ctxt,
                    Err(_) => {
                        counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                let payload_end = (ctxt.offset + ctxt.length).min(frame.data.len());
                let payload = frame.data[ctxt.offset.min(payload_end)..payload_end].to_vec();

                for op in demuxer.process(&ctxt, &payload, seen) {
                    if demux_tx.send(op).is_err() {
                        anyhow::bail!("message pipeline closed unexpectedly");
                    }
                }
            }

            let now = if source.live { CaptureTime::now() } else { last_seen };
            for op in demuxer.drain(now) {
                if demux_tx.send(op).is_err() {
                    break;
                }
            }
            drop(demux_tx);
            if sorter.join().is_err() {
                log::error!("sorter thread panicked");
            }

            summary.malformed_frames = counters.malformed_frames.load(Ordering::Relaxed);
            summary.desync_events = counters.desync_events.load(Ordering::Relaxed);
            summary.messages = counters.messages.load(Ordering::Relaxed);
            summary.pcap_dropped = source.dropped();
            log::info!(
                "capture done: {} packets, {} bytes, {} messages, {} malformed, {} desyncs, {} dropped",
                summary.packets,
                summary.bytes,
                summary.messages,
                summary.malformed_frames,
                summary.desync_events,
                summary.pcap_dropped,
            );
            Ok(summary)
        })
        .expect("spawn capture thread");

    (sorted_rx, handle)
}
