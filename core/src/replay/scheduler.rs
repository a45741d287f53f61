//! The replay scheduler.
//!
//! Reads the trace once per generation, annotates each record with its
//! scheduled execution instant, and dispatches it to the per-connection
//! worker channel (created on demand, one worker thread per recorded
//! connection per generation). Channels are FIFO, so per-connection trace
//! order is preserved; across connections only `play_at` timing orders
//! execution. A full worker channel backpressures this loop, which in turn
//! backpressures the trace reader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, tick, Sender};

use crate::config::ReplayConfig;
use crate::correlate::{Correlator, CursorMap, PENDING_REPLY_TTL};
use crate::replay::session::parse_target;
use crate::replay::worker::{run_worker, WorkerContext};
use crate::stats::{StatRecord, StatSink};
use crate::time::scale_gap;
use crate::trace::{RecordedOp, TraceReader};

/// Period of the correlator housekeeping tick.
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Totals reported when the replay finishes.
#[derive(Debug, Default, Clone)]
pub struct ReplaySummary {
    pub generations_run: u32,
    pub dispatched: u64,
    /// Records read but not dispatched after a generation was cancelled.
    pub skipped_after_error: u64,
}

/// Replays a recorded trace against a live server.
pub struct Scheduler {
    trace_path: PathBuf,
    target: String,
    config: ReplayConfig,
    stats: StatSink,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        trace_path: &Path,
        target_uri: &str,
        config: ReplayConfig,
        stats: StatSink,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Scheduler> {
        Ok(Scheduler {
            trace_path: trace_path.to_path_buf(),
            target: parse_target(target_uri)?,
            config,
            stats,
            shutdown,
        })
    }

    /// Runs every generation to completion. A worker error kills its own
    /// generation; later generations still run, and the first error is
    /// returned at the end.
    pub fn run(&self) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        let shared_cursors = self
            .config
            .shared_cursors
            .then(|| Arc::new(CursorMap::new()));
        let mut first_error: Option<anyhow::Error> = None;

        for generation in 0..self.config.repeat {
            if self.shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                log::info!("shutdown requested, stopping before generation {}", generation);
                break;
            }
            // each generation runs fresh workers and, unless sharing is
            // requested, fresh cursor state
            let cursors = shared_cursors
                .clone()
                .unwrap_or_else(|| Arc::new(CursorMap::new()));
            log::info!(
                "generation {} of {} starting",
                generation + 1,
                self.config.repeat
            );
            match self.run_generation(generation as i32, cursors, &mut summary) {
                Ok(()) => {}
                Err(e) => {
                    log::error!("generation {} failed: {}", generation, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            summary.generations_run += 1;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn run_generation(
        &self,
        generation: i32,
        cursors: Arc<CursorMap>,
        summary: &mut ReplaySummary,
    ) -> Result<()> {
        let mut reader = TraceReader::open(&self.trace_path)
            .with_context(|| format!("opening trace {}", self.trace_path.display()))?;

        let ctx = Arc::new(WorkerContext {
            target: self.target.clone(),
            cursors: Arc::clone(&cursors),
            correlator: Arc::new(Correlator::new()),
            stats: self.stats.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            cancellers: Mutex::new(vec![]),
            max_lag: Duration::from_millis(self.config.max_lag as u64),
        });
        let housekeeping = spawn_housekeeping(Arc::clone(&ctx));

        let playback_start = Instant::now();
        let mut recording_start = None;
        let mut channels: HashMap<i64, Sender<RecordedOp>> = HashMap::new();
        let mut workers: Vec<(i64, JoinHandle<Result<()>>)> = vec![];

        let mut read_error = None;
        loop {
            let mut record = match reader.next_op() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    // fatal: stop dispatching, fail the generation
                    read_error = Some(anyhow::Error::new(e).context("decoding trace"));
                    break;
                }
            };
            if ctx.cancelled() || self.shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                // drain the remainder into a no-op sink
                summary.skipped_after_error += 1;
                continue;
            }

            record.generation = generation;
            let recording_start = *recording_start.get_or_insert(record.seen);
            record.play_at = Some(
                playback_start + scale_gap(record.seen - recording_start, self.config.speed),
            );

            let connection_id = record.connection_id;
            let sender = channels.entry(connection_id).or_insert_with(|| {
                let (tx, rx) = bounded(self.config.worker_queue_depth);
                let worker_ctx = Arc::clone(&ctx);
                let handle = thread::Builder::new()
                    .name(format!("replay-g{}-c{}", generation, connection_id))
                    .spawn(move || run_worker(worker_ctx, connection_id, rx))
                    .expect("spawn replay worker");
                workers.push((connection_id, handle));
                tx
            });
            if sender.send(record).is_err() {
                log::error!("worker for connection {} died early", connection_id);
            } else {
                summary.dispatched += 1;
            }
        }

        // close all channels, wait for workers to finish in-flight ops
        drop(channels);
        let mut worker_error: Option<anyhow::Error> = None;
        for (connection_id, handle) in workers {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if worker_error.is_none() {
                        worker_error = Some(e.context(format!("connection {}", connection_id)));
                    }
                }
                Err(_) => log::error!("worker for connection {} panicked", connection_id),
            }
        }
        housekeeping.stop();

        // anything still one-sided is unresolved
        for unresolved in ctx
            .correlator
            .sweep(&ctx.cursors, Instant::now() + PENDING_REPLY_TTL)
        {
            self.stats.record(StatRecord::unresolved(&unresolved));
        }

        if let Some(e) = read_error.or(worker_error) {
            return Err(e);
        }
        Ok(())
    }
}

struct Housekeeping {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Housekeeping {
    fn stop(self) {
        drop(self.stop_tx);
        if self.handle.join().is_err() {
            log::error!("housekeeping thread panicked");
        }
    }
}

/// TTL eviction on a periodic tick; evicted one-sided pairs surface as
/// unresolved stats while the generation is still running.
fn spawn_housekeeping(ctx: Arc<WorkerContext>) -> Housekeeping {
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let handle = thread::Builder::new()
        .name("correlator-sweep".to_string())
        .spawn(move || {
            let ticker = tick(SWEEP_PERIOD);
            loop {
                crossbeam::select! {
                    recv(ticker) -> _ => {
                        for unresolved in ctx.correlator.sweep(&ctx.cursors, Instant::now()) {
                            ctx.stats.record(StatRecord::unresolved(&unresolved));
                        }
                    }
                    recv(stop_rx) -> _ => return,
                }
            }
        })
        .expect("spawn housekeeping thread");
    Housekeeping { stop_tx, handle }
}
