//! The `play` subcommand: replay a trace against a live server.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use wireplay_core::config::EngineConfig;
use wireplay_core::replay::Scheduler;
use wireplay_core::stats::{spawn_recorder, StatFormat, StatSink};

use crate::PlayArgs;

pub fn run(args: &PlayArgs, mut config: EngineConfig, shutdown: Arc<AtomicBool>) -> Result<i32> {
    if let Some(repeat) = args.repeat {
        config.replay.repeat = repeat;
    }
    if let Some(speed) = args.speed {
        config.replay.speed = speed;
    }
    if args.shared_cursors {
        config.replay.shared_cursors = true;
    }
    config.validate()?;

    let out: Box<dyn Write + Send> = match &args.report {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating report {}", path.display()))?,
        )),
        None => Box::new(io::stdout()),
    };
    let (stats, stat_rx) = StatSink::channel(config.stats.queue_depth);
    let recorder = spawn_recorder(stat_rx, StatFormat::JsonLines, out);

    let scheduler = Scheduler::new(
        &args.trace,
        &args.host,
        config.replay.clone(),
        stats,
        shutdown,
    )?;
    let result = scheduler.run();
    drop(scheduler);

    let written = match recorder.join() {
        Ok(written) => written?,
        Err(_) => {
            log::error!("stat recorder panicked");
            0
        }
    };

    let summary = result?;
    log::info!(
        "replayed {} generation(s), {} ops dispatched, {} stat records",
        summary.generations_run,
        summary.dispatched,
        written
    );
    Ok(0)
}
