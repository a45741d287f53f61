//! Configuration options.
//!
//! Applications are free to define their own command line arguments; the
//! engine itself is configured through this module. Every knob has a default
//! suitable for moderate traffic, and all of them can be loaded from a TOML
//! file whose path is typically a command line argument. CLI flags override
//! individual fields after loading.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig> {
    let config_str = fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.as_ref().display()))?;
    let config: EngineConfig = toml::from_str(&config_str).context("invalid config file")?;
    config.validate()?;
    Ok(config)
}

/// Returns the default configuration.
pub fn default_config() -> EngineConfig {
    EngineConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Engine-wide configuration options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct EngineConfig {
    /// Capture-side settings (record and monitor).
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Replay-side settings (play).
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Stat output settings.
    #[serde(default)]
    pub stats: StatsConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capture.max_message_size < 16 {
            bail!("capture.max_message_size must be at least 16 bytes");
        }
        if self.capture.sort_heap_capacity == 0 {
            bail!("capture.sort_heap_capacity must be nonzero");
        }
        if self.replay.speed <= 0.0 {
            bail!("replay.speed must be positive");
        }
        if self.replay.repeat == 0 {
            bail!("replay.repeat must be at least 1");
        }
        Ok(())
    }
}

/// Capture-side settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CaptureConfig {
    /// Largest plausible wire message, header included. Headers declaring a
    /// larger total length desynchronize the half-flow instead of allocating.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Capacity of the time-ordering merge heap. Bounds the reorder distance
    /// of the emitted stream.
    #[serde(default = "default_sort_heap_capacity")]
    pub sort_heap_capacity: usize,

    /// Maximum number of out-of-order TCP segments buffered per half-flow.
    #[serde(default = "default_max_out_of_order")]
    pub max_out_of_order: usize,

    /// Time before a half-flow's buffered out-of-order segments are flushed
    /// as a byte gap (in milliseconds).
    #[serde(default = "default_stale_flush_timeout")]
    pub stale_flush_timeout: usize,

    /// Frequency of the stale-buffer check (in milliseconds).
    #[serde(default = "default_flush_resolution")]
    pub flush_resolution: usize,

    /// Snapshot length for live captures.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,

    /// OS capture buffer size for live captures, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: i32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            max_message_size: default_max_message_size(),
            sort_heap_capacity: default_sort_heap_capacity(),
            max_out_of_order: default_max_out_of_order(),
            stale_flush_timeout: default_stale_flush_timeout(),
            flush_resolution: default_flush_resolution(),
            snaplen: default_snaplen(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Replay-side settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReplayConfig {
    /// Number of replay generations. Each generation replays the whole trace
    /// with a fresh set of workers.
    #[serde(default = "default_repeat")]
    pub repeat: u32,

    /// Playback speed multiplier applied to recorded inter-arrival gaps.
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Longest a worker sleeps to honor a scheduled time before giving up and
    /// running at max speed (in milliseconds).
    #[serde(default = "default_max_lag")]
    pub max_lag: usize,

    /// Per-connection worker channel depth. A full channel backpressures the
    /// scheduler.
    #[serde(default = "default_worker_queue_depth")]
    pub worker_queue_depth: usize,

    /// Share one cursor map across all generations instead of isolating each
    /// generation's cursors.
    #[serde(default)]
    pub shared_cursors: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            repeat: default_repeat(),
            speed: default_speed(),
            max_lag: default_max_lag(),
            worker_queue_depth: default_worker_queue_depth(),
            shared_cursors: false,
        }
    }
}

/// Stat output settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StatsConfig {
    /// Stat channel depth between workers and the recorder thread. A full
    /// channel backpressures the producers; records are never dropped.
    #[serde(default = "default_stat_queue_depth")]
    pub queue_depth: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            queue_depth: default_stat_queue_depth(),
        }
    }
}

fn default_max_message_size() -> usize {
    48 * 1024 * 1024
}

fn default_sort_heap_capacity() -> usize {
    1000
}

fn default_max_out_of_order() -> usize {
    500
}

fn default_stale_flush_timeout() -> usize {
    300_000
}

fn default_flush_resolution() -> usize {
    1000
}

fn default_snaplen() -> i32 {
    65535
}

fn default_buffer_size() -> i32 {
    16 * 1024 * 1024
}

fn default_repeat() -> u32 {
    1
}

fn default_speed() -> f64 {
    1.0
}

fn default_max_lag() -> usize {
    1000
}

fn default_worker_queue_depth() -> usize {
    10_000
}

fn default_stat_queue_depth() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        default_config().validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [capture]
            sort_heap_capacity = 200

            [replay]
            speed = 2.5
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.sort_heap_capacity, 200);
        assert_eq!(config.capture.max_message_size, 48 * 1024 * 1024);
        assert_eq!(config.replay.speed, 2.5);
        assert_eq!(config.replay.repeat, 1);
    }

    #[test]
    fn rejects_zero_speed() {
        let mut config = default_config();
        config.replay.speed = 0.0;
        assert!(config.validate().is_err());
    }
}
