//! Background stat recording: line-delimited JSON or a terminal table.

use std::io::Write;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use crossbeam::channel::Receiver;
use prettytable::{format, row, Table};

use crate::stats::StatRecord;

/// Output rendering chosen at construction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatFormat {
    /// One JSON object per line.
    JsonLines,
    /// Column-aligned table chunks.
    Terminal,
}

/// Rows buffered before a terminal-format flush.
const TERMINAL_CHUNK: usize = 32;

/// Spawns the recorder thread consuming `rx` until it disconnects. Resolves
/// to the number of records written.
pub fn spawn_recorder(
    rx: Receiver<StatRecord>,
    stat_format: StatFormat,
    out: Box<dyn Write + Send>,
) -> JoinHandle<Result<u64>> {
    thread::Builder::new()
        .name("stat-recorder".to_string())
        .spawn(move || run_recorder(rx, stat_format, out))
        .expect("spawn stat recorder thread")
}

fn run_recorder(
    rx: Receiver<StatRecord>,
    stat_format: StatFormat,
    mut out: Box<dyn Write + Send>,
) -> Result<u64> {
    let mut written = 0u64;
    match stat_format {
        StatFormat::JsonLines => {
            for record in rx.iter() {
                serde_json::to_writer(&mut out, &record)?;
                out.write_all(b"\n")?;
                written += 1;
            }
            out.flush()?;
        }
        StatFormat::Terminal => {
            let mut chunk: Vec<StatRecord> = Vec::with_capacity(TERMINAL_CHUNK);
            let mut first = true;
            for record in rx.iter() {
                chunk.push(record);
                written += 1;
                if chunk.len() >= TERMINAL_CHUNK {
                    flush_table(&mut out, &chunk, first)?;
                    first = false;
                    chunk.clear();
                }
            }
            if !chunk.is_empty() {
                flush_table(&mut out, &chunk, first)?;
            }
            out.flush()?;
        }
    }
    Ok(written)
}

fn flush_table(out: &mut dyn Write, records: &[StatRecord], titles: bool) -> Result<()> {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_CLEAN);
    if titles {
        table.set_titles(row![
            "order", "conn", "op", "ns", "latency_us", "lag_us", "n", "errors", "detail"
        ]);
    }
    for record in records {
        let errors = if record.errors.is_empty() {
            String::new()
        } else {
            record.errors.join("; ")
        };
        table.add_row(row![
            record.order,
            record.connection_id,
            record
                .command
                .as_deref()
                .unwrap_or(record.op_type.as_str()),
            record.ns,
            record
                .latency_us
                .map(|v| v.to_string())
                .unwrap_or_default(),
            record
                .playback_lag_us
                .map(|v| v.to_string())
                .unwrap_or_default(),
            record
                .n_returned
                .map(|v| v.to_string())
                .unwrap_or_default(),
            errors,
            record.summary,
        ]);
    }
    table.print(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::sync::{Arc, Mutex};

    /// Shared in-memory writer the recorder thread can own.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sample(order: i64) -> StatRecord {
        StatRecord {
            order,
            op_type: "query".to_string(),
            ns: "app.users".to_string(),
            connection_id: 1,
            request_id: 7,
            latency_us: Some(120),
            ..Default::default()
        }
    }

    #[test]
    fn json_lines_one_object_per_record() {
        let (tx, rx) = bounded(8);
        let buf = SharedBuf::default();
        let handle = spawn_recorder(rx, StatFormat::JsonLines, Box::new(buf.clone()));
        tx.send(sample(0)).unwrap();
        tx.send(sample(1)).unwrap();
        drop(tx);
        assert_eq!(handle.join().unwrap().unwrap(), 2);

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["order"], 0);
        assert_eq!(parsed["op_type"], "query");
        assert_eq!(parsed["latency_us"], 120);
        // absent optionals are omitted entirely
        assert!(parsed.get("play_at").is_none());
    }

    #[test]
    fn terminal_format_renders_rows() {
        let (tx, rx) = bounded(8);
        let buf = SharedBuf::default();
        let handle = spawn_recorder(rx, StatFormat::Terminal, Box::new(buf.clone()));
        tx.send(sample(0)).unwrap();
        drop(tx);
        assert_eq!(handle.join().unwrap().unwrap(), 1);

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("app.users"));
        assert!(text.contains("order"));
    }
}
