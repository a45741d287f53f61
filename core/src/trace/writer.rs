//! Append-only trace writing.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::trace::{RecordedOp, TraceError, TraceHeader, FORMAT_VERSION, TRACE_MAGIC};

enum Sink<W: Write> {
    Raw(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Raw(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Raw(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

/// Serializes recorded operations into the trace container.
///
/// Single-producer: callers must serialize access. The magic is always
/// written raw; everything after it is optionally gzip-compressed.
pub struct TraceWriter<W: Write> {
    sink: Sink<W>,
    records: u64,
}

impl TraceWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(
        path: P,
        header: &TraceHeader,
        gzip: bool,
    ) -> Result<Self, TraceError> {
        let file = BufWriter::new(File::create(path)?);
        TraceWriter::new(file, header, gzip)
    }
}

impl<W: Write> TraceWriter<W> {
    pub fn new(mut inner: W, header: &TraceHeader, gzip: bool) -> Result<Self, TraceError> {
        inner.write_u32::<LittleEndian>(TRACE_MAGIC)?;
        let mut sink = if gzip {
            Sink::Gzip(GzEncoder::new(inner, Compression::default()))
        } else {
            Sink::Raw(inner)
        };
        sink.write_u32::<LittleEndian>(FORMAT_VERSION.len() as u32)?;
        sink.write_all(FORMAT_VERSION.as_bytes())?;
        sink.write_all(&header.to_document())?;
        Ok(TraceWriter { sink, records: 0 })
    }

    pub fn write_op(&mut self, op: &RecordedOp) -> Result<(), TraceError> {
        self.sink.write_all(&op.to_document())?;
        self.records += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flushes and, for compressed traces, terminates the gzip stream.
    pub fn finish(self) -> Result<(), TraceError> {
        match self.sink {
            Sink::Raw(mut w) => w.flush()?,
            Sink::Gzip(gz) => {
                gz.finish()?.flush()?;
            }
        }
        Ok(())
    }
}
