//! Streaming trace decoding.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use flate2::read::GzDecoder;

use crate::trace::{RecordedOp, TraceError, TraceHeader, FORMAT_VERSION, TRACE_MAGIC};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Sequential decoder for the trace container.
///
/// Emits records in file order, assigning `order` starting at 0. Decode
/// errors (bad magic, truncated record, corrupt length) are fatal: the
/// iterator reports the error once and then stops.
pub struct TraceReader {
    source: Box<dyn Read + Send>,
    header: TraceHeader,
    next_order: i64,
    poisoned: bool,
}

impl TraceReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        TraceReader::new(BufReader::new(File::open(path)?))
    }

    pub fn new<R: Read + Send + 'static>(inner: R) -> Result<Self, TraceError> {
        let mut buffered = BufReader::new(inner);
        let magic = buffered.read_u32::<LittleEndian>()?;
        if magic != TRACE_MAGIC {
            return Err(TraceError::BadMagic { found: magic });
        }

        // the stream after the magic is gzip-compressed iff it opens with
        // the gzip magic
        let head = buffered.fill_buf()?;
        let mut source: Box<dyn Read + Send> = if head.len() >= 2 && head[..2] == GZIP_MAGIC {
            Box::new(GzDecoder::new(buffered))
        } else {
            Box::new(buffered)
        };

        let version_len = source.read_u32::<LittleEndian>()? as usize;
        if version_len > 64 {
            return Err(TraceError::Truncated(format!(
                "version string length {} out of range",
                version_len
            )));
        }
        let mut version = vec![0u8; version_len];
        source.read_exact(&mut version)?;
        let version = String::from_utf8_lossy(&version).to_string();
        if version != FORMAT_VERSION {
            return Err(TraceError::UnsupportedVersion { found: version });
        }

        let header_doc = read_document(&mut source)?
            .ok_or_else(|| TraceError::Truncated("missing trace header".to_string()))?;
        let header = TraceHeader::from_document(&header_doc)?;

        Ok(TraceReader {
            source,
            header,
            next_order: 0,
            poisoned: false,
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    /// Reads the next record, or `None` at a clean end of stream.
    pub fn next_op(&mut self) -> Result<Option<RecordedOp>, TraceError> {
        if self.poisoned {
            return Ok(None);
        }
        let doc = match read_document(&mut self.source) {
            Ok(Some(doc)) => doc,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.poisoned = true;
                return Err(e);
            }
        };
        let op = RecordedOp::from_document(&doc, self.next_order).map_err(|e| {
            self.poisoned = true;
            e
        })?;
        self.next_order += 1;
        Ok(Some(op))
    }
}

impl Iterator for TraceReader {
    type Item = Result<RecordedOp, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_op().transpose()
    }
}

/// Reads one length-prefixed document. A clean EOF before the length prefix
/// yields `None`; anything torn mid-record is an error.
fn read_document(source: &mut (dyn Read + Send)) -> Result<Option<Vec<u8>>, TraceError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = source.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TraceError::Truncated(
                "torn length prefix at end of trace".to_string(),
            ));
        }
        filled += n;
    }
    let len = LittleEndian::read_i32(&len_buf);
    if !(5..=256 * 1024 * 1024).contains(&len) {
        return Err(TraceError::Truncated(format!(
            "corrupt record length {}",
            len
        )));
    }
    let mut doc = vec![0u8; len as usize];
    doc[..4].copy_from_slice(&len_buf);
    source
        .read_exact(&mut doc[4..])
        .map_err(|_| TraceError::Truncated(format!("record torn, expected {} bytes", len)))?;
    Ok(Some(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::tests::sample_op;
    use crate::trace::TraceWriter;
    use std::io::Cursor;

    fn write_trace(ops: &[RecordedOp], gzip: bool) -> Vec<u8> {
        let mut buf = vec![];
        let mut writer = TraceWriter::new(&mut buf, &TraceHeader::default(), gzip).unwrap();
        for op in ops {
            writer.write_op(op).unwrap();
        }
        writer.finish().unwrap();
        buf
    }

    #[test]
    fn roundtrip_assigns_monotonic_order() {
        let ops = vec![
            sample_op(0, 100, vec![1, 2, 3]),
            sample_op(1, 200, vec![4, 5]),
            sample_op(0, 300, vec![]),
        ];
        let bytes = write_trace(&ops, false);
        let reader = TraceReader::new(Cursor::new(bytes)).unwrap();
        let read: Vec<RecordedOp> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(read.len(), 3);
        for (i, op) in read.iter().enumerate() {
            assert_eq!(op.order, i as i64);
            assert_eq!(op.raw.body, ops[i].raw.body);
            assert_eq!(op.seen, ops[i].seen);
        }
    }

    #[test]
    fn gzip_roundtrip() {
        let ops = vec![sample_op(0, 100, vec![0u8; 4096])];
        let bytes = write_trace(&ops, true);
        let raw_bytes = write_trace(&ops, false);
        assert!(bytes.len() < raw_bytes.len(), "gzip should compress zeros");

        let reader = TraceReader::new(Cursor::new(bytes)).unwrap();
        let read: Vec<RecordedOp> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].raw.body, vec![0u8; 4096]);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = write_trace(&[], false);
        bytes[0] ^= 0xff;
        match TraceReader::new(Cursor::new(bytes)) {
            Err(TraceError::BadMagic { .. }) => {}
            other => panic!("expected BadMagic, got {:?}", other.err()),
        }
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut bytes = write_trace(&[], false);
        // version string starts after magic (4) + length prefix (4)
        bytes[8] = b'9';
        match TraceReader::new(Cursor::new(bytes)) {
            Err(TraceError::UnsupportedVersion { found }) => assert_eq!(found, "9.1"),
            other => panic!("expected UnsupportedVersion, got {:?}", other.err()),
        }
    }

    #[test]
    fn truncated_record_is_fatal() {
        let ops = vec![sample_op(0, 100, vec![1; 64])];
        let mut bytes = write_trace(&ops, false);
        bytes.truncate(bytes.len() - 10);
        let mut reader = TraceReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.next_op().is_err());
        // poisoned: no further records
        assert!(reader.next_op().unwrap().is_none());
    }

    #[test]
    fn header_preserved() {
        let mut buf = vec![];
        let header = TraceHeader {
            server_version: "7.0.1".to_string(),
            tool_version: "x".to_string(),
            concurrent_collections: 2,
        };
        TraceWriter::new(&mut buf, &header, false)
            .unwrap()
            .finish()
            .unwrap();
        let reader = TraceReader::new(Cursor::new(buf)).unwrap();
        assert_eq!(reader.header(), &header);
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.trace");
        let mut writer =
            TraceWriter::create(&path, &TraceHeader::default(), false).unwrap();
        writer.write_op(&sample_op(0, 1, vec![1])).unwrap();
        writer.finish().unwrap();

        let reader = TraceReader::open(&path).unwrap();
        assert_eq!(reader.count(), 1);
    }
}
