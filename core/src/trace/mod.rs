//! The trace container: a length-delimited, self-describing record format
//! with a validating magic.
//!
//! Layout, in file order:
//!
//! ```text
//! MAGIC      : u32 little-endian = 0x8199E26D
//! FORMAT_VER : u32 length-prefixed UTF-8 string, currently "0.1"
//! HEADER     : length-prefixed document
//!              { server_version, tool_version, concurrent_collections }
//! RECORDS    : repeated length-prefixed documents, one per RecordedOp
//! ```
//!
//! The byte stream after the magic may optionally be gzip-compressed; the
//! reader sniffs the gzip magic and falls back to raw. There is exactly one
//! on-disk record shape: `seen` is an `i64` nanosecond Unix timestamp, and a
//! reader encountering any other version string stops with a clear error.

mod reader;
mod writer;

pub use self::reader::TraceReader;
pub use self::writer::TraceWriter;

use std::time::Instant;

use thiserror::Error;

use crate::capture::conn_id::Endpoint;
use crate::time::CaptureTime;
use crate::wire::document::{DocBuilder, Document, DocumentError};
use crate::wire::{MessageHeader, RawMessage};

/// Trace file magic, little-endian.
pub const TRACE_MAGIC: u32 = 0x8199_E26D;

/// On-disk format version.
pub const FORMAT_VERSION: &str = "0.1";

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("invalid trace magic {found:#010x}, want {TRACE_MAGIC:#010x}")]
    BadMagic { found: u32 },

    #[error("unsupported trace format version {found:?}, want {FORMAT_VERSION:?}")]
    UnsupportedVersion { found: String },

    #[error("record {order}: {source}")]
    BadRecord {
        order: i64,
        source: DocumentError,
    },

    #[error("record {order}: missing field {field:?}")]
    MissingField { order: i64, field: &'static str },

    #[error("truncated trace: {0}")]
    Truncated(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Static description written at the head of every trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub server_version: String,
    pub tool_version: String,
    pub concurrent_collections: i32,
}

impl Default for TraceHeader {
    fn default() -> Self {
        TraceHeader {
            server_version: "unknown".to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            concurrent_collections: 0,
        }
    }
}

impl TraceHeader {
    fn to_document(&self) -> Vec<u8> {
        DocBuilder::new()
            .append_str("server_version", &self.server_version)
            .append_str("tool_version", &self.tool_version)
            .append_i32("concurrent_collections", self.concurrent_collections)
            .finish()
    }

    fn from_document(bytes: &[u8]) -> Result<TraceHeader, TraceError> {
        let doc = Document::at_start(bytes).map_err(|source| TraceError::BadRecord {
            order: -1,
            source,
        })?;
        let field = |name: &'static str| {
            doc.get(name)
                .ok_or(TraceError::MissingField { order: -1, field: name })
        };
        Ok(TraceHeader {
            server_version: field("server_version")?
                .as_str()
                .unwrap_or_default()
                .to_string(),
            tool_version: field("tool_version")?
                .as_str()
                .unwrap_or_default()
                .to_string(),
            concurrent_collections: field("concurrent_collections")?.as_i32().unwrap_or(0),
        })
    }
}

/// One captured operation, as persisted in and restored from a trace.
#[derive(Debug, Clone)]
pub struct RecordedOp {
    /// The framed message. Synthetic EOF records carry an empty placeholder.
    pub raw: RawMessage,
    /// When the message's first byte was observed.
    pub seen: CaptureTime,
    /// Direction of travel.
    pub src_endpoint: Endpoint,
    pub dst_endpoint: Endpoint,
    /// Stable within a capture; assigned by the demuxer.
    pub connection_id: i64,
    /// Strictly monotonic emission index; assigned by the reader.
    pub order: i64,
    /// Synthetic marker: the connection closed.
    pub eof: bool,
    /// Assigned at replay time, never persisted.
    pub generation: i32,
    /// Scheduled execution instant, annotated by the replay scheduler.
    pub play_at: Option<Instant>,
}

impl RecordedOp {
    pub fn message(
        raw: RawMessage,
        seen: CaptureTime,
        src_endpoint: Endpoint,
        dst_endpoint: Endpoint,
        connection_id: i64,
    ) -> Self {
        RecordedOp {
            raw,
            seen,
            src_endpoint,
            dst_endpoint,
            connection_id,
            order: 0,
            eof: false,
            generation: 0,
            play_at: None,
        }
    }

    /// The synthetic end-of-connection marker.
    pub fn eof(
        src_endpoint: Endpoint,
        dst_endpoint: Endpoint,
        connection_id: i64,
        seen: CaptureTime,
    ) -> Self {
        let header = MessageHeader {
            length: crate::wire::HEADER_LEN as i32,
            request_id: 0,
            response_to: 0,
            op_code: 0,
        };
        RecordedOp {
            raw: RawMessage { header, body: vec![] },
            seen,
            src_endpoint,
            dst_endpoint,
            connection_id,
            order: 0,
            eof: true,
            generation: 0,
            play_at: None,
        }
    }

    fn to_document(&self) -> Vec<u8> {
        let header = DocBuilder::new()
            .append_i32("length", self.raw.header.length)
            .append_i32("request_id", self.raw.header.request_id)
            .append_i32("response_to", self.raw.header.response_to)
            .append_i32("op_code", self.raw.header.op_code)
            .finish();
        DocBuilder::new()
            .append_i64("seen", self.seen.as_nanos())
            .append_str("src", self.src_endpoint.as_str())
            .append_str("dst", self.dst_endpoint.as_str())
            .append_i64("connection_id", self.connection_id)
            .append_bool("eof", self.eof)
            .append_doc("header", &header)
            .append_binary("body", &self.raw.body)
            .finish()
    }

    fn from_document(bytes: &[u8], order: i64) -> Result<RecordedOp, TraceError> {
        let doc =
            Document::at_start(bytes).map_err(|source| TraceError::BadRecord { order, source })?;
        let field = |name: &'static str| {
            doc.get(name)
                .ok_or(TraceError::MissingField { order, field: name })
        };

        let header_doc = field("header")?
            .as_document()
            .ok_or(TraceError::MissingField { order, field: "header" })?;
        let header_field = |name: &'static str| {
            header_doc
                .get(name)
                .and_then(|e| e.as_i32())
                .ok_or(TraceError::MissingField { order, field: name })
        };
        let header = MessageHeader {
            length: header_field("length")?,
            request_id: header_field("request_id")?,
            response_to: header_field("response_to")?,
            op_code: header_field("op_code")?,
        };
        let body = field("body")?
            .as_binary()
            .ok_or(TraceError::MissingField { order, field: "body" })?
            .to_vec();

        Ok(RecordedOp {
            raw: RawMessage { header, body },
            seen: CaptureTime::from_nanos(
                field("seen")?
                    .as_i64()
                    .ok_or(TraceError::MissingField { order, field: "seen" })?,
            ),
            src_endpoint: Endpoint::new(field("src")?.as_str().unwrap_or_default()),
            dst_endpoint: Endpoint::new(field("dst")?.as_str().unwrap_or_default()),
            connection_id: field("connection_id")?
                .as_i64()
                .ok_or(TraceError::MissingField { order, field: "connection_id" })?,
            order,
            eof: field("eof")?.as_bool().unwrap_or(false),
            generation: 0,
            play_at: None,
        })
    }
}
