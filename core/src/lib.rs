//! Capture-and-replay engine for a document database wire protocol.
//!
//! Wireplay observes client/server traffic on the wire, persists a structured,
//! time-annotated trace, and later replays that trace against a live server
//! while preserving per-connection ordering, relative timing, and cursor
//! continuity.
//!
//! The pipeline, capture side first:
//!
//! - [`capture`]: a packet source (pcap file or live interface) feeds per
//!   half-flow TCP reassembly; a per-direction state machine recovers framed
//!   wire messages; opposite half-flows are paired into logical connections;
//!   a bounded min-heap merges all connections into one time-sorted stream.
//! - [`trace`]: a length-delimited, self-describing record container with a
//!   validating magic, used to persist and later stream captured operations.
//! - [`replay`]: a scheduler that dispatches recorded operations to one
//!   worker per recorded connection, honoring recorded inter-arrival times
//!   across one or more replay generations.
//! - [`correlate`]: a two-sided pending-reply cache that pairs recorded
//!   replies with live replies to build the recorded-to-live cursor map used
//!   for getMore/killCursors rewriting.
//! - [`stats`]: per-operation stat generation, rendered as JSON lines or a
//!   terminal table.

pub mod capture;
pub mod config;
pub mod correlate;
pub mod replay;
pub mod stats;
mod time;
pub mod trace;
pub mod wire;

pub use self::capture::conn_id::{ConnectionKey, Endpoint};
pub use self::time::CaptureTime;
pub use self::trace::RecordedOp;
pub use self::wire::{MessageHeader, OpCode, RawMessage};
