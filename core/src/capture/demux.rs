//! Bidirectional stream demultiplexing.
//!
//! Each logical connection pairs two half-flows under an unordered
//! [`ConnectionKey`]. Per half-flow, a state machine walks the reassembled
//! byte stream and recovers framed wire messages, resynchronizing on a
//! plausible header after gaps or mid-stream starts. Recovered messages are
//! tagged with endpoints, capture timestamp, and a connection id that is
//! stable within the capture.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use hashlink::linked_hash_map::{LinkedHashMap, RawEntryMut};

use crate::capture::conn_id::{ConnectionKey, Endpoint};
use crate::capture::packet::SegmentContext;
use crate::capture::reassembly::{Reassembly, Segment, TcpFlow};
use crate::time::CaptureTime;
use crate::trace::RecordedOp;
use crate::wire::{MessageHeader, RawMessage, HEADER_LEN};

/// Counters shared with the capture loop and surfaced at shutdown.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    /// Frames the packet parser rejected.
    pub malformed_frames: AtomicU64,
    /// Half-flow desync events (gaps, implausible headers).
    pub desync_events: AtomicU64,
    /// Messages successfully framed.
    pub messages: AtomicU64,
}

/// Framing state of one half-flow.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FlowState {
    /// Accumulating bytes for the next 16-byte header.
    BeforeMessage,
    /// Accumulating a message body of known total length.
    InMessage,
    /// Alignment lost; probing for a plausible header.
    OutOfSync,
}

/// Per-direction framing state machine.
struct HalfFlowFsm {
    state: FlowState,
    buf: Vec<u8>,
    /// Total length of the in-flight message.
    want: usize,
    /// Capture time of the first reassembly contributing to the in-flight
    /// accumulation.
    accum_seen: Option<CaptureTime>,
    max_message_size: usize,
}

impl HalfFlowFsm {
    fn new(max_message_size: usize) -> Self {
        HalfFlowFsm {
            state: FlowState::BeforeMessage,
            buf: vec![],
            want: 0,
            accum_seen: None,
            max_message_size,
        }
    }

    /// Feeds one reassembled chunk through the state machine, returning any
    /// completed messages with the capture time of their first byte.
    fn handle(
        &mut self,
        chunk: &Reassembly,
        counters: &CaptureCounters,
    ) -> Vec<(RawMessage, CaptureTime)> {
        let mut out = vec![];

        if chunk.skip != 0 {
            // bytes on either side of a gap (or before a mid-stream join)
            // cannot complete a message
            if self.state != FlowState::OutOfSync {
                counters.desync_events.fetch_add(1, Ordering::Relaxed);
            }
            self.buf.clear();
            self.accum_seen = None;
            self.want = 0;
            self.state = FlowState::OutOfSync;
        }
        if chunk.bytes.is_empty() {
            return out;
        }
        if self.buf.is_empty() {
            self.accum_seen = Some(chunk.seen);
        }
        self.buf.extend_from_slice(&chunk.bytes);

        loop {
            match self.state {
                FlowState::BeforeMessage => {
                    if self.buf.len() < HEADER_LEN {
                        break;
                    }
                    let header = MessageHeader::from_bytes(&self.buf);
                    if !header.is_plausible(self.max_message_size) {
                        log::debug!("implausible header (length {}), desync", header.length);
                        counters.desync_events.fetch_add(1, Ordering::Relaxed);
                        self.state = FlowState::OutOfSync;
                        continue;
                    }
                    self.want = header.length as usize;
                    self.state = FlowState::InMessage;
                }
                FlowState::InMessage => {
                    if self.buf.len() < self.want {
                        break;
                    }
                    let msg_bytes: Vec<u8> = self.buf.drain(..self.want).collect();
                    let seen = self.accum_seen.take().unwrap_or(chunk.seen);
                    // residual bytes restart accumulation within this chunk
                    self.accum_seen = (!self.buf.is_empty()).then_some(chunk.seen);
                    self.want = 0;
                    self.state = FlowState::BeforeMessage;
                    match RawMessage::from_wire_bytes(&msg_bytes) {
                        Ok(raw) => {
                            counters.messages.fetch_add(1, Ordering::Relaxed);
                            out.push((raw, seen));
                        }
                        Err(e) => {
                            // framing guaranteed the length, so this is
                            // unreachable in practice
                            log::error!("framed message failed to parse: {}", e);
                        }
                    }
                }
                FlowState::OutOfSync => {
                    if self.buf.len() < HEADER_LEN {
                        self.buf.clear();
                        self.accum_seen = None;
                        break;
                    }
                    match self.probe(chunk.seen) {
                        Some(()) => continue,
                        None => break,
                    }
                }
            }
        }
        out
    }

    /// Scans the accumulated bytes for a plausible header. On a hit, retains
    /// from the match onward and re-enters `BeforeMessage`; on a miss the
    /// accumulated bytes are discarded.
    fn probe(&mut self, seen: CaptureTime) -> Option<()> {
        for offset in 0..=(self.buf.len() - HEADER_LEN) {
            let header = MessageHeader::from_bytes(&self.buf[offset..]);
            if header.is_plausible(self.max_message_size) {
                log::debug!("resynchronized at offset {}", offset);
                self.buf.drain(..offset);
                self.accum_seen = Some(seen);
                self.state = FlowState::BeforeMessage;
                return Some(());
            }
        }
        self.buf.clear();
        self.accum_seen = None;
        None
    }
}

/// One direction of a logical connection: reassembly feeding framing.
struct HalfFlow {
    src: SocketAddr,
    flow: TcpFlow,
    fsm: HalfFlowFsm,
    closed: bool,
}

impl HalfFlow {
    fn new(src: SocketAddr, max_out_of_order: usize, max_message_size: usize) -> Self {
        HalfFlow {
            src,
            flow: TcpFlow::new(max_out_of_order),
            fsm: HalfFlowFsm::new(max_message_size),
            closed: false,
        }
    }
}

/// A logical bidirectional connection.
struct BidiConn {
    connection_id: i64,
    halves: Vec<HalfFlow>,
}

impl BidiConn {
    /// Number of observed half-flows that have not reached FIN/RST.
    fn open_streams(&self) -> usize {
        self.halves.iter().filter(|h| !h.closed).count()
    }
}

/// Configurable options for the demuxer.
#[derive(Debug, Clone)]
pub struct DemuxConfig {
    pub max_message_size: usize,
    pub max_out_of_order: usize,
    /// Stale out-of-order buffers older than this are flushed as gaps (in
    /// milliseconds).
    pub stale_flush_timeout: usize,
}

impl From<&crate::config::CaptureConfig> for DemuxConfig {
    fn from(config: &crate::config::CaptureConfig) -> Self {
        DemuxConfig {
            max_message_size: config.max_message_size,
            max_out_of_order: config.max_out_of_order,
            stale_flush_timeout: config.stale_flush_timeout,
        }
    }
}

/// Pairs half-flows into logical connections and frames their messages.
pub struct BidiDemuxer {
    config: DemuxConfig,
    table: LinkedHashMap<ConnectionKey, BidiConn>,
    next_conn_id: AtomicI64,
    counters: Arc<CaptureCounters>,
}

impl BidiDemuxer {
    pub fn new(config: DemuxConfig, counters: Arc<CaptureCounters>) -> Self {
        BidiDemuxer {
            config,
            table: LinkedHashMap::new(),
            next_conn_id: AtomicI64::new(0),
            counters,
        }
    }

    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Processes a single TCP segment, returning any operations that became
    /// complete, including the synthetic EOF op when the segment finalizes
    /// its connection.
    pub fn process(
        &mut self,
        ctxt: &SegmentContext,
        payload: &[u8],
        seen: CaptureTime,
    ) -> Vec<RecordedOp> {
        let key = ConnectionKey::new(ctxt.src, ctxt.dst);
        let conn = match self.table.raw_entry_mut().from_key(&key) {
            RawEntryMut::Occupied(occupied) => occupied.into_mut(),
            RawEntryMut::Vacant(vacant) => {
                let connection_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                log::debug!("new connection {}: {}", connection_id, key);
                let (_, conn) = vacant.insert(
                    key.clone(),
                    BidiConn {
                        connection_id,
                        halves: vec![],
                    },
                );
                conn
            }
        };

        let config = &self.config;
        let half_index = match conn.halves.iter().position(|h| h.src == ctxt.src) {
            Some(index) => index,
            None => {
                conn.halves.push(HalfFlow::new(
                    ctxt.src,
                    config.max_out_of_order,
                    config.max_message_size,
                ));
                conn.halves.len() - 1
            }
        };
        let half = &mut conn.halves[half_index];

        let segment = Segment {
            payload: payload.to_vec(),
            seq_no: ctxt.seq_no,
            flags: ctxt.flags,
            seen,
        };
        let src = Endpoint::from_addr(ctxt.src);
        let dst = Endpoint::from_addr(ctxt.dst);
        let connection_id = conn.connection_id;

        let mut ops = vec![];
        let mut ended = false;
        for chunk in half.flow.insert_segment(segment) {
            ended |= chunk.end;
            for (raw, msg_seen) in half.fsm.handle(&chunk, &self.counters) {
                ops.push(RecordedOp::message(
                    raw,
                    msg_seen,
                    src.clone(),
                    dst.clone(),
                    connection_id,
                ));
            }
        }

        if ended && !half.closed {
            half.closed = true;
            if conn.open_streams() == 0 {
                log::debug!("connection {} finalized", connection_id);
                ops.push(RecordedOp::eof(src, dst, connection_id, seen));
                self.table.remove(&key);
            }
        }
        ops
    }

    /// Flushes half-flows whose out-of-order buffers went stale. Driven by
    /// the capture loop's periodic tick.
    pub fn flush_stale(&mut self, now: CaptureTime) -> Vec<RecordedOp> {
        let stale_before =
            CaptureTime(now.0 - self.config.stale_flush_timeout as i64 * 1_000_000);
        let mut ops = vec![];
        for (key, conn) in self.table.iter_mut() {
            for half in conn.halves.iter_mut() {
                let src = Endpoint::new(half.src.to_string());
                for chunk in half.flow.flush_stale(stale_before) {
                    for (raw, msg_seen) in half.fsm.handle(&chunk, &self.counters) {
                        // reconstruct the peer endpoint from the key's other side
                        let dst = peer_endpoint(key, half.src);
                        ops.push(RecordedOp::message(
                            raw,
                            msg_seen,
                            src.clone(),
                            dst,
                            conn.connection_id,
                        ));
                    }
                }
            }
        }
        ops
    }

    /// Recovers whatever the out-of-order buffers still hold, then emits
    /// the synthetic EOF op for every connection still open. Called when
    /// the packet source ends.
    pub fn drain(&mut self, now: CaptureTime) -> Vec<RecordedOp> {
        log::info!("draining {} open connections", self.table.len());
        let mut ops = self.flush_stale(CaptureTime(i64::MAX));
        for (key, conn) in self.table.drain() {
            let src = conn
                .halves
                .first()
                .map(|h| Endpoint::from_addr(h.src))
                .unwrap_or_else(|| Endpoint::new(key.to_string()));
            let dst = conn
                .halves
                .first()
                .map(|h| peer_endpoint(&key, h.src))
                .unwrap_or_else(|| Endpoint::new(String::new()));
            ops.push(RecordedOp::eof(src, dst, conn.connection_id, now));
        }
        ops
    }
}

fn peer_endpoint(key: &ConnectionKey, src: SocketAddr) -> Endpoint {
    Endpoint::from_addr(key.peer_of(src))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::packet::tcp::{ACK, FIN, SYN};
    use crate::wire::OpCode;

    fn demuxer() -> BidiDemuxer {
        BidiDemuxer::new(
            DemuxConfig {
                max_message_size: 1024 * 1024,
                max_out_of_order: 32,
                stale_flush_timeout: 300_000,
            },
            Arc::new(CaptureCounters::default()),
        )
    }

    fn ctxt(src: &str, dst: &str, seq_no: u32, flags: u8, length: usize) -> SegmentContext {
        SegmentContext {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            offset: 0,
            length,
            seq_no,
            flags,
        }
    }

    fn message_bytes(op_code: i32, request_id: i32, body_len: usize) -> Vec<u8> {
        let header = MessageHeader {
            length: (HEADER_LEN + body_len) as i32,
            request_id,
            response_to: 0,
            op_code,
        };
        let mut bytes = vec![];
        header.write_to(&mut bytes).unwrap();
        bytes.extend(std::iter::repeat(0u8).take(body_len));
        bytes
    }

    const CLIENT: &str = "10.0.0.1:40000";
    const SERVER: &str = "10.0.0.2:27017";

    /// Runs a client-side handshake so the flow accepts data segments.
    fn open_client(demux: &mut BidiDemuxer) {
        let ops = demux.process(&ctxt(CLIENT, SERVER, 99, SYN, 0), b"", CaptureTime(1));
        assert!(ops.is_empty());
    }

    #[test]
    fn frames_single_message() {
        let mut demux = demuxer();
        open_client(&mut demux);
        let msg = message_bytes(2004, 7, 32);
        let ops = demux.process(
            &ctxt(CLIENT, SERVER, 100, ACK, msg.len()),
            &msg,
            CaptureTime(5),
        );
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].raw.header.op(), Some(OpCode::Query));
        assert_eq!(ops[0].seen, CaptureTime(5));
        assert_eq!(ops[0].connection_id, 0);
        assert!(!ops[0].eof);
    }

    #[test]
    fn message_split_across_segments_keeps_first_seen() {
        let mut demux = demuxer();
        open_client(&mut demux);
        let msg = message_bytes(2004, 7, 64);
        let (a, b) = msg.split_at(20);
        assert!(demux
            .process(&ctxt(CLIENT, SERVER, 100, ACK, a.len()), a, CaptureTime(5))
            .is_empty());
        let ops = demux.process(
            &ctxt(CLIENT, SERVER, 100 + a.len() as u32, ACK, b.len()),
            b,
            CaptureTime(9),
        );
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].seen, CaptureTime(5));
    }

    #[test]
    fn coalesced_messages_split() {
        let mut demux = demuxer();
        open_client(&mut demux);
        let mut payload = message_bytes(2004, 1, 16);
        payload.extend(message_bytes(2005, 2, 24));
        let ops = demux.process(
            &ctxt(CLIENT, SERVER, 100, ACK, payload.len()),
            &payload,
            CaptureTime(5),
        );
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].raw.header.request_id, 1);
        assert_eq!(ops[1].raw.header.request_id, 2);
    }

    #[test]
    fn both_directions_share_connection_id() {
        let mut demux = demuxer();
        open_client(&mut demux);
        let request = message_bytes(2004, 1, 16);
        let ops = demux.process(
            &ctxt(CLIENT, SERVER, 100, ACK, request.len()),
            &request,
            CaptureTime(5),
        );
        assert_eq!(ops[0].connection_id, 0);

        demux.process(&ctxt(SERVER, CLIENT, 499, SYN | ACK, 0), b"", CaptureTime(6));
        let reply = message_bytes(1, 2, 36);
        let ops = demux.process(
            &ctxt(SERVER, CLIENT, 500, ACK, reply.len()),
            &reply,
            CaptureTime(7),
        );
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].connection_id, 0);
        assert_eq!(ops[0].src_endpoint.as_str(), SERVER);
        assert_eq!(demux.size(), 1);
    }

    #[test]
    fn junk_before_first_header_resyncs() {
        let mut demux = demuxer();
        // joined mid-stream: no SYN, starts with junk
        let mut junk = vec![0xffu8; 1024];
        let ops = demux.process(
            &ctxt(CLIENT, SERVER, 5000, ACK, junk.len()),
            &junk,
            CaptureTime(1),
        );
        assert!(ops.is_empty());

        // next segment carries trailing junk then an aligned message
        junk = vec![0xeeu8; 37];
        let msg = message_bytes(2002, 3, 20);
        junk.extend_from_slice(&msg);
        let ops = demux.process(
            &ctxt(CLIENT, SERVER, 6024, ACK, junk.len()),
            &junk,
            CaptureTime(2),
        );
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].raw.header.op(), Some(OpCode::Insert));
    }

    #[test]
    fn gap_in_message_desyncs_then_recovers() {
        let mut demux = demuxer();
        open_client(&mut demux);
        // first 60 bytes of a 216-byte message arrive, the rest is lost
        let msg = message_bytes(2004, 1, 200);
        assert!(demux
            .process(&ctxt(CLIENT, SERVER, 100, ACK, 60), &msg[..60], CaptureTime(5))
            .is_empty());

        // an aligned message far past the loss sits in the out-of-order
        // buffer until the stale tick flushes it as a gap
        let next = message_bytes(2005, 2, 16);
        assert!(demux
            .process(
                &ctxt(CLIENT, SERVER, 5100, ACK, next.len()),
                &next,
                CaptureTime(6),
            )
            .is_empty());
        let flushed = demux.flush_stale(CaptureTime(400_000_000_000));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].raw.header.op(), Some(OpCode::GetMore));
    }

    #[test]
    fn eof_emitted_when_both_halves_close() {
        let mut demux = demuxer();
        open_client(&mut demux);
        demux.process(&ctxt(SERVER, CLIENT, 499, SYN | ACK, 0), b"", CaptureTime(2));

        let ops = demux.process(&ctxt(CLIENT, SERVER, 100, FIN | ACK, 0), b"", CaptureTime(3));
        assert!(ops.is_empty(), "one-sided close must not finalize");

        let ops = demux.process(&ctxt(SERVER, CLIENT, 500, FIN | ACK, 0), b"", CaptureTime(4));
        assert_eq!(ops.len(), 1);
        assert!(ops[0].eof);
        assert_eq!(demux.size(), 0);
    }

    #[test]
    fn drain_emits_eof_for_open_connections() {
        let mut demux = demuxer();
        open_client(&mut demux);
        let ops = demux.drain(CaptureTime(10));
        assert_eq!(ops.len(), 1);
        assert!(ops[0].eof);
        assert_eq!(demux.size(), 0);
    }

    #[test]
    fn implausible_header_desyncs() {
        let mut demux = demuxer();
        open_client(&mut demux);
        // length field of 8 is below the header size
        let mut bad = vec![];
        MessageHeader {
            length: 8,
            request_id: 1,
            response_to: 0,
            op_code: 2004,
        }
        .write_to(&mut bad)
        .unwrap();
        bad.extend_from_slice(&[0u8; 16]);
        let ops = demux.process(&ctxt(CLIENT, SERVER, 100, ACK, bad.len()), &bad, CaptureTime(5));
        assert!(ops.is_empty());
    }
}
