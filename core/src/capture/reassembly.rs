//! Per-half-flow TCP reassembly.
//!
//! Buffers out-of-order segments keyed by sequence number and emits
//! contiguous byte-stream chunks as they complete. Loss beyond the bounded
//! out-of-order window, and segments stuck in the buffer past the stale
//! timeout, surface as a `skip > 0` gap marker that downstream framing must
//! resynchronize over. Captures that join an established connection
//! mid-stream surface as `skip < 0` on the first chunk.

use std::collections::VecDeque;

use crate::time::CaptureTime;
use crate::capture::packet::tcp::{FIN, RST, SYN};

/// One TCP segment's payload and context, owned.
#[derive(Debug, Clone)]
pub struct Segment {
    pub payload: Vec<u8>,
    pub seq_no: u32,
    pub flags: u8,
    pub seen: CaptureTime,
}

impl Segment {
    fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Sequence number just past this segment, FIN/SYN accounted for.
    fn end_seq(&self) -> u32 {
        let mut end = self.seq_no.wrapping_add(self.len());
        if self.flags & (FIN | SYN) != 0 {
            end = end.wrapping_add(1);
        }
        end
    }
}

/// A chunk of reassembled bytes in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembly {
    pub bytes: Vec<u8>,
    /// `> 0`: that many bytes were lost before `bytes`. `< 0`: the capture
    /// started mid-stream. `0`: contiguous.
    pub skip: i64,
    /// SYN observed.
    pub start: bool,
    /// FIN or RST observed.
    pub end: bool,
    pub seen: CaptureTime,
}

impl Reassembly {
    fn data(segment: &Segment, skip: i64) -> Reassembly {
        Reassembly {
            bytes: segment.payload.clone(),
            skip,
            start: segment.flags & SYN != 0,
            end: segment.flags & (FIN | RST) != 0,
            seen: segment.seen,
        }
    }
}

/// Represents a uni-directional TCP flow.
#[derive(Debug)]
pub struct TcpFlow {
    /// Expected sequence number of next segment.
    next_seq: Option<u32>,
    /// Out-of-order buffer.
    ooo_buf: OutOfOrderBuffer,
    /// FIN/RST consumed; subsequent segments are dropped.
    done: bool,
}

impl TcpFlow {
    pub fn new(capacity: usize) -> Self {
        TcpFlow {
            next_seq: None,
            ooo_buf: OutOfOrderBuffer::new(capacity),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Attempts to insert an incoming data segment into the flow, returning
    /// the chunks that became contiguous. Buffers future segments and drops
    /// old ones; retransmitted bytes overlapping previously emitted ranges
    /// are trimmed.
    pub fn insert_segment(&mut self, mut segment: Segment) -> Vec<Reassembly> {
        if self.done {
            return vec![];
        }
        let mut out = vec![];

        let next_seq = match self.next_seq {
            Some(next_seq) => next_seq,
            None => {
                if segment.flags & SYN != 0 {
                    self.next_seq = Some(segment.end_seq());
                    out.push(Reassembly::data(&segment, 0));
                    self.done = segment.flags & RST != 0;
                } else if !segment.payload.is_empty() || segment.flags & (FIN | RST) != 0 {
                    // joined mid-stream
                    self.next_seq = Some(segment.end_seq());
                    self.done = segment.flags & (FIN | RST) != 0;
                    out.push(Reassembly::data(&segment, -1));
                }
                // a bare ACK before any payload tells us nothing yet
                return out;
            }
        };

        let cur_seq = segment.seq_no;
        if next_seq == cur_seq {
            self.consume(segment, 0, &mut out);
            self.flush_ordered(&mut out);
        } else if wrapping_lt(next_seq, cur_seq) {
            // future data
            let overflow = self.ooo_buf.is_full();
            self.ooo_buf.buf.push_back(segment);
            if overflow {
                log::warn!("out-of-order buffer overflow, flushing with gap");
                self.flush_gap(&mut out);
            }
        } else if overlap(&mut segment, next_seq) {
            // starts before the expected sequence but carries new data
            self.consume(segment, 0, &mut out);
            self.flush_ordered(&mut out);
        } else {
            log::debug!("dropping old segment. cur: {} expect: {}", cur_seq, next_seq);
        }
        out
    }

    /// Flushes buffered segments older than `stale_before` as a gap, for the
    /// periodic stale tick.
    pub fn flush_stale(&mut self, stale_before: CaptureTime) -> Vec<Reassembly> {
        let mut out = vec![];
        if self
            .ooo_buf
            .oldest_seen()
            .is_some_and(|seen| seen < stale_before)
        {
            log::warn!("flushing stale out-of-order buffer");
            self.flush_gap(&mut out);
        }
        out
    }

    fn consume(&mut self, segment: Segment, skip: i64, out: &mut Vec<Reassembly>) {
        self.next_seq = Some(segment.end_seq());
        if segment.flags & (FIN | RST) != 0 {
            self.done = true;
        }
        out.push(Reassembly::data(&segment, skip));
    }

    /// Consumes buffered segments that became contiguous, trimming overlap
    /// and dropping stale data.
    fn flush_ordered(&mut self, out: &mut Vec<Reassembly>) {
        let mut index = 0;
        while index < self.ooo_buf.len() && !self.done {
            let next_seq = match self.next_seq {
                Some(seq) => seq,
                None => return,
            };
            // unwraps ok because index < len
            let cur_seq = self.ooo_buf.buf.get(index).unwrap().seq_no;
            if next_seq == cur_seq {
                let segment = self.ooo_buf.buf.remove(index).unwrap();
                self.consume(segment, 0, out);
                index = 0;
            } else if wrapping_lt(next_seq, cur_seq) {
                index += 1;
            } else {
                let mut segment = self.ooo_buf.buf.remove(index).unwrap();
                if overlap(&mut segment, next_seq) {
                    self.consume(segment, 0, out);
                    index = 0;
                } else {
                    log::debug!("dropping old segment during flush");
                    index += 1;
                }
            }
        }
    }

    /// Skips over lost bytes to the earliest buffered segment and drains
    /// whatever is contiguous from there.
    fn flush_gap(&mut self, out: &mut Vec<Reassembly>) {
        let next_seq = match self.next_seq {
            Some(seq) => seq,
            None => return,
        };
        let earliest = match self.ooo_buf.earliest_seq(next_seq) {
            Some(seq) => seq,
            None => return,
        };
        let gap = earliest.wrapping_sub(next_seq) as i64;
        self.next_seq = Some(earliest);
        let before = out.len();
        self.flush_ordered(out);
        if let Some(first) = out.get_mut(before) {
            first.skip = gap;
        }
    }
}

fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // From RFC1323: a sequence number is "old" if it is more than 2**31
    // bytes behind the left edge of the window.
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// Trims a segment that starts before `expected_seq`. Returns `true` if new
/// data remains after the trim.
fn overlap(segment: &mut Segment, expected_seq: u32) -> bool {
    let end_seq = segment.seq_no.wrapping_add(segment.len());
    if wrapping_lt(expected_seq, end_seq) {
        let overlap_len = expected_seq.wrapping_sub(segment.seq_no) as usize;
        segment.payload.drain(..overlap_len.min(segment.payload.len()));
        segment.seq_no = expected_seq;
        true
    } else {
        false
    }
}

/// A buffer to hold reordered TCP segments.
#[derive(Debug)]
struct OutOfOrderBuffer {
    capacity: usize,
    buf: VecDeque<Segment>,
}

impl OutOfOrderBuffer {
    fn new(capacity: usize) -> Self {
        OutOfOrderBuffer {
            capacity,
            buf: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    fn oldest_seen(&self) -> Option<CaptureTime> {
        self.buf.iter().map(|s| s.seen).min()
    }

    /// Sequence number closest after `next_seq` among buffered segments.
    fn earliest_seq(&self, next_seq: u32) -> Option<u32> {
        self.buf
            .iter()
            .map(|s| s.seq_no)
            .min_by_key(|seq| seq.wrapping_sub(next_seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::packet::tcp::ACK;

    fn seg(seq_no: u32, flags: u8, payload: &[u8], seen_ns: i64) -> Segment {
        Segment {
            payload: payload.to_vec(),
            seq_no,
            flags,
            seen: CaptureTime(seen_ns),
        }
    }

    fn bytes_of(chunks: &[Reassembly]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.bytes.clone()).collect()
    }

    #[test]
    fn in_order_stream() {
        let mut flow = TcpFlow::new(8);
        let start = flow.insert_segment(seg(100, SYN, b"", 1));
        assert_eq!(start.len(), 1);
        assert!(start[0].start);

        let chunks = flow.insert_segment(seg(101, ACK, b"abc", 2));
        assert_eq!(bytes_of(&chunks), b"abc");
        let chunks = flow.insert_segment(seg(104, ACK, b"def", 3));
        assert_eq!(bytes_of(&chunks), b"def");
    }

    #[test]
    fn out_of_order_reordered() {
        let mut flow = TcpFlow::new(8);
        flow.insert_segment(seg(100, SYN, b"", 1));
        assert!(flow.insert_segment(seg(104, ACK, b"def", 2)).is_empty());
        assert!(flow.insert_segment(seg(107, ACK, b"ghi", 3)).is_empty());
        let chunks = flow.insert_segment(seg(101, ACK, b"abc", 4));
        assert_eq!(bytes_of(&chunks), b"abcdefghi");
        assert!(chunks.iter().all(|c| c.skip == 0));
    }

    #[test]
    fn retransmission_discarded() {
        let mut flow = TcpFlow::new(8);
        flow.insert_segment(seg(100, SYN, b"", 1));
        flow.insert_segment(seg(101, ACK, b"abc", 2));
        assert!(flow.insert_segment(seg(101, ACK, b"abc", 3)).is_empty());
    }

    #[test]
    fn partial_overlap_trimmed() {
        let mut flow = TcpFlow::new(8);
        flow.insert_segment(seg(100, SYN, b"", 1));
        flow.insert_segment(seg(101, ACK, b"abcd", 2));
        let chunks = flow.insert_segment(seg(103, ACK, b"cdEF", 3));
        assert_eq!(bytes_of(&chunks), b"EF");
    }

    #[test]
    fn mid_stream_start_marked() {
        let mut flow = TcpFlow::new(8);
        let chunks = flow.insert_segment(seg(5000, ACK, b"junk", 1));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].skip, -1);
    }

    #[test]
    fn overflow_surfaces_gap() {
        let mut flow = TcpFlow::new(2);
        flow.insert_segment(seg(100, SYN, b"", 1));
        // segment at 101 is lost; buffer 3 future segments into capacity 2
        assert!(flow.insert_segment(seg(104, ACK, b"def", 2)).is_empty());
        assert!(flow.insert_segment(seg(107, ACK, b"ghi", 3)).is_empty());
        let chunks = flow.insert_segment(seg(110, ACK, b"jkl", 4));
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].skip, 3); // bytes 101..104 lost
        assert_eq!(bytes_of(&chunks), b"defghijkl");
    }

    #[test]
    fn stale_buffer_flushed_as_gap() {
        let mut flow = TcpFlow::new(8);
        flow.insert_segment(seg(100, SYN, b"", 1_000));
        assert!(flow.insert_segment(seg(104, ACK, b"def", 2_000)).is_empty());
        assert!(flow.flush_stale(CaptureTime(1_500)).is_empty());
        let chunks = flow.flush_stale(CaptureTime(3_000));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].skip, 3);
        assert_eq!(chunks[0].bytes, b"def");
    }

    #[test]
    fn fin_marks_end() {
        let mut flow = TcpFlow::new(8);
        flow.insert_segment(seg(100, SYN, b"", 1));
        let chunks = flow.insert_segment(seg(101, FIN | ACK, b"", 2));
        assert!(chunks[0].end);
        assert!(flow.is_done());
        assert!(flow.insert_segment(seg(102, ACK, b"zzz", 3)).is_empty());
    }
}
