//! Time-ordering merge of per-connection message streams.
//!
//! Messages arrive in per-half-flow order but interleaved arbitrarily across
//! connections. A perfect global sort would require buffering the whole
//! capture; a min-heap of bounded capacity `H` instead produces a locally
//! correct order with reorder distance at most `H`, which downstream replay
//! tolerates because per-connection worker queues re-serialize within a
//! connection anyway.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crossbeam::channel::{Receiver, Sender};

use crate::time::CaptureTime;
use crate::trace::RecordedOp;

struct HeapEntry {
    seen: CaptureTime,
    /// Arrival index; breaks ties so emission is stable.
    tiebreak: u64,
    op: RecordedOp,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seen == other.seen && self.tiebreak == other.tiebreak
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.seen, self.tiebreak).cmp(&(other.seen, other.tiebreak))
    }
}

/// Bounded min-heap merging messages into non-decreasing `seen` order.
pub struct MessageSorter {
    capacity: usize,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    next_tiebreak: u64,
}

impl MessageSorter {
    pub fn new(capacity: usize) -> Self {
        MessageSorter {
            capacity: capacity.max(1),
            heap: BinaryHeap::with_capacity(capacity.max(1)),
            next_tiebreak: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pushes one message; whenever the push brings the heap to capacity,
    /// the earliest buffered message is popped and returned.
    pub fn push(&mut self, op: RecordedOp) -> Option<RecordedOp> {
        let entry = HeapEntry {
            seen: op.seen,
            tiebreak: self.next_tiebreak,
            op,
        };
        self.next_tiebreak += 1;
        self.heap.push(Reverse(entry));
        if self.heap.len() >= self.capacity {
            return self.heap.pop().map(|Reverse(entry)| entry.op);
        }
        None
    }

    /// Empties the heap in order. Called once the input closes.
    pub fn drain(&mut self) -> Vec<RecordedOp> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(entry)) = self.heap.pop() {
            out.push(entry.op);
        }
        out
    }
}

/// Bridges the unordered demuxer channel to a time-sorted output channel.
/// Runs until the input disconnects, then drains.
pub fn run_sorter(input: Receiver<RecordedOp>, output: Sender<RecordedOp>, capacity: usize) {
    let mut sorter = MessageSorter::new(capacity);
    for op in input.iter() {
        if let Some(ready) = sorter.push(op) {
            if output.send(ready).is_err() {
                log::warn!("sorted-message consumer went away");
                return;
            }
        }
    }
    for op in sorter.drain() {
        if output.send(op).is_err() {
            log::warn!("sorted-message consumer went away during drain");
            return;
        }
    }
}
