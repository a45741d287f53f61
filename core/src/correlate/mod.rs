//! Request/reply correlation and cursor remapping.
//!
//! At replay time every executed operation produces a live reply while the
//! trace supplies the recorded reply for the same request. The two arrive in
//! no particular order, so a two-sided pending cache pairs them: a key hit
//! on one slot while the other is already full completes the pair, and a
//! completed pair whose recorded side opened a cursor publishes a
//! recorded-to-live cursor mapping. getMore/killCursors ops consult that
//! mapping before execution.
//!
//! Entries that see only one side within the pending TTL are evicted and
//! surface as "unresolved" stats. Cursor mappings expire after ten minutes
//! of inactivity, which also breaks the cache's inherent A-waits-for-B,
//! B-waits-for-A retention cycle.

pub mod ttl_map;

pub use self::ttl_map::TtlMap;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::capture::conn_id::Endpoint;
use crate::trace::RecordedOp;
use crate::wire::ops::ParsedOp;
use crate::wire::{RawMessage, WireError};

/// Lifetime of a one-sided pending reply.
pub const PENDING_REPLY_TTL: Duration = Duration::from_secs(60);

/// Inactivity lifetime of a recorded-to-live cursor mapping.
pub const CURSOR_TTL: Duration = Duration::from_secs(600);

/// The recorded-to-live cursor id mapping, shared by all workers of a
/// generation (or of the whole replay when cursor sharing is enabled).
pub struct CursorMap {
    inner: Mutex<TtlMap<i64, i64>>,
}

impl Default for CursorMap {
    fn default() -> Self {
        CursorMap::new()
    }
}

impl CursorMap {
    pub fn new() -> Self {
        CursorMap {
            inner: Mutex::new(TtlMap::new(CURSOR_TTL)),
        }
    }

    pub fn get(&self, recorded_id: i64) -> Option<i64> {
        self.inner
            .lock()
            .expect("cursor map lock")
            .get(&recorded_id, Instant::now())
            .copied()
    }

    pub fn insert(&self, recorded_id: i64, live_id: i64) {
        self.inner
            .lock()
            .expect("cursor map lock")
            .insert(recorded_id, live_id, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cursor map lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self, now: Instant) {
        let evicted = self
            .inner
            .lock()
            .expect("cursor map lock")
            .evict_expired(now);
        if !evicted.is_empty() {
            log::debug!("expired {} cursor mappings", evicted.len());
        }
    }
}

/// What one side of a pair contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplySummary {
    pub cursor_id: i64,
    pub n_returned: i64,
}

impl ReplySummary {
    /// Summarizes a reply-shaped op; `None` for anything else.
    pub fn from_op(op: &ParsedOp) -> Option<ReplySummary> {
        op.reply_cursor_id().map(|cursor_id| ReplySummary {
            cursor_id,
            n_returned: op.n_returned().unwrap_or(0),
        })
    }
}

/// A 2-slot pending entry, promoted to complete the instant both fill.
#[derive(Debug)]
struct PendingPair {
    recorded: Option<ReplySummary>,
    live: Option<ReplySummary>,
    order: i64,
    connection_id: i64,
}

/// A pending entry evicted with only one side present.
#[derive(Debug)]
pub struct UnresolvedReply {
    pub key: String,
    pub order: i64,
    pub connection_id: i64,
}

/// Result of a cursor rewrite, for logging and stats.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CursorRewrite {
    /// Live ids now carried by the op, aligned with the recorded ids; `None`
    /// marks a missing mapping.
    pub mapped: Vec<Option<i64>>,
    /// Recorded ids that had no mapping.
    pub dropped: Vec<i64>,
}

enum Side {
    Recorded,
    Live,
}

/// The two-sided pending-reply cache.
pub struct Correlator {
    pending: Mutex<TtlMap<String, PendingPair>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Correlator::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Correlator {
            pending: Mutex::new(TtlMap::new(PENDING_REPLY_TTL)),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    /// Indexes a reply observed in the trace. `record` is the trace record
    /// carrying the reply, so the requester is its destination endpoint.
    pub fn add_recorded(&self, cursors: &CursorMap, reply: &ParsedOp, record: &RecordedOp) {
        let summary = match ReplySummary::from_op(reply) {
            Some(summary) => summary,
            None => return,
        };
        let key = pending_key(
            &record.dst_endpoint,
            &record.src_endpoint,
            record.raw.header.response_to,
            record.generation,
        );
        self.fill(cursors, key, Side::Recorded, summary, record);
    }

    /// Indexes a reply received from the live server. `request` is the
    /// recorded request the worker replayed; its request id was copied onto
    /// the outgoing message, so both sides derive the same key.
    pub fn add_live(&self, cursors: &CursorMap, reply: &ParsedOp, request: &RecordedOp) {
        let summary = match ReplySummary::from_op(reply) {
            Some(summary) => summary,
            None => return,
        };
        let key = pending_key(
            &request.src_endpoint,
            &request.dst_endpoint,
            request.raw.header.request_id,
            request.generation,
        );
        self.fill(cursors, key, Side::Live, summary, request);
    }

    fn fill(
        &self,
        cursors: &CursorMap,
        key: String,
        side: Side,
        summary: ReplySummary,
        record: &RecordedOp,
    ) {
        let now = Instant::now();
        let mut pending = self.pending.lock().expect("pending lock");
        let is_complete = match pending.get_mut(&key, now) {
            Some(pair) => {
                match side {
                    Side::Recorded => pair.recorded = Some(summary),
                    Side::Live => pair.live = Some(summary),
                }
                pair.recorded.is_some() && pair.live.is_some()
            }
            None => {
                let mut pair = PendingPair {
                    recorded: None,
                    live: None,
                    order: record.order,
                    connection_id: record.connection_id,
                };
                match side {
                    Side::Recorded => pair.recorded = Some(summary),
                    Side::Live => pair.live = Some(summary),
                }
                pending.insert(key.clone(), pair, now);
                false
            }
        };
        let completed = if is_complete { pending.remove(&key) } else { None };
        drop(pending);

        if let Some(pair) = completed {
            let recorded = pair.recorded.expect("completed pair");
            let live = pair.live.expect("completed pair");
            if recorded.cursor_id != 0 {
                // a live side that ended on the first batch maps to 0, so
                // later getMores on the recorded id rewrite to 0 instead of
                // dangling
                log::debug!(
                    "cursor mapping {} -> {}",
                    recorded.cursor_id,
                    live.cursor_id
                );
                cursors.insert(recorded.cursor_id, live.cursor_id);
            }
        }
    }

    /// Rewrites the op's cursor ids through the mapping. Missing getMore
    /// mappings pass 0 through (provoking a server-side "cursor not found"
    /// that surfaces in stats); missing killCursors mappings drop the id.
    pub fn rewrite_cursors(
        &self,
        cursors: &CursorMap,
        op: &mut ParsedOp,
        raw: &mut RawMessage,
    ) -> Result<CursorRewrite, WireError> {
        let recorded_ids = op.cursor_ids();
        if recorded_ids.is_empty() {
            return Ok(CursorRewrite::default());
        }
        let mut outcome = CursorRewrite::default();
        for id in &recorded_ids {
            match cursors.get(*id) {
                Some(live) => outcome.mapped.push(Some(live)),
                None => {
                    outcome.mapped.push(None);
                    outcome.dropped.push(*id);
                }
            }
        }
        if !outcome.dropped.is_empty() {
            log::warn!(
                "no live cursor mapping for recorded cursor(s) {:?}",
                outcome.dropped
            );
        }
        op.rewrite_cursor_ids(raw, &outcome.mapped)?;
        Ok(outcome)
    }

    /// Evicts pending entries past their TTL, returning the one-sided ones
    /// as unresolved. Also ages out idle cursor mappings. Driven by the
    /// housekeeping tick.
    pub fn sweep(&self, cursors: &CursorMap, now: Instant) -> Vec<UnresolvedReply> {
        cursors.sweep(now);
        let evicted = self
            .pending
            .lock()
            .expect("pending lock")
            .evict_expired(now);
        evicted
            .into_iter()
            .filter(|(_, pair)| pair.recorded.is_none() || pair.live.is_none())
            .map(|(key, pair)| UnresolvedReply {
                key,
                order: pair.order,
                connection_id: pair.connection_id,
            })
            .collect()
    }
}

/// Key format shared by both sides of the cache; includes the request id so
/// no live reply can correlate to more than one recorded request.
fn pending_key(requester: &Endpoint, responder: &Endpoint, id: i32, generation: i32) -> String {
    format!("{}:{}:{}:{}", requester, responder, id, generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::CaptureTime;
    use crate::wire::ops::tests::raw_from_body;
    use crate::wire::MessageHeader;

    fn record(request_id: i32, response_to: i32, generation: i32) -> RecordedOp {
        let header = MessageHeader {
            length: 16,
            request_id,
            response_to,
            op_code: 1,
        };
        let mut op = RecordedOp::message(
            RawMessage { header, body: vec![] },
            CaptureTime(1),
            Endpoint::new("client:1"),
            Endpoint::new("server:2"),
            0,
        );
        op.generation = generation;
        op
    }

    /// A recorded reply record travels server -> client.
    fn reply_record(response_to: i32, generation: i32) -> RecordedOp {
        let header = MessageHeader {
            length: 16,
            request_id: 900,
            response_to,
            op_code: 1,
        };
        let mut op = RecordedOp::message(
            RawMessage { header, body: vec![] },
            CaptureTime(2),
            Endpoint::new("server:2"),
            Endpoint::new("client:1"),
            0,
        );
        op.generation = generation;
        op
    }

    fn legacy_reply(cursor_id: i64) -> ParsedOp {
        let body = crate::wire::ops::reply::tests::reply_body(cursor_id, &[]);
        ParsedOp::from_raw(&raw_from_body(1, body)).unwrap()
    }

    #[test]
    fn pair_completion_inserts_cursor_mapping() {
        let correlator = Correlator::new();
        let cursors = CursorMap::new();

        correlator.add_recorded(&cursors, &legacy_reply(42), &reply_record(7, 0));
        assert!(cursors.is_empty());
        assert_eq!(correlator.pending_len(), 1);

        correlator.add_live(&cursors, &legacy_reply(9999), &record(7, 0, 0));
        assert_eq!(correlator.pending_len(), 0);
        assert_eq!(cursors.get(42), Some(9999));
    }

    #[test]
    fn completion_order_is_symmetric() {
        let correlator = Correlator::new();
        let cursors = CursorMap::new();

        correlator.add_live(&cursors, &legacy_reply(1111), &record(9, 0, 0));
        correlator.add_recorded(&cursors, &legacy_reply(55), &reply_record(9, 0));
        assert_eq!(cursors.get(55), Some(1111));
    }

    #[test]
    fn dead_live_cursor_maps_to_zero() {
        let correlator = Correlator::new();
        let cursors = CursorMap::new();

        correlator.add_recorded(&cursors, &legacy_reply(42), &reply_record(7, 0));
        correlator.add_live(&cursors, &legacy_reply(0), &record(7, 0, 0));
        assert_eq!(cursors.get(42), Some(0));
    }

    #[test]
    fn zero_recorded_cursor_inserts_nothing() {
        let correlator = Correlator::new();
        let cursors = CursorMap::new();

        correlator.add_recorded(&cursors, &legacy_reply(0), &reply_record(7, 0));
        correlator.add_live(&cursors, &legacy_reply(1234), &record(7, 0, 0));
        assert!(cursors.is_empty());
    }

    #[test]
    fn generations_do_not_cross_talk() {
        let correlator = Correlator::new();
        let cursors = CursorMap::new();

        correlator.add_recorded(&cursors, &legacy_reply(42), &reply_record(7, 0));
        correlator.add_live(&cursors, &legacy_reply(9999), &record(7, 0, 1));
        // different generations, different keys: nothing pairs
        assert!(cursors.is_empty());
        assert_eq!(correlator.pending_len(), 2);
    }

    #[test]
    fn request_ids_prevent_cross_talk() {
        let correlator = Correlator::new();
        let cursors = CursorMap::new();

        correlator.add_recorded(&cursors, &legacy_reply(42), &reply_record(7, 0));
        correlator.add_live(&cursors, &legacy_reply(9999), &record(8, 0, 0));
        assert!(cursors.is_empty());
    }

    #[test]
    fn getmore_rewrite_through_map() {
        let correlator = Correlator::new();
        let cursors = CursorMap::new();
        cursors.insert(42, 9999);

        let body = crate::wire::ops::cursor::tests::getmore_body("app.users", 42);
        let mut raw = raw_from_body(2005, body);
        let mut op = ParsedOp::from_raw(&raw).unwrap();
        let outcome = correlator
            .rewrite_cursors(&cursors, &mut op, &mut raw)
            .unwrap();
        assert_eq!(outcome.mapped, vec![Some(9999)]);
        assert!(outcome.dropped.is_empty());
        assert_eq!(op.cursor_ids(), vec![9999]);
    }

    #[test]
    fn killcursors_partial_rewrite_reports_drop() {
        let correlator = Correlator::new();
        let cursors = CursorMap::new();
        cursors.insert(42, 1000);
        cursors.insert(44, 1002);

        let body = crate::wire::ops::cursor::tests::killcursors_body(&[42, 43, 44]);
        let mut raw = raw_from_body(2007, body);
        let mut op = ParsedOp::from_raw(&raw).unwrap();
        let outcome = correlator
            .rewrite_cursors(&cursors, &mut op, &mut raw)
            .unwrap();
        assert_eq!(outcome.dropped, vec![43]);
        assert_eq!(op.cursor_ids(), vec![1000, 1002]);
    }

    #[test]
    fn sweep_reports_unresolved_singles() {
        let correlator = Correlator::new();
        let cursors = CursorMap::new();

        correlator.add_recorded(&cursors, &legacy_reply(42), &reply_record(7, 0));
        let unresolved = correlator.sweep(&cursors, Instant::now() + PENDING_REPLY_TTL);
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].connection_id, 0);
        assert_eq!(correlator.pending_len(), 0);
    }
}
