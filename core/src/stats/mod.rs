//! Per-operation stat generation.
//!
//! Two modes, chosen at construction and mutually exclusive: live/monitor
//! mode observes a captured stream (optionally pairing each request with its
//! reply before emitting), replay/compare mode additionally carries the
//! scheduling fields (`play_at`, `played_at`, `playback_lag_us`). Records
//! flow over a bounded channel to a background recorder thread; a slow
//! recorder backpressures producers rather than dropping.

pub mod recorder;

pub use self::recorder::{spawn_recorder, StatFormat};

use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use serde::Serialize;

use crate::correlate::{TtlMap, UnresolvedReply};
use crate::time::CaptureTime;
use crate::trace::RecordedOp;
use crate::wire::document::Document;
use crate::wire::ops::ParsedOp;

/// How long a request waits for its reply in paired live mode.
const PAIR_TTL: Duration = Duration::from_secs(60);

/// One emitted stat line.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StatRecord {
    pub order: i64,
    pub op_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ns: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub connection_id: i64,
    pub request_id: i32,
    /// Capture time of the op, RFC 3339.
    pub seen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_us: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_returned: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Replay mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub played_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_lag_us: Option<i64>,
    /// Bounded human-readable rendering, for the terminal table.
    #[serde(skip)]
    pub summary: String,
}

impl StatRecord {
    /// Base record for one captured or replayed op.
    pub fn from_op(record: &RecordedOp, op: &ParsedOp) -> StatRecord {
        let meta = op.meta();
        StatRecord {
            order: record.order,
            op_type: meta.op_type,
            ns: meta.ns,
            command: meta.command,
            connection_id: record.connection_id,
            request_id: record.raw.header.request_id,
            seen: record.seen.to_string(),
            summary: op.abbreviated(64),
            ..Default::default()
        }
    }

    /// Marks the op as unresolved: no latency, a single sentinel error.
    pub fn unresolved(u: &UnresolvedReply) -> StatRecord {
        StatRecord {
            order: u.order,
            op_type: "unresolved".to_string(),
            connection_id: u.connection_id,
            errors: vec!["unresolved".to_string()],
            summary: u.key.clone(),
            ..Default::default()
        }
    }

    pub fn with_reply(mut self, reply: &ParsedOp) -> StatRecord {
        self.n_returned = reply.n_returned();
        if let Some(doc) = reply.first_reply_doc() {
            self.errors.extend(extract_errors(&doc));
        }
        self
    }
}

/// Collects `$err`, top-level `errmsg`, and each `errmsg` inside
/// `writeErrors[]` / `writeConcernErrors[]` from the first reply document.
pub fn extract_errors(doc: &Document<'_>) -> Vec<String> {
    let mut errors = vec![];
    if let Some(err) = doc.get("$err").and_then(|e| e.as_str()) {
        errors.push(err.to_string());
    }
    if let Some(err) = doc.get("errmsg").and_then(|e| e.as_str()) {
        errors.push(err.to_string());
    }
    for array_name in ["writeErrors", "writeConcernErrors"] {
        if let Some(array) = doc.get(array_name).and_then(|e| e.as_document()) {
            for entry in array.iter().flatten() {
                if let Some(err) = entry
                    .as_document()
                    .and_then(|d| d.get("errmsg").map(|e| e.as_str()))
                    .flatten()
                {
                    errors.push(err.to_string());
                }
            }
        }
    }
    errors
}

/// Producer handle for stat records. Cloneable across workers; the channel
/// is the synchronization boundary.
#[derive(Clone)]
pub struct StatSink {
    tx: Sender<StatRecord>,
}

impl StatSink {
    /// Creates the sink and the receiver side for the recorder thread.
    pub fn channel(queue_depth: usize) -> (StatSink, Receiver<StatRecord>) {
        let (tx, rx) = bounded(queue_depth);
        (StatSink { tx }, rx)
    }

    /// Blocking push: slow consumers backpressure the producer, records are
    /// never dropped.
    pub fn record(&self, record: StatRecord) {
        if self.tx.send(record).is_err() {
            log::warn!("stat recorder went away, dropping record");
        }
    }
}

/// Key for pairing a request with its reply on the same captured connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PairKey {
    requester: String,
    responder: String,
    id: i32,
}

struct PendingRequest {
    record: StatRecord,
    seen: CaptureTime,
}

/// Live/monitor-mode stat generation over a captured stream.
///
/// In paired mode a request's record is held until its reply arrives and
/// emitted once, carrying latency and reply details. Replies that never
/// arrive are flushed without latency after a TTL.
pub struct LiveAggregator {
    paired: bool,
    pending: TtlMap<PairKey, PendingRequest>,
}

impl LiveAggregator {
    pub fn new(paired: bool) -> LiveAggregator {
        LiveAggregator {
            paired,
            pending: TtlMap::new(PAIR_TTL),
        }
    }

    /// Observes one captured op, returning the records ready to emit.
    pub fn observe(&mut self, record: &RecordedOp, now: Instant) -> Vec<StatRecord> {
        if record.eof {
            return vec![];
        }
        let op = match ParsedOp::from_raw(&record.raw) {
            Ok(op) => op,
            Err(e) => {
                log::warn!("op {} undecodable: {}", record.order, e);
                return vec![];
            }
        };
        let mut out = self.flush_expired(now);

        if !self.paired {
            out.push(StatRecord::from_op(record, &op));
            return out;
        }

        if op.is_reply() {
            let key = PairKey {
                requester: record.dst_endpoint.as_str().to_string(),
                responder: record.src_endpoint.as_str().to_string(),
                id: record.raw.header.response_to,
            };
            match self.pending.remove(&key) {
                Some(request) => {
                    let latency = record.seen.since(request.seen);
                    let mut stat = request.record.with_reply(&op);
                    stat.latency_us = Some(latency.as_micros() as i64);
                    out.push(stat);
                }
                None => {
                    // a reply with no tracked request still counts
                    out.push(StatRecord::from_op(record, &op));
                }
            }
        } else if op.expects_reply() {
            let key = PairKey {
                requester: record.src_endpoint.as_str().to_string(),
                responder: record.dst_endpoint.as_str().to_string(),
                id: record.raw.header.request_id,
            };
            self.pending.insert(
                key,
                PendingRequest {
                    record: StatRecord::from_op(record, &op),
                    seen: record.seen,
                },
                now,
            );
        } else {
            out.push(StatRecord::from_op(record, &op));
        }
        out
    }

    /// Emits requests whose replies never arrived within the TTL.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<StatRecord> {
        self.pending
            .evict_expired(now)
            .into_iter()
            .map(|(_, request)| {
                let mut stat = request.record;
                stat.errors.push("unresolved".to_string());
                stat
            })
            .collect()
    }

    /// Emits everything still pending, for end of stream.
    pub fn finish(&mut self) -> Vec<StatRecord> {
        let mut out = vec![];
        loop {
            let drained = self.flush_expired(Instant::now() + PAIR_TTL + PAIR_TTL);
            if drained.is_empty() {
                break;
            }
            out.extend(drained);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::conn_id::Endpoint;
    use crate::wire::document::DocBuilder;
    use crate::wire::ops::tests::raw_from_body;
    use crate::wire::RawMessage;

    pub(crate) fn captured(
        raw: RawMessage,
        seen_ns: i64,
        src: &str,
        dst: &str,
        order: i64,
    ) -> RecordedOp {
        let mut op = RecordedOp::message(
            raw,
            CaptureTime(seen_ns),
            Endpoint::new(src),
            Endpoint::new(dst),
            0,
        );
        op.order = order;
        op
    }

    fn query_record(request_id: i32, seen_ns: i64, order: i64) -> RecordedOp {
        let query = DocBuilder::new().append_str("find", "users").finish();
        let body = crate::wire::ops::query::tests::query_body("app.$cmd", &query);
        let mut raw = raw_from_body(2004, body);
        raw.header.request_id = request_id;
        captured(raw, seen_ns, "client:1", "server:2", order)
    }

    fn reply_record(response_to: i32, seen_ns: i64, order: i64) -> RecordedOp {
        let body = crate::wire::ops::reply::tests::reply_body(0, &[]);
        let mut raw = raw_from_body(1, body);
        raw.header.response_to = response_to;
        captured(raw, seen_ns, "server:2", "client:1", order)
    }

    #[test]
    fn error_extraction_all_shapes() {
        let write_error = DocBuilder::new()
            .append_i32("index", 0)
            .append_str("errmsg", "dup key")
            .finish();
        let wc_error = DocBuilder::new().append_str("errmsg", "timeout").finish();
        let doc_bytes = DocBuilder::new()
            .append_str("$err", "legacy failure")
            .append_str("errmsg", "top-level failure")
            .append_array(
                "writeErrors",
                &DocBuilder::new().append_doc("0", &write_error).finish(),
            )
            .append_array(
                "writeConcernErrors",
                &DocBuilder::new().append_doc("0", &wc_error).finish(),
            )
            .finish();
        let doc = Document::at_start(&doc_bytes).unwrap();
        assert_eq!(
            extract_errors(&doc),
            vec!["legacy failure", "top-level failure", "dup key", "timeout"]
        );
    }

    #[test]
    fn unpaired_mode_emits_per_op() {
        let mut agg = LiveAggregator::new(false);
        let now = Instant::now();
        let out = agg.observe(&query_record(7, 1_000, 0), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].op_type, "query");
        assert_eq!(out[0].command.as_deref(), Some("find"));
    }

    #[test]
    fn paired_mode_emits_on_reply_with_latency() {
        let mut agg = LiveAggregator::new(true);
        let now = Instant::now();
        assert!(agg.observe(&query_record(7, 1_000, 0), now).is_empty());

        let out = agg.observe(&reply_record(7, 2_500_000, 1), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].order, 0, "stat belongs to the request");
        assert_eq!(out[0].latency_us, Some(2_499)); // (2_500_000 - 1_000) ns
        assert_eq!(out[0].n_returned, Some(0));
    }

    #[test]
    fn paired_mode_times_out_unanswered_requests() {
        let mut agg = LiveAggregator::new(true);
        let t0 = Instant::now();
        assert!(agg.observe(&query_record(7, 1_000, 0), t0).is_empty());

        let out = agg.flush_expired(t0 + PAIR_TTL);
        assert_eq!(out.len(), 1);
        assert!(out[0].latency_us.is_none());
        assert_eq!(out[0].errors, vec!["unresolved"]);
    }

    #[test]
    fn eof_records_are_silent() {
        let mut agg = LiveAggregator::new(true);
        let eof = RecordedOp::eof(Endpoint::new("a:1"), Endpoint::new("b:2"), 0, CaptureTime(1));
        assert!(agg.observe(&eof, Instant::now()).is_empty());
    }
}
