//! Per-connection replay workers.
//!
//! One worker per (connection id, generation), owning one connection to the
//! target server. Within a worker execution is strictly serial, so
//! per-connection replay order equals per-connection recording order; across
//! workers only `play_at` timing relates operations.

use std::sync::atomic::Ordering;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use crossbeam::channel::Receiver;

use crate::correlate::{Correlator, CursorMap};
use crate::replay::session::{ServerSession, SessionCanceller};
use crate::stats::{StatRecord, StatSink};
use crate::trace::RecordedOp;
use crate::wire::ops::ParsedOp;

/// State shared by every worker of one generation.
pub struct WorkerContext {
    pub target: String,
    pub cursors: Arc<CursorMap>,
    pub correlator: Arc<Correlator>,
    pub stats: StatSink,
    /// Set by the first fatal error; kills the enclosing generation.
    pub cancel: Arc<AtomicBool>,
    /// Open sessions, closed en masse on cancellation so in-flight ops fail
    /// fast.
    pub cancellers: Mutex<Vec<SessionCanceller>>,
    /// Longest acceptable scheduling lag before the worker logs that it is
    /// behind and stops trying to catch up gracefully.
    pub max_lag: Duration,
}

impl WorkerContext {
    /// Flags the generation as failed and closes every open session.
    pub fn trip(&self, reason: &str) {
        if !self.cancel.swap(true, Ordering::SeqCst) {
            log::error!("generation aborting: {}", reason);
            for canceller in self.cancellers.lock().expect("cancellers lock").iter() {
                canceller.cancel();
            }
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Serial executor for one recorded connection. Runs until its channel
/// closes; drains without executing once the generation is cancelled.
pub fn run_worker(
    ctx: Arc<WorkerContext>,
    connection_id: i64,
    rx: Receiver<RecordedOp>,
) -> Result<()> {
    let mut session: Option<ServerSession> = None;
    let mut result = Ok(());

    for record in rx.iter() {
        if ctx.cancelled() {
            continue; // drain
        }
        if record.eof {
            if let Some(session) = session.take() {
                session.close();
            }
            continue;
        }
        if let Err(e) = replay_one(&ctx, connection_id, &record, &mut session) {
            ctx.trip(&format!("connection {}: {}", connection_id, e));
            result = Err(e);
        }
    }
    if let Some(session) = session.take() {
        session.close();
    }
    result
}

fn replay_one(
    ctx: &WorkerContext,
    connection_id: i64,
    record: &RecordedOp,
    session: &mut Option<ServerSession>,
) -> Result<()> {
    // honor the recorded schedule
    if let Some(play_at) = record.play_at {
        let now = Instant::now();
        match play_at.checked_duration_since(now) {
            Some(wait) => thread::sleep(wait),
            None => {
                let lag = now.duration_since(play_at);
                if lag > ctx.max_lag {
                    log::warn!(
                        "connection {} behind schedule by {}ms",
                        connection_id,
                        lag.as_millis()
                    );
                }
            }
        }
    }

    let mut op = match ParsedOp::from_raw(&record.raw) {
        Ok(op) => op,
        Err(e) => {
            // transient: observed, counted, never aborts
            log::warn!("op {} undecodable, skipping: {}", record.order, e);
            return Ok(());
        }
    };

    if op.is_reply() {
        ctx.correlator.add_recorded(&ctx.cursors, &op, record);
        return Ok(());
    }
    if op.is_driver_op() {
        log::debug!(
            "op {}: driver op {:?} observed, not replayed",
            record.order,
            op.meta().command
        );
        return Ok(());
    }
    if let ParsedOp::Unknown(code) = &op {
        return Err(anyhow!("cannot replay unknown op code {}", code));
    }
    if let ParsedOp::Msg(msg) = &op {
        if !msg.replayable() {
            log::warn!("op {}: opaque msg sections, not replayed", record.order);
            return Ok(());
        }
    }

    let mut raw = record.raw.clone();
    if let Err(e) = ctx
        .correlator
        .rewrite_cursors(&ctx.cursors, &mut op, &mut raw)
    {
        log::warn!("op {}: cursor rewrite failed, sending as recorded: {}", record.order, e);
    }

    if session.is_none() {
        // dial failure is fatal for the generation
        let dialed = ServerSession::connect(&ctx.target)?;
        if let Ok(canceller) = dialed.canceller() {
            ctx.cancellers.lock().expect("cancellers lock").push(canceller);
        }
        *session = Some(dialed);
    }
    let session = session.as_mut().expect("session just dialed");

    let played_at = Instant::now();
    let reply = session.execute(&raw, op.expects_reply())?;
    let latency = played_at.elapsed();

    let mut stat = StatRecord::from_op(record, &op);
    if let Some(play_at) = record.play_at {
        let lag = played_at.saturating_duration_since(play_at);
        let played_wall = Utc::now();
        stat.playback_lag_us = Some(lag.as_micros() as i64);
        stat.played_at = Some(played_wall.to_rfc3339());
        stat.play_at = Some(
            (played_wall - chrono::Duration::from_std(lag).unwrap_or_else(|_| chrono::Duration::zero()))
                .to_rfc3339(),
        );
    }
    if let Some(reply_raw) = reply {
        stat.latency_us = Some(latency.as_micros() as i64);
        match ParsedOp::from_raw(&reply_raw) {
            Ok(reply_op) => {
                stat = stat.with_reply(&reply_op);
                ctx.correlator.add_live(&ctx.cursors, &reply_op, record);
            }
            Err(e) => {
                log::warn!("op {}: live reply undecodable: {}", record.order, e);
                stat.errors.push(format!("reply undecodable: {}", e));
            }
        }
    }
    ctx.stats.record(stat);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::conn_id::Endpoint;
    use crate::time::CaptureTime;
    use crate::wire::document::DocBuilder;
    use crate::wire::{MessageHeader, RawMessage, HEADER_LEN};
    use crossbeam::channel::bounded;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Fake server: accepts any number of connections, answers every
    /// reply-expecting request with a legacy reply carrying `live_cursor`,
    /// and records every message it receives across all connections.
    pub(crate) fn spawn_server(
        live_cursor: i64,
    ) -> (String, Arc<Mutex<Vec<RawMessage>>>, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let received = Arc::new(Mutex::new(vec![]));
        let received_in_thread = Arc::clone(&received);
        let handle = thread::spawn(move || {
            for socket in listener.incoming() {
                let mut socket = match socket {
                    Ok(socket) => socket,
                    Err(_) => return,
                };
                let received = Arc::clone(&received_in_thread);
                thread::spawn(move || loop {
                    let mut header_bytes = [0u8; HEADER_LEN];
                    if socket.read_exact(&mut header_bytes).is_err() {
                        return;
                    }
                    let header = MessageHeader::from_bytes(&header_bytes);
                    let mut body = vec![0u8; header.body_len()];
                    if socket.read_exact(&mut body).is_err() {
                        return;
                    }
                    let raw = RawMessage { header, body };
                    let expects_reply = matches!(header.op_code, 2004 | 2005 | 2010 | 2013);
                    received.lock().unwrap().push(raw);
                    if expects_reply {
                        let reply_body =
                            crate::wire::ops::reply::tests::reply_body(live_cursor, &[]);
                        let reply = RawMessage::new(
                            MessageHeader {
                                length: (HEADER_LEN + reply_body.len()) as i32,
                                request_id: 1000,
                                response_to: header.request_id,
                                op_code: 1,
                            },
                            reply_body,
                        )
                        .unwrap();
                        if socket.write_all(&reply.to_wire_bytes()).is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (addr, received, handle)
    }

    pub(crate) fn test_context(target: String) -> Arc<WorkerContext> {
        let (stats, stat_rx) = StatSink::channel(1024);
        // tests that care about stats build their own context
        thread::spawn(move || for _ in stat_rx.iter() {});
        Arc::new(WorkerContext {
            target,
            cursors: Arc::new(CursorMap::new()),
            correlator: Arc::new(Correlator::new()),
            stats,
            cancel: Arc::new(AtomicBool::new(false)),
            cancellers: Mutex::new(vec![]),
            max_lag: Duration::from_secs(1),
        })
    }

    fn recorded(raw: RawMessage, request_id: i32, response_to: i32, order: i64) -> RecordedOp {
        let mut raw = raw;
        raw.header.request_id = request_id;
        raw.header.response_to = response_to;
        let mut op = RecordedOp::message(
            raw,
            CaptureTime(order * 1_000_000),
            Endpoint::new("client:1"),
            Endpoint::new("server:2"),
            0,
        );
        op.order = order;
        op
    }

    fn recorded_reply(cursor_id: i64, response_to: i32, order: i64) -> RecordedOp {
        let body = crate::wire::ops::reply::tests::reply_body(cursor_id, &[]);
        let raw = crate::wire::ops::tests::raw_from_body(1, body);
        let mut op = recorded(raw, 999, response_to, order);
        // replies travel server -> client
        op.src_endpoint = Endpoint::new("server:2");
        op.dst_endpoint = Endpoint::new("client:1");
        op
    }

    #[test]
    fn query_then_getmore_rewrites_cursor() {
        let (addr, received, _server) = spawn_server(9999);
        let ctx = test_context(addr);

        let query_doc = DocBuilder::new().append_str("name", "ada").finish();
        let query_body = crate::wire::ops::query::tests::query_body("app.users", &query_doc);
        let query = recorded(
            crate::wire::ops::tests::raw_from_body(2004, query_body),
            7,
            0,
            0,
        );
        let reply = recorded_reply(42, 7, 1);
        let getmore = recorded(
            crate::wire::ops::tests::raw_from_body(
                2005,
                crate::wire::ops::cursor::tests::getmore_body("app.users", 42),
            ),
            8,
            0,
            2,
        );

        let (tx, rx) = bounded(16);
        tx.send(query).unwrap();
        tx.send(reply).unwrap();
        tx.send(getmore).unwrap();
        drop(tx);
        run_worker(Arc::clone(&ctx), 0, rx).unwrap();

        // recorded cursor 42 was mapped to the live server's 9999
        assert_eq!(ctx.cursors.get(42), Some(9999));
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2, "query and getmore executed");
        let sent_getmore = ParsedOp::from_raw(&received[1]).unwrap();
        assert_eq!(sent_getmore.cursor_ids(), vec![9999]);
    }

    #[test]
    fn driver_ops_not_executed() {
        let (addr, received, _server) = spawn_server(0);
        let ctx = test_context(addr);

        let hello = DocBuilder::new().append_i32("isMaster", 1).finish();
        let body = crate::wire::ops::query::tests::query_body("admin.$cmd", &hello);
        let op = recorded(crate::wire::ops::tests::raw_from_body(2004, body), 7, 0, 0);

        let (tx, rx) = bounded(4);
        tx.send(op).unwrap();
        drop(tx);
        run_worker(Arc::clone(&ctx), 0, rx).unwrap();
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_op_is_fatal_and_cancels() {
        let (addr, _received, _server) = spawn_server(0);
        let ctx = test_context(addr);

        let op = recorded(
            crate::wire::ops::tests::raw_from_body(4242, vec![1, 2, 3]),
            7,
            0,
            0,
        );
        let (tx, rx) = bounded(4);
        tx.send(op).unwrap();
        drop(tx);
        assert!(run_worker(Arc::clone(&ctx), 0, rx).is_err());
        assert!(ctx.cancelled());
    }

    #[test]
    fn dial_failure_is_fatal() {
        // a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let ctx = test_context(addr);
        let query_doc = DocBuilder::new().append_str("name", "ada").finish();
        let body = crate::wire::ops::query::tests::query_body("app.users", &query_doc);
        let op = recorded(crate::wire::ops::tests::raw_from_body(2004, body), 7, 0, 0);

        let (tx, rx) = bounded(4);
        tx.send(op).unwrap();
        drop(tx);
        assert!(run_worker(Arc::clone(&ctx), 0, rx).is_err());
        assert!(ctx.cancelled());
    }
}
