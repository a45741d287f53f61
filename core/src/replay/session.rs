//! Raw wire session to the replay target.
//!
//! The replay path writes recorded messages byte-for-byte (cursor ids
//! rewritten) onto a plain TCP connection and reads framed replies back. No
//! handshake is performed beyond TCP connect; driver chatter recorded in the
//! trace is skipped rather than replayed, and the session issues none of its
//! own. Socket read timeouts are disabled: operations may block
//! indefinitely, and cancellation closes the socket out from under any
//! in-flight read to fail it fast.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

use anyhow::{bail, Context, Result};

use crate::wire::{MessageHeader, RawMessage, HEADER_LEN, MAX_MESSAGE_SIZE};

/// Extracts `host:port` from a target URI. Accepts a bare `host:port` or a
/// `scheme://host:port[/path]` form; the port defaults to 27017.
pub fn parse_target(uri: &str) -> Result<String> {
    let rest = match uri.split_once("://") {
        Some((_, rest)) => rest,
        None => uri,
    };
    let hostport = rest
        .split(|c| c == '/' || c == '?')
        .next()
        .unwrap_or_default()
        .trim();
    if hostport.is_empty() {
        bail!("no host in target {:?}", uri);
    }
    if hostport.contains(':') {
        Ok(hostport.to_string())
    } else {
        Ok(format!("{}:27017", hostport))
    }
}

/// One connection to the target server, owned by one worker.
pub struct ServerSession {
    stream: TcpStream,
}

impl ServerSession {
    pub fn connect(addr: &str) -> Result<ServerSession> {
        let stream =
            TcpStream::connect(addr).with_context(|| format!("dialing replay target {}", addr))?;
        stream.set_nodelay(true).ok();
        // operations may block indefinitely; cancellation closes the socket
        stream.set_read_timeout(None).ok();
        ServerSession::from_stream(stream)
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<ServerSession> {
        Ok(ServerSession { stream })
    }

    /// A handle that can close the session from another thread.
    pub fn canceller(&self) -> Result<SessionCanceller> {
        Ok(SessionCanceller {
            stream: self.stream.try_clone().context("cloning session handle")?,
        })
    }

    /// Writes one message and, if the op expects one, reads the framed
    /// reply.
    pub fn execute(
        &mut self,
        raw: &RawMessage,
        expects_reply: bool,
    ) -> Result<Option<RawMessage>> {
        self.stream
            .write_all(&raw.to_wire_bytes())
            .context("writing to replay target")?;
        if !expects_reply {
            return Ok(None);
        }
        Ok(Some(self.read_message()?))
    }

    fn read_message(&mut self) -> Result<RawMessage> {
        let mut header_bytes = [0u8; HEADER_LEN];
        self.stream
            .read_exact(&mut header_bytes)
            .context("reading reply header")?;
        let header = MessageHeader::from_bytes(&header_bytes);
        if !(HEADER_LEN as i32..=MAX_MESSAGE_SIZE as i32).contains(&header.length) {
            bail!("server sent implausible reply length {}", header.length);
        }
        let mut body = vec![0u8; header.body_len()];
        self.stream
            .read_exact(&mut body)
            .context("reading reply body")?;
        Ok(RawMessage { header, body })
    }

    pub fn close(&self) {
        self.stream.shutdown(Shutdown::Both).ok();
    }
}

/// Closes a session's socket to fail any in-flight op fast.
pub struct SessionCanceller {
    stream: TcpStream,
}

impl SessionCanceller {
    pub fn cancel(&self) {
        self.stream.shutdown(Shutdown::Both).ok();
    }
}
