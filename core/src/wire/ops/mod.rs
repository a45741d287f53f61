//! Typed wire operations.
//!
//! Each op variant decodes the legacy wire protocol layout for its op code
//! and answers a small capability set: metadata for stats, an abbreviated
//! rendering, reply expectations, and (for the rewritable subset) cursor id
//! access. The universe of op codes is closed, so dispatch is a plain match.

pub mod command;
pub mod cursor;
pub mod msg;
pub mod query;
pub mod reply;
pub mod write;

pub use self::command::{CommandOp, CommandReplyOp};
pub use self::cursor::{GetMoreOp, KillCursorsOp};
pub use self::msg::{MsgOp, MsgSection};
pub use self::query::QueryOp;
pub use self::reply::ReplyOp;
pub use self::write::{DeleteOp, InsertOp, UpdateOp};

use crate::wire::document::Document;
use crate::wire::{OpCode, RawMessage, WireError};

use byteorder::{ByteOrder, LittleEndian};

/// Commands issued by client drivers for session management. Observed but
/// never re-executed; the replay session's own driver issues equivalents.
const DRIVER_COMMANDS: [&str; 10] = [
    "isMaster",
    "ismaster",
    "hello",
    "ping",
    "buildInfo",
    "getnonce",
    "saslStart",
    "saslContinue",
    "endSessions",
    "getLog",
];

pub(crate) fn is_driver_command(name: &str) -> bool {
    DRIVER_COMMANDS.contains(&name)
}

/// Per-op metadata used by stat records and logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpMetadata {
    /// Coarse op type, e.g. "query", "insert", "command".
    pub op_type: String,
    /// Namespace the op addresses ("db.collection"), empty if inapplicable.
    pub ns: String,
    /// Command name for command-shaped ops.
    pub command: Option<String>,
}

/// A decoded wire operation.
///
/// `Unknown` preserves ops with an unrecognized code: still capturable, only
/// replayable when classified as skippable.
#[derive(Debug, Clone)]
pub enum ParsedOp {
    Query(QueryOp),
    Insert(InsertOp),
    Update(UpdateOp),
    Delete(DeleteOp),
    GetMore(GetMoreOp),
    KillCursors(KillCursorsOp),
    Reply(ReplyOp),
    Command(CommandOp),
    CommandReply(CommandReplyOp),
    Msg(MsgOp),
    Unknown(i32),
}

impl ParsedOp {
    /// Decodes `raw`'s body per its header op code.
    pub fn from_raw(raw: &RawMessage) -> Result<ParsedOp, WireError> {
        let op = match raw.header.op() {
            Some(op) => op,
            None => return Ok(ParsedOp::Unknown(raw.header.op_code)),
        };
        let mut rdr = BodyReader::new(&raw.body, op_name(op));
        Ok(match op {
            OpCode::Query => ParsedOp::Query(QueryOp::from_reader(&mut rdr)?),
            OpCode::Insert => ParsedOp::Insert(InsertOp::from_reader(&mut rdr)?),
            OpCode::Update => ParsedOp::Update(UpdateOp::from_reader(&mut rdr)?),
            OpCode::Delete => ParsedOp::Delete(DeleteOp::from_reader(&mut rdr)?),
            OpCode::GetMore => ParsedOp::GetMore(GetMoreOp::from_reader(&mut rdr)?),
            OpCode::KillCursors => ParsedOp::KillCursors(KillCursorsOp::from_reader(&mut rdr)?),
            OpCode::Reply => ParsedOp::Reply(ReplyOp::from_reader(&mut rdr)?),
            OpCode::Command => ParsedOp::Command(CommandOp::from_reader(&mut rdr)?),
            OpCode::CommandReply => ParsedOp::CommandReply(CommandReplyOp::from_reader(&mut rdr)?),
            OpCode::Msg => ParsedOp::Msg(MsgOp::from_reader(&mut rdr, raw.header.response_to)?),
        })
    }

    pub fn op_code(&self) -> i32 {
        match self {
            ParsedOp::Query(_) => OpCode::Query.as_i32(),
            ParsedOp::Insert(_) => OpCode::Insert.as_i32(),
            ParsedOp::Update(_) => OpCode::Update.as_i32(),
            ParsedOp::Delete(_) => OpCode::Delete.as_i32(),
            ParsedOp::GetMore(_) => OpCode::GetMore.as_i32(),
            ParsedOp::KillCursors(_) => OpCode::KillCursors.as_i32(),
            ParsedOp::Reply(_) => OpCode::Reply.as_i32(),
            ParsedOp::Command(_) => OpCode::Command.as_i32(),
            ParsedOp::CommandReply(_) => OpCode::CommandReply.as_i32(),
            ParsedOp::Msg(_) => OpCode::Msg.as_i32(),
            ParsedOp::Unknown(code) => *code,
        }
    }

    pub fn meta(&self) -> OpMetadata {
        match self {
            ParsedOp::Query(op) => op.meta(),
            ParsedOp::Insert(op) => op.meta(),
            ParsedOp::Update(op) => op.meta(),
            ParsedOp::Delete(op) => op.meta(),
            ParsedOp::GetMore(op) => op.meta(),
            ParsedOp::KillCursors(op) => op.meta(),
            ParsedOp::Reply(op) => op.meta(),
            ParsedOp::Command(op) => op.meta(),
            ParsedOp::CommandReply(op) => op.meta(),
            ParsedOp::Msg(op) => op.meta(),
            ParsedOp::Unknown(code) => OpMetadata {
                op_type: format!("unknown({})", code),
                ..Default::default()
            },
        }
    }

    /// Bounded human-readable rendering for terminal output.
    pub fn abbreviated(&self, n: usize) -> String {
        match self {
            ParsedOp::Query(op) => op.abbreviated(n),
            ParsedOp::Insert(op) => op.abbreviated(n),
            ParsedOp::Update(op) => op.abbreviated(n),
            ParsedOp::Delete(op) => op.abbreviated(n),
            ParsedOp::GetMore(op) => op.abbreviated(n),
            ParsedOp::KillCursors(op) => op.abbreviated(n),
            ParsedOp::Reply(op) => op.abbreviated(n),
            ParsedOp::Command(op) => op.abbreviated(n),
            ParsedOp::CommandReply(op) => op.abbreviated(n),
            ParsedOp::Msg(op) => op.abbreviated(n),
            ParsedOp::Unknown(code) => format!("unknown op {}", code),
        }
    }

    /// Returns `true` for server-to-client reply shapes.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            ParsedOp::Reply(_) | ParsedOp::CommandReply(_)
        ) || matches!(self, ParsedOp::Msg(op) if op.is_reply())
    }

    /// Classifies driver session-management chatter that must not be
    /// re-executed on replay.
    pub fn is_driver_op(&self) -> bool {
        match self {
            ParsedOp::Query(op) => op.is_driver_op(),
            ParsedOp::Command(op) => is_driver_command(&op.command_name),
            ParsedOp::Msg(op) => op.is_driver_op(),
            _ => false,
        }
    }

    /// Whether executing this op should block on a server reply.
    pub fn expects_reply(&self) -> bool {
        match self {
            ParsedOp::Query(_) | ParsedOp::GetMore(_) | ParsedOp::Command(_) => true,
            ParsedOp::Msg(op) => op.expects_reply(),
            _ => false,
        }
    }

    /// Cursor ids carried by the op, in body order. Empty for ops without
    /// cursor ids.
    pub fn cursor_ids(&self) -> Vec<i64> {
        match self {
            ParsedOp::GetMore(op) => vec![op.cursor_id],
            ParsedOp::KillCursors(op) => op.cursor_ids.clone(),
            ParsedOp::Msg(op) => op.cursor_ids(),
            _ => vec![],
        }
    }

    /// Replaces the op's cursor ids with `mapped`, positionally aligned with
    /// [`ParsedOp::cursor_ids`], regenerating `raw`'s body. `None` marks an
    /// unmapped id: dropped for a legacy killCursors body, rewritten to `0`
    /// everywhere else.
    pub fn rewrite_cursor_ids(
        &mut self,
        raw: &mut RawMessage,
        mapped: &[Option<i64>],
    ) -> Result<(), WireError> {
        match self {
            ParsedOp::GetMore(op) => op.rewrite(raw, mapped.first().copied().flatten()),
            ParsedOp::KillCursors(op) => op.rewrite(raw, mapped),
            ParsedOp::Msg(op) => op.rewrite_cursor_ids(raw, mapped),
            _ => Ok(()),
        }
    }

    /// Cursor id reported by a reply-shaped op. `Some(0)` means the reply
    /// shape is present but the cursor ended (or none was opened); `None`
    /// means the op is not a reply or carries no cursor information.
    pub fn reply_cursor_id(&self) -> Option<i64> {
        match self {
            ParsedOp::Reply(op) => Some(op.cursor_id),
            ParsedOp::CommandReply(op) => Some(op.cursor_id()),
            ParsedOp::Msg(op) if op.is_reply() => Some(op.reply_cursor_id()),
            _ => None,
        }
    }

    /// Number of documents returned by a reply-shaped op.
    pub fn n_returned(&self) -> Option<i64> {
        match self {
            ParsedOp::Reply(op) => Some(op.num_returned as i64),
            ParsedOp::CommandReply(op) => Some(op.n_returned()),
            ParsedOp::Msg(op) if op.is_reply() => Some(op.n_returned()),
            _ => None,
        }
    }

    /// First document of a reply-shaped op, for error extraction.
    pub fn first_reply_doc(&self) -> Option<Document<'_>> {
        match self {
            ParsedOp::Reply(op) => op.first_doc(),
            ParsedOp::CommandReply(op) => Document::at_start(&op.command_reply).ok(),
            ParsedOp::Msg(op) => op.body_doc(),
            _ => None,
        }
    }
}

pub(crate) fn op_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Reply => "reply",
        OpCode::Update => "update",
        OpCode::Insert => "insert",
        OpCode::Query => "query",
        OpCode::GetMore => "getmore",
        OpCode::Delete => "delete",
        OpCode::KillCursors => "killcursors",
        OpCode::Command => "command",
        OpCode::CommandReply => "command_reply",
        OpCode::Msg => "msg",
    }
}

/* --------------------------------------------------------------------------------- */

/// Positioned reader over an op body.
pub(crate) struct BodyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    op: &'static str,
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(bytes: &'a [u8], op: &'static str) -> Self {
        BodyReader { bytes, pos: 0, op }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn bail<T>(&self, what: &str) -> Result<T, WireError> {
        Err(WireError::BadBody(self.op, format!("{} at offset {}", what, self.pos)))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, WireError> {
        if self.remaining() < 4 {
            return self.bail("truncated i32");
        }
        let v = LittleEndian::read_i32(&self.bytes[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(self.read_i32()? as u32)
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64, WireError> {
        if self.remaining() < 8 {
            return self.bail("truncated i64");
        }
        let v = LittleEndian::read_i64(&self.bytes[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.remaining() < 1 {
            return self.bail("truncated byte");
        }
        let v = self.bytes[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub(crate) fn read_cstring(&mut self) -> Result<String, WireError> {
        let rest = &self.bytes[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(nul) => {
                let s = match std::str::from_utf8(&rest[..nul]) {
                    Ok(s) => s.to_string(),
                    Err(_) => return self.bail("non-utf8 cstring"),
                };
                self.pos += nul + 1;
                Ok(s)
            }
            None => self.bail("unterminated cstring"),
        }
    }

    /// Reads one length-prefixed document, returning its raw bytes.
    pub(crate) fn read_document(&mut self) -> Result<Vec<u8>, WireError> {
        let doc = Document::at_start(&self.bytes[self.pos..])
            .map_err(|e| WireError::BadBody(self.op, format!("{} at offset {}", e, self.pos)))?;
        let bytes = doc.as_bytes().to_vec();
        self.pos += doc.len();
        Ok(bytes)
    }

    /// Reads documents until the body is exhausted.
    pub(crate) fn read_documents_to_end(&mut self) -> Result<Vec<Vec<u8>>, WireError> {
        let mut docs = vec![];
        while self.remaining() > 0 {
            docs.push(self.read_document()?);
        }
        Ok(docs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::wire::document::DocBuilder;
    use crate::wire::MessageHeader;

    pub(crate) fn raw_from_body(op_code: i32, body: Vec<u8>) -> RawMessage {
        let header = MessageHeader {
            length: (16 + body.len()) as i32,
            request_id: 1,
            response_to: 0,
            op_code,
        };
        RawMessage::new(header, body).unwrap()
    }

    #[test]
    fn unknown_op_code_preserved() {
        let raw = raw_from_body(4242, vec![1, 2, 3]);
        let op = ParsedOp::from_raw(&raw).unwrap();
        assert!(matches!(op, ParsedOp::Unknown(4242)));
        assert_eq!(op.op_code(), 4242);
        assert!(!op.is_driver_op());
        assert!(op.cursor_ids().is_empty());
    }

    #[test]
    fn body_reader_cstring_and_ints() {
        let mut body = vec![];
        body.extend_from_slice(&7i32.to_le_bytes());
        body.extend_from_slice(b"db.coll\0");
        body.extend_from_slice(&42i64.to_le_bytes());
        let mut rdr = BodyReader::new(&body, "test");
        assert_eq!(rdr.read_i32().unwrap(), 7);
        assert_eq!(rdr.read_cstring().unwrap(), "db.coll");
        assert_eq!(rdr.read_i64().unwrap(), 42);
        assert_eq!(rdr.remaining(), 0);
        assert!(rdr.read_i32().is_err());
    }

    #[test]
    fn body_reader_documents() {
        let doc = DocBuilder::new().append_i32("a", 1).finish();
        let mut body = doc.clone();
        body.extend_from_slice(&doc);
        let mut rdr = BodyReader::new(&body, "test");
        let docs = rdr.read_documents_to_end().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0], doc);
    }

    #[test]
    fn driver_command_list() {
        assert!(is_driver_command("isMaster"));
        assert!(is_driver_command("endSessions"));
        assert!(!is_driver_command("find"));
    }
}
