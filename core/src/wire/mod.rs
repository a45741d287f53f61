//! Types for parsing and manipulating framed wire messages.
//!
//! Every message on the wire begins with a fixed 16-byte header. The declared
//! `length` is the total message size, header included, so a header is only
//! plausible when `16 <= length <= max_message_size` and its op code is one of
//! the known values. Framing recovery after packet loss leans on that
//! plausibility check.

pub mod document;
pub mod ops;

use std::fmt;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 16;

/// Default ceiling for a plausible message, header included.
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("message body truncated: have {have} bytes, header declares {want}")]
    Truncated { have: usize, want: usize },

    #[error("implausible header: length {0}")]
    BadLength(i32),

    #[error("unknown op code {0}")]
    UnknownOpCode(i32),

    #[error("malformed {0} body: {1}")]
    BadBody(&'static str, String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Wire operation codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Command,
    CommandReply,
    Msg,
}

impl OpCode {
    /// All op codes recognized by the framing plausibility check.
    pub fn from_i32(code: i32) -> Option<OpCode> {
        match code {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            2010 => Some(OpCode::Command),
            2011 => Some(OpCode::CommandReply),
            2013 => Some(OpCode::Msg),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Command => 2010,
            OpCode::CommandReply => 2011,
            OpCode::Msg => 2013,
        }
    }

    /// Returns `true` for server-to-client reply codes.
    pub fn is_reply(&self) -> bool {
        matches!(self, OpCode::Reply | OpCode::CommandReply)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
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
        };
        write!(f, "{}", name)
    }
}

/// Fixed 16-byte prefix of every wire message.
///
/// `length` is the TOTAL message size, header included.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    /// Parses a header from the first 16 bytes of `buf`.
    ///
    /// Callers must ensure `buf.len() >= HEADER_LEN`.
    pub fn from_bytes(buf: &[u8]) -> MessageHeader {
        let mut rdr = &buf[..HEADER_LEN];
        // reads from a 16-byte slice cannot fail
        MessageHeader {
            length: rdr.read_i32::<LittleEndian>().unwrap(),
            request_id: rdr.read_i32::<LittleEndian>().unwrap(),
            response_to: rdr.read_i32::<LittleEndian>().unwrap(),
            op_code: rdr.read_i32::<LittleEndian>().unwrap(),
        }
    }

    pub fn read_from<R: Read>(rdr: &mut R) -> Result<MessageHeader, WireError> {
        Ok(MessageHeader {
            length: rdr.read_i32::<LittleEndian>()?,
            request_id: rdr.read_i32::<LittleEndian>()?,
            response_to: rdr.read_i32::<LittleEndian>()?,
            op_code: rdr.read_i32::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, wtr: &mut W) -> Result<(), WireError> {
        wtr.write_i32::<LittleEndian>(self.length)?;
        wtr.write_i32::<LittleEndian>(self.request_id)?;
        wtr.write_i32::<LittleEndian>(self.response_to)?;
        wtr.write_i32::<LittleEndian>(self.op_code)?;
        Ok(())
    }

    /// A header is plausible iff its declared length is in range and its op
    /// code is known. Used to (re)align framing on a byte stream.
    pub fn is_plausible(&self, max_message_size: usize) -> bool {
        self.length >= HEADER_LEN as i32
            && (self.length as usize) <= max_message_size
            && OpCode::from_i32(self.op_code).is_some()
    }

    pub fn op(&self) -> Option<OpCode> {
        OpCode::from_i32(self.op_code)
    }

    /// Body size declared by the header.
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_LEN)
    }
}

/// A framed wire message: fixed header plus the raw body bytes.
///
/// Immutable after framing; cursor rewriting clones into a new body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

impl RawMessage {
    pub fn new(header: MessageHeader, body: Vec<u8>) -> Result<RawMessage, WireError> {
        if body.len() != header.body_len() {
            return Err(WireError::Truncated {
                have: body.len(),
                want: header.body_len(),
            });
        }
        Ok(RawMessage { header, body })
    }

    /// Reconstructs the full on-the-wire byte sequence.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        self.header.write_to(&mut out).expect("write to Vec");
        out.extend_from_slice(&self.body);
        out
    }

    /// Parses a full message (header plus body) from `bytes`.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<RawMessage, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                have: bytes.len(),
                want: HEADER_LEN,
            });
        }
        let header = MessageHeader::from_bytes(bytes);
        if header.length < HEADER_LEN as i32 {
            return Err(WireError::BadLength(header.length));
        }
        if bytes.len() < header.length as usize {
            return Err(WireError::Truncated {
                have: bytes.len(),
                want: header.length as usize,
            });
        }
        Ok(RawMessage {
            header,
            body: bytes[HEADER_LEN..header.length as usize].to_vec(),
        })
    }
}
