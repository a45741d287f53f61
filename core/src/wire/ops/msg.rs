//! OP_MSG decoding: flag bits plus a sequence of typed sections.
//!
//! Section kind 0 carries the command (or reply) body document; kind 1
//! carries a named document sequence. An op with an unknown section kind is
//! kept for observation but marked non-replayable, since the section layout
//! cannot be recovered.

use byteorder::{ByteOrder, LittleEndian};

use crate::wire::document::Document;
use crate::wire::ops::command::{reply_doc_cursor_id, reply_doc_n_returned};
use crate::wire::ops::{is_driver_command, BodyReader, OpMetadata};
use crate::wire::{RawMessage, WireError};

pub const MSG_FLAG_CHECKSUM_PRESENT: u32 = 0x1;
pub const MSG_FLAG_MORE_TO_COME: u32 = 0x2;

#[derive(Debug, Clone)]
pub enum MsgSection {
    /// Kind 0: the single body document.
    Body(Vec<u8>),
    /// Kind 1: a document sequence addressed by identifier.
    DocumentSequence {
        identifier: String,
        documents: Vec<Vec<u8>>,
    },
}

#[derive(Debug, Clone)]
pub struct MsgOp {
    pub flag_bits: u32,
    pub sections: Vec<MsgSection>,
    /// `response_to` from the enclosing header; nonzero marks a reply.
    pub response_to: i32,
    /// Offset of the kind-0 body document within the raw body.
    body_offset: Option<usize>,
    /// Set when a section kind we cannot size was encountered.
    unknown_section: bool,
}

impl MsgOp {
    pub(crate) fn from_reader(
        rdr: &mut BodyReader<'_>,
        response_to: i32,
    ) -> Result<MsgOp, WireError> {
        let flag_bits = rdr.read_u32()?;
        let checksum_len = if flag_bits & MSG_FLAG_CHECKSUM_PRESENT != 0 {
            4
        } else {
            0
        };

        let mut sections = vec![];
        let mut body_offset = None;
        let mut unknown_section = false;
        while rdr.remaining() > checksum_len {
            let kind = rdr.read_u8()?;
            match kind {
                0 => {
                    if body_offset.is_none() {
                        body_offset = Some(rdr.pos());
                    }
                    sections.push(MsgSection::Body(rdr.read_document()?));
                }
                1 => {
                    let size = rdr.read_i32()?;
                    if size < 4 {
                        return Err(WireError::BadBody(
                            "msg",
                            format!("section size {} out of range", size),
                        ));
                    }
                    let end = rdr.pos() - 4 + size as usize;
                    let identifier = rdr.read_cstring()?;
                    let mut documents = vec![];
                    while rdr.pos() < end {
                        documents.push(rdr.read_document()?);
                    }
                    sections.push(MsgSection::DocumentSequence {
                        identifier,
                        documents,
                    });
                }
                other => {
                    log::warn!("op_msg section kind {} not understood, keeping raw", other);
                    unknown_section = true;
                    break;
                }
            }
        }

        Ok(MsgOp {
            flag_bits,
            sections,
            response_to,
            body_offset,
            unknown_section,
        })
    }

    /// The kind-0 body document.
    pub fn body_doc(&self) -> Option<Document<'_>> {
        self.sections.iter().find_map(|s| match s {
            MsgSection::Body(doc) => Document::at_start(doc).ok(),
            MsgSection::DocumentSequence { .. } => None,
        })
    }

    pub fn command_name(&self) -> Option<String> {
        self.body_doc()?.first_element_name().map(str::to_string)
    }

    pub(crate) fn is_reply(&self) -> bool {
        self.response_to != 0
    }

    /// Ops whose section layout could not be fully recovered are observable
    /// but never re-executed.
    pub fn replayable(&self) -> bool {
        !self.unknown_section
    }

    pub(crate) fn expects_reply(&self) -> bool {
        self.flag_bits & MSG_FLAG_MORE_TO_COME == 0
    }

    pub(crate) fn is_driver_op(&self) -> bool {
        if self.is_reply() {
            return false;
        }
        match self.command_name() {
            Some(name) => is_driver_command(&name),
            None => false,
        }
    }

    pub(crate) fn cursor_ids(&self) -> Vec<i64> {
        if self.is_reply() {
            return vec![];
        }
        let doc = match self.body_doc() {
            Some(doc) => doc,
            None => return vec![],
        };
        match doc.first_element_name() {
            Some("getMore") => doc
                .get("getMore")
                .and_then(|e| e.as_i64())
                .map(|id| vec![id])
                .unwrap_or_default(),
            Some("killCursors") => match doc.get("cursors").and_then(|e| e.as_document()) {
                Some(arr) => arr.iter().flatten().filter_map(|e| e.as_i64()).collect(),
                None => vec![],
            },
            _ => vec![],
        }
    }

    /// Patches cursor ids in place inside the kind-0 body document. An
    /// unmapped id is rewritten to `0`; the body length never changes, so no
    /// section or header lengths need fixing.
    pub(crate) fn rewrite_cursor_ids(
        &mut self,
        raw: &mut RawMessage,
        mapped: &[Option<i64>],
    ) -> Result<(), WireError> {
        let body_offset = match self.body_offset {
            Some(off) => off,
            None => return Ok(()),
        };
        let doc_bytes = raw.body[body_offset..].to_vec();
        let doc = Document::at_start(&doc_bytes)
            .map_err(|e| WireError::BadBody("msg", e.to_string()))?;

        // collect absolute offsets of each 8-byte cursor id value
        let mut offsets: Vec<usize> = vec![];
        match doc.first_element_name() {
            Some("getMore") => {
                if let Some(elem) = doc.get("getMore") {
                    if elem.as_i64().is_some() && elem.value.len() == 8 {
                        offsets.push(body_offset + elem.value_offset);
                    }
                }
            }
            Some("killCursors") => {
                if let Some(cursors) = doc.get("cursors") {
                    let arr_offset = body_offset + cursors.value_offset;
                    if let Some(arr) = cursors.as_document() {
                        for entry in arr.iter().flatten() {
                            if entry.as_i64().is_some() && entry.value.len() == 8 {
                                offsets.push(arr_offset + entry.value_offset);
                            }
                        }
                    }
                }
            }
            _ => {}
        }

        for (i, offset) in offsets.iter().enumerate() {
            let live_id = mapped.get(i).copied().flatten().unwrap_or(0);
            LittleEndian::write_i64(&mut raw.body[*offset..*offset + 8], live_id);
        }

        // re-read the patched body so this op reflects what will be sent
        for section in &mut self.sections {
            if let MsgSection::Body(doc) = section {
                let len = doc.len();
                doc.copy_from_slice(&raw.body[body_offset..body_offset + len]);
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn reply_cursor_id(&self) -> i64 {
        match self.body_doc() {
            Some(doc) => reply_doc_cursor_id(&doc),
            None => 0,
        }
    }

    pub(crate) fn n_returned(&self) -> i64 {
        match self.body_doc() {
            Some(doc) => reply_doc_n_returned(&doc).unwrap_or(0),
            None => 0,
        }
    }

    fn ns(&self) -> String {
        let doc = match self.body_doc() {
            Some(doc) => doc,
            None => return String::new(),
        };
        let db = doc
            .get("$db")
            .and_then(|e| e.as_str())
            .unwrap_or_default();
        let collection = doc
            .iter()
            .flatten()
            .next()
            .and_then(|e| e.as_str().map(str::to_string));
        match (db.is_empty(), collection) {
            (false, Some(coll)) => format!("{}.{}", db, coll),
            (false, None) => db.to_string(),
            _ => String::new(),
        }
    }

    pub(crate) fn meta(&self) -> OpMetadata {
        OpMetadata {
            op_type: if self.is_reply() {
                "msg_reply".to_string()
            } else {
                "msg".to_string()
            },
            ns: self.ns(),
            command: if self.is_reply() {
                None
            } else {
                self.command_name()
            },
        }
    }

    pub(crate) fn abbreviated(&self, n: usize) -> String {
        let body = self
            .body_doc()
            .map(|d| d.abbreviated(n))
            .unwrap_or_default();
        format!("msg flags={:#x} {}", self.flag_bits, body)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::wire::document::DocBuilder;
    use crate::wire::ops::tests::raw_from_body;
    use crate::wire::ops::ParsedOp;
    use crate::wire::MessageHeader;

    pub(crate) fn msg_body(flag_bits: u32, body_doc: &[u8]) -> Vec<u8> {
        let mut body = vec![];
        body.extend_from_slice(&flag_bits.to_le_bytes());
        body.push(0);
        body.extend_from_slice(body_doc);
        body
    }

    fn msg_reply(body_doc: &[u8]) -> RawMessage {
        let body = msg_body(0, body_doc);
        let header = MessageHeader {
            length: (16 + body.len()) as i32,
            request_id: 2,
            response_to: 1,
            op_code: 2013,
        };
        RawMessage::new(header, body).unwrap()
    }

    #[test]
    fn decode_find_command() {
        let doc = DocBuilder::new()
            .append_str("find", "users")
            .append_str("$db", "app")
            .finish();
        let op = ParsedOp::from_raw(&raw_from_body(2013, msg_body(0, &doc))).unwrap();
        let meta = op.meta();
        assert_eq!(meta.op_type, "msg");
        assert_eq!(meta.ns, "app.users");
        assert_eq!(meta.command.as_deref(), Some("find"));
        assert!(op.expects_reply());
        assert!(!op.is_reply());
    }

    #[test]
    fn more_to_come_expects_no_reply() {
        let doc = DocBuilder::new().append_str("insert", "users").finish();
        let op =
            ParsedOp::from_raw(&raw_from_body(2013, msg_body(MSG_FLAG_MORE_TO_COME, &doc))).unwrap();
        assert!(!op.expects_reply());
    }

    #[test]
    fn hello_is_driver_op() {
        let doc = DocBuilder::new()
            .append_i32("hello", 1)
            .append_str("$db", "admin")
            .finish();
        let op = ParsedOp::from_raw(&raw_from_body(2013, msg_body(0, &doc))).unwrap();
        assert!(op.is_driver_op());
    }

    #[test]
    fn document_sequence_section() {
        let body_doc = DocBuilder::new()
            .append_str("insert", "users")
            .append_str("$db", "app")
            .finish();
        let seq_doc = DocBuilder::new().append_i32("x", 1).finish();

        let mut body = vec![];
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(0);
        body.extend_from_slice(&body_doc);
        body.push(1);
        let size = 4 + "documents".len() + 1 + seq_doc.len();
        body.extend_from_slice(&(size as i32).to_le_bytes());
        body.extend_from_slice(b"documents\0");
        body.extend_from_slice(&seq_doc);

        match ParsedOp::from_raw(&raw_from_body(2013, body)).unwrap() {
            ParsedOp::Msg(msg) => {
                assert_eq!(msg.sections.len(), 2);
                match &msg.sections[1] {
                    MsgSection::DocumentSequence {
                        identifier,
                        documents,
                    } => {
                        assert_eq!(identifier, "documents");
                        assert_eq!(documents, &vec![seq_doc]);
                    }
                    other => panic!("expected sequence, got {:?}", other),
                }
            }
            other => panic!("expected msg, got {:?}", other),
        }
    }

    #[test]
    fn getmore_cursor_rewrite_in_place() {
        let doc = DocBuilder::new()
            .append_i64("getMore", 42)
            .append_str("collection", "users")
            .append_str("$db", "app")
            .finish();
        let mut raw = raw_from_body(2013, msg_body(0, &doc));
        let mut op = ParsedOp::from_raw(&raw).unwrap();
        assert_eq!(op.cursor_ids(), vec![42]);

        op.rewrite_cursor_ids(&mut raw, &[Some(9999)]).unwrap();
        assert_eq!(op.cursor_ids(), vec![9999]);
        let reparsed = ParsedOp::from_raw(&raw).unwrap();
        assert_eq!(reparsed.cursor_ids(), vec![9999]);
        // body length is unchanged by an in-place patch
        assert_eq!(raw.header.length as usize, 16 + raw.body.len());
    }

    #[test]
    fn killcursors_unmapped_patched_to_zero() {
        let ids = DocBuilder::new()
            .append_i64("0", 42)
            .append_i64("1", 43)
            .finish();
        let doc = DocBuilder::new()
            .append_str("killCursors", "users")
            .append_array("cursors", &ids)
            .append_str("$db", "app")
            .finish();
        let mut raw = raw_from_body(2013, msg_body(0, &doc));
        let mut op = ParsedOp::from_raw(&raw).unwrap();
        assert_eq!(op.cursor_ids(), vec![42, 43]);

        op.rewrite_cursor_ids(&mut raw, &[Some(1000), None]).unwrap();
        assert_eq!(
            ParsedOp::from_raw(&raw).unwrap().cursor_ids(),
            vec![1000, 0]
        );
    }

    #[test]
    fn reply_cursor_extraction() {
        let reply_doc = crate::wire::ops::command::tests::cursor_reply_doc(7777, 2, false);
        let op = ParsedOp::from_raw(&msg_reply(&reply_doc)).unwrap();
        assert!(op.is_reply());
        assert_eq!(op.reply_cursor_id(), Some(7777));
        assert_eq!(op.n_returned(), Some(2));
    }

    #[test]
    fn unknown_section_kind_not_replayable() {
        let doc = DocBuilder::new().append_str("find", "users").finish();
        let mut body = msg_body(0, &doc);
        body.push(7); // unknown section kind
        body.extend_from_slice(&[1, 2, 3]);
        match ParsedOp::from_raw(&raw_from_body(2013, body)).unwrap() {
            ParsedOp::Msg(msg) => assert!(!msg.replayable()),
            other => panic!("expected msg, got {:?}", other),
        }
    }
}
