//! OP_REPLY decoding.

use crate::wire::document::Document;
use crate::wire::ops::{BodyReader, OpMetadata};
use crate::wire::WireError;

/// A legacy server reply: flags, cursor id, batch window, and the returned
/// documents.
#[derive(Debug, Clone)]
pub struct ReplyOp {
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub num_returned: i32,
    pub documents: Vec<Vec<u8>>,
}

impl ReplyOp {
    pub(crate) fn from_reader(rdr: &mut BodyReader<'_>) -> Result<ReplyOp, WireError> {
        let flags = rdr.read_i32()?;
        let cursor_id = rdr.read_i64()?;
        let starting_from = rdr.read_i32()?;
        let num_returned = rdr.read_i32()?;
        let documents = rdr.read_documents_to_end()?;
        Ok(ReplyOp {
            flags,
            cursor_id,
            starting_from,
            num_returned,
            documents,
        })
    }

    pub fn first_doc(&self) -> Option<Document<'_>> {
        self.documents.first().and_then(|d| Document::at_start(d).ok())
    }

    pub(crate) fn meta(&self) -> OpMetadata {
        OpMetadata {
            op_type: "reply".to_string(),
            ns: String::new(),
            command: None,
        }
    }

    pub(crate) fn abbreviated(&self, n: usize) -> String {
        let first = self
            .first_doc()
            .map(|d| d.abbreviated(n))
            .unwrap_or_default();
        format!(
            "reply cursor={} n={} {}",
            self.cursor_id, self.num_returned, first
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::wire::document::DocBuilder;
    use crate::wire::ops::tests::raw_from_body;
    use crate::wire::ops::ParsedOp;

    pub(crate) fn reply_body(cursor_id: i64, docs: &[Vec<u8>]) -> Vec<u8> {
        let mut body = vec![];
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&cursor_id.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(docs.len() as i32).to_le_bytes());
        for doc in docs {
            body.extend_from_slice(doc);
        }
        body
    }

    #[test]
    fn decode_reply_with_cursor() {
        let doc = DocBuilder::new().append_i32("x", 1).finish();
        let raw = raw_from_body(1, reply_body(42, &[doc.clone()]));
        let op = ParsedOp::from_raw(&raw).unwrap();
        assert!(op.is_reply());
        assert_eq!(op.reply_cursor_id(), Some(42));
        assert_eq!(op.n_returned(), Some(1));
        match op {
            ParsedOp::Reply(reply) => assert_eq!(reply.documents, vec![doc]),
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn exhausted_cursor_reports_zero() {
        let raw = raw_from_body(1, reply_body(0, &[]));
        let op = ParsedOp::from_raw(&raw).unwrap();
        assert_eq!(op.reply_cursor_id(), Some(0));
        assert_eq!(op.n_returned(), Some(0));
    }
}
