//! OP_COMMAND and OP_COMMANDREPLY decoding.

use crate::wire::document::Document;
use crate::wire::ops::{BodyReader, OpMetadata};
use crate::wire::WireError;

#[derive(Debug, Clone)]
pub struct CommandOp {
    pub database: String,
    pub command_name: String,
    pub metadata: Vec<u8>,
    pub command_args: Vec<u8>,
    pub input_docs: Vec<Vec<u8>>,
}

impl CommandOp {
    pub(crate) fn from_reader(rdr: &mut BodyReader<'_>) -> Result<CommandOp, WireError> {
        let database = rdr.read_cstring()?;
        let command_name = rdr.read_cstring()?;
        let metadata = rdr.read_document()?;
        let command_args = rdr.read_document()?;
        let input_docs = rdr.read_documents_to_end()?;
        Ok(CommandOp {
            database,
            command_name,
            metadata,
            command_args,
            input_docs,
        })
    }

    pub(crate) fn meta(&self) -> OpMetadata {
        OpMetadata {
            op_type: "command".to_string(),
            ns: format!("{}.$cmd", self.database),
            command: Some(self.command_name.clone()),
        }
    }

    pub(crate) fn abbreviated(&self, n: usize) -> String {
        let args = Document::at_start(&self.command_args)
            .map(|d| d.abbreviated(n))
            .unwrap_or_default();
        format!("command {}.{} {}", self.database, self.command_name, args)
    }
}

#[derive(Debug, Clone)]
pub struct CommandReplyOp {
    pub metadata: Vec<u8>,
    pub command_reply: Vec<u8>,
    pub output_docs: Vec<Vec<u8>>,
}

impl CommandReplyOp {
    pub(crate) fn from_reader(rdr: &mut BodyReader<'_>) -> Result<CommandReplyOp, WireError> {
        let metadata = rdr.read_document()?;
        let command_reply = rdr.read_document()?;
        let output_docs = rdr.read_documents_to_end()?;
        Ok(CommandReplyOp {
            metadata,
            command_reply,
            output_docs,
        })
    }

    /// Cursor id reported in the reply document, `0` when the reply carries
    /// no open cursor.
    pub(crate) fn cursor_id(&self) -> i64 {
        match Document::at_start(&self.command_reply) {
            Ok(doc) => reply_doc_cursor_id(&doc),
            Err(_) => 0,
        }
    }

    pub(crate) fn n_returned(&self) -> i64 {
        match Document::at_start(&self.command_reply) {
            Ok(doc) => reply_doc_n_returned(&doc).unwrap_or(self.output_docs.len() as i64),
            Err(_) => 0,
        }
    }

    pub(crate) fn meta(&self) -> OpMetadata {
        OpMetadata {
            op_type: "command_reply".to_string(),
            ns: String::new(),
            command: None,
        }
    }

    pub(crate) fn abbreviated(&self, n: usize) -> String {
        let reply = Document::at_start(&self.command_reply)
            .map(|d| d.abbreviated(n))
            .unwrap_or_default();
        format!("command_reply {}", reply)
    }
}

/// Cursor id from a command-style reply document. Prefers the top-level
/// `cursor.id`; failing that, scans a `cursors` array (the multi-cursor
/// reply shape) for the first entry whose cursor document carries a
/// `firstBatch`/`nextBatch` and takes the id sitting next to that batch.
/// A batch-bearing document with no id anywhere reports 0: there is no
/// cursor left to map.
pub(crate) fn reply_doc_cursor_id(doc: &Document<'_>) -> i64 {
    if let Some(id) = doc.get_path("cursor.id").and_then(|e| e.as_i64()) {
        return id;
    }
    batch_parent_id(doc).unwrap_or(0)
}

/// The id next to the first batch found in a `cursors` array. Each entry is
/// either the cursor container itself or wraps it as `{cursor: {...}}`.
fn batch_parent_id(doc: &Document<'_>) -> Option<i64> {
    let cursors = doc.get("cursors")?.as_document()?;
    for entry in cursors.iter().flatten() {
        let container = match entry.as_document() {
            Some(container) => container,
            None => continue,
        };
        let cursor = container
            .get("cursor")
            .and_then(|e| e.as_document())
            .unwrap_or(container);
        if cursor.get("firstBatch").is_some() || cursor.get("nextBatch").is_some() {
            if let Some(id) = cursor.get("id").and_then(|e| e.as_i64()) {
                return Some(id);
            }
        }
    }
    None
}

/// Number of documents in a command-style reply batch, if the reply has
/// cursor shape.
pub(crate) fn reply_doc_n_returned(doc: &Document<'_>) -> Option<i64> {
    let cursor = doc.get("cursor")?.as_document()?;
    let batch = cursor
        .get("firstBatch")
        .or_else(|| cursor.get("nextBatch"))?
        .as_document()?;
    Some(batch.iter().flatten().count() as i64)
}
