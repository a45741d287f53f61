//! OP_QUERY decoding.

use crate::wire::document::Document;
use crate::wire::ops::{is_driver_command, BodyReader, OpMetadata};
use crate::wire::WireError;

/// A legacy query: flags, namespace, skip/return counts, query document, and
/// an optional projection document.
#[derive(Debug, Clone)]
pub struct QueryOp {
    pub flags: i32,
    pub full_collection: String,
    pub num_to_skip: i32,
    pub num_to_return: i32,
    pub query: Vec<u8>,
    pub return_fields: Option<Vec<u8>>,
}

impl QueryOp {
    pub(crate) fn from_reader(rdr: &mut BodyReader<'_>) -> Result<QueryOp, WireError> {
        let flags = rdr.read_i32()?;
        let full_collection = rdr.read_cstring()?;
        let num_to_skip = rdr.read_i32()?;
        let num_to_return = rdr.read_i32()?;
        let query = rdr.read_document()?;
        let return_fields = if rdr.remaining() > 0 {
            Some(rdr.read_document()?)
        } else {
            None
        };
        Ok(QueryOp {
            flags,
            full_collection,
            num_to_skip,
            num_to_return,
            query,
            return_fields,
        })
    }

    /// The effective query document, unwrapping a `$query` envelope when the
    /// driver used one.
    pub fn query_doc(&self) -> Option<Document<'_>> {
        let doc = Document::at_start(&self.query).ok()?;
        if let Some(inner) = doc.get("$query").and_then(|e| e.as_document()) {
            return Some(inner);
        }
        Some(doc)
    }

    /// Command name when this query addresses a `$cmd` collection.
    pub fn command_name(&self) -> Option<String> {
        if !self.full_collection.ends_with(".$cmd") {
            return None;
        }
        self.query_doc()?.first_element_name().map(str::to_string)
    }

    pub(crate) fn is_driver_op(&self) -> bool {
        match self.command_name() {
            Some(name) => is_driver_command(&name),
            None => false,
        }
    }

    pub(crate) fn meta(&self) -> OpMetadata {
        OpMetadata {
            op_type: "query".to_string(),
            ns: self.full_collection.clone(),
            command: self.command_name(),
        }
    }

    pub(crate) fn abbreviated(&self, n: usize) -> String {
        let query = Document::at_start(&self.query)
            .map(|d| d.abbreviated(n))
            .unwrap_or_else(|_| "{?}".to_string());
        format!(
            "query {} skip={} limit={} {}",
            self.full_collection, self.num_to_skip, self.num_to_return, query
        )
    }
}
