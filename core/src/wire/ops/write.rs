//! Legacy write ops: OP_INSERT, OP_UPDATE, OP_DELETE.

use crate::wire::document::Document;
use crate::wire::ops::{BodyReader, OpMetadata};
use crate::wire::WireError;

#[derive(Debug, Clone)]
pub struct InsertOp {
    pub flags: i32,
    pub full_collection: String,
    pub documents: Vec<Vec<u8>>,
}

impl InsertOp {
    pub(crate) fn from_reader(rdr: &mut BodyReader<'_>) -> Result<InsertOp, WireError> {
        let flags = rdr.read_i32()?;
        let full_collection = rdr.read_cstring()?;
        let documents = rdr.read_documents_to_end()?;
        Ok(InsertOp {
            flags,
            full_collection,
            documents,
        })
    }

    pub(crate) fn meta(&self) -> OpMetadata {
        OpMetadata {
            op_type: "insert".to_string(),
            ns: self.full_collection.clone(),
            command: None,
        }
    }

    pub(crate) fn abbreviated(&self, n: usize) -> String {
        let first = self
            .documents
            .first()
            .and_then(|d| Document::at_start(d).ok())
            .map(|d| d.abbreviated(n))
            .unwrap_or_default();
        format!(
            "insert {} ndocs={} {}",
            self.full_collection,
            self.documents.len(),
            first
        )
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOp {
    pub full_collection: String,
    pub flags: i32,
    pub selector: Vec<u8>,
    pub update: Vec<u8>,
}

impl UpdateOp {
    pub(crate) fn from_reader(rdr: &mut BodyReader<'_>) -> Result<UpdateOp, WireError> {
        let _zero = rdr.read_i32()?;
        let full_collection = rdr.read_cstring()?;
        let flags = rdr.read_i32()?;
        let selector = rdr.read_document()?;
        let update = rdr.read_document()?;
        Ok(UpdateOp {
            full_collection,
            flags,
            selector,
            update,
        })
    }

    pub(crate) fn meta(&self) -> OpMetadata {
        OpMetadata {
            op_type: "update".to_string(),
            ns: self.full_collection.clone(),
            command: None,
        }
    }

    pub(crate) fn abbreviated(&self, n: usize) -> String {
        let selector = Document::at_start(&self.selector)
            .map(|d| d.abbreviated(n / 2))
            .unwrap_or_default();
        let update = Document::at_start(&self.update)
            .map(|d| d.abbreviated(n / 2))
            .unwrap_or_default();
        format!("update {} {} -> {}", self.full_collection, selector, update)
    }
}

#[derive(Debug, Clone)]
pub struct DeleteOp {
    pub full_collection: String,
    pub flags: i32,
    pub selector: Vec<u8>,
}

impl DeleteOp {
    pub(crate) fn from_reader(rdr: &mut BodyReader<'_>) -> Result<DeleteOp, WireError> {
        let _zero = rdr.read_i32()?;
        let full_collection = rdr.read_cstring()?;
        let flags = rdr.read_i32()?;
        let selector = rdr.read_document()?;
        Ok(DeleteOp {
            full_collection,
            flags,
            selector,
        })
    }

    pub(crate) fn meta(&self) -> OpMetadata {
        OpMetadata {
            op_type: "delete".to_string(),
            ns: self.full_collection.clone(),
            command: None,
        }
    }

    pub(crate) fn abbreviated(&self, n: usize) -> String {
        let selector = Document::at_start(&self.selector)
            .map(|d| d.abbreviated(n))
            .unwrap_or_default();
        format!("delete {} {}", self.full_collection, selector)
    }
}
