//! Cursor ops: OP_GET_MORE and OP_KILL_CURSORS.
//!
//! Both are rewritable: at replay time their recorded cursor ids are swapped
//! for the live server's ids. GetMore patches a fixed offset in place; a
//! killCursors body is rebuilt because unmapped ids are dropped entirely.

use byteorder::{ByteOrder, LittleEndian};

use crate::wire::ops::{BodyReader, OpMetadata};
use crate::wire::{RawMessage, WireError};

#[derive(Debug, Clone)]
pub struct GetMoreOp {
    pub full_collection: String,
    pub num_to_return: i32,
    pub cursor_id: i64,
}

impl GetMoreOp {
    pub(crate) fn from_reader(rdr: &mut BodyReader<'_>) -> Result<GetMoreOp, WireError> {
        let _zero = rdr.read_i32()?;
        let full_collection = rdr.read_cstring()?;
        let num_to_return = rdr.read_i32()?;
        let cursor_id = rdr.read_i64()?;
        Ok(GetMoreOp {
            full_collection,
            num_to_return,
            cursor_id,
        })
    }

    /// Overwrites the cursor id in place. A missing mapping rewrites to `0`,
    /// which provokes a server-side "cursor not found" that surfaces in
    /// stats rather than silently reusing a stale id.
    pub(crate) fn rewrite(
        &mut self,
        raw: &mut RawMessage,
        mapped: Option<i64>,
    ) -> Result<(), WireError> {
        let live_id = mapped.unwrap_or(0);
        let offset = 4 + self.full_collection.len() + 1 + 4;
        if raw.body.len() < offset + 8 {
            return Err(WireError::BadBody(
                "getmore",
                "body too short for cursor id".to_string(),
            ));
        }
        LittleEndian::write_i64(&mut raw.body[offset..offset + 8], live_id);
        self.cursor_id = live_id;
        Ok(())
    }

    pub(crate) fn meta(&self) -> OpMetadata {
        OpMetadata {
            op_type: "getmore".to_string(),
            ns: self.full_collection.clone(),
            command: None,
        }
    }

    pub(crate) fn abbreviated(&self, _n: usize) -> String {
        format!(
            "getmore {} limit={} cursor={}",
            self.full_collection, self.num_to_return, self.cursor_id
        )
    }
}

#[derive(Debug, Clone)]
pub struct KillCursorsOp {
    pub cursor_ids: Vec<i64>,
}

impl KillCursorsOp {
    pub(crate) fn from_reader(rdr: &mut BodyReader<'_>) -> Result<KillCursorsOp, WireError> {
        let _zero = rdr.read_i32()?;
        let count = rdr.read_i32()?;
        if count < 0 {
            return Err(WireError::BadBody(
                "killcursors",
                format!("negative cursor count {}", count),
            ));
        }
        let mut cursor_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            cursor_ids.push(rdr.read_i64()?);
        }
        Ok(KillCursorsOp { cursor_ids })
    }

    /// Rebuilds the body with only the mapped ids, positionally aligned with
    /// the recorded ids. Unmapped ids are dropped.
    pub(crate) fn rewrite(
        &mut self,
        raw: &mut RawMessage,
        mapped: &[Option<i64>],
    ) -> Result<(), WireError> {
        let live_ids: Vec<i64> = mapped.iter().filter_map(|id| *id).collect();
        let mut body = Vec::with_capacity(8 + live_ids.len() * 8);
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(live_ids.len() as i32).to_le_bytes());
        for id in &live_ids {
            body.extend_from_slice(&id.to_le_bytes());
        }
        raw.header.length = (crate::wire::HEADER_LEN + body.len()) as i32;
        raw.body = body;
        self.cursor_ids = live_ids;
        Ok(())
    }

    pub(crate) fn meta(&self) -> OpMetadata {
        OpMetadata {
            op_type: "killcursors".to_string(),
            ns: String::new(),
            command: None,
        }
    }

    pub(crate) fn abbreviated(&self, _n: usize) -> String {
        format!("killcursors {:?}", self.cursor_ids)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::wire::ops::tests::raw_from_body;
    use crate::wire::ops::ParsedOp;

    pub(crate) fn getmore_body(ns: &str, cursor_id: i64) -> Vec<u8> {
        let mut body = vec![];
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(ns.as_bytes());
        body.push(0);
        body.extend_from_slice(&5i32.to_le_bytes());
        body.extend_from_slice(&cursor_id.to_le_bytes());
        body
    }

    pub(crate) fn killcursors_body(ids: &[i64]) -> Vec<u8> {
        let mut body = vec![];
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(ids.len() as i32).to_le_bytes());
        for id in ids {
            body.extend_from_slice(&id.to_le_bytes());
        }
        body
    }

    #[test]
    fn getmore_roundtrip_and_rewrite() {
        let mut raw = raw_from_body(2005, getmore_body("app.users", 42));
        let mut op = ParsedOp::from_raw(&raw).unwrap();
        assert_eq!(op.cursor_ids(), vec![42]);

        op.rewrite_cursor_ids(&mut raw, &[Some(9999)]).unwrap();
        assert_eq!(op.cursor_ids(), vec![9999]);

        // the patched body decodes to the live id
        let reparsed = ParsedOp::from_raw(&raw).unwrap();
        assert_eq!(reparsed.cursor_ids(), vec![9999]);
    }

    #[test]
    fn getmore_unmapped_rewrites_to_zero() {
        let mut raw = raw_from_body(2005, getmore_body("app.users", 42));
        let mut op = ParsedOp::from_raw(&raw).unwrap();
        op.rewrite_cursor_ids(&mut raw, &[None]).unwrap();
        assert_eq!(ParsedOp::from_raw(&raw).unwrap().cursor_ids(), vec![0]);
    }

    #[test]
    fn killcursors_partial_rewrite_drops_unmapped() {
        let mut raw = raw_from_body(2007, killcursors_body(&[42, 43, 44]));
        let mut op = ParsedOp::from_raw(&raw).unwrap();
        assert_eq!(op.cursor_ids(), vec![42, 43, 44]);

        op.rewrite_cursor_ids(&mut raw, &[Some(1000), None, Some(1002)])
            .unwrap();
        assert_eq!(op.cursor_ids(), vec![1000, 1002]);

        let reparsed = ParsedOp::from_raw(&raw).unwrap();
        assert_eq!(reparsed.cursor_ids(), vec![1000, 1002]);
        // header length tracks the shrunken body
        assert_eq!(raw.header.length as usize, 16 + raw.body.len());
    }

    #[test]
    fn killcursors_negative_count_rejected() {
        let mut body = vec![];
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(-1i32).to_le_bytes());
        assert!(ParsedOp::from_raw(&raw_from_body(2007, body)).is_err());
    }
}
