//! Wire document parsing and construction.
//!
//! Message bodies carry length-prefixed binary documents: an `i32` total
//! length, a sequence of typed elements (`type byte`, cstring name, value),
//! and a trailing NUL. This module implements a zero-copy walker over that
//! encoding plus a small builder used by the trace container and tests.
//! Only the element types that appear on the wire are interpreted; everything
//! else is sized and skipped.

use std::fmt::Write as _;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DocumentError {
    #[error("truncated document: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("document length {0} out of range")]
    BadLength(i64),

    #[error("unterminated element name")]
    BadName,

    #[error("unknown element type 0x{0:02x}")]
    UnknownType(u8),
}

/// Element type bytes understood by the walker.
pub mod element_type {
    pub const DOUBLE: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BINARY: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const OBJECT_ID: u8 = 0x07;
    pub const BOOL: u8 = 0x08;
    pub const DATETIME: u8 = 0x09;
    pub const NULL: u8 = 0x0A;
    pub const REGEX: u8 = 0x0B;
    pub const DB_POINTER: u8 = 0x0C;
    pub const CODE: u8 = 0x0D;
    pub const SYMBOL: u8 = 0x0E;
    pub const CODE_WITH_SCOPE: u8 = 0x0F;
    pub const INT32: u8 = 0x10;
    pub const TIMESTAMP: u8 = 0x11;
    pub const INT64: u8 = 0x12;
    pub const DECIMAL128: u8 = 0x13;
    pub const MIN_KEY: u8 = 0xFF;
    pub const MAX_KEY: u8 = 0x7F;
}

/// A borrowed view over one encoded document.
#[derive(Debug, Copy, Clone)]
pub struct Document<'a> {
    bytes: &'a [u8],
}

/// One element inside a [`Document`].
#[derive(Debug, Copy, Clone)]
pub struct Element<'a> {
    pub name: &'a str,
    pub type_byte: u8,
    /// Raw value bytes, sized per the element type.
    pub value: &'a [u8],
    /// Offset of `value` from the start of the enclosing document.
    pub value_offset: usize,
}

impl<'a> Document<'a> {
    /// Parses the document starting at `bytes[0]`, which may be followed by
    /// trailing data (e.g. further documents in the same message body).
    pub fn at_start(bytes: &'a [u8]) -> Result<Document<'a>, DocumentError> {
        if bytes.len() < 5 {
            return Err(DocumentError::Truncated {
                need: 5,
                have: bytes.len(),
            });
        }
        let declared = LittleEndian::read_i32(bytes) as i64;
        if declared < 5 || declared > bytes.len() as i64 {
            if declared >= 5 {
                return Err(DocumentError::Truncated {
                    need: declared as usize,
                    have: bytes.len(),
                });
            }
            return Err(DocumentError::BadLength(declared));
        }
        Ok(Document {
            bytes: &bytes[..declared as usize],
        })
    }

    /// Total encoded size, length prefix and terminator included.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= 5
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Iterates the document's elements in encoding order.
    pub fn iter(&self) -> ElementIter<'a> {
        ElementIter {
            bytes: self.bytes,
            pos: 4,
            failed: false,
        }
    }

    /// Name of the first element, by convention the command name in a
    /// command-style body.
    pub fn first_element_name(&self) -> Option<&'a str> {
        match self.iter().next() {
            Some(Ok(elem)) => Some(elem.name),
            _ => None,
        }
    }

    /// Looks up a top-level element by name.
    pub fn get(&self, name: &str) -> Option<Element<'a>> {
        for elem in self.iter().flatten() {
            if elem.name == name {
                return Some(elem);
            }
        }
        None
    }

    /// Looks up a dotted path, descending through embedded documents.
    pub fn get_path(&self, path: &str) -> Option<Element<'a>> {
        let mut doc = *self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let elem = doc.get(segment)?;
            if segments.peek().is_none() {
                return Some(elem);
            }
            doc = elem.as_document()?;
        }
        None
    }

    /// Renders a terse single-line summary, truncated to roughly `limit`
    /// characters. Lossy on purpose; used for terminal stat output.
    pub fn abbreviated(&self, limit: usize) -> String {
        let mut out = String::from("{");
        for (i, elem) in self.iter().flatten().enumerate() {
            if out.len() >= limit {
                out.push_str(" ...");
                break;
            }
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}: {}", elem.name, elem.render_terse(limit));
        }
        out.push('}');
        if out.len() > limit + 8 {
            let mut cut = limit + 5;
            while !out.is_char_boundary(cut) {
                cut -= 1;
            }
            out.truncate(cut);
            out.push_str("...}");
        }
        out
    }
}

impl<'a> Element<'a> {
    pub fn as_i32(&self) -> Option<i32> {
        (self.type_byte == element_type::INT32).then(|| LittleEndian::read_i32(self.value))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.type_byte {
            element_type::INT64 | element_type::DATETIME | element_type::TIMESTAMP => {
                Some(LittleEndian::read_i64(self.value))
            }
            element_type::INT32 => Some(LittleEndian::read_i32(self.value) as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        (self.type_byte == element_type::DOUBLE).then(|| LittleEndian::read_f64(self.value))
    }

    pub fn as_bool(&self) -> Option<bool> {
        (self.type_byte == element_type::BOOL).then(|| self.value[0] != 0)
    }

    pub fn as_str(&self) -> Option<&'a str> {
        if self.type_byte != element_type::STRING {
            return None;
        }
        // value: i32 length (including NUL), bytes, NUL
        let len = LittleEndian::read_i32(self.value) as usize;
        if len == 0 || 4 + len > self.value.len() {
            return None;
        }
        std::str::from_utf8(&self.value[4..4 + len - 1]).ok()
    }

    pub fn as_document(&self) -> Option<Document<'a>> {
        match self.type_byte {
            element_type::DOCUMENT | element_type::ARRAY => Document::at_start(self.value).ok(),
            _ => None,
        }
    }

    /// Binary element payload, subtype byte stripped.
    pub fn as_binary(&self) -> Option<&'a [u8]> {
        if self.type_byte != element_type::BINARY || self.value.len() < 5 {
            return None;
        }
        Some(&self.value[5..])
    }

    fn render_terse(&self, limit: usize) -> String {
        match self.type_byte {
            element_type::STRING => format!("\"{}\"", self.as_str().unwrap_or("?")),
            element_type::INT32 => format!("{}", self.as_i32().unwrap_or(0)),
            element_type::INT64 => format!("{}", self.as_i64().unwrap_or(0)),
            element_type::DOUBLE => format!("{}", self.as_f64().unwrap_or(0.0)),
            element_type::BOOL => format!("{}", self.as_bool().unwrap_or(false)),
            element_type::NULL => "null".to_string(),
            element_type::DOCUMENT | element_type::ARRAY => self
                .as_document()
                .map(|d| d.abbreviated(limit / 2))
                .unwrap_or_else(|| "{?}".to_string()),
            element_type::OBJECT_ID => hex::encode(self.value),
            element_type::BINARY => format!("bin({})", self.value.len().saturating_sub(5)),
            _ => format!("<0x{:02x}>", self.type_byte),
        }
    }
}

pub struct ElementIter<'a> {
    bytes: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Iterator for ElementIter<'a> {
    type Item = Result<Element<'a>, DocumentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() {
            return None;
        }
        let type_byte = self.bytes[self.pos];
        if type_byte == 0 {
            // document terminator
            return None;
        }
        match read_element(self.bytes, self.pos) {
            Ok((elem, next_pos)) => {
                self.pos = next_pos;
                Some(Ok(elem))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn read_element(bytes: &[u8], pos: usize) -> Result<(Element<'_>, usize), DocumentError> {
    let type_byte = bytes[pos];
    let name_start = pos + 1;
    let name_end = bytes[name_start..]
        .iter()
        .position(|&b| b == 0)
        .map(|i| name_start + i)
        .ok_or(DocumentError::BadName)?;
    let name = std::str::from_utf8(&bytes[name_start..name_end]).map_err(|_| DocumentError::BadName)?;
    let value_offset = name_end + 1;
    let rest = &bytes[value_offset..];
    let value_len = element_value_len(type_byte, rest)?;
    if value_len > rest.len() {
        return Err(DocumentError::Truncated {
            need: value_len,
            have: rest.len(),
        });
    }
    Ok((
        Element {
            name,
            type_byte,
            value: &rest[..value_len],
            value_offset,
        },
        value_offset + value_len,
    ))
}

/// Size of an element value per its type byte, using `rest` for the
/// length-prefixed variants.
fn element_value_len(type_byte: u8, rest: &[u8]) -> Result<usize, DocumentError> {
    use element_type::*;

    let prefixed = |extra: usize| -> Result<usize, DocumentError> {
        if rest.len() < 4 {
            return Err(DocumentError::Truncated {
                need: 4,
                have: rest.len(),
            });
        }
        let len = LittleEndian::read_i32(rest);
        if len < 0 {
            return Err(DocumentError::BadLength(len as i64));
        }
        Ok(4 + extra + len as usize)
    };

    match type_byte {
        DOUBLE | DATETIME | TIMESTAMP | INT64 => Ok(8),
        STRING | CODE | SYMBOL => prefixed(0),
        DOCUMENT | ARRAY | CODE_WITH_SCOPE => {
            if rest.len() < 4 {
                return Err(DocumentError::Truncated {
                    need: 4,
                    have: rest.len(),
                });
            }
            let len = LittleEndian::read_i32(rest);
            if len < 5 {
                return Err(DocumentError::BadLength(len as i64));
            }
            Ok(len as usize)
        }
        BINARY => prefixed(1),
        UNDEFINED | NULL | MIN_KEY | MAX_KEY => Ok(0),
        OBJECT_ID => Ok(12),
        BOOL => Ok(1),
        REGEX => {
            let mut nuls = 0;
            for (i, &b) in rest.iter().enumerate() {
                if b == 0 {
                    nuls += 1;
                    if nuls == 2 {
                        return Ok(i + 1);
                    }
                }
            }
            Err(DocumentError::BadName)
        }
        DB_POINTER => prefixed(12),
        INT32 => Ok(4),
        DECIMAL128 => Ok(16),
        other => Err(DocumentError::UnknownType(other)),
    }
}

/* --------------------------------------------------------------------------------- */

/// Incremental builder for an encoded document.
#[derive(Debug, Default)]
pub struct DocBuilder {
    // element payload, without length prefix or terminator
    elements: Vec<u8>,
}

impl DocBuilder {
    pub fn new() -> Self {
        DocBuilder::default()
    }

    fn push_name(&mut self, type_byte: u8, name: &str) {
        self.elements.push(type_byte);
        self.elements.extend_from_slice(name.as_bytes());
        self.elements.push(0);
    }

    pub fn append_f64(mut self, name: &str, value: f64) -> Self {
        self.push_name(element_type::DOUBLE, name);
        let mut buf = [0u8; 8];
        LittleEndian::write_f64(&mut buf, value);
        self.elements.extend_from_slice(&buf);
        self
    }

    pub fn append_str(mut self, name: &str, value: &str) -> Self {
        self.push_name(element_type::STRING, name);
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value.len() as i32 + 1);
        self.elements.extend_from_slice(&buf);
        self.elements.extend_from_slice(value.as_bytes());
        self.elements.push(0);
        self
    }

    pub fn append_i32(mut self, name: &str, value: i32) -> Self {
        self.push_name(element_type::INT32, name);
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value);
        self.elements.extend_from_slice(&buf);
        self
    }

    pub fn append_i64(mut self, name: &str, value: i64) -> Self {
        self.push_name(element_type::INT64, name);
        let mut buf = [0u8; 8];
        LittleEndian::write_i64(&mut buf, value);
        self.elements.extend_from_slice(&buf);
        self
    }

    pub fn append_bool(mut self, name: &str, value: bool) -> Self {
        self.push_name(element_type::BOOL, name);
        self.elements.push(value as u8);
        self
    }

    pub fn append_doc(mut self, name: &str, doc: &[u8]) -> Self {
        self.push_name(element_type::DOCUMENT, name);
        self.elements.extend_from_slice(doc);
        self
    }

    pub fn append_array(mut self, name: &str, doc: &[u8]) -> Self {
        self.push_name(element_type::ARRAY, name);
        self.elements.extend_from_slice(doc);
        self
    }

    /// Appends a binary element with the generic subtype.
    pub fn append_binary(mut self, name: &str, value: &[u8]) -> Self {
        self.push_name(element_type::BINARY, name);
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value.len() as i32);
        self.elements.extend_from_slice(&buf);
        self.elements.push(0); // generic subtype
        self.elements.extend_from_slice(value);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        let total = 4 + self.elements.len() + 1;
        let mut out = Vec::with_capacity(total);
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, total as i32);
        out.extend_from_slice(&buf);
        out.extend_from_slice(&self.elements);
        out.push(0);
        out
    }
}
