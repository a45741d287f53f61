//! TCP segment header.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, NetworkEndian};

use crate::capture::packet::PacketParseError;

// TCP flags.
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

const MIN_HDR_SIZE: usize = 20;

/// A TCP header. Options are accounted for in the length but not parsed.
#[derive(Debug)]
pub struct Tcp {
    src_port: u16,
    dst_port: u16,
    seq_no: u32,
    header_len: usize,
    flags: u8,
}

impl Tcp {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Tcp> {
        let hdr = match frame.get(offset..offset + MIN_HDR_SIZE) {
            Some(hdr) => hdr,
            None => bail!(PacketParseError::InvalidRead),
        };
        let header_len = ((hdr[12] & 0xf0) >> 2) as usize;
        if header_len < MIN_HDR_SIZE || frame.len() < offset + header_len {
            bail!(PacketParseError::InvalidRead);
        }
        Ok(Tcp {
            src_port: NetworkEndian::read_u16(&hdr[0..2]),
            dst_port: NetworkEndian::read_u16(&hdr[2..4]),
            seq_no: NetworkEndian::read_u32(&hdr[4..8]),
            header_len,
            flags: hdr[13],
        })
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    #[inline]
    pub fn seq_no(&self) -> u32 {
        self.seq_no
    }

    /// Header length in bytes, options included.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }
}
