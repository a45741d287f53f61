//! IPv4 packet header.

use std::net::Ipv4Addr;

use anyhow::{bail, Result};
use byteorder::{ByteOrder, NetworkEndian};

use crate::capture::packet::PacketParseError;

/// TCP assigned protocol number.
pub const TCP_PROTOCOL: u8 = 6;

const MIN_HDR_SIZE: usize = 20;

/// An IPv4 header, options included in the reported length.
#[derive(Debug)]
pub struct Ipv4 {
    offset: usize,
    header_len: usize,
    total_length: u16,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

impl Ipv4 {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Ipv4> {
        let hdr = match frame.get(offset..offset + MIN_HDR_SIZE) {
            Some(hdr) => hdr,
            None => bail!(PacketParseError::InvalidRead),
        };
        if hdr[0] >> 4 != 4 {
            bail!(PacketParseError::InvalidProtocol);
        }
        let header_len = ((hdr[0] & 0x0f) as usize) * 4;
        if header_len < MIN_HDR_SIZE || frame.len() < offset + header_len {
            bail!(PacketParseError::InvalidRead);
        }
        if hdr[9] != TCP_PROTOCOL {
            bail!(PacketParseError::InvalidProtocol);
        }
        Ok(Ipv4 {
            offset,
            header_len,
            total_length: NetworkEndian::read_u16(&hdr[2..4]),
            src: Ipv4Addr::new(hdr[12], hdr[13], hdr[14], hdr[15]),
            dst: Ipv4Addr::new(hdr[16], hdr[17], hdr[18], hdr[19]),
        })
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Total datagram length, header included.
    #[inline]
    pub fn total_length(&self) -> u16 {
        self.total_length
    }

    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + self.header_len
    }

    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        self.src
    }

    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        self.dst
    }
}
