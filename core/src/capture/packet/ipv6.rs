//! IPv6 packet header.

use std::net::Ipv6Addr;

use anyhow::{bail, Result};
use byteorder::{ByteOrder, NetworkEndian};

use crate::capture::packet::ipv4::TCP_PROTOCOL;
use crate::capture::packet::PacketParseError;

const HDR_SIZE: usize = 40;

/// A fixed IPv6 header. Extension headers are not walked; segments behind
/// them are dropped by the parser and counted as malformed.
#[derive(Debug)]
pub struct Ipv6 {
    offset: usize,
    payload_length: u16,
    src: Ipv6Addr,
    dst: Ipv6Addr,
}

impl Ipv6 {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Ipv6> {
        let hdr = match frame.get(offset..offset + HDR_SIZE) {
            Some(hdr) => hdr,
            None => bail!(PacketParseError::InvalidRead),
        };
        if hdr[0] >> 4 != 6 {
            bail!(PacketParseError::InvalidProtocol);
        }
        if hdr[6] != TCP_PROTOCOL {
            bail!(PacketParseError::InvalidProtocol);
        }
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&hdr[8..24]);
        dst.copy_from_slice(&hdr[24..40]);
        Ok(Ipv6 {
            offset,
            payload_length: NetworkEndian::read_u16(&hdr[4..6]),
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
        })
    }

    /// Length of the payload after the fixed header.
    #[inline]
    pub fn payload_length(&self) -> u16 {
        self.payload_length
    }

    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + HDR_SIZE
    }

    #[inline]
    pub fn src_addr(&self) -> Ipv6Addr {
        self.src
    }

    #[inline]
    pub fn dst_addr(&self) -> Ipv6Addr {
        self.dst
    }
}
