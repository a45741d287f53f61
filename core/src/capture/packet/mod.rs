//! Parsing of link, network, and transport headers from raw frames.
//!
//! Every frame handed over by the packet source is walked once, front to
//! back, to recover the TCP segment context used for reassembly. Parsing is
//! slice-based and allocation-free; anything that is not TCP over IPv4 or
//! IPv6 is reported as an error and counted by the caller.

pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;

use std::net::SocketAddr;

use anyhow::{bail, Result};
use thiserror::Error;

use self::ethernet::Ethernet;
use self::ipv4::Ipv4;
use self::ipv6::Ipv6;
use self::tcp::Tcp;

#[derive(Error, Debug)]
pub(crate) enum PacketParseError {
    #[error("Invalid protocol")]
    InvalidProtocol,

    #[error("Invalid data read")]
    InvalidRead,
}

/// Parsed transport-layer context of one TCP segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentContext {
    /// Source socket address.
    pub src: SocketAddr,
    /// Destination socket address.
    pub dst: SocketAddr,
    /// Offset into the frame where TCP payload begins.
    pub offset: usize,
    /// Length of the payload in bytes.
    pub length: usize,
    /// Raw sequence number of the segment.
    pub seq_no: u32,
    /// TCP flags.
    pub flags: u8,
}

impl SegmentContext {
    /// Walks `frame` (starting at the Ethernet header) down to TCP.
    pub fn parse(frame: &[u8]) -> Result<SegmentContext> {
        let eth = Ethernet::parse(frame)?;
        match eth.ether_type() {
            ethernet::ETHER_TYPE_IPV4 => {
                let ipv4 = Ipv4::parse(frame, eth.payload_offset())?;
                let tcp = Tcp::parse(frame, ipv4.payload_offset())?;
                let payload_size = match (ipv4.total_length() as usize)
                    .checked_sub(ipv4.header_len() + tcp.header_len())
                {
                    Some(size) => size,
                    None => bail!("Malformed packet"),
                };
                Ok(SegmentContext {
                    src: SocketAddr::new(ipv4.src_addr().into(), tcp.src_port()),
                    dst: SocketAddr::new(ipv4.dst_addr().into(), tcp.dst_port()),
                    offset: ipv4.payload_offset() + tcp.header_len(),
                    length: payload_size,
                    seq_no: tcp.seq_no(),
                    flags: tcp.flags(),
                })
            }
            ethernet::ETHER_TYPE_IPV6 => {
                let ipv6 = Ipv6::parse(frame, eth.payload_offset())?;
                let tcp = Tcp::parse(frame, ipv6.payload_offset())?;
                let payload_size =
                    match (ipv6.payload_length() as usize).checked_sub(tcp.header_len()) {
                        Some(size) => size,
                        None => bail!("Malformed packet"),
                    };
                Ok(SegmentContext {
                    src: SocketAddr::new(ipv6.src_addr().into(), tcp.src_port()),
                    dst: SocketAddr::new(ipv6.dst_addr().into(), tcp.dst_port()),
                    offset: ipv6.payload_offset() + tcp.header_len(),
                    length: payload_size,
                    seq_no: tcp.seq_no(),
                    flags: tcp.flags(),
                })
            }
            _ => bail!(PacketParseError::InvalidProtocol),
        }
    }
}
