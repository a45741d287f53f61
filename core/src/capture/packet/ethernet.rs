//! Ethernet frame header.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, NetworkEndian};

use crate::capture::packet::PacketParseError;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_IPV6: u16 = 0x86DD;

const VLAN_802_1Q: u16 = 0x8100;
const VLAN_802_1AD: u16 = 0x88a8;

const TAG_SIZE: usize = 4;
const HDR_SIZE: usize = 14;

/// An Ethernet frame header.
///
/// Single-tagged 802.1Q frames are unwrapped transparently; double-tagged
/// (QinQ) frames are rejected.
#[derive(Debug)]
pub struct Ethernet {
    ether_type: u16,
    payload_offset: usize,
}

impl Ethernet {
    pub fn parse(frame: &[u8]) -> Result<Ethernet> {
        if frame.len() < HDR_SIZE {
            bail!(PacketParseError::InvalidRead);
        }
        let raw_type = NetworkEndian::read_u16(&frame[12..14]);
        match raw_type {
            VLAN_802_1Q => {
                if frame.len() < HDR_SIZE + TAG_SIZE {
                    bail!(PacketParseError::InvalidRead);
                }
                Ok(Ethernet {
                    ether_type: NetworkEndian::read_u16(&frame[16..18]),
                    payload_offset: HDR_SIZE + TAG_SIZE,
                })
            }
            VLAN_802_1AD => bail!(PacketParseError::InvalidProtocol),
            _ => Ok(Ethernet {
                ether_type: raw_type,
                payload_offset: HDR_SIZE,
            }),
        }
    }

    /// EtherType of the encapsulated protocol, tag unwrapped.
    #[inline]
    pub fn ether_type(&self) -> u16 {
        self.ether_type
    }

    /// Offset of the network-layer header from the start of the frame.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlan_tag_unwrapped() {
        let mut frame = vec![0u8; 18];
        frame[12] = 0x81;
        frame[13] = 0x00;
        frame[16] = 0x08;
        frame[17] = 0x00;
        let eth = Ethernet::parse(&frame).unwrap();
        assert_eq!(eth.ether_type(), ETHER_TYPE_IPV4);
        assert_eq!(eth.payload_offset(), 18);
    }
}
