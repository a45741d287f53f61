//! Connection identifiers.
//!
//! Provides direction-aware endpoints and the unordered half-flow pair key
//! under which a bidirectional connection is tracked.

use std::cmp;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// A (host, port) pair rendered as an opaque comparable string.
///
/// Stored verbatim in trace records, so it survives round trips even for
/// traces recorded on machines whose address formatting differs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Endpoint(s.into())
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        Endpoint(addr.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unordered pair of half-flow addresses identifying one bidirectional
/// connection.
///
/// Either direction's first observed half-flow creates the tracking slot, so
/// the key must compare equal regardless of travel direction.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConnectionKey(SocketAddr, SocketAddr);

impl ConnectionKey {
    /// Returns the connection key of a segment with `src` and `dst` IP/port
    /// pairs.
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        ConnectionKey(cmp::max(src, dst), cmp::min(src, dst))
    }

    /// The other side of the pair.
    pub fn peer_of(&self, addr: SocketAddr) -> SocketAddr {
        if self.0 == addr {
            self.1
        } else {
            self.0
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <> {}", self.0, self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_direction_agnostic() {
        let a: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:27017".parse().unwrap();
        assert_eq!(ConnectionKey::new(a, b), ConnectionKey::new(b, a));
    }

    #[test]
    fn endpoint_renders_addr() {
        let addr: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        assert_eq!(Endpoint::from_addr(addr).as_str(), "10.0.0.1:40000");
    }
}
