//! Peer identities understood by the registry and the fan-out engine.

use std::{fmt::Debug, hash::Hash};

/// Anything that names a reachable destination for the lifetime of its session.
///
/// The engine only compares and hashes identities; how bytes actually reach a
/// peer is the transport's business (see [`crate::fanout::Deliver`]). Datagram
/// transports use `SocketAddr`, the broker uses [`RoutingId`], and the stream
/// transports use connection handles whose equality is the connection serial.
pub trait Peer: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Peer for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Broker-assigned client tag. Opaque bytes, at most 255 long.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingId(bytes::Bytes);

impl RoutingId {
    pub const MAX_LEN: usize = 255;

    pub fn new(raw: impl Into<bytes::Bytes>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > Self::MAX_LEN {
            return None;
        }
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for RoutingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutingId({})", self)
    }
}

impl std::fmt::Display for RoutingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_id_rejects_empty_and_oversized_tags() {
        assert!(RoutingId::new(Vec::new()).is_none());
        assert!(RoutingId::new(vec![b'x'; RoutingId::MAX_LEN + 1]).is_none());
        let id = RoutingId::new("load_client_3").expect("valid routing id");
        assert_eq!(id.to_string(), "load_client_3");
        assert_eq!(id.as_bytes(), b"load_client_3");
    }
}
