use serde::{Deserialize, Serialize};

pub const ID_LEN: usize = 20;

// 160-bit identifier (SHA-1 sized)
pub type NodeId = [u8; ID_LEN];

/// Keys live in the same space as node IDs.
pub type Key = NodeId;

/// A peer as seen by other peers: its ID and where to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub address: String,
}

impl PeerInfo {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    pub fn short_id(&self) -> String {
        hex::encode(&self.id[..4])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DhtMessage {
    // Liveness check; the sender announces itself
    Ping {
        from: PeerInfo,
    },
    // Response to Ping
    Pong {
        from: PeerInfo,
    },
    // Ask for the peers closest to a target ID
    FindNode {
        from: PeerInfo,
        target: NodeId,
    },
    // Response to FindNode
    FoundNodes {
        closer: Vec<PeerInfo>,
    },
    // Ask for a value, or closer peers if the receiver does not hold it
    FindValue {
        from: PeerInfo,
        key: Key,
    },
    // Response to FindValue
    FoundValue {
        value: Option<Vec<u8>>,
        closer: Vec<PeerInfo>,
    },
    // Store a key-value pair on the receiver
    Store {
        from: PeerInfo,
        key: Key,
        value: Vec<u8>,
    },
    // Acknowledges Store
    Stored {
        key: Key,
    },
    // Announce the sender as a provider for a key
    AddProvider {
        from: PeerInfo,
        key: Key,
    },
    // Acknowledges AddProvider
    ProviderAdded {
        key: Key,
    },
    // Ask for known providers of a key
    GetProviders {
        from: PeerInfo,
        key: Key,
    },
    // Response to GetProviders
    Providers {
        providers: Vec<PeerInfo>,
        closer: Vec<PeerInfo>,
    },
    // Generic failure response
    Error {
        message: String,
    },
}

impl DhtMessage {
    /// The announcing peer, for request messages.
    pub fn sender(&self) -> Option<&PeerInfo> {
        match self {
            DhtMessage::Ping { from }
            | DhtMessage::FindNode { from, .. }
            | DhtMessage::FindValue { from, .. }
            | DhtMessage::Store { from, .. }
            | DhtMessage::AddProvider { from, .. }
            | DhtMessage::GetProviders { from, .. } => Some(from),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.sender().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_expose_sender() {
        let from = PeerInfo::new([7; ID_LEN], "127.0.0.1:4001");
        let ping = DhtMessage::Ping { from: from.clone() };
        let pong = DhtMessage::Pong { from: from.clone() };

        assert_eq!(ping.sender(), Some(&from));
        assert!(ping.is_request());
        assert!(!pong.is_request());
        assert!(!DhtMessage::Stored { key: [0; ID_LEN] }.is_request());
    }

    #[test]
    fn test_short_id() {
        let peer = PeerInfo::new([0xab; ID_LEN], "127.0.0.1:4001");
        assert_eq!(peer.short_id(), "abababab");
    }
}
