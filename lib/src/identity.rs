//! Peer identities: a private key plus the address the peer declares.

use std::net::{Ipv4Addr, SocketAddr};

use rand::Rng;

use crate::dht_messages::{NodeId, PeerInfo};
use crate::keys::PrivateKey;

/// Anything that can be plugged into a network as a peer.
pub trait Identity: Send + Sync {
    fn private_key(&self) -> &PrivateKey;

    fn address(&self) -> &str;

    fn peer_id(&self) -> NodeId {
        self.private_key().peer_id()
    }

    fn peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.peer_id(), self.address())
    }
}

/// Identity backed by a freshly generated keypair. Immutable once built.
#[derive(Debug, Clone)]
pub struct TestIdentity {
    private_key: PrivateKey,
    address: String,
}

impl TestIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_key(PrivateKey::generate(), address)
    }

    pub fn with_key(private_key: PrivateKey, address: impl Into<String>) -> Self {
        Self {
            private_key,
            address: address.into(),
        }
    }
}

impl Identity for TestIdentity {
    fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Loopback identity on the given port.
pub fn identity_for_port(port: u16) -> TestIdentity {
    TestIdentity::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)).to_string())
}

/// Loopback identity on a random high port.
///
/// Ports can collide across calls; use [`identity_for_port`] when a scenario
/// needs many distinct addresses.
pub fn rand_identity() -> TestIdentity {
    let port = rand::thread_rng().gen_range(10_000..60_000);
    identity_for_port(port)
}
