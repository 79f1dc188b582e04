//! The capability test code and applications program against.
//!
//! A [`RoutingClient`] hides which DHT implementation and which transport sit
//! behind it, so a node on the simulated fabric and a node on real TCP are
//! interchangeable.

use async_trait::async_trait;
use mockroute_lib::dht_messages::{Key, NodeId, PeerInfo};
use mockroute_lib::metrics::NodeMetrics;

use crate::datastore::SharedDatastore;
use crate::error::Result;

#[async_trait]
pub trait RoutingClient: Send + Sync {
    /// This participant's ID and address.
    fn info(&self) -> PeerInfo;

    /// The store backing this participant, bypassing the network layer.
    fn datastore(&self) -> SharedDatastore;

    /// Contacts currently in the routing table.
    fn routing_table(&self) -> Vec<PeerInfo>;

    fn metrics(&self) -> NodeMetrics;

    /// Contacts each seed address and fills the routing table from them.
    /// Returns the routing table size afterwards.
    async fn bootstrap(&self, seeds: &[String]) -> Result<usize>;

    /// Stores `value` locally and on the closest peers to `key`.
    async fn put_value(&self, key: Key, value: Vec<u8>) -> Result<()>;

    async fn get_value(&self, key: Key) -> Result<Vec<u8>>;

    async fn find_peer(&self, id: NodeId) -> Result<PeerInfo>;

    /// Announces this participant as a provider of `key`.
    async fn provide(&self, key: Key) -> Result<()>;

    /// Up to `count` providers of `key`.
    async fn find_providers(&self, key: Key, count: usize) -> Result<Vec<PeerInfo>>;

    /// Stops serving requests and detaches from the network.
    async fn close(&self);
}
