//! Mockroute DHT Node Library
//!
//! A Kademlia DHT node that runs on any [`Host`]: over real TCP via
//! [`TcpHost`], or on a simulated fabric in tests. Applications and tests
//! talk to it through the [`RoutingClient`] trait.

pub mod context;
pub mod datastore;
pub mod error;
pub mod host;
pub mod node;
pub mod routing;
pub mod routing_table;
pub mod tcp_host;

use std::env;
use std::time::Duration;

pub use context::{CancelHandle, Context, ContextError};
pub use datastore::{
    Datastore, DatastoreError, MapDatastore, MutexDatastore, SharedDatastore, SharedStore,
    ThreadSafeDatastore,
};
pub use error::{ConstructionError, DhtError, HostError};
pub use host::{Host, InboundReceiver, InboundRequest};
pub use node::{new_dht, DhtNode};
pub use routing::RoutingClient;
pub use tcp_host::TcpHost;

// Re-export from lib crate for convenience
pub use mockroute_lib::dht_messages::{DhtMessage, Key, NodeId, PeerInfo};
pub use mockroute_lib::metrics::NodeMetrics;

/// Kademlia parameters for one DHT instance.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket size and replication factor
    pub k: usize,
    /// Lookup concurrency
    pub alpha: usize,
    pub request_timeout: Duration,
    /// Addresses contacted while the node is being built
    pub bootstrap_peers: Vec<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            request_timeout: Duration::from_secs(5),
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Configuration for the standalone node binary
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub bootstrap_address: Option<String>,
    /// Hex-encoded P-256 key; a fresh key is generated when absent
    pub private_key_hex: Option<String>,
    pub refresh_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8000".to_string(),
            bootstrap_address: None,
            private_key_hex: None,
            refresh_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Reads `NODE_ADDRESS`, `BOOTSTRAP_ADDRESS`, `NODE_KEY` and
    /// `REFRESH_INTERVAL_SECS`, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            address: env::var("NODE_ADDRESS").unwrap_or(defaults.address),
            bootstrap_address: env::var("BOOTSTRAP_ADDRESS")
                .ok()
                .filter(|a| !a.is_empty()),
            private_key_hex: env::var("NODE_KEY").ok().filter(|k| !k.is_empty()),
            refresh_interval: env::var("REFRESH_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_interval),
        }
    }
}

#[cfg(test)]
mod tests;
