//! Error types for the DHT node and its collaborators.

use thiserror::Error;

use crate::context::ContextError;
use crate::datastore::DatastoreError;

/// Failures while talking to another peer through a [`Host`](crate::Host).
#[derive(Error, Debug)]
pub enum HostError {
    #[error("peer {0} is not reachable")]
    Unreachable(String),

    #[error("no link between {from} and {to}")]
    NoLink { from: String, to: String },

    #[error("message to {0} was dropped")]
    Dropped(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("connection limit exceeded for {0}")]
    ConnectionLimit(String),

    #[error("host is closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while constructing a DHT instance.
#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error("construction aborted: {0}")]
    Context(#[from] ContextError),

    #[error("host inbound stream is already bound to another DHT")]
    HostAlreadyBound,

    #[error("datastore unavailable: {0}")]
    Datastore(#[from] DatastoreError),
}

/// Failures of routing operations on a running DHT.
#[derive(Error, Debug)]
pub enum DhtError {
    #[error("key not found")]
    NotFound,

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("routing table is empty")]
    NoPeers,

    #[error("bootstrap failed: no seed responded")]
    BootstrapFailed,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("DHT is closed")]
    Closed,

    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, DhtError>;
