use async_trait::async_trait;
use mockroute_lib::dht_messages::{DhtMessage, PeerInfo};
use tokio::sync::{mpsc, oneshot};

use crate::error::HostError;

/// A request delivered to this host by another peer.
///
/// The receiver answers through `respond`; dropping it without answering
/// makes the caller's request fail.
#[derive(Debug)]
pub struct InboundRequest {
    pub from: String,
    pub message: DhtMessage,
    pub respond: oneshot::Sender<DhtMessage>,
}

pub type InboundReceiver = mpsc::UnboundedReceiver<InboundRequest>;

/// A peer's attachment point to a network, real or simulated.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// The identity and address this host is reachable under.
    fn info(&self) -> PeerInfo;

    /// Sends `message` to the peer at `address` and waits for its answer.
    async fn call(&self, address: &str, message: DhtMessage) -> Result<DhtMessage, HostError>;

    /// Takes the stream of inbound requests. Only the first caller gets it.
    fn take_incoming(&self) -> Option<InboundReceiver>;

    /// Detaches the host from its network.
    async fn close(&self);
}
