use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};

use mockroute_lib::dht_messages::{DhtMessage, NodeId, PeerInfo};
use mockroute_lib::keys::PrivateKey;
use mockroute_node::{Host, HostError, InboundReceiver, InboundRequest};

/// Why the mock network refused to register a peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("mock network is full ({capacity} peers)")]
    CapacityExceeded { capacity: usize },

    #[error("address {0} is already in use")]
    AddressInUse(String),

    #[error("peer {0} is already registered")]
    PeerAlreadyRegistered(String),
}

#[derive(Debug, Clone)]
pub struct MocknetConfig {
    /// Maximum number of registered peers, unbounded when `None`
    pub capacity: Option<usize>,
    /// Delay applied to every delivered request
    pub latency: Duration,
    /// Probability of dropping a request (0.0 to 1.0)
    pub drop_rate: f64,
    /// How long a caller waits for the remote peer to answer
    pub request_timeout: Duration,
}

impl Default for MocknetConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            latency: Duration::ZERO,
            drop_rate: 0.0,
            request_timeout: Duration::from_secs(5),
        }
    }
}

struct Registration {
    id: NodeId,
    inbound: mpsc::UnboundedSender<InboundRequest>,
}

#[derive(Default)]
struct DeliveryController {
    /// Addresses whose traffic is refused
    failed_peers: HashSet<String>,
    /// Address pairs that cannot reach each other, stored in sorted order
    unlinked: HashSet<(String, String)>,
    latency: Duration,
    drop_rate: f64,
}

// One spelling per socket address, so `[::1]:7000` and
// `[0:0:0:0:0:0:0:1]:7000` name the same peer. Unparseable input is kept as is.
fn canonical(address: &str) -> String {
    address
        .parse::<SocketAddr>()
        .map(|parsed| parsed.to_string())
        .unwrap_or_else(|_| address.to_string())
}

fn link_key(a: &str, b: &str) -> (String, String) {
    let (a, b) = (canonical(a), canonical(b));
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// An in-process network: peers register under an address and exchange
/// [`DhtMessage`]s through channels, with controllable failures, latency
/// and drops. Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct Mocknet {
    peers: Arc<RwLock<HashMap<String, Registration>>>,
    delivery_controller: Arc<RwLock<DeliveryController>>,
    capacity: Option<usize>,
    request_timeout: Duration,
}

impl Default for Mocknet {
    fn default() -> Self {
        Self::new()
    }
}

impl Mocknet {
    pub fn new() -> Self {
        Self::with_config(MocknetConfig::default())
    }

    pub fn with_config(config: MocknetConfig) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            delivery_controller: Arc::new(RwLock::new(DeliveryController {
                latency: config.latency,
                drop_rate: config.drop_rate.clamp(0.0, 1.0),
                ..DeliveryController::default()
            })),
            capacity: config.capacity,
            request_timeout: config.request_timeout,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Registers a peer and returns its connected host.
    ///
    /// Registration is not idempotent: a second registration of the same
    /// socket address (in any spelling) or the same key fails. The check and
    /// the insert happen under one write lock, so concurrent registrations
    /// never observe each other half done. The host advertises the canonical
    /// form of `address`.
    pub async fn add_peer(
        &self,
        key: &PrivateKey,
        address: &str,
    ) -> Result<SimulatedHost, RegistrationError> {
        let address = match address.parse::<SocketAddr>() {
            Ok(parsed) => parsed.to_string(),
            Err(_) => return Err(RegistrationError::MalformedAddress(address.to_string())),
        };
        let info = PeerInfo::new(key.peer_id(), address.clone());
        let (sender, receiver) = mpsc::unbounded_channel();

        {
            let mut peers = self.peers.write().await;
            if let Some(capacity) = self.capacity {
                if peers.len() >= capacity {
                    return Err(RegistrationError::CapacityExceeded { capacity });
                }
            }
            if peers.contains_key(&address) {
                return Err(RegistrationError::AddressInUse(address));
            }
            if peers.values().any(|r| r.id == info.id) {
                return Err(RegistrationError::PeerAlreadyRegistered(info.short_id()));
            }
            peers.insert(
                address.clone(),
                Registration {
                    id: info.id,
                    inbound: sender,
                },
            );
        }

        debug!("[{}] Registered peer {}", address, info.short_id());
        Ok(SimulatedHost {
            info,
            mocknet: self.clone(),
            incoming: Mutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
        })
    }

    /// Removes a peer (simulates the peer leaving). Pending requests to it fail.
    pub async fn remove_peer(&self, address: &str) -> bool {
        self.peers.write().await.remove(&canonical(address)).is_some()
    }

    // Only removes the registration if it still belongs to `id`.
    async fn remove_registration(&self, address: &str, id: &NodeId) {
        let address = canonical(address);
        let mut peers = self.peers.write().await;
        if peers.get(&address).is_some_and(|r| &r.id == id) {
            peers.remove(&address);
            debug!("[{}] Unregistered peer", address);
        }
    }

    /// Registered peers, ordered by address
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(address, r)| PeerInfo::new(r.id, address.clone()))
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_registered(&self, address: &str) -> bool {
        self.peers.read().await.contains_key(&canonical(address))
    }

    pub async fn peer_id_for(&self, address: &str) -> Option<NodeId> {
        self.peers.read().await.get(&canonical(address)).map(|r| r.id)
    }

    /// Mark a peer as failed (requests to and from it are refused)
    pub async fn mark_peer_failed(&self, address: &str) {
        self.delivery_controller
            .write()
            .await
            .failed_peers
            .insert(canonical(address));
    }

    pub async fn mark_peer_recovered(&self, address: &str) {
        self.delivery_controller
            .write()
            .await
            .failed_peers
            .remove(&canonical(address));
    }

    /// Cut the link between two peers in both directions
    pub async fn unlink_peers(&self, a: &str, b: &str) {
        self.delivery_controller
            .write()
            .await
            .unlinked
            .insert(link_key(a, b));
    }

    pub async fn link_peers(&self, a: &str, b: &str) {
        self.delivery_controller
            .write()
            .await
            .unlinked
            .remove(&link_key(a, b));
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.delivery_controller.write().await.latency = latency;
    }

    /// Set message drop rate (0.0 = no drops, 1.0 = drop all)
    pub async fn set_drop_rate(&self, drop_rate: f64) {
        self.delivery_controller.write().await.drop_rate = drop_rate.clamp(0.0, 1.0);
    }

    async fn deliver(
        &self,
        from: &str,
        to: &str,
        message: DhtMessage,
    ) -> Result<DhtMessage, HostError> {
        let (from, to) = (canonical(from), canonical(to));
        let (from, to) = (from.as_str(), to.as_str());
        let controller = self.delivery_controller.read().await;

        if controller.failed_peers.contains(to) || controller.failed_peers.contains(from) {
            return Err(HostError::Unreachable(to.to_string()));
        }
        if controller.unlinked.contains(&link_key(from, to)) {
            return Err(HostError::NoLink {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if controller.drop_rate > 0.0 && rand::random::<f64>() < controller.drop_rate {
            return Err(HostError::Dropped(to.to_string()));
        }
        let latency = controller.latency;
        drop(controller);

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let sender = self
            .peers
            .read()
            .await
            .get(to)
            .map(|r| r.inbound.clone())
            .ok_or_else(|| HostError::Unreachable(to.to_string()))?;

        let (respond, response) = oneshot::channel();
        sender
            .send(InboundRequest {
                from: from.to_string(),
                message,
                respond,
            })
            .map_err(|_| HostError::Unreachable(to.to_string()))?;

        match tokio::time::timeout(self.request_timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(HostError::Dropped(to.to_string())),
            Err(_) => Err(HostError::Timeout(to.to_string())),
        }
    }
}

/// A peer's attachment to a [`Mocknet`]. Closing it unregisters the peer.
pub struct SimulatedHost {
    info: PeerInfo,
    mocknet: Mocknet,
    incoming: Mutex<Option<InboundReceiver>>,
    closed: AtomicBool,
}

impl SimulatedHost {
    pub fn mocknet(&self) -> &Mocknet {
        &self.mocknet
    }
}

#[async_trait]
impl Host for SimulatedHost {
    fn info(&self) -> PeerInfo {
        self.info.clone()
    }

    async fn call(&self, address: &str, message: DhtMessage) -> Result<DhtMessage, HostError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HostError::Closed);
        }
        self.mocknet
            .deliver(&self.info.address, address, message)
            .await
    }

    fn take_incoming(&self) -> Option<InboundReceiver> {
        self.incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mocknet
            .remove_registration(&self.info.address, &self.info.id)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(from: &SimulatedHost) -> DhtMessage {
        DhtMessage::Ping { from: from.info() }
    }

    // Answers every inbound request with a Pong from `host`.
    fn answer_pings(host: &SimulatedHost) {
        let mut incoming = host.take_incoming().unwrap();
        let info = host.info();
        tokio::spawn(async move {
            while let Some(request) = incoming.recv().await {
                let _ = request.respond.send(DhtMessage::Pong { from: info.clone() });
            }
        });
    }

    #[tokio::test]
    async fn test_registration_rejects_duplicates() {
        let mocknet = Mocknet::new();
        let key = PrivateKey::generate();

        mocknet.add_peer(&key, "127.0.0.1:7001").await.unwrap();
        assert!(matches!(
            mocknet.add_peer(&PrivateKey::generate(), "127.0.0.1:7001").await,
            Err(RegistrationError::AddressInUse(_))
        ));
        assert!(matches!(
            mocknet.add_peer(&key, "127.0.0.1:7002").await,
            Err(RegistrationError::PeerAlreadyRegistered(_))
        ));
        assert_eq!(mocknet.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_equivalent_address_spellings_collide() {
        let mocknet = Mocknet::new();

        let first = mocknet
            .add_peer(&PrivateKey::generate(), "[::1]:7000")
            .await
            .unwrap();
        assert_eq!(
            mocknet
                .add_peer(&PrivateKey::generate(), "[0:0:0:0:0:0:0:1]:7000")
                .await
                .err(),
            Some(RegistrationError::AddressInUse("[::1]:7000".to_string()))
        );
        assert_eq!(mocknet.peer_count().await, 1);
        assert_eq!(first.info().address, "[::1]:7000");
        assert_eq!(
            mocknet.peer_id_for("[0:0:0:0:0:0:0:1]:7000").await,
            Some(first.info().id)
        );
    }

    #[tokio::test]
    async fn test_requests_reach_peer_under_any_spelling() {
        let mocknet = Mocknet::new();
        let a = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7001")
            .await
            .unwrap();
        let b = mocknet
            .add_peer(&PrivateKey::generate(), "[0:0:0:0:0:0:0:1]:7002")
            .await
            .unwrap();
        answer_pings(&b);

        assert_eq!(b.info().address, "[::1]:7002");
        let response = a.call("[::1]:7002", ping(&a)).await.unwrap();
        assert_eq!(response, DhtMessage::Pong { from: b.info() });
    }

    #[tokio::test]
    async fn test_registration_validates_address_and_capacity() {
        let mocknet = Mocknet::with_config(MocknetConfig {
            capacity: Some(1),
            ..MocknetConfig::default()
        });

        assert!(matches!(
            mocknet.add_peer(&PrivateKey::generate(), "not-an-address").await,
            Err(RegistrationError::MalformedAddress(_))
        ));
        mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7001")
            .await
            .unwrap();
        assert_eq!(
            mocknet
                .add_peer(&PrivateKey::generate(), "127.0.0.1:7002")
                .await
                .err(),
            Some(RegistrationError::CapacityExceeded { capacity: 1 })
        );
    }

    #[tokio::test]
    async fn test_request_reaches_registered_peer() {
        let mocknet = Mocknet::new();
        let a = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7001")
            .await
            .unwrap();
        let b = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7002")
            .await
            .unwrap();
        answer_pings(&b);

        let response = a.call("127.0.0.1:7002", ping(&a)).await.unwrap();
        assert_eq!(response, DhtMessage::Pong { from: b.info() });
    }

    #[tokio::test]
    async fn test_delivery_controls() {
        let mocknet = Mocknet::new();
        let a = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7001")
            .await
            .unwrap();
        let b = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7002")
            .await
            .unwrap();
        answer_pings(&b);

        mocknet.mark_peer_failed("127.0.0.1:7002").await;
        assert!(matches!(
            a.call("127.0.0.1:7002", ping(&a)).await,
            Err(HostError::Unreachable(_))
        ));
        mocknet.mark_peer_recovered("127.0.0.1:7002").await;

        mocknet.unlink_peers("127.0.0.1:7002", "127.0.0.1:7001").await;
        assert!(matches!(
            a.call("127.0.0.1:7002", ping(&a)).await,
            Err(HostError::NoLink { .. })
        ));
        mocknet.link_peers("127.0.0.1:7001", "127.0.0.1:7002").await;

        mocknet.set_drop_rate(7.0).await;
        assert!(matches!(
            a.call("127.0.0.1:7002", ping(&a)).await,
            Err(HostError::Dropped(_))
        ));
        mocknet.set_drop_rate(0.0).await;

        assert!(a.call("127.0.0.1:7002", ping(&a)).await.is_ok());
        assert!(matches!(
            a.call("127.0.0.1:7999", ping(&a)).await,
            Err(HostError::Unreachable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let mocknet = Mocknet::new();
        let a = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7001")
            .await
            .unwrap();
        let b = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7002")
            .await
            .unwrap();
        answer_pings(&b);
        mocknet.set_latency(Duration::from_millis(250)).await;

        let started = tokio::time::Instant::now();
        a.call("127.0.0.1:7002", ping(&a)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let mocknet = Mocknet::with_config(MocknetConfig {
            request_timeout: Duration::from_secs(2),
            ..MocknetConfig::default()
        });
        let a = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7001")
            .await
            .unwrap();
        // Keep b's inbound stream alive but never answer.
        let b = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7002")
            .await
            .unwrap();
        let _incoming = b.take_incoming().unwrap();

        assert!(matches!(
            a.call("127.0.0.1:7002", ping(&a)).await,
            Err(HostError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_close_unregisters_only_its_own_registration() {
        let mocknet = Mocknet::new();
        let first = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7001")
            .await
            .unwrap();
        assert!(mocknet.remove_peer("127.0.0.1:7001").await);

        let second = mocknet
            .add_peer(&PrivateKey::generate(), "127.0.0.1:7001")
            .await
            .unwrap();
        first.close().await;
        assert_eq!(
            mocknet.peer_id_for("127.0.0.1:7001").await,
            Some(second.info().id)
        );

        second.close().await;
        assert!(!mocknet.is_registered("127.0.0.1:7001").await);
        assert!(matches!(
            second.call("127.0.0.1:7002", ping(&second)).await,
            Err(HostError::Closed)
        ));
    }
}
