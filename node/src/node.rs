use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;

use mockroute_lib::dht_messages::{DhtMessage, Key, NodeId, PeerInfo};
use mockroute_lib::distance_cmp;
use mockroute_lib::metrics::NodeMetrics;

use crate::context::{Context, ContextError};
use crate::datastore::SharedDatastore;
use crate::error::{ConstructionError, DhtError, HostError, Result};
use crate::host::{Host, InboundReceiver};
use crate::routing::RoutingClient;
use crate::routing_table::{Insertion, RoutingTable};
use crate::DhtConfig;

macro_rules! log_debug {
    ($address:expr, $($arg:tt)*) => ({
        debug!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_info {
    ($address:expr, $($arg:tt)*) => ({
        info!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_warn {
    ($address:expr, $($arg:tt)*) => ({
        warn!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_error {
    ($address:expr, $($arg:tt)*) => ({
        error!("[{}] {}", $address, format_args!($($arg)*));
    })
}

/// Datastore namespace for DHT records.
pub const RECORD_PREFIX: &str = "/records/";

pub fn record_key(key: &Key) -> String {
    format!("{}{}", RECORD_PREFIX, hex::encode(key))
}

// Poisoning only means another task panicked mid-update; the guarded state
// here is always left consistent, so keep going with it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupKind {
    Nodes,
    Value,
    Providers { wanted: usize },
}

#[derive(Debug, Default)]
struct Lookup {
    closest: Vec<PeerInfo>,
    value: Option<Vec<u8>>,
    providers: Vec<PeerInfo>,
    responded: usize,
}

/// A Kademlia participant bound to one [`Host`] and one datastore.
pub struct DhtNode<H: Host> {
    pub info: PeerInfo,
    host: Arc<H>,
    config: DhtConfig,
    routing: Mutex<RoutingTable>,
    datastore: SharedDatastore,
    providers: Mutex<HashMap<Key, Vec<PeerInfo>>>,
    metrics: Mutex<NodeMetrics>,
    closed: AtomicBool,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    // Oldest contacts of full buckets with a liveness ping in flight
    pinging: Mutex<HashSet<NodeId>>,
    this: Weak<DhtNode<H>>,
}

/// Builds a DHT node on top of a connected host and starts serving requests.
///
/// The node lives as long as `ctx`: once `ctx` is cancelled or its deadline
/// passes, the node closes itself and its host, exactly as if
/// [`DhtNode::close`] had been called. When `config.bootstrap_peers` is
/// non-empty the node bootstraps before returning, bounded by `ctx`. On
/// failure the host is closed so the network does not keep a peer nobody
/// serves.
pub async fn new_dht<H: Host>(
    ctx: &Context,
    host: H,
    datastore: SharedDatastore,
    config: DhtConfig,
) -> std::result::Result<Arc<DhtNode<H>>, ConstructionError> {
    let host = Arc::new(host);
    match DhtNode::construct(ctx, host.clone(), datastore, config).await {
        Ok(node) => Ok(node),
        Err(e) => {
            host.close().await;
            Err(e)
        }
    }
}

async fn serve<H: Host>(node: Weak<DhtNode<H>>, mut incoming: InboundReceiver, ctx: Context) {
    let reason = loop {
        let request = tokio::select! {
            request = incoming.recv() => match request {
                Some(request) => request,
                None => return,
            },
            reason = ctx.done() => break reason,
        };
        let Some(dht) = node.upgrade() else {
            return;
        };
        let response = dht.handle_request(&request.from, request.message);
        // The caller may have given up already.
        let _ = request.respond.send(response);
    };
    if let Some(dht) = node.upgrade() {
        dht.expire(reason).await;
    }
}

impl<H: Host> DhtNode<H> {
    async fn construct(
        ctx: &Context,
        host: Arc<H>,
        datastore: SharedDatastore,
        config: DhtConfig,
    ) -> std::result::Result<Arc<Self>, ConstructionError> {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let incoming = host
            .take_incoming()
            .ok_or(ConstructionError::HostAlreadyBound)?;
        let local_records = datastore.keys(RECORD_PREFIX)?.len() as u64;

        let info = host.info();
        let node = Arc::new_cyclic(|this| DhtNode {
            routing: Mutex::new(RoutingTable::new(info.id, config.k)),
            metrics: Mutex::new(NodeMetrics {
                local_records,
                ..NodeMetrics::default()
            }),
            info,
            host,
            config,
            datastore,
            providers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            serve_task: Mutex::new(None),
            pinging: Mutex::new(HashSet::new()),
            this: this.clone(),
        });

        let task = tokio::spawn(serve(Arc::downgrade(&node), incoming, ctx.clone()));
        *lock(&node.serve_task) = Some(task);

        log_info!(
            node.info.address,
            "DHT node {} started ({} records in store)",
            hex::encode(node.info.id),
            local_records
        );

        if !node.config.bootstrap_peers.is_empty() {
            let seeds = node.config.bootstrap_peers.clone();
            tokio::select! {
                result = node.bootstrap(&seeds) => {
                    if let Err(e) = result {
                        log_warn!(node.info.address, "Bootstrap during construction failed: {}", e);
                    }
                }
                reason = ctx.done() => {
                    node.close().await;
                    return Err(reason.into());
                }
            }
        }

        Ok(node)
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(DhtError::Closed)
        } else {
            Ok(())
        }
    }

    fn observe(&self, contact: &PeerInfo) {
        if contact.id == self.info.id {
            return;
        }
        let outcome = lock(&self.routing).update(contact.clone());
        match outcome {
            Insertion::Inserted => {
                log_debug!(self.info.address, "Added {} to routing table", contact.address);
            }
            Insertion::Pending { oldest } => {
                log_debug!(
                    self.info.address,
                    "Bucket full, {} waits on a liveness check of {}",
                    contact.address,
                    oldest.address
                );
                self.check_oldest(oldest);
            }
            Insertion::Refreshed | Insertion::Ignored => {}
        }
    }

    // Pings the oldest contact of a full bucket in the background. An answer
    // keeps it; a failure evicts it and promotes the parked replacement.
    fn check_oldest(&self, oldest: PeerInfo) {
        if self.is_closed() || !lock(&self.pinging).insert(oldest.id) {
            return;
        }
        let (Some(dht), Ok(runtime)) = (self.this.upgrade(), tokio::runtime::Handle::try_current())
        else {
            lock(&self.pinging).remove(&oldest.id);
            return;
        };
        runtime.spawn(async move {
            let ping = DhtMessage::Ping {
                from: dht.info.clone(),
            };
            if dht.rpc(&oldest, ping).await.is_err() {
                log_debug!(dht.info.address, "Replaced stale contact {}", oldest.address);
            }
            lock(&dht.pinging).remove(&oldest.id);
        });
    }

    fn forget(&self, peer: &PeerInfo) {
        if lock(&self.routing).remove(&peer.id).is_some() {
            log_debug!(self.info.address, "Evicted unresponsive peer {}", peer.address);
        }
    }

    // Answers a request from another peer. Never touches the network.
    pub fn handle_request(&self, from_address: &str, message: DhtMessage) -> DhtMessage {
        if let Some(sender) = message.sender() {
            self.observe(sender);
        }
        lock(&self.metrics).requests_served += 1;
        let k = self.config.k;

        match message {
            DhtMessage::Ping { .. } => DhtMessage::Pong {
                from: self.info.clone(),
            },
            DhtMessage::FindNode { from, target } => DhtMessage::FoundNodes {
                closer: self.closest_excluding(&target, k, &from.id),
            },
            DhtMessage::FindValue { from, key } => match self.datastore.get(&record_key(&key)) {
                Ok(value) => DhtMessage::FoundValue {
                    closer: if value.is_some() {
                        Vec::new()
                    } else {
                        self.closest_excluding(&key, k, &from.id)
                    },
                    value,
                },
                Err(e) => DhtMessage::Error {
                    message: e.to_string(),
                },
            },
            DhtMessage::Store { key, value, .. } => match self.store_local(&key, value) {
                Ok(()) => {
                    log_debug!(
                        self.info.address,
                        "Stored key {} for {}",
                        hex::encode(key),
                        from_address
                    );
                    DhtMessage::Stored { key }
                }
                Err(e) => DhtMessage::Error {
                    message: e.to_string(),
                },
            },
            DhtMessage::AddProvider { from, key } => {
                self.add_provider(key, from);
                DhtMessage::ProviderAdded { key }
            }
            DhtMessage::GetProviders { from, key } => DhtMessage::Providers {
                providers: lock(&self.providers).get(&key).cloned().unwrap_or_default(),
                closer: self.closest_excluding(&key, k, &from.id),
            },
            other => {
                log_error!(
                    self.info.address,
                    "Received response message as request from {}: {:?}",
                    from_address,
                    other
                );
                DhtMessage::Error {
                    message: "Received response message as request".to_string(),
                }
            }
        }
    }

    fn closest_excluding(&self, target: &NodeId, count: usize, exclude: &NodeId) -> Vec<PeerInfo> {
        let mut closest = lock(&self.routing).closest(target, count + 1);
        closest.retain(|p| &p.id != exclude);
        closest.truncate(count);
        closest
    }

    fn store_local(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        let record = record_key(key);
        let is_new = !self.datastore.has(&record)?;
        self.datastore.put(&record, value)?;
        if is_new {
            lock(&self.metrics).local_records += 1;
        }
        Ok(())
    }

    fn add_provider(&self, key: Key, provider: PeerInfo) {
        let mut providers = lock(&self.providers);
        let entry = providers.entry(key).or_default();
        if !entry.iter().any(|p| p.id == provider.id) {
            entry.push(provider);
        }
    }

    async fn rpc(&self, peer: &PeerInfo, message: DhtMessage) -> Result<DhtMessage> {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.request_timeout, self.host.call(&peer.address, message))
                .await
                .unwrap_or_else(|_| Err(HostError::Timeout(peer.address.clone())));

        match outcome {
            Ok(DhtMessage::Error { message }) => {
                lock(&self.metrics).record_rpc(true, started.elapsed());
                Err(DhtError::Remote(message))
            }
            Ok(response) => {
                lock(&self.metrics).record_rpc(true, started.elapsed());
                self.observe(peer);
                Ok(response)
            }
            Err(e) => {
                lock(&self.metrics).record_rpc(false, started.elapsed());
                log_debug!(self.info.address, "Call to {} failed: {}", peer.address, e);
                self.forget(peer);
                Err(e.into())
            }
        }
    }

    async fn ping_address(&self, address: &str) -> Result<PeerInfo> {
        let ping = DhtMessage::Ping {
            from: self.info.clone(),
        };
        let response =
            tokio::time::timeout(self.config.request_timeout, self.host.call(address, ping))
                .await
                .unwrap_or_else(|_| Err(HostError::Timeout(address.to_string())))?;
        match response {
            DhtMessage::Pong { from } => {
                self.observe(&from);
                Ok(from)
            }
            other => Err(DhtError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    fn request_for(&self, kind: LookupKind, target: NodeId) -> DhtMessage {
        let from = self.info.clone();
        match kind {
            LookupKind::Nodes => DhtMessage::FindNode { from, target },
            LookupKind::Value => DhtMessage::FindValue { from, key: target },
            LookupKind::Providers { .. } => DhtMessage::GetProviders { from, key: target },
        }
    }

    // Iterative Kademlia lookup: query `alpha` unqueried peers from the
    // shortlist at a time until every one of the `k` closest has answered or
    // failed, or until the requested value/providers turn up.
    async fn lookup(&self, target: NodeId, kind: LookupKind) -> Result<Lookup> {
        let k = self.config.k;
        let alpha = self.config.alpha.max(1);

        let mut shortlist = lock(&self.routing).closest(&target, k);
        if shortlist.is_empty() {
            return Err(DhtError::NoPeers);
        }
        lock(&self.metrics).lookups += 1;

        let mut seen: HashSet<NodeId> = shortlist.iter().map(|p| p.id).collect();
        seen.insert(self.info.id);
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut lookup = Lookup::default();

        loop {
            let candidates: Vec<PeerInfo> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.id))
                .take(alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for candidate in &candidates {
                queried.insert(candidate.id);
            }

            let responses = join_all(candidates.iter().map(|peer| async move {
                (peer, self.rpc(peer, self.request_for(kind, target)).await)
            }))
            .await;

            let mut failed: HashSet<NodeId> = HashSet::new();
            for (peer, response) in responses {
                let closer = match response {
                    Ok(DhtMessage::FoundNodes { closer }) => closer,
                    Ok(DhtMessage::FoundValue { value, closer }) => {
                        if let Some(value) = value {
                            lookup.responded += 1;
                            lookup.value = Some(value);
                            lookup.closest = shortlist;
                            return Ok(lookup);
                        }
                        closer
                    }
                    Ok(DhtMessage::Providers { providers, closer }) => {
                        for provider in providers {
                            if !lookup.providers.iter().any(|p| p.id == provider.id) {
                                lookup.providers.push(provider);
                            }
                        }
                        closer
                    }
                    Ok(other) => {
                        log_warn!(
                            self.info.address,
                            "Unexpected lookup response from {}: {:?}",
                            peer.address,
                            other
                        );
                        failed.insert(peer.id);
                        continue;
                    }
                    Err(_) => {
                        failed.insert(peer.id);
                        continue;
                    }
                };
                lookup.responded += 1;
                for contact in closer {
                    if seen.insert(contact.id) {
                        shortlist.push(contact);
                    }
                }
            }

            shortlist.retain(|p| !failed.contains(&p.id));
            shortlist.sort_by(|a, b| distance_cmp(&target, &a.id, &b.id));
            shortlist.truncate(k);

            if let LookupKind::Providers { wanted } = kind {
                if lookup.providers.len() >= wanted {
                    break;
                }
            }
        }

        if lookup.responded == 0 {
            lock(&self.metrics).failed_lookups += 1;
        }
        lookup.closest = shortlist;
        Ok(lookup)
    }

    /// The `k` closest live peers to `target` found by an iterative lookup.
    pub async fn closest_peers(&self, target: NodeId) -> Result<Vec<PeerInfo>> {
        self.ensure_open()?;
        Ok(self.lookup(target, LookupKind::Nodes).await?.closest)
    }

    pub async fn bootstrap(&self, seeds: &[String]) -> Result<usize> {
        self.ensure_open()?;
        let mut reached = 0;
        for seed in seeds {
            if seed == &self.info.address {
                continue;
            }
            match self.ping_address(seed).await {
                Ok(peer) => {
                    log_debug!(self.info.address, "Bootstrap seed {} is {}", seed, peer.short_id());
                    reached += 1;
                }
                Err(e) => {
                    log_warn!(self.info.address, "Bootstrap seed {} unreachable: {}", seed, e);
                }
            }
        }

        if reached == 0 && lock(&self.routing).is_empty() {
            return Err(DhtError::BootstrapFailed);
        }

        // Looking ourselves up fills the buckets near our own ID.
        match self.lookup(self.info.id, LookupKind::Nodes).await {
            Ok(_) | Err(DhtError::NoPeers) => {}
            Err(e) => return Err(e),
        }

        let size = lock(&self.routing).len();
        log_info!(
            self.info.address,
            "Bootstrapped from {} seed(s), routing table has {} peers",
            reached,
            size
        );
        Ok(size)
    }

    /// Refreshes the routing table with a lookup of a random ID.
    pub async fn refresh(&self) -> Result<usize> {
        self.ensure_open()?;
        let target: NodeId = rand::random();
        match self.lookup(target, LookupKind::Nodes).await {
            Ok(_) | Err(DhtError::NoPeers) => Ok(lock(&self.routing).len()),
            Err(e) => Err(e),
        }
    }

    pub async fn put_value(&self, key: Key, value: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        self.store_local(&key, value.clone())?;

        let targets = match self.lookup(key, LookupKind::Nodes).await {
            Ok(lookup) => lookup.closest,
            Err(DhtError::NoPeers) => Vec::new(),
            Err(e) => return Err(e),
        };

        let acks = join_all(targets.iter().map(|peer| {
            self.rpc(
                peer,
                DhtMessage::Store {
                    from: self.info.clone(),
                    key,
                    value: value.clone(),
                },
            )
        }))
        .await;
        let replicas = acks
            .iter()
            .filter(|ack| matches!(ack, Ok(DhtMessage::Stored { .. })))
            .count();

        log_info!(
            self.info.address,
            "Stored key {} locally and on {} of {} peers",
            hex::encode(key),
            replicas,
            targets.len()
        );
        Ok(())
    }

    pub async fn get_value(&self, key: Key) -> Result<Vec<u8>> {
        self.ensure_open()?;
        if let Some(value) = self.datastore.get(&record_key(&key))? {
            log_debug!(self.info.address, "Found key {} locally", hex::encode(key));
            return Ok(value);
        }

        match self.lookup(key, LookupKind::Value).await {
            Ok(Lookup {
                value: Some(value), ..
            }) => {
                log_debug!(self.info.address, "Found key {} on the network", hex::encode(key));
                Ok(value)
            }
            Ok(_) | Err(DhtError::NoPeers) => Err(DhtError::NotFound),
            Err(e) => Err(e),
        }
    }

    pub async fn find_peer(&self, id: NodeId) -> Result<PeerInfo> {
        self.ensure_open()?;
        if id == self.info.id {
            return Ok(self.info.clone());
        }
        if let Some(peer) = lock(&self.routing).get(&id).cloned() {
            return Ok(peer);
        }

        match self.lookup(id, LookupKind::Nodes).await {
            Ok(lookup) => lookup
                .closest
                .into_iter()
                .find(|p| p.id == id)
                .ok_or_else(|| DhtError::PeerNotFound(hex::encode(id))),
            Err(DhtError::NoPeers) => Err(DhtError::PeerNotFound(hex::encode(id))),
            Err(e) => Err(e),
        }
    }

    pub async fn provide(&self, key: Key) -> Result<()> {
        self.ensure_open()?;
        self.add_provider(key, self.info.clone());

        let targets = match self.lookup(key, LookupKind::Nodes).await {
            Ok(lookup) => lookup.closest,
            Err(DhtError::NoPeers) => Vec::new(),
            Err(e) => return Err(e),
        };
        let acks = join_all(targets.iter().map(|peer| {
            self.rpc(
                peer,
                DhtMessage::AddProvider {
                    from: self.info.clone(),
                    key,
                },
            )
        }))
        .await;

        log_info!(
            self.info.address,
            "Announced provider record for {} to {} peers",
            hex::encode(key),
            acks.iter().filter(|ack| ack.is_ok()).count()
        );
        Ok(())
    }

    pub async fn find_providers(&self, key: Key, count: usize) -> Result<Vec<PeerInfo>> {
        self.ensure_open()?;
        let mut found = lock(&self.providers).get(&key).cloned().unwrap_or_default();
        if found.len() >= count {
            found.truncate(count);
            return Ok(found);
        }

        match self
            .lookup(key, LookupKind::Providers { wanted: count })
            .await
        {
            Ok(lookup) => {
                for provider in lookup.providers {
                    if !found.iter().any(|p| p.id == provider.id) {
                        found.push(provider);
                    }
                }
            }
            Err(DhtError::NoPeers) => {}
            Err(e) => return Err(e),
        }
        found.truncate(count);
        Ok(found)
    }

    pub fn metrics(&self) -> NodeMetrics {
        let mut metrics = lock(&self.metrics).clone();
        metrics.routing_table_size = lock(&self.routing).len();
        metrics.provider_keys = lock(&self.providers).len() as u64;
        metrics
    }

    pub fn routing_table(&self) -> Vec<PeerInfo> {
        lock(&self.routing).peers()
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.serve_task).take() {
            task.abort();
        }
        self.host.close().await;
        log_info!(self.info.address, "DHT node closed");
    }

    // Runs on the serve task once the node's context is done, so the task
    // handle is released rather than aborted.
    async fn expire(&self, reason: ContextError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.serve_task).take();
        self.host.close().await;
        log_info!(self.info.address, "DHT node closed: {}", reason);
    }
}

impl<H: Host> Drop for DhtNode<H> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.serve_task).take() {
            task.abort();
        }
        // Detach from the network in the background if a runtime is around.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let host = Arc::clone(&self.host);
            runtime.spawn(async move {
                host.close().await;
            });
        }
    }
}

#[async_trait]
impl<H: Host> RoutingClient for DhtNode<H> {
    fn info(&self) -> PeerInfo {
        self.info.clone()
    }

    fn datastore(&self) -> SharedDatastore {
        Arc::clone(&self.datastore)
    }

    fn routing_table(&self) -> Vec<PeerInfo> {
        DhtNode::routing_table(self)
    }

    fn metrics(&self) -> NodeMetrics {
        DhtNode::metrics(self)
    }

    async fn bootstrap(&self, seeds: &[String]) -> Result<usize> {
        DhtNode::bootstrap(self, seeds).await
    }

    async fn put_value(&self, key: Key, value: Vec<u8>) -> Result<()> {
        DhtNode::put_value(self, key, value).await
    }

    async fn get_value(&self, key: Key) -> Result<Vec<u8>> {
        DhtNode::get_value(self, key).await
    }

    async fn find_peer(&self, id: NodeId) -> Result<PeerInfo> {
        DhtNode::find_peer(self, id).await
    }

    async fn provide(&self, key: Key) -> Result<()> {
        DhtNode::provide(self, key).await
    }

    async fn find_providers(&self, key: Key, count: usize) -> Result<Vec<PeerInfo>> {
        DhtNode::find_providers(self, key, count).await
    }

    async fn close(&self) {
        DhtNode::close(self).await
    }
}
