use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

use mockroute_lib::identity::Identity;
use mockroute_node::{
    new_dht, ConstructionError, Context, Datastore, DhtConfig, DhtError, MapDatastore,
    MutexDatastore, RoutingClient, SharedDatastore,
};

use crate::integration::{Mocknet, RegistrationError};

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("no mock network configured")]
    UnconfiguredFabric,

    #[error("failed to register {address} on the mock network: {source}")]
    Registration {
        address: String,
        #[source]
        source: RegistrationError,
    },

    #[error("{count} ports starting at {base_port} run past 65535")]
    PortRangeOverflow { base_port: u16, count: u16 },

    #[error("failed to construct DHT for {peer}: {source}")]
    Construction {
        peer: String,
        #[source]
        source: ConstructionError,
    },
}

/// How caller-supplied stores are prepared for concurrent use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapPolicy {
    /// Every store goes behind a mutex.
    #[default]
    Always,
    /// Stores that already report being concurrency safe are used as is.
    IfNeeded,
}

#[derive(Debug, Clone, Default)]
pub struct HarnessConfig {
    pub wrap_policy: WrapPolicy,
    pub dht: DhtConfig,
}

/// Something that hands out DHT clients for identities.
#[async_trait]
pub trait RoutingServer: Send + Sync {
    async fn client(&self, identity: &dyn Identity) -> Result<Arc<dyn RoutingClient>, HarnessError>;

    async fn client_with_store(
        &self,
        ctx: &Context,
        identity: &dyn Identity,
        store: Box<dyn Datastore>,
    ) -> Result<Arc<dyn RoutingClient>, HarnessError>;
}

fn wrap_store<D: Datastore>(policy: WrapPolicy, store: D) -> SharedDatastore {
    match policy {
        WrapPolicy::Always => MutexDatastore::shared(store),
        WrapPolicy::IfNeeded => {
            let boxed: Box<dyn Datastore> = Box::new(store);
            match boxed.into_shared() {
                Ok(shared) => shared,
                Err(store) => MutexDatastore::shared(store),
            }
        }
    }
}

/// Spins up DHT clients wired into one [`Mocknet`].
///
/// `DhtNetwork::default()` has no mock network; every client request on it
/// fails with [`HarnessError::UnconfiguredFabric`].
#[derive(Clone, Default)]
pub struct DhtNetwork {
    mocknet: Option<Mocknet>,
    config: HarnessConfig,
}

impl DhtNetwork {
    pub fn new(mocknet: Mocknet) -> Self {
        Self::with_config(mocknet, HarnessConfig::default())
    }

    pub fn with_config(mocknet: Mocknet, config: HarnessConfig) -> Self {
        Self {
            mocknet: Some(mocknet),
            config,
        }
    }

    pub fn mocknet(&self) -> Option<&Mocknet> {
        self.mocknet.as_ref()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// A client backed by its own fresh in-memory store.
    pub async fn client(
        &self,
        identity: &dyn Identity,
    ) -> Result<Arc<dyn RoutingClient>, HarnessError> {
        self.client_with_store(&Context::background(), identity, MapDatastore::new())
            .await
    }

    /// Registers `identity` on the mock network and builds a DHT on the
    /// resulting host, backed by `store`.
    ///
    /// A failed registration leaves the network untouched; a failed
    /// construction unregisters the peer again.
    pub async fn client_with_store<D: Datastore>(
        &self,
        ctx: &Context,
        identity: &dyn Identity,
        store: D,
    ) -> Result<Arc<dyn RoutingClient>, HarnessError> {
        let mocknet = self.mocknet.as_ref().ok_or(HarnessError::UnconfiguredFabric)?;
        let address = identity.address().to_string();

        let host = match mocknet.add_peer(identity.private_key(), &address).await {
            Ok(host) => host,
            Err(source) => {
                warn!("[{}] Registration refused: {}", address, source);
                return Err(HarnessError::Registration { address, source });
            }
        };
        debug!("[{}] Registered on mock network", address);

        let datastore = wrap_store(self.config.wrap_policy, store);
        let node = match new_dht(ctx, host, datastore, self.config.dht.clone()).await {
            Ok(node) => node,
            Err(source) => {
                warn!("[{}] DHT construction failed: {}", address, source);
                return Err(HarnessError::Construction {
                    peer: address,
                    source,
                });
            }
        };
        debug!("[{}] DHT client ready", address);

        Ok(node)
    }
}

#[async_trait]
impl RoutingServer for DhtNetwork {
    async fn client(&self, identity: &dyn Identity) -> Result<Arc<dyn RoutingClient>, HarnessError> {
        DhtNetwork::client(self, identity).await
    }

    async fn client_with_store(
        &self,
        ctx: &Context,
        identity: &dyn Identity,
        store: Box<dyn Datastore>,
    ) -> Result<Arc<dyn RoutingClient>, HarnessError> {
        DhtNetwork::client_with_store(self, ctx, identity, store).await
    }
}

/// Joins every client to the first one, then repeats the bootstrap so early
/// joiners learn about later ones.
pub async fn bootstrap_all(clients: &[Arc<dyn RoutingClient>]) -> Result<(), DhtError> {
    let Some((first, rest)) = clients.split_first() else {
        return Ok(());
    };
    let seed = [first.info().address];
    for _ in 0..2 {
        for client in rest {
            client.bootstrap(&seed).await?;
        }
    }
    Ok(())
}
