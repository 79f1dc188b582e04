use std::sync::Arc;

use mockroute_lib::identity::{identity_for_port, Identity, TestIdentity};
use mockroute_lib::key_for;
use mockroute_node::{Context, MapDatastore, RoutingClient, ThreadSafeDatastore};

use crate::integration::{
    bootstrap_all, DhtNetwork, HarnessError, Mocknet, MocknetConfig, NetworkInvariants,
    RegistrationError,
};

type ScenarioResult = Result<(), Box<dyn std::error::Error>>;

/// Common end-to-end scenarios for the harness
pub struct TestScenarios;

impl TestScenarios {
    /// Builds `count` clients on consecutive ports starting at `base_port`.
    /// Nothing is registered when the range does not fit below port 65535.
    pub async fn spawn_clients(
        harness: &DhtNetwork,
        base_port: u16,
        count: u16,
    ) -> Result<Vec<Arc<dyn RoutingClient>>, HarnessError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let last = base_port
            .checked_add(count - 1)
            .ok_or(HarnessError::PortRangeOverflow { base_port, count })?;
        let mut clients = Vec::with_capacity(count.into());
        for port in base_port..=last {
            clients.push(harness.client(&identity_for_port(port)).await?);
        }
        Ok(clients)
    }

    /// Two clients on an empty mock network; both end up registered and
    /// able to find each other.
    pub async fn two_clients_on_empty_network() -> ScenarioResult {
        let mocknet = Mocknet::new();
        let harness = DhtNetwork::new(mocknet.clone());

        let a = TestIdentity::new("127.0.0.1:4001");
        let b = TestIdentity::new("127.0.0.1:4002");
        let clients = vec![harness.client(&a).await?, harness.client(&b).await?];

        if mocknet.peer_count().await != 2 {
            return Err("both peers should be registered".into());
        }
        bootstrap_all(&clients).await?;

        let violations = NetworkInvariants::check_all(&mocknet, &clients).await;
        if !violations.is_empty() {
            return Err(format!("Invariant violations: {:?}", violations).into());
        }
        Ok(())
    }

    /// A full mock network refuses the next registration, the same harness
    /// accepts it once a slot frees up, and a harness on a larger network
    /// takes both.
    pub async fn capacity_exhaustion_and_reuse() -> ScenarioResult {
        let full = Mocknet::with_config(MocknetConfig {
            capacity: Some(1),
            ..MocknetConfig::default()
        });
        let harness = DhtNetwork::new(full.clone());

        let resident = harness.client(&identity_for_port(4101)).await?;
        match harness.client(&identity_for_port(4102)).await {
            Err(HarnessError::Registration {
                source: RegistrationError::CapacityExceeded { capacity: 1 },
                ..
            }) => {}
            Err(e) => return Err(format!("unexpected error: {}", e).into()),
            Ok(_) => return Err("registration beyond capacity succeeded".into()),
        }
        if full.peer_count().await != 1 {
            return Err("refused registration must not change the network".into());
        }

        resident.close().await;
        let _newcomer = harness.client(&identity_for_port(4102)).await?;
        if full.peer_id_for(identity_for_port(4102).address()).await.is_none() {
            return Err("freed slot should be reusable".into());
        }

        let roomy = DhtNetwork::new(Mocknet::with_config(MocknetConfig {
            capacity: Some(2),
            ..MocknetConfig::default()
        }));
        let _a = roomy.client(&identity_for_port(4101)).await?;
        let _b = roomy.client(&identity_for_port(4102)).await?;
        Ok(())
    }

    /// Records already in a caller's store are visible through the client.
    pub async fn prepopulated_store_is_visible() -> ScenarioResult {
        let harness = DhtNetwork::new(Mocknet::new());
        let store: MapDatastore = [("k", "v")].into_iter().collect();

        let client = harness
            .client_with_store(&Context::background(), &identity_for_port(4201), store)
            .await?;
        match client.datastore().get("k")? {
            Some(value) if value == b"v" => Ok(()),
            other => Err(format!("expected \"v\", found {:?}", other).into()),
        }
    }

    /// A value put through one client can be read through every other one.
    pub async fn value_round_trip(count: u16) -> ScenarioResult {
        let harness = DhtNetwork::new(Mocknet::new());
        let clients = Self::spawn_clients(&harness, 4300, count).await?;
        bootstrap_all(&clients).await?;

        let (writer, readers) = clients.split_first().ok_or("no clients")?;
        let key = key_for(b"round-trip");
        writer.put_value(key, b"payload".to_vec()).await?;

        for reader in readers {
            let value = reader.get_value(key).await?;
            if value != b"payload" {
                return Err(format!("{} read a wrong value", reader.info().address).into());
            }
        }
        Ok(())
    }

    /// Provider announcements are discoverable from other clients.
    pub async fn provider_discovery() -> ScenarioResult {
        let harness = DhtNetwork::new(Mocknet::new());
        let clients = Self::spawn_clients(&harness, 4400, 4).await?;
        bootstrap_all(&clients).await?;

        let key = key_for(b"provided-content");
        let provider = clients.last().ok_or("no clients")?;
        provider.provide(key).await?;

        let seeker = clients.first().ok_or("no clients")?;
        let providers = seeker.find_providers(key, 1).await?;
        if providers != vec![provider.info()] {
            return Err(format!("unexpected providers {:?}", providers).into());
        }
        Ok(())
    }

    /// Data survives the writer dropping off the network.
    pub async fn fault_tolerance() -> ScenarioResult {
        let mocknet = Mocknet::new();
        let harness = DhtNetwork::new(mocknet.clone());
        let clients = Self::spawn_clients(&harness, 4500, 5).await?;
        bootstrap_all(&clients).await?;

        let key = key_for(b"durable");
        let writer = clients.first().ok_or("no clients")?;
        writer.put_value(key, b"still here".to_vec()).await?;

        mocknet.mark_peer_failed(&writer.info().address).await;
        let reader = clients.last().ok_or("no clients")?;
        if reader.get_value(key).await? != b"still here" {
            return Err("value lost after writer failure".into());
        }
        Ok(())
    }

    /// Registering one identity twice is refused and leaves the first client
    /// working.
    pub async fn duplicate_registration_is_rejected() -> ScenarioResult {
        let mocknet = Mocknet::new();
        let harness = DhtNetwork::new(mocknet.clone());
        let identity = identity_for_port(4601);

        let first = harness.client(&identity).await?;
        match harness.client(&identity).await {
            Err(HarnessError::Registration { address, .. }) if address == identity.address() => {}
            Err(e) => return Err(format!("unexpected error: {}", e).into()),
            Ok(_) => return Err("duplicate registration succeeded".into()),
        }

        if mocknet.peer_id_for(identity.address()).await != Some(first.info().id) {
            return Err("first registration should be untouched".into());
        }
        Ok(())
    }

    pub async fn run_comprehensive_test_suite() -> ScenarioResult {
        Self::two_clients_on_empty_network().await?;
        Self::capacity_exhaustion_and_reuse().await?;
        Self::prepopulated_store_is_visible().await?;
        Self::value_round_trip(8).await?;
        Self::provider_discovery().await?;
        Self::fault_tolerance().await?;
        Self::duplicate_registration_is_rejected().await?;
        Ok(())
    }
}
