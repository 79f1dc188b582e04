use std::collections::HashSet;
use std::sync::Arc;

use mockroute_node::RoutingClient;

use crate::integration::Mocknet;

/// Properties that should hold for any set of clients built by the harness.
pub struct NetworkInvariants;

#[derive(Debug)]
pub struct InvariantViolation {
    pub name: String,
    pub description: String,
    pub affected_nodes: Vec<String>,
}

impl NetworkInvariants {
    /// Check all invariants and return any violations
    pub async fn check_all(
        mocknet: &Mocknet,
        clients: &[Arc<dyn RoutingClient>],
    ) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        violations.extend(Self::check_registration(mocknet, clients).await);
        violations.extend(Self::check_store_isolation(clients));
        violations.extend(Self::check_routing_tables_live(mocknet, clients).await);
        violations.extend(Self::check_peer_reachability(clients).await);

        violations
    }

    /// Every client is registered on the mock network under its own peer id.
    pub async fn check_registration(
        mocknet: &Mocknet,
        clients: &[Arc<dyn RoutingClient>],
    ) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        for client in clients {
            let info = client.info();
            match mocknet.peer_id_for(&info.address).await {
                Some(id) if id == info.id => {}
                Some(_) => violations.push(InvariantViolation {
                    name: "Registration".to_string(),
                    description: format!(
                        "Address {} is registered to a different peer than {}",
                        info.address,
                        info.short_id()
                    ),
                    affected_nodes: vec![info.address.clone()],
                }),
                None => violations.push(InvariantViolation {
                    name: "Registration".to_string(),
                    description: format!("Client {} is not registered", info.address),
                    affected_nodes: vec![info.address.clone()],
                }),
            }
        }

        violations
    }

    /// No two clients are backed by the same store object. Only meaningful for
    /// clients built with their own store.
    pub fn check_store_isolation(clients: &[Arc<dyn RoutingClient>]) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        for (i, a) in clients.iter().enumerate() {
            for b in clients.iter().skip(i + 1) {
                if Arc::ptr_eq(&a.datastore(), &b.datastore()) {
                    violations.push(InvariantViolation {
                        name: "Store Isolation".to_string(),
                        description: format!(
                            "Clients {} and {} share a datastore",
                            a.info().address,
                            b.info().address
                        ),
                        affected_nodes: vec![a.info().address, b.info().address],
                    });
                }
            }
        }

        violations
    }

    /// Routing tables only point at peers the mock network still knows.
    pub async fn check_routing_tables_live(
        mocknet: &Mocknet,
        clients: &[Arc<dyn RoutingClient>],
    ) -> Vec<InvariantViolation> {
        let registered: HashSet<_> = mocknet.peers().await.into_iter().collect();
        let mut violations = Vec::new();

        for client in clients {
            let stale: Vec<String> = client
                .routing_table()
                .into_iter()
                .filter(|peer| !registered.contains(peer))
                .map(|peer| peer.address)
                .collect();
            if !stale.is_empty() {
                violations.push(InvariantViolation {
                    name: "Routing Table Liveness".to_string(),
                    description: format!(
                        "Client {} routes to unregistered peers {:?}",
                        client.info().address,
                        stale
                    ),
                    affected_nodes: stale,
                });
            }
        }

        violations
    }

    /// Every client can locate every other client through the DHT.
    pub async fn check_peer_reachability(
        clients: &[Arc<dyn RoutingClient>],
    ) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        for client in clients {
            let mut unreachable = Vec::new();
            for other in clients {
                let target = other.info();
                if target.id == client.info().id {
                    continue;
                }
                match client.find_peer(target.id).await {
                    Ok(found) if found.address == target.address => {}
                    _ => unreachable.push(target.address),
                }
            }
            if !unreachable.is_empty() {
                violations.push(InvariantViolation {
                    name: "Peer Reachability".to_string(),
                    description: format!(
                        "Client {} cannot locate {} peer(s)",
                        client.info().address,
                        unreachable.len()
                    ),
                    affected_nodes: unreachable,
                });
            }
        }

        violations
    }
}
