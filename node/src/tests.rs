#[cfg(test)]
mod tests {
    use crate::context::{Context, ContextError};
    use crate::datastore::{MapDatastore, MutexDatastore, SharedDatastore};
    use crate::error::{ConstructionError, DhtError, HostError};
    use crate::host::{InboundRequest, MockHost};
    use crate::node::{new_dht, record_key, DhtNode};
    use crate::routing::RoutingClient;
    use crate::DhtConfig;
    use mockroute_lib::dht_messages::{DhtMessage, NodeId, PeerInfo};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    fn hex_to_node_id(hex_str: &str) -> NodeId {
        let mut id = [0u8; 20];
        let bytes = hex::decode(hex_str).unwrap();
        // Pad with leading zeros if necessary
        let start_index = 20 - bytes.len();
        id[start_index..].copy_from_slice(&bytes);
        id
    }

    fn peer(hex_id: &str, port: u16) -> PeerInfo {
        PeerInfo::new(hex_to_node_id(hex_id), format!("127.0.0.1:{}", port))
    }

    fn local_info() -> PeerInfo {
        peer("0000000000000000000000000000000000000000", 9000)
    }

    fn store() -> SharedDatastore {
        MutexDatastore::shared(MapDatastore::new())
    }

    // A mock host whose inbound stream is handed to the caller.
    fn mock_host() -> (MockHost, mpsc::UnboundedSender<InboundRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut host = MockHost::new();
        host.expect_info().return_const(local_info());
        host.expect_take_incoming().return_once(move || Some(receiver));
        host.expect_close().returning(|| ());
        (host, sender)
    }

    async fn node_with(host: MockHost) -> Arc<DhtNode<MockHost>> {
        new_dht(&Context::background(), host, store(), DhtConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_is_answered_and_sender_is_learned() {
        let (host, _inbound) = mock_host();
        let node = node_with(host).await;
        let remote = peer("1111111111111111111111111111111111111111", 9001);

        let response = node.handle_request(&remote.address.clone(), DhtMessage::Ping { from: remote.clone() });

        assert_eq!(response, DhtMessage::Pong { from: local_info() });
        assert_eq!(node.routing_table(), vec![remote]);
        assert_eq!(node.metrics().requests_served, 1);
    }

    #[tokio::test]
    async fn test_store_then_find_value() {
        let (host, _inbound) = mock_host();
        let node = node_with(host).await;
        let remote = peer("2222222222222222222222222222222222222222", 9002);
        let key = hex_to_node_id("abcdef");

        let stored = node.handle_request(
            &remote.address,
            DhtMessage::Store {
                from: remote.clone(),
                key,
                value: b"hello".to_vec(),
            },
        );
        assert_eq!(stored, DhtMessage::Stored { key });

        let found = node.handle_request(&remote.address.clone(), DhtMessage::FindValue { from: remote, key });
        assert_eq!(
            found,
            DhtMessage::FoundValue {
                value: Some(b"hello".to_vec()),
                closer: vec![],
            }
        );
        assert_eq!(node.metrics().local_records, 1);
    }

    #[tokio::test]
    async fn test_find_node_excludes_requester() {
        let (host, _inbound) = mock_host();
        let node = node_with(host).await;
        let a = peer("1000000000000000000000000000000000000000", 9001);
        let b = peer("2000000000000000000000000000000000000000", 9002);
        node.handle_request(&a.address, DhtMessage::Ping { from: a.clone() });
        node.handle_request(&b.address, DhtMessage::Ping { from: b.clone() });

        let response = node.handle_request(
            &a.address,
            DhtMessage::FindNode {
                from: a.clone(),
                target: a.id,
            },
        );
        assert_eq!(response, DhtMessage::FoundNodes { closer: vec![b] });
    }

    #[tokio::test]
    async fn test_response_received_as_request_is_rejected() {
        let (host, _inbound) = mock_host();
        let node = node_with(host).await;

        let response = node.handle_request("127.0.0.1:9100", DhtMessage::FoundNodes { closer: vec![] });
        assert_eq!(
            response,
            DhtMessage::Error {
                message: "Received response message as request".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_inbound_requests_are_served_through_host_stream() {
        let (host, inbound) = mock_host();
        let _node = node_with(host).await;
        let remote = peer("3333333333333333333333333333333333333333", 9003);

        let (respond, response) = oneshot::channel();
        inbound
            .send(InboundRequest {
                from: remote.address.clone(),
                message: DhtMessage::Ping { from: remote },
                respond,
            })
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(1), response)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, DhtMessage::Pong { from: local_info() });
    }

    #[tokio::test]
    async fn test_unresponsive_peer_is_evicted_during_lookup() {
        let (mut host, _inbound) = mock_host();
        host.expect_call()
            .withf(|address, message| {
                address == "127.0.0.1:9004" && matches!(message, DhtMessage::FindNode { .. })
            })
            .times(1)
            .returning(|address, _| Err(HostError::Unreachable(address.to_string())));

        let node = node_with(host).await;
        let dead = peer("4444444444444444444444444444444444444444", 9004);
        node.handle_request(&dead.address, DhtMessage::Ping { from: dead.clone() });
        assert_eq!(node.routing_table().len(), 1);

        let result = node.find_peer(hex_to_node_id("5555")).await;
        assert!(matches!(result, Err(DhtError::PeerNotFound(_))));
        assert!(node.routing_table().is_empty());

        let metrics = node.metrics();
        assert_eq!(metrics.lookups, 1);
        assert_eq!(metrics.failed_lookups, 1);
        assert!(metrics.operation_success_rate < 1.0);
    }

    #[tokio::test]
    async fn test_get_value_falls_back_to_network_lookup() {
        let (mut host, _inbound) = mock_host();
        host.expect_call()
            .withf(|_, message| matches!(message, DhtMessage::FindValue { .. }))
            .times(1)
            .returning(|_, _| {
                Ok(DhtMessage::FoundValue {
                    value: Some(b"remote".to_vec()),
                    closer: vec![],
                })
            });

        let node = node_with(host).await;
        let holder = peer("6666666666666666666666666666666666666666", 9006);
        node.handle_request(&holder.address.clone(), DhtMessage::Ping { from: holder });

        let value = node.get_value(hex_to_node_id("77")).await.unwrap();
        assert_eq!(value, b"remote".to_vec());
    }

    #[tokio::test]
    async fn test_get_value_without_peers_is_not_found() {
        let (host, _inbound) = mock_host();
        let node = node_with(host).await;

        let result = node.get_value(hex_to_node_id("77")).await;
        assert!(matches!(result, Err(DhtError::NotFound)));
    }

    #[tokio::test]
    async fn test_put_value_replicates_to_closest_peers() {
        let (mut host, _inbound) = mock_host();
        host.expect_call()
            .withf(|_, message| matches!(message, DhtMessage::FindNode { .. }))
            .returning(|_, _| Ok(DhtMessage::FoundNodes { closer: vec![] }));
        host.expect_call()
            .withf(|address, message| {
                address == "127.0.0.1:9008" && matches!(message, DhtMessage::Store { .. })
            })
            .times(1)
            .returning(|_, message| match message {
                DhtMessage::Store { key, .. } => Ok(DhtMessage::Stored { key }),
                other => Ok(other),
            });

        let node = node_with(host).await;
        let replica = peer("8888888888888888888888888888888888888888", 9008);
        node.handle_request(&replica.address.clone(), DhtMessage::Ping { from: replica });

        let key = hex_to_node_id("99");
        node.put_value(key, b"v".to_vec()).await.unwrap();
        assert_eq!(
            node.datastore().get(&record_key(&key)).unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[tokio::test]
    async fn test_provide_is_visible_locally() {
        let (host, _inbound) = mock_host();
        let node = node_with(host).await;
        let key = hex_to_node_id("aa");

        node.provide(key).await.unwrap();
        let providers = node.find_providers(key, 5).await.unwrap();
        assert_eq!(providers, vec![local_info()]);
        assert_eq!(node.metrics().provider_keys, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_fails_when_no_seed_answers() {
        let (mut host, _inbound) = mock_host();
        host.expect_call()
            .returning(|address, _| Err(HostError::Unreachable(address.to_string())));

        let node = node_with(host).await;
        let result = node.bootstrap(&["127.0.0.1:9500".to_string()]).await;
        assert!(matches!(result, Err(DhtError::BootstrapFailed)));
    }

    #[tokio::test]
    async fn test_bootstrap_learns_seed() {
        let seed = peer("abababababababababababababababababababab", 9501);
        let seed_for_mock = seed.clone();
        let (mut host, _inbound) = mock_host();
        host.expect_call()
            .withf(|_, message| matches!(message, DhtMessage::Ping { .. }))
            .times(1)
            .returning(move |_, _| Ok(DhtMessage::Pong { from: seed_for_mock.clone() }));
        host.expect_call()
            .withf(|_, message| matches!(message, DhtMessage::FindNode { .. }))
            .returning(|_, _| Ok(DhtMessage::FoundNodes { closer: vec![] }));

        let node = node_with(host).await;
        let size = node.bootstrap(&[seed.address.clone()]).await.unwrap();
        assert_eq!(size, 1);
        assert_eq!(node.routing_table(), vec![seed]);
    }

    #[tokio::test]
    async fn test_construction_fails_when_host_already_bound() {
        let mut host = MockHost::new();
        host.expect_take_incoming().return_once(|| None);
        host.expect_close().times(1).returning(|| ());

        let result = new_dht(&Context::background(), host, store(), DhtConfig::default()).await;
        assert!(matches!(result, Err(ConstructionError::HostAlreadyBound)));
    }

    #[tokio::test]
    async fn test_construction_honours_cancelled_context() {
        let mut host = MockHost::new();
        host.expect_close().times(1).returning(|| ());

        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();

        let result = new_dht(&ctx, host, store(), DhtConfig::default()).await;
        assert!(matches!(
            result,
            Err(ConstructionError::Context(ContextError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_closed_node_rejects_operations() {
        let (host, _inbound) = mock_host();
        let node = node_with(host).await;

        node.close().await;
        node.close().await;
        assert!(node.is_closed());
        assert!(matches!(
            node.get_value(hex_to_node_id("01")).await,
            Err(DhtError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_node_closes_with_its_context() {
        let mut host = MockHost::new();
        host.expect_info().return_const(local_info());
        let (_inbound, receiver) = mpsc::unbounded_channel();
        host.expect_take_incoming().return_once(move || Some(receiver));
        host.expect_close().times(1).returning(|| ());

        let (ctx, cancel) = Context::background().with_cancel();
        let node = new_dht(&ctx, host, store(), DhtConfig::default())
            .await
            .unwrap();
        assert!(!node.is_closed());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !node.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            node.put_value(hex_to_node_id("02"), b"late".to_vec()).await,
            Err(DhtError::Closed)
        ));
        node.close().await;
    }

    #[tokio::test]
    async fn test_full_bucket_replaces_unresponsive_oldest_contact() {
        let (mut host, _inbound) = mock_host();
        host.expect_call()
            .withf(|address, message| {
                address == "127.0.0.1:9011" && matches!(message, DhtMessage::Ping { .. })
            })
            .times(1)
            .returning(|address, _| Err(HostError::Unreachable(address.to_string())));

        let config = DhtConfig {
            k: 1,
            ..DhtConfig::default()
        };
        let node = new_dht(&Context::background(), host, store(), config)
            .await
            .unwrap();
        // Both sit in the bucket farthest from the all-zero local id.
        let oldest = peer("8000000000000000000000000000000000000000", 9011);
        let newcomer = peer("c000000000000000000000000000000000000000", 9012);
        node.handle_request(&oldest.address.clone(), DhtMessage::Ping { from: oldest });
        node.handle_request(&newcomer.address, DhtMessage::Ping { from: newcomer.clone() });

        tokio::time::timeout(Duration::from_secs(1), async {
            while node.routing_table() != vec![newcomer.clone()] {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_existing_records_are_counted_at_startup() {
        let (host, _inbound) = mock_host();
        let key = hex_to_node_id("0102");
        let datastore: MapDatastore = [(record_key(&key), b"x".to_vec())].into_iter().collect();

        let node = new_dht(
            &Context::background(),
            host,
            MutexDatastore::shared(datastore),
            DhtConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(node.metrics().local_records, 1);
        assert_eq!(node.get_value(key).await.unwrap(), b"x".to_vec());
    }

    #[test]
    fn test_dht_config_defaults() {
        let config = DhtConfig::default();
        assert_eq!(config.k, 20);
        assert_eq!(config.alpha, 3);
        assert!(config.bootstrap_peers.is_empty());
    }
}
