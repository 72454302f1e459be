//! Cluster Module Tests
//!
//! - **Wire protocol**: gossip messages survive bincode.
//! - **Membership**: joins, suspicion, refutation and failure detection.
//! - **Partitioning**: owner placement is deterministic, deduplicated and capped.

#[cfg(test)]
mod tests {
    use crate::cluster::membership::MembershipService;
    use crate::cluster::partitioner::PartitionManager;
    use crate::cluster::peer::Reply;
    use crate::cluster::types::{GossipMessage, Node, NodeId, NodeState};
    use crate::error::QueryStorageError;
    use crate::storage::types::QueryId;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn node(id: &str, port: u16) -> Node {
        Node {
            id: NodeId(id.to_string()),
            gossip_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            http_addr: format!("127.0.0.1:{}", port + 1000).parse().unwrap(),
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: None,
        }
    }

    async fn single_node() -> Arc<MembershipService> {
        MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            vec![],
        )
        .await
        .expect("Failed to create membership service")
    }

    fn src() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    // ============================================================
    // WIRE PROTOCOL
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn test_ping_carries_sender_addresses() {
        let msg = GossipMessage::Ping {
            from: node("sender", 5000),
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Ping");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Ping");

        if let GossipMessage::Ping { from } = decoded {
            assert_eq!(from.id.0, "sender");
            assert_eq!(from.http_addr.port(), 6000);
            assert!(from.last_seen.is_none());
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_ack_carries_member_list() {
        let msg = GossipMessage::Ack {
            from: NodeId("responder".to_string()),
            incarnation: 10,
            members: vec![node("a", 5000), node("b", 5001)],
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Ack");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Ack");

        if let GossipMessage::Ack {
            incarnation,
            members,
            ..
        } = decoded
        {
            assert_eq!(incarnation, 10);
            assert_eq!(members.len(), 2);
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // MEMBERSHIP
    // ============================================================

    #[tokio::test]
    async fn test_new_service_knows_only_itself() {
        let service = single_node().await;

        assert_eq!(service.members.len(), 1);
        assert!(service.peers().is_empty());
        let me = service.get_member(service.local_id()).unwrap();
        assert_eq!(me.state, NodeState::Alive);
        assert_ne!(me.gossip_addr.port(), 0, "bound port should be advertised");
    }

    #[tokio::test]
    async fn test_join_adds_member() {
        let service = single_node().await;

        service
            .handle_message(
                GossipMessage::Join {
                    node: node("joiner", 5100),
                },
                src(),
            )
            .await
            .unwrap();

        let joined = service.get_member(&NodeId("joiner".to_string())).unwrap();
        assert_eq!(joined.state, NodeState::Alive);
        assert_eq!(service.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_alive_with_same_incarnation_refutes_suspicion() {
        // ARRANGE
        let service = single_node().await;
        let peer = NodeId("peer".to_string());
        service
            .handle_message(GossipMessage::Join { node: node("peer", 5200) }, src())
            .await
            .unwrap();
        service
            .handle_message(
                GossipMessage::Suspect {
                    node_id: peer.clone(),
                    incarnation: 1,
                },
                src(),
            )
            .await
            .unwrap();
        assert_eq!(service.get_member(&peer).unwrap().state, NodeState::Suspect);

        // ACT
        service
            .handle_message(
                GossipMessage::Alive {
                    node_id: peer.clone(),
                    incarnation: 1,
                },
                src(),
            )
            .await
            .unwrap();

        // ASSERT
        assert_eq!(service.get_member(&peer).unwrap().state, NodeState::Alive);
    }

    #[tokio::test]
    async fn test_stale_ack_does_not_resurrect_with_old_incarnation() {
        let service = single_node().await;
        let mut peer = node("peer", 5300);
        peer.incarnation = 5;
        service
            .handle_message(GossipMessage::Join { node: peer.clone() }, src())
            .await
            .unwrap();

        let mut stale = peer.clone();
        stale.incarnation = 3;
        stale.state = NodeState::Dead;
        service
            .handle_message(
                GossipMessage::Ack {
                    from: NodeId("other".to_string()),
                    incarnation: 1,
                    members: vec![stale],
                },
                src(),
            )
            .await
            .unwrap();

        let current = service.get_member(&peer.id).unwrap();
        assert_eq!(current.state, NodeState::Alive);
        assert_eq!(current.incarnation, 5);
    }

    #[tokio::test]
    async fn test_silent_member_goes_suspect_then_dead() {
        let service = single_node().await;
        service
            .handle_message(GossipMessage::Join { node: node("quiet", 5400) }, src())
            .await
            .unwrap();
        let quiet = NodeId("quiet".to_string());

        let suspicions = service.detect_failures(Instant::now() + Duration::from_secs(6));
        assert_eq!(suspicions.len(), 1);
        assert_eq!(service.get_member(&quiet).unwrap().state, NodeState::Suspect);

        service.detect_failures(Instant::now() + Duration::from_secs(11));
        assert_eq!(service.get_member(&quiet).unwrap().state, NodeState::Dead);
        assert!(service.peers().is_empty());
    }

    // ============================================================
    // PARTITIONING
    // ============================================================

    #[tokio::test]
    async fn test_partition_is_deterministic() {
        let membership = single_node().await;
        let manager = PartitionManager::new(membership, 256, 2);
        let query_id = QueryId::from("query-100");

        let p1 = manager.get_partition(&query_id);
        let p2 = manager.get_partition(&query_id);

        assert_eq!(p1, p2);
        assert!(p1 < 256);
    }

    #[tokio::test]
    async fn test_single_node_owns_everything_without_backups() {
        let membership = single_node().await;
        let me = membership.local_id().clone();
        let manager = PartitionManager::new(membership, 16, 3);

        for partition in 0..16 {
            assert_eq!(manager.get_owners(partition), vec![me.clone()]);
        }
        assert_eq!(manager.my_primary_partitions().len(), 16);
        assert!(manager.my_backup_partitions().is_empty());
    }

    #[tokio::test]
    async fn test_owners_are_distinct_and_capped_by_replication_factor() {
        let membership = single_node().await;
        for (i, id) in ["n-a", "n-b", "n-c"].iter().enumerate() {
            membership
                .handle_message(GossipMessage::Join { node: node(id, 5500 + i as u16) }, src())
                .await
                .unwrap();
        }
        let manager = PartitionManager::new(membership, 64, 2);

        let mut primaries = std::collections::HashSet::new();
        for partition in 0..64 {
            let owners = manager.get_owners(partition);
            assert_eq!(owners.len(), 2);
            assert_ne!(owners[0], owners[1]);
            primaries.insert(owners[0].clone());
        }
        assert_eq!(primaries.len(), 4, "every member should be primary somewhere");
    }

    // ============================================================
    // PEER REPLIES
    // ============================================================

    #[test]
    fn test_error_reply_maps_status_and_variant() {
        let (status, axum::Json(reply)) =
            Reply::<u32>::respond(Err(QueryStorageError::NotFound("query q".to_string())));

        assert_eq!(status.as_u16(), 404);
        let json = serde_json::to_string(&reply).unwrap();
        let back: Reply<u32> = serde_json::from_str(&json).unwrap();
        match back {
            Reply::Err(e) => assert!(matches!(
                QueryStorageError::from(e),
                QueryStorageError::NotFound(_)
            )),
            Reply::Ok(_) => panic!("expected an error reply"),
        }
    }
}
