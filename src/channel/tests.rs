//! Group Channel Tests
//!
//! Validates node identity, the gossip wire codec, fault classification
//! and the in-process hub used by the map tests.
//!
//! *Note: HTTP message delivery between real nodes is exercised in
//! cluster integration runs; unit tests here stay off the network apart
//! from binding loopback sockets.*

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::channel::gossip::GossipChannel;
    use crate::channel::group::{GroupChannel, GroupListener};
    use crate::channel::local::LocalHub;
    use crate::channel::types::{
        FaultCause, GossipMessage, Member, NodeId, NodeState, SendError, SendFault,
    };
    use crate::map::protocol::{MapMessage, MessageKind};

    // ============================================================
    // NODE ID TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each generated NodeId should be unique");
    }

    #[test]
    fn test_node_id_equality_and_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(NodeId::from("node-1"));
        set.insert(NodeId::from("node-1"));
        set.insert(NodeId::from("node-2"));

        assert_eq!(set.len(), 2, "HashSet should hold 2 unique NodeIds");
    }

    // ============================================================
    // GOSSIP WIRE CODEC
    // ============================================================

    fn member(id: &str) -> Member {
        Member {
            id: NodeId::from(id),
            gossip_addr: "127.0.0.1:5000".parse().unwrap(),
            http_addr: "127.0.0.1:6000".parse().unwrap(),
            state: NodeState::Alive,
            incarnation: 3,
            last_seen: None,
        }
    }

    #[test]
    fn test_gossip_message_roundtrip() {
        let message = GossipMessage::Ack {
            from: NodeId::from("n1"),
            incarnation: 7,
            members: vec![member("n1"), member("n2")],
        };

        let encoded = bincode::serialize(&message).unwrap();
        let decoded: GossipMessage = bincode::deserialize(&encoded).unwrap();

        match decoded {
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                assert_eq!(from, NodeId::from("n1"));
                assert_eq!(incarnation, 7);
                assert_eq!(members.len(), 2);
                assert_eq!(members[1].id, NodeId::from("n2"));
            }
            other => panic!("Expected Ack, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_carries_member_record() {
        let message = GossipMessage::Ping { from: member("n9") };

        let encoded = bincode::serialize(&message).unwrap();
        let decoded: GossipMessage = bincode::deserialize(&encoded).unwrap();

        match decoded {
            GossipMessage::Ping { from } => {
                assert_eq!(from.id, NodeId::from("n9"));
                assert_eq!(from.incarnation, 3);
                assert!(from.last_seen.is_none(), "last_seen never crosses the wire");
            }
            other => panic!("Expected Ping, got {:?}", other),
        }
    }

    // ============================================================
    // FAULT CLASSIFICATION
    // ============================================================

    #[test]
    fn test_fault_cause_classification() {
        assert!(FaultCause::Transport("timeout".to_string()).is_transport());
        assert!(!FaultCause::Remote("peer replied 500".to_string()).is_transport());
    }

    #[test]
    fn test_send_error_transport_faults_filter() {
        let error = SendError::Faulty {
            faults: vec![
                SendFault {
                    node: NodeId::from("n2"),
                    cause: FaultCause::Transport("unreachable".to_string()),
                },
                SendFault {
                    node: NodeId::from("n3"),
                    cause: FaultCause::Remote("peer replied 500".to_string()),
                },
            ],
        };

        assert_eq!(
            error.transport_faults(),
            vec![NodeId::from("n2")],
            "Only transport-faulted targets count as departed"
        );
    }

    // ============================================================
    // IN-PROCESS HUB
    // ============================================================

    #[derive(Default)]
    struct RecordingListener {
        added: Mutex<Vec<NodeId>>,
        removed: Mutex<Vec<NodeId>>,
        messages: Mutex<Vec<MapMessage>>,
    }

    #[async_trait]
    impl GroupListener for RecordingListener {
        async fn on_message(&self, message: MapMessage) -> anyhow::Result<()> {
            self.messages.lock().push(message);
            Ok(())
        }

        async fn member_added(&self, node: &NodeId) {
            self.added.lock().push(node.clone());
        }

        async fn member_removed(&self, node: &NodeId) {
            self.removed.lock().push(node.clone());
        }

        fn state_snapshot(&self) -> Vec<MapMessage> {
            Vec::new()
        }
    }

    struct FailingListener;

    #[async_trait]
    impl GroupListener for FailingListener {
        async fn on_message(&self, _message: MapMessage) -> anyhow::Result<()> {
            anyhow::bail!("replication handler blew up")
        }

        async fn member_added(&self, _node: &NodeId) {}

        async fn member_removed(&self, _node: &NodeId) {}

        fn state_snapshot(&self) -> Vec<MapMessage> {
            Vec::new()
        }
    }

    fn test_message(map_id: &str, sender: &str, targets: Vec<NodeId>) -> MapMessage {
        MapMessage {
            map_id: map_id.to_string(),
            kind: MessageKind::IncrementalCopy,
            key: "k".to_string(),
            value_json: Some("\"v\"".to_string()),
            value_set: true,
            sender: NodeId::from(sender),
            targets,
        }
    }

    #[tokio::test]
    async fn test_hub_membership_callbacks() {
        let hub = LocalHub::new();
        let ch1 = hub.join("n1").await;

        let listener = Arc::new(RecordingListener::default());
        ch1.register("m", listener.clone());

        let _ch2 = hub.join("n2").await;
        assert_eq!(listener.added.lock().as_slice(), &[NodeId::from("n2")]);

        hub.kill(&NodeId::from("n2")).await;
        assert_eq!(listener.removed.lock().as_slice(), &[NodeId::from("n2")]);
    }

    #[tokio::test]
    async fn test_hub_delivers_messages() {
        let hub = LocalHub::new();
        let ch1 = hub.join("n1").await;
        let ch2 = hub.join("n2").await;

        let listener = Arc::new(RecordingListener::default());
        ch2.register("m", listener.clone());

        let targets = vec![ch2.local_node()];
        ch1.send(&targets, test_message("m", "n1", targets.clone()))
            .await
            .unwrap();

        assert_eq!(listener.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_hub_classifies_faults() {
        let hub = LocalHub::new();
        let ch1 = hub.join("n1").await;
        let ch2 = hub.join("n2").await;
        let ch3 = hub.join("n3").await;

        ch2.register("m", Arc::new(FailingListener));
        ch3.register("m", Arc::new(RecordingListener::default()));
        hub.set_unreachable(&NodeId::from("n3"), true);

        let targets = vec![ch2.local_node(), ch3.local_node(), NodeId::from("ghost")];
        let error = ch1
            .send(&targets, test_message("m", "n1", targets.clone()))
            .await
            .unwrap_err();

        let SendError::Faulty { faults } = error else {
            panic!("Expected a faulty send");
        };
        assert_eq!(faults.len(), 3);
        assert!(
            !faults[0].cause.is_transport(),
            "A throwing handler is a remote-processing fault"
        );
        assert!(faults[1].cause.is_transport(), "Unreachable is transport");
        assert!(faults[2].cause.is_transport(), "Unknown member is transport");
    }

    #[tokio::test]
    async fn test_hub_live_members_exclude_self_and_dead() {
        let hub = LocalHub::new();
        let ch1 = hub.join("n1").await;
        let _ch2 = hub.join("n2").await;
        let _ch3 = hub.join("n3").await;

        hub.kill(&NodeId::from("n3")).await;

        assert_eq!(ch1.live_members(), vec![NodeId::from("n2")]);
    }

    // ============================================================
    // GOSSIP CHANNEL
    // ============================================================

    #[tokio::test]
    async fn test_gossip_channel_creation() {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let http_addr: SocketAddr = "127.0.0.1:9100".parse().unwrap();

        let channel = GossipChannel::new(bind_addr, http_addr, vec![])
            .await
            .expect("Failed to create channel");

        assert_eq!(channel.alive_members().len(), 1, "Only self at startup");
        assert!(channel.live_members().is_empty(), "No peers at startup");
    }

    #[tokio::test]
    async fn test_gossip_two_nodes_discover_each_other() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let http: SocketAddr = "127.0.0.1:9200".parse().unwrap();

        let seed = GossipChannel::new(any, http, vec![]).await.unwrap();
        seed.clone().start().await;

        let joiner = GossipChannel::new(any, http, vec![seed.local.gossip_addr])
            .await
            .unwrap();
        joiner.clone().start().await;

        // Join is sent immediately; discovery of the seed flows back via
        // the first ping/ack exchange.
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(
            seed.live_members().contains(&joiner.local.id),
            "Seed should see the joiner"
        );
        assert!(
            joiner.live_members().contains(&seed.local.id),
            "Joiner should see the seed"
        );
    }
}
