//! Storage Module Tests
//!
//! Validates the local part directory, replica selection and the node's wire
//! protocol.
//!
//! ## Test Scopes
//! - **PartStore**: atomic writes, exact lengths, path validation and deletion.
//! - **Policies**: each `ReplicaPolicy` picks only configured peers, never the node itself.
//! - **StorageNode**: `store` / `GET_PART` / `DELETE_PART` over real localhost sockets.
//! - **Replication**: a stored part reaches the peer once and is reported to a
//!   (stand-in) coordinator.

#[cfg(test)]
mod tests {
    use crate::config::{ReplicaPolicyKind, ReplicationConfig, StorageNodeConfig, TimeoutConfig};
    use crate::discovery::types::StorageNodeAddress;
    use crate::protocol::codec::{read_command, read_int, read_utf, write_size, write_utf};
    use crate::protocol::commands::{
        CMD_REPLICATION_INFO, CMD_STORE, REPLICATION_INFO_ACK, STORE_ERROR_PREFIX, UNKNOWN_COMMAND,
    };
    use crate::storage::client::{FetchOutcome, StorageClient};
    use crate::storage::part_store::{PartStore, validate_part_name};
    use crate::storage::replication::{
        FixedPeer, RandomPeer, RendezvousPeers, ReplicaPolicy, ReplicationOutcome, RoundRobinPeers,
        build_policy,
    };
    use crate::storage::server::StorageNode;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, watch};

    const IDLE: Duration = Duration::from_secs(5);

    fn test_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            connect_timeout_ms: 500,
            io_timeout_ms: 5_000,
        }
    }

    fn addr(port: u16) -> StorageNodeAddress {
        StorageNodeAddress::new("127.0.0.1", port)
    }

    /// An address nothing listens on.
    async fn dead_address() -> StorageNodeAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        addr(port)
    }

    struct TestNode {
        node: Arc<StorageNode>,
        addr: StorageNodeAddress,
        _shutdown: watch::Sender<bool>,
        _dir: TempDir,
    }

    async fn spawn_node(peers: Vec<StorageNodeAddress>, coordinator: StorageNodeAddress) -> TestNode {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageNodeConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            advertise_host: "127.0.0.1".to_string(),
            storage_dir: dir.path().join("storage"),
            coordinator_addr: coordinator,
            replication: ReplicationConfig {
                policy: ReplicaPolicyKind::Fixed,
                peers,
            },
            timeouts: test_timeouts(),
            ..StorageNodeConfig::default()
        };

        let (node, listener) = StorageNode::bind(config).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(node.clone().serve(listener, shutdown_rx));

        TestNode {
            addr: node.advertise().clone(),
            node,
            _shutdown: shutdown_tx,
            _dir: dir,
        }
    }

    /// Accepts `REPLICATION_INFO` reports and forwards them to the returned channel.
    async fn fake_coordinator() -> (StorageNodeAddress, mpsc::UnboundedReceiver<(String, String, i32)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Ok(Some(command)) = read_command(&mut stream).await {
                        assert_eq!(command, CMD_REPLICATION_INFO);
                        let part = read_utf(&mut stream).await.unwrap();
                        let ip = read_utf(&mut stream).await.unwrap();
                        let port = read_int(&mut stream).await.unwrap();
                        write_utf(&mut stream, REPLICATION_INFO_ACK).await.unwrap();
                        let _ = tx.send((part, ip, port));
                    }
                });
            }
        });

        (addr(port), rx)
    }

    async fn write_temp_file(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    // ============================================================
    // PART STORE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_write_then_open_part() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartStore::open(dir.path()).await.unwrap();

        let mut reader: &[u8] = b"hello world";
        store.write_part("a.txt.part0", &mut reader, 11, IDLE).await.unwrap();

        let (mut file, size) = store.open_part("a.txt.part0").await.unwrap().unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).await.unwrap();

        assert_eq!(size, 11);
        assert_eq!(content, b"hello world");
        assert!(store.contains("a.txt.part0").await);
    }

    #[tokio::test]
    async fn test_write_stops_at_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartStore::open(dir.path()).await.unwrap();

        let mut reader: &[u8] = b"abcdef";
        store.write_part("p", &mut reader, 3, IDLE).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("p")).unwrap(), b"abc");
        assert_eq!(reader, b"def", "Bytes past the declared length stay unread");
    }

    #[tokio::test]
    async fn test_short_stream_leaves_no_part() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartStore::open(dir.path()).await.unwrap();

        let mut reader: &[u8] = b"abc";
        let result = store.write_part("p", &mut reader, 10, IDLE).await;

        assert!(result.is_err());
        assert!(!store.contains("p").await);
        assert!(
            store.list_parts().await.unwrap().is_empty(),
            "No partial or temporary file may remain"
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_part_names_cannot_escape() {
        assert!(validate_part_name("").is_err());
        assert!(validate_part_name("../x").is_err());
        assert!(validate_part_name("/etc/passwd").is_err());
        assert!(validate_part_name("a/../../b").is_err());
        assert!(validate_part_name("./a").is_err());
        assert!(validate_part_name("nested/file.bin.part3").is_ok());

        let dir = tempfile::tempdir().unwrap();
        let store = PartStore::open(dir.path().join("root")).await.unwrap();
        let mut reader: &[u8] = b"evil";
        assert!(store.write_part("../evil", &mut reader, 4, IDLE).await.is_err());
        assert!(!dir.path().join("evil").exists());
        assert!(store.open_part("../evil").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_part_reports_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartStore::open(dir.path()).await.unwrap();

        assert!(!store.delete_part("missing").await.unwrap());

        let mut reader: &[u8] = b"x";
        store.write_part("present", &mut reader, 1, IDLE).await.unwrap();
        assert!(store.delete_part("present").await.unwrap());
        assert!(!store.delete_part("present").await.unwrap());
        assert!(store.open_part("present").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_parts_includes_nested() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartStore::open(dir.path()).await.unwrap();

        let mut a: &[u8] = b"1";
        let mut b: &[u8] = b"2";
        store.write_part("x.part0", &mut a, 1, IDLE).await.unwrap();
        store.write_part("sub/y.part1", &mut b, 1, IDLE).await.unwrap();

        assert_eq!(
            store.list_parts().await.unwrap(),
            vec!["sub/y.part1".to_string(), "x.part0".to_string()]
        );
    }

    // ============================================================
    // REPLICA POLICY TESTS
    // ============================================================

    #[test]
    fn test_fixed_policy_uses_first_peer() {
        let policy = FixedPeer::new(vec![addr(5003), addr(5005)]);

        assert_eq!(policy.choose("a.part0"), Some(addr(5003)));
        assert_eq!(policy.choose("b.part1"), Some(addr(5003)));
        assert_eq!(FixedPeer::new(vec![]).choose("a.part0"), None);
    }

    #[test]
    fn test_policies_skip_own_address() {
        let own = addr(5004);
        let config = ReplicationConfig {
            policy: ReplicaPolicyKind::Fixed,
            peers: vec![own.clone(), addr(5005)],
        };
        assert_eq!(build_policy(&config, &own).choose("p"), Some(addr(5005)));

        for policy in [
            ReplicaPolicyKind::Fixed,
            ReplicaPolicyKind::RoundRobin,
            ReplicaPolicyKind::Rendezvous,
            ReplicaPolicyKind::Random,
        ] {
            let config = ReplicationConfig {
                policy,
                peers: vec![own.clone()],
            };
            assert_eq!(
                build_policy(&config, &own).choose("p"),
                None,
                "{:?} must never pick the node itself",
                policy
            );
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let policy = RoundRobinPeers::new(vec![addr(1), addr(2), addr(3)]);

        let picks: Vec<u16> = (0..6)
            .map(|i| policy.choose(&format!("p{}", i)).unwrap().port)
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_rendezvous_is_stable_and_spreads() {
        let policy = RendezvousPeers::new(vec![addr(1), addr(2), addr(3)]);

        assert_eq!(policy.choose("file.part0"), policy.choose("file.part0"));

        let used: HashSet<u16> = (0..200)
            .map(|i| policy.choose(&format!("file.part{}", i)).unwrap().port)
            .collect();
        assert!(used.len() > 1, "Parts should not all land on one peer");
    }

    #[test]
    fn test_random_stays_within_peers() {
        let peers = vec![addr(1), addr(2)];
        let policy = RandomPeer::new(peers.clone());

        for i in 0..50 {
            let pick = policy.choose(&format!("p{}", i)).unwrap();
            assert!(peers.contains(&pick));
        }
        assert_eq!(RandomPeer::new(vec![]).choose("p"), None);
    }

    // ============================================================
    // STORAGE NODE PROTOCOL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_store_get_delete_cycle() {
        let node = spawn_node(vec![], dead_address().await).await;
        let client = StorageClient::new(test_timeouts());
        let scratch = tempfile::tempdir().unwrap();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let source = write_temp_file(&scratch, "source", &payload).await;

        let sent = client.store_file(&node.addr, "big.bin.part0", &source).await.unwrap();
        assert_eq!(sent, payload.len() as u64);

        let dest = scratch.path().join("fetched");
        let fetched = client.fetch_part(&node.addr, "big.bin.part0", &dest).await.unwrap();
        assert_eq!(fetched, FetchOutcome::Found(payload.len() as u64));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);

        assert!(client.delete_part(&node.addr, "big.bin.part0").await.unwrap());
        assert_eq!(
            client.fetch_part(&node.addr, "big.bin.part0", &dest).await.unwrap(),
            FetchOutcome::NotFound
        );
        assert!(!client.delete_part(&node.addr, "big.bin.part0").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_command_answered_then_closed() {
        let node = spawn_node(vec![], dead_address().await).await;

        let mut stream = TcpStream::connect(node.addr.connect_target()).await.unwrap();
        write_utf(&mut stream, "BOGUS").await.unwrap();

        assert_eq!(read_utf(&mut stream).await.unwrap(), UNKNOWN_COMMAND);
        let mut rest = Vec::new();
        let read = stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(read, 0, "Node must close cleanly after the reply");
    }

    #[tokio::test]
    async fn test_store_rejects_bad_part_name() {
        let node = spawn_node(vec![], dead_address().await).await;

        let mut stream = TcpStream::connect(node.addr.connect_target()).await.unwrap();
        write_utf(&mut stream, CMD_STORE).await.unwrap();
        write_utf(&mut stream, "../escape").await.unwrap();
        write_size(&mut stream, 4).await.unwrap();
        stream.write_all(b"data").await.unwrap();

        let reply = read_utf(&mut stream).await.unwrap();
        assert!(reply.starts_with(STORE_ERROR_PREFIX), "Got: {}", reply);
        assert!(node.node.store().list_parts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_part_with_bad_name_is_not_found() {
        let node = spawn_node(vec![], dead_address().await).await;
        let client = StorageClient::new(test_timeouts());
        let scratch = tempfile::tempdir().unwrap();

        let outcome = client
            .fetch_part(&node.addr, "../../etc/passwd", &scratch.path().join("x"))
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NotFound);
        assert!(!client.delete_part(&node.addr, "/abs").await.unwrap());
    }

    // ============================================================
    // REPLICATION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_replicates_once_and_reports() {
        let (coordinator, mut reports) = fake_coordinator().await;
        let peer = spawn_node(vec![], coordinator.clone()).await;
        let primary = spawn_node(vec![peer.addr.clone()], coordinator).await;

        let client = StorageClient::new(test_timeouts());
        let scratch = tempfile::tempdir().unwrap();
        let source = write_temp_file(&scratch, "source", b"replicate me").await;

        client.store_file(&primary.addr, "doc.txt.part0", &source).await.unwrap();

        let (part, ip, port) = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .expect("replication was not reported")
            .unwrap();
        assert_eq!(part, "doc.txt.part0");
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(port, peer.addr.port as i32);

        let (mut file, _) = peer.node.store().open_part("doc.txt.part0").await.unwrap().unwrap();
        let mut replica = Vec::new();
        file.read_to_end(&mut replica).await.unwrap();
        assert_eq!(replica, b"replicate me");

        // Same part again: stored, but not replicated a second time
        client.store_file(&primary.addr, "doc.txt.part0", &source).await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(500), reports.recv()).await;
        assert!(second.is_err(), "A part must be replicated only once");
    }

    #[tokio::test]
    async fn test_replication_outcomes_without_peer() {
        let unreachable = dead_address().await;
        let node = spawn_node(vec![unreachable.clone()], dead_address().await).await;
        let lonely = spawn_node(vec![], dead_address().await).await;

        let mut reader: &[u8] = b"data";
        node.node.store().write_part("p", &mut reader, 4, IDLE).await.unwrap();
        let outcome = node.node.replicator().schedule("p").unwrap().await.unwrap();
        assert_eq!(outcome, ReplicationOutcome::PeerUnreachable { peer: unreachable });

        let mut reader: &[u8] = b"data";
        lonely.node.store().write_part("p", &mut reader, 4, IDLE).await.unwrap();
        let outcome = lonely.node.replicator().schedule("p").unwrap().await.unwrap();
        assert_eq!(outcome, ReplicationOutcome::NoPeer);

        assert!(lonely.node.replicator().schedule("p").is_none());
    }

    #[tokio::test]
    async fn test_unreported_when_coordinator_is_down() {
        let peer = spawn_node(vec![], dead_address().await).await;
        let node = spawn_node(vec![peer.addr.clone()], dead_address().await).await;

        let mut reader: &[u8] = b"data";
        node.node.store().write_part("q", &mut reader, 4, IDLE).await.unwrap();
        let outcome = node.node.replicator().schedule("q").unwrap().await.unwrap();

        assert_eq!(outcome, ReplicationOutcome::Unreported { peer: peer.addr.clone() });
        assert!(peer.node.store().contains("q").await);
    }

    #[tokio::test]
    async fn test_delete_clears_replication_record() {
        let node = spawn_node(vec![], dead_address().await).await;
        let client = StorageClient::new(test_timeouts());
        let scratch = tempfile::tempdir().unwrap();
        let source = write_temp_file(&scratch, "source", b"abc").await;

        client.store_file(&node.addr, "r.part0", &source).await.unwrap();
        for _ in 0..50 {
            if node.node.replicator().is_replicated("r.part0") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(node.node.replicator().is_replicated("r.part0"));

        assert!(client.delete_part(&node.addr, "r.part0").await.unwrap());
        assert!(!node.node.replicator().is_replicated("r.part0"));
    }
}
