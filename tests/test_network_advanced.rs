use anyhow::Result;
use medchain::{
    network::{read_envelope, PeerClient},
    Blockchain, ChainPolicy, Envelope, JoinState, MedchainError, Message, MedicalRecord,
    MessageType, Node, RetryPolicy,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration, Instant};

fn record(name: &str) -> MedicalRecord {
    MedicalRecord {
        name: name.to_string(),
        year: "2022".to_string(),
        hospital: "H2".to_string(),
        doctor: "D2".to_string(),
        diagnostic: "DG2".to_string(),
        medication: "M2".to_string(),
        procedure: "P2".to_string(),
    }
}

async fn started_node() -> Result<Node> {
    let mut node = Node::builder()
        .local_address("127.0.0.1:0")
        .retry(RetryPolicy::none())
        .connect_timeout_ms(500)
        .join_timeout_ms(5_000)
        .build()?;
    node.start().await?;
    Ok(node)
}

async fn first_node() -> Result<Node> {
    let node = started_node().await?;
    node.join(None).await?;
    Ok(node)
}

/// An address nothing listens on
fn dead_address() -> Result<String> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();
    drop(listener);
    Ok(addr)
}

const SETTLE: Duration = Duration::from_secs(5);

/// Poll until `node` holds `len` blocks
async fn wait_for_len(node: &Node, len: usize) -> bool {
    let deadline = Instant::now() + SETTLE;
    while Instant::now() < deadline {
        if node.chain_len().await == len {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Poll until `node` lists `peer` as a member
async fn wait_for_peer(node: &Node, peer: &str) -> bool {
    let deadline = Instant::now() + SETTLE;
    while Instant::now() < deadline {
        if node.peers().await.iter().any(|p| p == peer) {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_join_round_trip() -> Result<()> {
    let mut a = first_node().await?;
    a.append_record(record("MR1")).await?;
    a.append_record(record("MR2")).await?;
    let a_chain = a.chain().await;
    assert_eq!(a_chain.len(), 3);

    let mut b = started_node().await?;
    let a_addr = a.local_address().await;
    let b_addr = b.local_address().await;
    b.join(Some(&a_addr)).await?;

    assert_eq!(b.state().await, JoinState::Ready);
    assert_eq!(b.chain().await, a_chain);
    assert!(b.is_chain_valid().await);
    assert!(a.peers().await.contains(&b_addr));
    assert!(b.peers().await.contains(&a_addr));
    assert!(!b.peers().await.contains(&b_addr));

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_bootstrap_informs_existing_peers_of_joiner() -> Result<()> {
    let mut a = first_node().await?;
    let mut b = started_node().await?;
    let mut c = started_node().await?;
    let a_addr = a.local_address().await;
    let c_addr = c.local_address().await;

    b.join(Some(&a_addr)).await?;
    c.join(Some(&a_addr)).await?;

    assert!(wait_for_peer(&b, &c_addr).await);
    let mut b_peers = b.peers().await;
    b_peers.sort();
    let mut expected = vec![a_addr.clone(), c_addr.clone()];
    expected.sort();
    assert_eq!(b_peers, expected);
    assert_eq!(a.peers().await.len(), 2);
    assert_eq!(c.peers().await.len(), 2);

    a.stop().await?;
    b.stop().await?;
    c.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_broadcast_propagation() -> Result<()> {
    let mut a = first_node().await?;
    let mut b = started_node().await?;
    let mut c = started_node().await?;
    let a_addr = a.local_address().await;
    b.join(Some(&a_addr)).await?;
    c.join(Some(&a_addr)).await?;

    let (block, report) = a.append_record(record("MR1")).await?;
    assert!(report.is_complete());
    assert_eq!(report.delivered.len(), 2);
    assert_eq!(block.index, 1);

    for node in [&b, &c] {
        assert!(wait_for_len(node, 2).await);
        assert_eq!(node.chain().await.last(), Some(&block));
        assert!(node.is_chain_valid().await);
    }

    // A record entered on a joined node reaches the bootstrap too
    let c_addr = c.local_address().await;
    assert!(wait_for_peer(&b, &c_addr).await);
    let (second, _) = b.append_record(record("MR2")).await?;
    assert_eq!(second.index, 2);
    for node in [&a, &c] {
        assert!(wait_for_len(node, 3).await);
        assert!(node.is_chain_valid().await);
    }
    assert_eq!(a.chain().await, b.chain().await);

    a.stop().await?;
    b.stop().await?;
    c.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_peer_does_not_block_broadcast() -> Result<()> {
    let mut a = first_node().await?;
    let mut b = started_node().await?;
    let a_addr = a.local_address().await;
    b.join(Some(&a_addr)).await?;

    // Announce a joiner that is not listening; the reply to it fails but the
    // address is still recorded.
    let dead = dead_address()?;
    let client = PeerClient::new(
        Duration::from_millis(500),
        Duration::from_millis(500),
        RetryPolicy::none(),
    );
    client
        .send(&a_addr, &Envelope::new(MessageType::NewHost, dead.clone()))
        .await?;
    assert!(wait_for_peer(&a, &dead).await);

    let (block, report) = a.append_record(record("MR1")).await?;
    assert_eq!(report.failed_peers(), vec![dead.as_str()]);
    assert_eq!(report.delivered, vec![b.local_address().await]);

    assert!(wait_for_len(&b, 2).await);
    assert_eq!(b.chain().await.last(), Some(&block));
    // No eviction unless configured
    assert!(a.peers().await.contains(&dead));

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_failing_peer_is_evicted_when_threshold_set() -> Result<()> {
    let mut a = Node::builder()
        .local_address("127.0.0.1:0")
        .retry(RetryPolicy::none())
        .connect_timeout_ms(500)
        .peer_failure_threshold(1)
        .build()?;
    a.start().await?;
    a.join(None).await?;
    let a_addr = a.local_address().await;

    let dead = dead_address()?;
    let client = PeerClient::new(
        Duration::from_millis(500),
        Duration::from_millis(500),
        RetryPolicy::none(),
    );
    client
        .send(&a_addr, &Envelope::new(MessageType::NewHost, dead.clone()))
        .await?;
    assert!(wait_for_peer(&a, &dead).await);

    let (_, report) = a.append_record(record("MR1")).await?;
    assert_eq!(report.evicted, vec![dead.clone()]);
    assert!(!a.peers().await.contains(&dead));

    a.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_malformed_messages_do_not_stop_the_server() -> Result<()> {
    let mut a = first_node().await?;
    a.append_record(record("MR1")).await?;
    let a_addr = a.local_address().await;
    let before = a.chain().await;

    for garbage in [
        "not json at all\n",
        "{\"Message\":\"x\",\"MessageType\":42}\n",
        "{\"Message\":\"{broken\",\"MessageType\":2}\n",
        "{\"Message\":\"[1,2]\",\"MessageType\":4}\n",
        "",
    ] {
        let mut stream = TcpStream::connect(&a_addr).await?;
        stream.write_all(garbage.as_bytes()).await?;
        stream.shutdown().await?;
    }

    // The server is still serving and nothing changed
    let mut b = started_node().await?;
    b.join(Some(&a_addr)).await?;
    assert_eq!(a.chain().await, before);
    assert_eq!(b.chain().await, before);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_join_timeout_leaves_node_uninitialized() -> Result<()> {
    // Accepts connections at the TCP level but never answers
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let silent_addr = silent.local_addr()?.to_string();

    let mut b = Node::builder()
        .local_address("127.0.0.1:0")
        .retry(RetryPolicy::none())
        .join_timeout_ms(300)
        .build()?;
    b.start().await?;

    match b.join(Some(&silent_addr)).await {
        Err(MedchainError::JoinTimeout { bootstrap, .. }) => assert_eq!(bootstrap, silent_addr),
        other => panic!("expected join timeout, got {:?}", other),
    }
    assert_eq!(b.state().await, JoinState::Uninitialized);
    assert!(matches!(
        b.append_record(record("MR1")).await,
        Err(MedchainError::NotReady(JoinState::Uninitialized))
    ));

    b.stop().await?;
    drop(silent);
    Ok(())
}

#[tokio::test]
async fn test_join_unreachable_bootstrap_is_network_error() -> Result<()> {
    let mut b = started_node().await?;
    let dead = dead_address()?;

    let err = b.join(Some(&dead)).await.unwrap_err();
    assert!(err.is_network(), "unexpected error {:?}", err);
    assert_eq!(b.state().await, JoinState::Uninitialized);

    // A later join through a live node still works
    let mut a = first_node().await?;
    b.join(Some(&a.local_address().await)).await?;
    assert_eq!(b.state().await, JoinState::Ready);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_chain_before_membership_does_not_complete_join() -> Result<()> {
    // A scripted bootstrap node that answers the handshake by hand
    let bootstrap = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let bootstrap_addr = bootstrap.local_addr()?.to_string();
    let client = PeerClient::new(
        Duration::from_millis(500),
        Duration::from_millis(500),
        RetryPolicy::none(),
    );

    let mut b = Node::builder()
        .local_address("127.0.0.1:0")
        .chain_policy(ChainPolicy::Verified)
        .retry(RetryPolicy::none())
        .join_timeout_ms(5_000)
        .build()?;
    b.start().await?;

    let mut served = Blockchain::new();
    served.append(record("MR1"));
    served.append(record("MR2"));

    let script = async {
        let (stream, _) = bootstrap.accept().await?;
        let new_host = read_envelope(stream, "joiner", 1 << 20, SETTLE).await?;
        assert_eq!(new_host.message_type, MessageType::NewHost);
        let joiner = new_host.message;
        let (stream, _) = bootstrap.accept().await?;
        let sync = read_envelope(stream, "joiner", 1 << 20, SETTLE).await?;
        assert_eq!(sync.message_type, MessageType::NewBlock);

        // A chain from some other node lands before the membership snapshot
        let stray = Message::SetBlocks {
            blocks: Blockchain::<MedicalRecord>::new().blocks().to_vec(),
        }
        .to_envelope()?;
        client.send(&joiner, &stray).await?;
        sleep(Duration::from_millis(200)).await;
        let state_after_stray = b.state().await;

        let membership = Message::<MedicalRecord>::AddHost {
            peers: vec![bootstrap_addr.clone()],
        }
        .to_envelope()?;
        client.send(&joiner, &membership).await?;
        let reply = Message::SetBlocks {
            blocks: served.blocks().to_vec(),
        }
        .to_envelope()?;
        client.send(&joiner, &reply).await?;
        anyhow::Ok(state_after_stray)
    };

    let (joined, scripted) = tokio::join!(b.join(Some(&bootstrap_addr)), script);
    assert_eq!(scripted?, JoinState::AwaitingMembership);
    joined?;

    assert_eq!(b.state().await, JoinState::Ready);
    assert_eq!(b.chain().await, served.blocks());
    assert_eq!(b.peers().await, vec![bootstrap_addr]);

    b.stop().await?;
    Ok(())
}
