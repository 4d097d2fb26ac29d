//! Integration test: timeouts, cancellation, eviction and protocol errors.
//!
//! 1. A silent peer times out at the RPC deadline and drops out of lookups
//! 2. Lookups stop on cancellation and on the overall deadline
//! 3. A full bucket evicts an unresponsive contact but keeps a live one
//! 4. Unknown commands are answered with an error result
//! 5. Bootstrap against unreachable seeds fails

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use arxen_dht::bootstrap::BootstrapConfig;
use arxen_dht::lookup::{LookupCanceller, LookupPhase};
use arxen_dht::node::{DhtNode, NodeConfig};
use arxen_dht::{DhtConfig, DhtError};
use arxen_transport::messages::{Request, RpcResult};
use arxen_transport::udp::UdpConfig;
use arxen_types::{Contact, NodeId};
use tokio::net::UdpSocket;

const RPC_TIMEOUT: Duration = Duration::from_millis(400);

fn loopback_config(dht: DhtConfig) -> NodeConfig {
    NodeConfig {
        udp: UdpConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        },
        dht: DhtConfig {
            rpc_timeout: RPC_TIMEOUT,
            ..dht
        },
        ..Default::default()
    }
}

async fn start_node() -> DhtNode {
    DhtNode::start(loopback_config(DhtConfig::default()))
        .await
        .expect("start node")
}

/// A bound socket that never answers.
async fn silent_peer() -> (UdpSocket, Contact) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind silent");
    let addr = socket.local_addr().expect("addr");
    (socket, Contact::new(NodeId::random(), addr))
}

#[tokio::test]
async fn silent_peer_times_out_at_deadline() {
    let a = start_node().await;
    let (_socket, silent) = silent_peer().await;

    let started = Instant::now();
    let result = a.ping(silent.addr).await;
    let elapsed = started.elapsed();

    assert!(
        matches!(result, Err(DhtError::Timeout { addr, timeout }) if addr == silent.addr && timeout == RPC_TIMEOUT)
    );
    assert!(elapsed >= RPC_TIMEOUT, "returned early: {elapsed:?}");
    assert!(elapsed < RPC_TIMEOUT * 3, "returned late: {elapsed:?}");
    assert_eq!(a.stats().timeouts, 1);
    assert_eq!(a.dispatcher().pending_requests(), 0);

    a.shutdown().await;
}

#[tokio::test]
async fn silent_peer_dropped_from_lookup() {
    let a = start_node().await;
    let b = start_node().await;
    let (_socket, silent) = silent_peer().await;

    a.ping(b.local_addr()).await.expect("ping B");
    a.add_contact(silent).await;

    let report = a.find_node(silent.id).await;
    assert!(!report.contains(&silent.id), "silent peer must not be in the result");
    assert!(report.contains(&b.id()));
    assert!(report.elapsed >= RPC_TIMEOUT);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn cancelled_before_start() {
    let a = start_node().await;
    let b = start_node().await;
    a.ping(b.local_addr()).await.expect("ping B");

    let canceller = LookupCanceller::new();
    canceller.cancel();
    let report = a.find_node_cancellable(NodeId::random(), canceller.token()).await;
    assert_eq!(report.phase, LookupPhase::Cancelled);
    assert_eq!(report.rounds, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn cancelled_mid_round() {
    let a = DhtNode::start(loopback_config(DhtConfig::default()))
        .await
        .expect("a");
    let (_socket, silent) = silent_peer().await;
    a.add_contact(silent).await;

    // Slow probes, so the round is still in flight when cancelled.
    let slow = a.dispatcher().clone();
    let canceller = LookupCanceller::new();
    let token = canceller.token();
    let lookup = tokio::spawn(async move {
        arxen_dht::lookup::LookupCoordinator::new(slow)
            .find_node(NodeId::random(), token)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    canceller.cancel();

    let report = lookup.await.expect("join");
    assert_eq!(report.phase, LookupPhase::Cancelled);
    assert_eq!(report.rounds, 1);
    assert!(started.elapsed() < RPC_TIMEOUT, "cancellation should not wait for probes");

    a.shutdown().await;
}

#[tokio::test]
async fn lookup_deadline_times_out() {
    let a = DhtNode::start(NodeConfig {
        dht: DhtConfig {
            rpc_timeout: Duration::from_secs(5),
            lookup_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        ..loopback_config(DhtConfig::default())
    })
    .await
    .expect("a");
    let (_socket, silent) = silent_peer().await;
    a.add_contact(silent).await;

    let started = Instant::now();
    let report = a.find_node(NodeId::random()).await;
    assert_eq!(report.phase, LookupPhase::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(2));

    a.shutdown().await;
}

#[tokio::test]
async fn full_bucket_evicts_unresponsive_contact() {
    // =========================================================
    // Step 1: A with one-entry buckets holds a dead contact
    // =========================================================
    let a = DhtNode::start(loopback_config(DhtConfig {
        k: 1,
        ..Default::default()
    }))
    .await
    .expect("a");
    let (socket, dead) = silent_peer().await;
    let dead = Contact::new(a.id().with_flipped_bit(0), dead.addr);
    a.add_contact(dead).await;

    // =========================================================
    // Step 2: B, whose id shares A's bucket 0, contacts A
    // =========================================================
    let mut b_id = *a.id().with_flipped_bit(0).as_bytes();
    b_id[31] ^= 0x01;
    let b = DhtNode::start(NodeConfig {
        node_id: Some(NodeId::from_bytes(b_id)),
        ..loopback_config(DhtConfig::default())
    })
    .await
    .expect("b");
    b.ping(a.local_addr()).await.expect("B pings A");

    // =========================================================
    // Step 3: The dead contact fails its probe and is replaced
    // =========================================================
    let mut replaced = false;
    for _ in 0..60 {
        if a.dispatcher().contains(&b.id()).await {
            replaced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(replaced, "B should replace the dead contact");
    assert!(!a.dispatcher().contains(&dead.id).await);
    assert_eq!(a.dispatcher().bucket(0).await.len(), 1);

    // =========================================================
    // Step 4: A third node in the same bucket loses to live B
    // =========================================================
    let mut c_id = *a.id().with_flipped_bit(0).as_bytes();
    c_id[31] ^= 0x02;
    let c = DhtNode::start(NodeConfig {
        node_id: Some(NodeId::from_bytes(c_id)),
        ..loopback_config(DhtConfig::default())
    })
    .await
    .expect("c");
    c.ping(a.local_addr()).await.expect("C pings A");
    tokio::time::sleep(RPC_TIMEOUT).await;
    assert!(a.dispatcher().contains(&b.id()).await);
    assert!(!a.dispatcher().contains(&c.id()).await);

    drop(socket);
    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn unrecognized_command_gets_error_result() {
    let a = start_node().await;
    let b = start_node().await;

    let reply = a
        .dispatcher()
        .send_request(
            b.local_addr(),
            Request::Unrecognized {
                command: "GOSSIP".into(),
            },
        )
        .await
        .expect("reply");
    assert_eq!(reply.from.id, b.id());
    assert!(
        matches!(&reply.result, RpcResult::Error(message) if message.contains("GOSSIP")),
        "got {:?}",
        reply.result
    );
    // The requester is still learned.
    assert!(b.dispatcher().contains(&a.id()).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn bootstrap_fails_without_responsive_seeds() {
    let a = start_node().await;
    let (_socket, silent) = silent_peer().await;

    let config = BootstrapConfig {
        seed_nodes: vec![silent.addr],
        max_retries: 2,
        timeout_ms: 100,
        min_responsive_seeds: 1,
    };
    let result = a.bootstrap(&config).await;
    assert!(matches!(result, Err(DhtError::BootstrapFailed(_))));

    a.shutdown().await;
}
