//! Integration test: STORE and FIND_VALUE across nodes.
//!
//! 1. A stores (42, "hello") at B; C fetches it from B directly
//! 2. An iterative FIND_VALUE lookup finds a value two hops away and caches
//!    it at the closest responder that lacked it
//! 3. publish() stores at the k closest nodes, which later lookups find
//! 4. A backend that refuses writes answers STORE with false

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arxen_dht::dispatcher::FindValueReply;
use arxen_dht::lookup::FindValueOutcome;
use arxen_dht::node::{DhtNode, NodeConfig};
use arxen_dht::store::MemoryStorage;
use arxen_dht::DhtConfig;
use arxen_transport::udp::UdpConfig;
use arxen_types::NodeId;

fn loopback_config(cache_found_values: bool) -> NodeConfig {
    NodeConfig {
        udp: UdpConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        },
        dht: DhtConfig {
            rpc_timeout: Duration::from_millis(500),
            cache_found_values,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn start_node() -> DhtNode {
    DhtNode::start(loopback_config(true)).await.expect("start node")
}

#[tokio::test]
async fn store_then_find_value_at_peer() {
    let a = start_node().await;
    let b = start_node().await;
    let c = start_node().await;
    let key = NodeId::from(42);

    let stored = a
        .store_at(b.local_addr(), key, b"hello".to_vec())
        .await
        .expect("store");
    assert!(stored, "B should accept the value");

    let found = c.find_value_at(b.local_addr(), key).await.expect("find_value");
    assert_eq!(found, FindValueReply::Value(b"hello".to_vec()));

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn find_value_lookup_two_hops_and_caches() {
    // =========================================================
    // Step 1: C -> D -> B, value held only by B
    // =========================================================
    let b = start_node().await;
    let c = start_node().await;
    let d = start_node().await;
    // Keyed by B's id, so D's referral to B is always an improvement.
    let key = b.id();

    assert!(b.store_local(key, b"hello".to_vec()));
    d.ping(b.local_addr()).await.expect("D pings B");
    c.ping(d.local_addr()).await.expect("C pings D");

    // =========================================================
    // Step 2: C looks the value up
    // =========================================================
    let outcome = c.find_value(key).await;
    assert_eq!(outcome.value(), Some(&b"hello"[..]));
    if let FindValueOutcome::Found { holder, rounds, .. } = &outcome {
        assert_eq!(holder.id, b.id());
        assert_eq!(*rounds, 2);
    }

    // =========================================================
    // Step 3: D answered without the value, so it receives a copy
    // =========================================================
    let mut cached = false;
    for _ in 0..40 {
        if d.dispatcher().store().get(&key).is_some() {
            cached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(cached, "D should hold a cached copy");

    b.shutdown().await;
    c.shutdown().await;
    d.shutdown().await;
}

#[tokio::test]
async fn find_value_lookup_without_caching() {
    let b = start_node().await;
    let c = DhtNode::start(loopback_config(false)).await.expect("c");
    let d = start_node().await;
    let key = b.id();

    assert!(b.store_local(key, b"x".to_vec()));
    d.ping(b.local_addr()).await.expect("D pings B");
    c.ping(d.local_addr()).await.expect("C pings D");

    assert_eq!(c.find_value(key).await.value(), Some(&b"x"[..]));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(d.dispatcher().store().get(&key).is_none());

    b.shutdown().await;
    c.shutdown().await;
    d.shutdown().await;
}

#[tokio::test]
async fn missing_value_returns_closest_contacts() {
    let a = start_node().await;
    let b = start_node().await;
    a.ping(b.local_addr()).await.expect("ping");

    let outcome = a.find_value(NodeId::from(99)).await;
    assert!(outcome.value().is_none(), "nothing was stored");
    if let FindValueOutcome::NotFound(report) = outcome {
        assert!(report.contains(&b.id()));
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn publish_then_lookup_from_new_node() {
    // =========================================================
    // Step 1: Six nodes around a hub
    // =========================================================
    let hub = start_node().await;
    let mut nodes = Vec::new();
    for _ in 0..6 {
        let node = start_node().await;
        node.ping(hub.local_addr()).await.expect("ping hub");
        nodes.push(node);
    }

    // =========================================================
    // Step 2: Publish from one of them
    // =========================================================
    let key = NodeId::random();
    let accepted = nodes[0].publish(key, b"published".to_vec()).await;
    assert!(accepted >= 1, "at least the hub accepts");

    // =========================================================
    // Step 3: A newcomer finds it
    // =========================================================
    let newcomer = start_node().await;
    newcomer.ping(hub.local_addr()).await.expect("ping hub");
    assert_eq!(
        newcomer.find_value(key).await.value(),
        Some(&b"published"[..])
    );

    for node in nodes {
        node.shutdown().await;
    }
    newcomer.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn full_storage_refuses_store() {
    let a = start_node().await;
    let b = DhtNode::start_with_storage(loopback_config(true), Arc::new(MemoryStorage::with_capacity(1)))
        .await
        .expect("b");

    assert!(a
        .store_at(b.local_addr(), NodeId::from(1), vec![1])
        .await
        .expect("first store"));
    assert!(!a
        .store_at(b.local_addr(), NodeId::from(2), vec![2])
        .await
        .expect("second store"));

    a.shutdown().await;
    b.shutdown().await;
}
