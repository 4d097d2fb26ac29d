//! The DHT node: one UDP transport, one dispatcher, one routing table.
//!
//! ```text
//! DhtNode::start
//!   ├─ UdpTransport::bind        socket + recv/send loops
//!   ├─ Dispatcher::new           routing table, pending table, store service
//!   └─ Dispatcher::spawn_inbound inbound loop on the TaskSupervisor
//!
//! DhtNode::shutdown
//!   ├─ TaskSupervisor::shutdown  inbound loop, probes, cache stores
//!   ├─ Dispatcher::fail_pending  waiting callers see DhtError::Shutdown
//!   └─ UdpTransport::close       joins both socket loops
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arxen_transport::udp::{UdpConfig, UdpTransport};
use arxen_types::{Contact, NodeId};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bootstrap::{self, BootstrapConfig, BootstrapResult};
use crate::dispatcher::{Dispatcher, DispatcherStats, FindValueReply};
use crate::lookup::{CancelToken, FindValueOutcome, LookupCoordinator, LookupReport};
use crate::store::{MemoryStorage, Storage};
use crate::supervisor::TaskSupervisor;
use crate::{DhtConfig, Result};

/// Grace period for background tasks during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Everything needed to start a node.
#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    pub udp: UdpConfig,
    pub dht: DhtConfig,
    /// Fixed node id. Random when unset.
    pub node_id: Option<NodeId>,
    /// Address advertised in outgoing envelopes. Defaults to the bound
    /// address; peers correct it from the datagram source either way.
    pub advertise_addr: Option<SocketAddr>,
}

/// A running DHT node.
pub struct DhtNode {
    contact: Contact,
    dispatcher: Dispatcher,
    lookup: LookupCoordinator,
    transport: UdpTransport,
    supervisor: Arc<TaskSupervisor>,
}

impl DhtNode {
    /// Start a node backed by in-memory storage.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        Self::start_with_storage(config, Arc::new(MemoryStorage::new())).await
    }

    /// Bind the socket and start serving requests.
    ///
    /// # Errors
    ///
    /// [`crate::DhtError::Transport`] if the socket cannot be bound.
    pub async fn start_with_storage(config: NodeConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let (transport, inbound) = UdpTransport::bind(config.udp).await?;
        let id = config.node_id.unwrap_or_else(NodeId::random);
        let contact = Contact::new(id, config.advertise_addr.unwrap_or(transport.local_addr()));

        let supervisor = Arc::new(TaskSupervisor::new());
        let dispatcher = Dispatcher::new(
            contact,
            config.dht,
            transport.sender(),
            storage,
            supervisor.clone(),
        );
        dispatcher.spawn_inbound(inbound);
        let lookup = LookupCoordinator::new(dispatcher.clone());

        info!(node_id = %id, addr = %transport.local_addr(), "DHT node started");

        Ok(Self {
            contact,
            dispatcher,
            lookup,
            transport,
            supervisor,
        })
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.contact.id
    }

    /// The contact advertised to peers.
    pub fn contact(&self) -> Contact {
        self.contact
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// The RPC dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Dispatcher counters.
    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Offer a known contact to the routing table.
    pub async fn add_contact(&self, contact: Contact) {
        self.dispatcher.learn(contact).await;
    }

    /// Number of known contacts.
    pub async fn routing_table_len(&self) -> usize {
        self.dispatcher.table_len().await
    }

    /// `PING` a peer. Returns its contact.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Contact> {
        self.dispatcher.ping(addr).await
    }

    /// Iterative lookup of the contacts closest to `target`.
    pub async fn find_node(&self, target: NodeId) -> LookupReport {
        self.lookup.find_node(target, CancelToken::never()).await
    }

    /// Like [`DhtNode::find_node`], stopping early when `cancel` fires.
    pub async fn find_node_cancellable(&self, target: NodeId, cancel: CancelToken) -> LookupReport {
        self.lookup.find_node(target, cancel).await
    }

    /// Iterative lookup of the value under `key`, answered locally when held.
    pub async fn find_value(&self, key: NodeId) -> FindValueOutcome {
        self.find_value_cancellable(key, CancelToken::never()).await
    }

    /// [`find_value`](Self::find_value) with a cancel token.
    pub async fn find_value_cancellable(&self, key: NodeId, cancel: CancelToken) -> FindValueOutcome {
        if let Some(value) = self.dispatcher.store().get(&key) {
            debug!(key = %key, "Value held locally");
            return FindValueOutcome::Found {
                value,
                holder: self.contact,
                rounds: 0,
            };
        }
        self.lookup.find_value(key, cancel).await
    }

    /// Store a value in this node's own storage.
    pub fn store_local(&self, key: NodeId, value: Vec<u8>) -> bool {
        self.dispatcher.store().store(key, value)
    }

    /// `STORE` at a single peer.
    pub async fn store_at(&self, addr: SocketAddr, key: NodeId, value: Vec<u8>) -> Result<bool> {
        self.dispatcher.store_at(addr, key, value).await
    }

    /// `FIND_VALUE` against a single peer.
    pub async fn find_value_at(&self, addr: SocketAddr, key: NodeId) -> Result<FindValueReply> {
        self.dispatcher.find_value_at(addr, key).await
    }

    /// Store `value` at the `k` contacts closest to `key`. Returns how many
    /// accepted it.
    pub async fn publish(&self, key: NodeId, value: Vec<u8>) -> usize {
        let report = self.find_node(key).await;
        let mut stores = JoinSet::new();
        for contact in report.closest {
            let dispatcher = self.dispatcher.clone();
            let value = value.clone();
            stores.spawn(async move {
                (contact, dispatcher.store_at(contact.addr, key, value).await)
            });
        }

        let mut accepted = 0;
        while let Some(joined) = stores.join_next().await {
            match joined {
                Ok((_, Ok(true))) => accepted += 1,
                Ok((contact, Ok(false))) => debug!(key = %key, peer = %contact.id, "Peer refused value"),
                Ok((contact, Err(e))) => debug!(key = %key, peer = %contact.id, error = %e, "Publish to peer failed"),
                Err(e) => warn!(key = %key, error = %e, "Publish task failed"),
            }
        }
        info!(key = %key, accepted, "Value published");
        accepted
    }

    /// Join the network through seed nodes.
    pub async fn bootstrap(&self, config: &BootstrapConfig) -> Result<BootstrapResult> {
        bootstrap::bootstrap(config, &self.lookup).await
    }

    /// Stop background tasks, abandon pending requests, and close the socket.
    pub async fn shutdown(self) {
        info!(node_id = %self.contact.id, "Shutting down DHT node");
        self.supervisor.shutdown(SHUTDOWN_GRACE).await;
        self.dispatcher.fail_pending();
        self.transport.close().await;
    }
}

impl std::fmt::Debug for DhtNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtNode")
            .field("contact", &self.contact)
            .finish_non_exhaustive()
    }
}
