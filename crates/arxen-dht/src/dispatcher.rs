//! Request/response correlation and inbound request handling.
//!
//! ## Outbound
//!
//! [`Dispatcher::send_request`] stamps a fresh correlation id, records a
//! oneshot sender in the pending table, enqueues the datagram, and waits on
//! the receiver under a deadline. The entry is removed on every exit path:
//! delivery, timeout, send failure, or the caller dropping the future.
//!
//! ## Inbound
//!
//! The loop started by [`Dispatcher::spawn_inbound`] decodes each datagram
//! and:
//!
//! 1. Learns the sender into the routing table, using the address the
//!    datagram actually came from rather than the one the sender claims.
//! 2. For a REQUEST, runs the command handler and enqueues the RESPONSE.
//! 3. For a RESPONSE, completes the matching pending request. A RESPONSE
//!    nobody is waiting for is dropped and counted as unknown.
//!
//! Learning never blocks the loop. A full bucket spawns a liveness probe of
//! its least-recently-seen contact on the [`TaskSupervisor`]; at most one
//! probe per bucket is in flight, and newcomers that arrive meanwhile are
//! discarded.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arxen_transport::messages::{PingArgs, Request, RpcResult};
use arxen_transport::udp::{Datagram, Inbound, UdpSender};
use arxen_transport::wire::{Body, Envelope, RpcId};
use arxen_transport::TransportError;
use arxen_types::{Contact, NodeId};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, trace, warn};

use crate::routing::{InsertOutcome, RoutingTable};
use crate::store::{Storage, StoreService};
use crate::supervisor::TaskSupervisor;
use crate::{DhtConfig, DhtError, Result};

/// A RESPONSE delivered to a waiting caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// The responder, with its observed source address.
    pub from: Contact,
    pub result: RpcResult,
}

/// Outcome of a `FIND_VALUE` RPC to a single peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueReply {
    Value(Vec<u8>),
    Contacts(Vec<Contact>),
}

#[derive(Debug, Default)]
struct Counters {
    requests_handled: AtomicU64,
    responses_delivered: AtomicU64,
    unknown_responses: AtomicU64,
    decode_failures: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of the dispatcher's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub requests_handled: u64,
    pub responses_delivered: u64,
    pub unknown_responses: u64,
    pub decode_failures: u64,
    pub timeouts: u64,
}

type PendingTable = Mutex<HashMap<RpcId, oneshot::Sender<Reply>>>;

struct Inner {
    local: Contact,
    config: DhtConfig,
    sender: UdpSender,
    table: RwLock<RoutingTable>,
    store: StoreService,
    pending: PendingTable,
    probing: Mutex<HashSet<usize>>,
    supervisor: Arc<TaskSupervisor>,
    counters: Counters,
}

/// Cloneable handle to the node's RPC machinery.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Removes a pending entry when the waiting future completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    rpc_id: RpcId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.rpc_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Dispatcher {
    /// Build a dispatcher with an empty routing table for `local`.
    pub fn new(
        local: Contact,
        config: DhtConfig,
        sender: UdpSender,
        storage: Arc<dyn Storage>,
        supervisor: Arc<TaskSupervisor>,
    ) -> Self {
        let table = RoutingTable::new(local.id, config.k);
        Self {
            inner: Arc::new(Inner {
                local,
                config,
                sender,
                table: RwLock::new(table),
                store: StoreService::new(storage),
                pending: Mutex::new(HashMap::new()),
                probing: Mutex::new(HashSet::new()),
                supervisor,
                counters: Counters::default(),
            }),
        }
    }

    /// The contact this node advertises in every envelope.
    pub fn local(&self) -> Contact {
        self.inner.local
    }

    /// Protocol parameters.
    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// The local value store.
    pub fn store(&self) -> &StoreService {
        &self.inner.store
    }

    /// Supervisor for background tasks.
    pub fn supervisor(&self) -> &Arc<TaskSupervisor> {
        &self.inner.supervisor
    }

    /// Current counter values.
    pub fn stats(&self) -> DispatcherStats {
        let c = &self.inner.counters;
        DispatcherStats {
            requests_handled: c.requests_handled.load(Ordering::Relaxed),
            responses_delivered: c.responses_delivered.load(Ordering::Relaxed),
            unknown_responses: c.unknown_responses.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Number of requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    // -----------------------------------------------------------------------
    // Routing table access
    // -----------------------------------------------------------------------

    /// Up to `count` known contacts closest to `target`.
    pub async fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.inner.table.read().await.closest(target, count)
    }

    /// Number of contacts in the routing table.
    pub async fn table_len(&self) -> usize {
        self.inner.table.read().await.len()
    }

    /// Whether `id` is in the routing table.
    pub async fn contains(&self, id: &NodeId) -> bool {
        self.inner.table.read().await.contains(id)
    }

    /// Contacts in bucket `index`, least-recently-seen first.
    pub async fn bucket(&self, index: usize) -> Vec<Contact> {
        self.inner.table.read().await.bucket(index)
    }

    /// Offer a contact to the routing table. A full bucket starts a liveness
    /// probe of its least-recently-seen entry in the background.
    pub async fn learn(&self, contact: Contact) {
        let outcome = self.inner.table.write().await.insert(contact);
        match outcome {
            InsertOutcome::Inserted => debug!(peer = %contact.id, addr = %contact.addr, "Contact added"),
            InsertOutcome::Updated | InsertOutcome::Ignored => {}
            InsertOutcome::BucketFull {
                bucket,
                least_recently_seen,
            } => self.probe_for_eviction(bucket, least_recently_seen, contact),
        }
    }

    fn probe_for_eviction(&self, bucket: usize, stale: Contact, candidate: Contact) {
        if !lock(&self.inner.probing).insert(bucket) {
            trace!(bucket, peer = %candidate.id, "Probe already in flight, discarding contact");
            return;
        }
        let this = self.clone();
        self.inner.supervisor.spawn("liveness-probe", async move {
            let alive = matches!(this.ping(stale.addr).await, Ok(c) if c.id == stale.id);
            {
                let mut table = this.inner.table.write().await;
                if alive {
                    table.mark_seen(&stale.id);
                    debug!(bucket, peer = %candidate.id, "Least-recently-seen contact alive, discarding newcomer");
                } else if table.evict_and_insert(&stale.id, candidate) {
                    info!(bucket, evicted = %stale.id, inserted = %candidate.id, "Evicted unresponsive contact");
                }
            }
            lock(&this.inner.probing).remove(&bucket);
        });
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Send a REQUEST and wait for its RESPONSE under the configured timeout.
    pub async fn send_request(&self, addr: SocketAddr, request: Request) -> Result<Reply> {
        self.send_request_with_timeout(addr, request, self.inner.config.rpc_timeout)
            .await
    }

    /// Send a REQUEST and wait up to `timeout` for its RESPONSE.
    ///
    /// # Errors
    ///
    /// - [`DhtError::Timeout`] if nothing matching arrives in time.
    /// - [`DhtError::Transport`] if the request cannot be encoded or enqueued.
    /// - [`DhtError::Shutdown`] if the node stops while waiting.
    pub async fn send_request_with_timeout(
        &self,
        addr: SocketAddr,
        request: Request,
        timeout: Duration,
    ) -> Result<Reply> {
        let command = request.command().to_owned();
        let envelope = Envelope::request(self.inner.local, request);
        let rpc_id = envelope.rpc_id;
        let bytes = envelope.encode()?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(rpc_id, tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            rpc_id,
        };

        self.inner.sender.send(bytes, addr)?;
        trace!(%rpc_id, %addr, command = %command, "Request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DhtError::Shutdown),
            Err(_) => {
                self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(%rpc_id, %addr, command = %command, "Request timed out");
                Err(DhtError::Timeout { addr, timeout })
            }
        }
    }

    /// `PING` a peer. Returns the responder's contact.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Contact> {
        self.ping_with_timeout(addr, self.inner.config.rpc_timeout)
            .await
    }

    /// `PING` a peer, waiting up to `timeout`.
    pub async fn ping_with_timeout(&self, addr: SocketAddr, timeout: Duration) -> Result<Contact> {
        let seq_value = rand::random::<u64>();
        let reply = self
            .send_request_with_timeout(addr, Request::Ping(PingArgs { seq_value }), timeout)
            .await?;
        match reply.result {
            RpcResult::SeqValue(echo) if echo == seq_value => Ok(reply.from),
            RpcResult::SeqValue(echo) => Err(DhtError::UnexpectedResponse(format!(
                "PING echoed {echo}, expected {seq_value}"
            ))),
            other => Err(unexpected("PING", other)),
        }
    }

    /// `FIND_NODE` against a single peer.
    pub async fn find_node_at(&self, addr: SocketAddr, target: NodeId) -> Result<Vec<Contact>> {
        let reply = self.send_request(addr, Request::find_node(target)).await?;
        match reply.result {
            RpcResult::NodeList(contacts) => Ok(contacts),
            other => Err(unexpected("FIND_NODE", other)),
        }
    }

    /// `FIND_VALUE` against a single peer.
    pub async fn find_value_at(&self, addr: SocketAddr, key: NodeId) -> Result<FindValueReply> {
        let reply = self.send_request(addr, Request::find_value(key)).await?;
        match reply.result {
            RpcResult::Value(value) => Ok(FindValueReply::Value(value)),
            RpcResult::NodeList(contacts) => Ok(FindValueReply::Contacts(contacts)),
            other => Err(unexpected("FIND_VALUE", other)),
        }
    }

    /// `STORE` at a single peer. Returns the peer's `success_boolean`.
    pub async fn store_at(&self, addr: SocketAddr, key: NodeId, value: Vec<u8>) -> Result<bool> {
        let reply = self.send_request(addr, Request::store(key, value)).await?;
        match reply.result {
            RpcResult::SuccessBoolean(ok) => Ok(ok),
            other => Err(unexpected("STORE", other)),
        }
    }

    /// Fail every waiting request with [`DhtError::Shutdown`].
    pub fn fail_pending(&self) {
        let drained = std::mem::take(&mut *lock(&self.inner.pending));
        if !drained.is_empty() {
            debug!(count = drained.len(), "Abandoning pending requests");
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Start the inbound loop on the supervisor.
    pub fn spawn_inbound(&self, mut inbound: Inbound) {
        let this = self.clone();
        self.inner.supervisor.spawn("dispatcher-inbound", async move {
            debug!(local = %this.inner.local.id, "Dispatcher inbound loop started");
            while let Some(datagram) = inbound.recv().await {
                this.handle_datagram(datagram).await;
            }
            debug!(local = %this.inner.local.id, "Dispatcher inbound loop stopped");
        });
    }

    /// Process one inbound datagram.
    pub async fn handle_datagram(&self, datagram: Datagram) {
        let envelope = match Envelope::decode(&datagram.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.inner
                    .counters
                    .decode_failures
                    .fetch_add(1, Ordering::Relaxed);
                debug!(peer = %datagram.addr, error = %e, "Dropping undecodable datagram");
                return;
            }
        };

        let sender = envelope.node.with_addr(datagram.addr);
        match envelope.body {
            Body::Request(request) => {
                self.learn(sender).await;
                let result = self.handle_request(&sender, request).await;
                self.respond(envelope.rpc_id, result, datagram.addr);
            }
            Body::Response(result) => {
                // Learn first so a caller woken by the reply sees the responder.
                self.learn(sender).await;
                if let Err(e) = self.deliver(envelope.rpc_id, Reply { from: sender, result }) {
                    self.inner
                        .counters
                        .unknown_responses
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %datagram.addr, error = %e, "Dropping response");
                }
            }
        }
    }

    fn deliver(&self, rpc_id: RpcId, reply: Reply) -> Result<()> {
        let waiter = lock(&self.inner.pending).remove(&rpc_id);
        match waiter {
            Some(tx) => {
                // The waiter may have given up between removal and send.
                let _ = tx.send(reply);
                self.inner
                    .counters
                    .responses_delivered
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(DhtError::UnknownResponse { rpc_id }),
        }
    }

    async fn handle_request(&self, from: &Contact, request: Request) -> RpcResult {
        self.inner
            .counters
            .requests_handled
            .fetch_add(1, Ordering::Relaxed);
        trace!(peer = %from.id, command = %request.command(), "Handling request");
        let k = self.inner.config.k;
        match request {
            Request::Ping(args) => RpcResult::SeqValue(args.seq_value),
            Request::FindNode(args) => {
                RpcResult::NodeList(self.closest_excluding(&args.node_id, k, &from.id).await)
            }
            Request::FindValue(args) => {
                let table = self.inner.table.read().await;
                self.inner.store.handle_find_value(&args.value_id, || {
                    closest_excluding(&table, &args.value_id, k, &from.id)
                })
            }
            Request::Store(args) => self.inner.store.handle_store(args.value_id, args.data),
            Request::Unrecognized { command } => {
                warn!(peer = %from.id, command = %command, "Unrecognized command");
                RpcResult::Error(format!("unrecognized command: {command}"))
            }
        }
    }

    async fn closest_excluding(&self, target: &NodeId, count: usize, exclude: &NodeId) -> Vec<Contact> {
        let table = self.inner.table.read().await;
        closest_excluding(&table, target, count, exclude)
    }

    /// Enqueue the RESPONSE. A result that cannot fit in one datagram is
    /// replaced by an `error` result so the requester is not left waiting.
    fn respond(&self, rpc_id: RpcId, result: RpcResult, addr: SocketAddr) {
        let local = self.inner.local;
        let encoded = match Envelope::response(local, rpc_id, result).encode_trimmed() {
            Err(TransportError::PayloadTooLarge { size, max }) => {
                warn!(%rpc_id, peer = %addr, size, max, "Result too large, answering with error");
                let message = format!("result too large: {size} bytes exceeds {max}");
                Envelope::response(local, rpc_id, RpcResult::Error(message)).encode()
            }
            other => other,
        };
        let sent = encoded.and_then(|bytes| self.inner.sender.send(bytes, addr));
        if let Err(e) = sent {
            warn!(%rpc_id, peer = %addr, error = %e, "Failed to send response");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("local", &self.inner.local)
            .finish_non_exhaustive()
    }
}

/// The requester already knows itself.
fn closest_excluding(
    table: &RoutingTable,
    target: &NodeId,
    count: usize,
    exclude: &NodeId,
) -> Vec<Contact> {
    let mut contacts = table.closest(target, count + 1);
    contacts.retain(|c| c.id != *exclude);
    contacts.truncate(count);
    contacts
}

fn unexpected(command: &str, result: RpcResult) -> DhtError {
    match result {
        RpcResult::Error(message) => DhtError::Remote(message),
        other => DhtError::UnexpectedResponse(format!(
            "{command} answered with {}",
            other.result_type()
        )),
    }
}
