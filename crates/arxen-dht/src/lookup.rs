//! Iterative concurrent Kademlia lookups.
//!
//! A lookup keeps a shortlist of the `k` contacts closest to the target
//! seen so far. Each round probes up to `alpha` of them that have not been
//! queried yet, concurrently, and merges whatever they return. The lookup
//! ends when:
//!
//! | Phase | Condition |
//! |---|---|
//! | [`LookupPhase::Converged`] | a round found nothing closer than the previous best, or a value was found |
//! | [`LookupPhase::Exhausted`] | no unqueried contact is left, or the round limit was hit |
//! | [`LookupPhase::TimedOut`] | the overall lookup deadline passed |
//! | [`LookupPhase::Cancelled`] | the caller's [`CancelToken`] fired |
//!
//! Contacts that fail to answer are dropped from the shortlist and never
//! retried within the same lookup. Probes still in flight when a lookup
//! stops are detached; their replies are discarded.

use std::collections::HashSet;
use std::time::Duration;

use arxen_transport::messages::{Request, RpcResult};
use arxen_types::{Contact, Distance, NodeId};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, Reply};
use crate::DhtConfig;

/// Where a lookup is in its life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupPhase {
    Init,
    Probing,
    Converged,
    Exhausted,
    TimedOut,
    Cancelled,
}

impl LookupPhase {
    /// Whether the lookup has stopped.
    pub fn is_terminal(self) -> bool {
        !matches!(self, LookupPhase::Init | LookupPhase::Probing)
    }
}

/// Summary of a finished lookup.
#[derive(Clone, Debug)]
pub struct LookupReport {
    pub target: NodeId,
    pub phase: LookupPhase,
    /// Up to `k` responsive or not-yet-queried contacts, nearest first.
    pub closest: Vec<Contact>,
    pub rounds: usize,
    /// Probes issued.
    pub queried: usize,
    pub elapsed: Duration,
}

impl LookupReport {
    /// Whether `id` is among the contacts the lookup ended with.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.closest.iter().any(|c| c.id == *id)
    }
}

/// Result of a `FIND_VALUE` lookup.
#[derive(Clone, Debug)]
pub enum FindValueOutcome {
    Found {
        value: Vec<u8>,
        /// The contact that returned the value.
        holder: Contact,
        rounds: usize,
    },
    NotFound(LookupReport),
}

impl FindValueOutcome {
    /// The found value, if any.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            FindValueOutcome::Found { value, .. } => Some(value),
            FindValueOutcome::NotFound(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancels the lookups holding its tokens.
#[derive(Debug)]
pub struct LookupCanceller {
    tx: watch::Sender<bool>,
}

/// Observed by a lookup between and during rounds.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl LookupCanceller {
    /// A canceller that has not fired.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A token observing this canceller.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire every token handed out.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for LookupCanceller {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether the canceller has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Pending forever if the canceller is dropped
    /// without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shortlist
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct Candidate {
    contact: Contact,
    distance: Distance,
}

/// The `k` closest contacts seen by one lookup.
#[derive(Debug)]
struct Shortlist {
    target: NodeId,
    local_id: NodeId,
    k: usize,
    entries: Vec<Candidate>,
    /// Every contact probed so far, including ones since truncated away.
    queried: HashSet<NodeId>,
    failed: HashSet<NodeId>,
}

impl Shortlist {
    fn new(target: NodeId, local_id: NodeId, k: usize) -> Self {
        Self {
            target,
            local_id,
            k: k.max(1),
            entries: Vec::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    /// Add contacts not already present, keeping the `k` nearest.
    fn merge(&mut self, contacts: impl IntoIterator<Item = Contact>) {
        for contact in contacts {
            if contact.id == self.local_id
                || self.failed.contains(&contact.id)
                || self.entries.iter().any(|c| c.contact.id == contact.id)
            {
                continue;
            }
            self.entries.push(Candidate {
                distance: contact.id.distance(&self.target),
                contact,
            });
        }
        self.entries.sort_by(|a, b| a.distance.cmp(&b.distance));
        self.entries.truncate(self.k);
    }

    /// Up to `alpha` nearest unqueried contacts, marked queried.
    fn next_batch(&mut self, alpha: usize) -> Vec<Contact> {
        let batch: Vec<Contact> = self
            .entries
            .iter()
            .filter(|c| !self.queried.contains(&c.contact.id))
            .take(alpha)
            .map(|c| c.contact)
            .collect();
        self.queried.extend(batch.iter().map(|c| c.id));
        batch
    }

    /// Drop a contact that failed to answer.
    fn fail(&mut self, id: &NodeId) {
        self.failed.insert(*id);
        self.entries.retain(|c| c.contact.id != *id);
    }

    fn best(&self) -> Option<Distance> {
        self.entries.first().map(|c| c.distance)
    }

    fn has_unqueried(&self) -> bool {
        self.entries.iter().any(|c| !self.queried.contains(&c.contact.id))
    }

    fn contacts(&self) -> Vec<Contact> {
        self.entries.iter().map(|c| c.contact).collect()
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LookupKind {
    FindNode,
    FindValue,
}

struct Outcome {
    report: LookupReport,
    found: Option<(Vec<u8>, Contact)>,
    /// Responders that answered `FIND_VALUE` with contacts.
    lacking: Vec<Contact>,
}

/// Runs iterative lookups over a [`Dispatcher`].
#[derive(Clone, Debug)]
pub struct LookupCoordinator {
    dispatcher: Dispatcher,
    config: DhtConfig,
}

impl LookupCoordinator {
    /// Lookups over `dispatcher` with its configuration.
    pub fn new(dispatcher: Dispatcher) -> Self {
        let config = dispatcher.config().clone();
        Self { dispatcher, config }
    }

    /// The dispatcher probes go through.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Locate the `k` contacts closest to `target`.
    pub async fn find_node(&self, target: NodeId, cancel: CancelToken) -> LookupReport {
        let outcome = self.run(target, LookupKind::FindNode, cancel).await;
        outcome.report
    }

    /// Locate the value stored under `key`, stopping at the first holder.
    ///
    /// With `cache_found_values` set, a found value is also stored at the
    /// closest responder that answered without it.
    pub async fn find_value(&self, key: NodeId, cancel: CancelToken) -> FindValueOutcome {
        let outcome = self.run(key, LookupKind::FindValue, cancel).await;
        match outcome.found {
            Some((value, holder)) => {
                if self.config.cache_found_values {
                    self.cache_at_closest(key, &value, outcome.lacking);
                }
                FindValueOutcome::Found {
                    value,
                    holder,
                    rounds: outcome.report.rounds,
                }
            }
            None => FindValueOutcome::NotFound(outcome.report),
        }
    }

    fn cache_at_closest(&self, key: NodeId, value: &[u8], mut lacking: Vec<Contact>) {
        lacking.sort_by_key(|c| c.id.distance(&key));
        let Some(target) = lacking.first().copied() else {
            return;
        };
        let dispatcher = self.dispatcher.clone();
        let value = value.to_vec();
        self.dispatcher.supervisor().spawn("cache-value", async move {
            match dispatcher.store_at(target.addr, key, value).await {
                Ok(stored) => debug!(key = %key, peer = %target.id, stored, "Cached found value"),
                Err(e) => debug!(key = %key, peer = %target.id, error = %e, "Caching found value failed"),
            }
        });
    }

    async fn run(&self, target: NodeId, kind: LookupKind, mut cancel: CancelToken) -> Outcome {
        let started = Instant::now();
        let deadline = started + self.config.lookup_timeout;
        let local_id = self.dispatcher.local().id;

        let mut shortlist = Shortlist::new(target, local_id, self.config.k);
        shortlist.merge(self.dispatcher.closest(&target, self.config.alpha).await);

        let mut phase = LookupPhase::Init;
        let mut rounds = 0;
        let mut queried = 0;
        let mut found = None;
        let mut lacking = Vec::new();

        'rounds: while !phase.is_terminal() {
            if cancel.is_cancelled() {
                phase = LookupPhase::Cancelled;
                break;
            }
            if Instant::now() >= deadline {
                phase = LookupPhase::TimedOut;
                break;
            }
            if rounds >= self.config.max_rounds || !shortlist.has_unqueried() {
                phase = LookupPhase::Exhausted;
                break;
            }

            phase = LookupPhase::Probing;
            rounds += 1;
            let best_before = shortlist.best();
            let batch = shortlist.next_batch(self.config.alpha);
            queried += batch.len();
            debug!(target = %target, round = rounds, probes = batch.len(), "Lookup round started");

            let mut probes = JoinSet::new();
            for contact in batch {
                let dispatcher = self.dispatcher.clone();
                let request = match kind {
                    LookupKind::FindNode => Request::find_node(target),
                    LookupKind::FindValue => Request::find_value(target),
                };
                probes.spawn(async move {
                    let result = dispatcher.send_request(contact.addr, request).await;
                    (contact, result)
                });
            }

            loop {
                let joined = tokio::select! {
                    joined = probes.join_next() => joined,
                    _ = cancel.cancelled() => {
                        probes.detach_all();
                        phase = LookupPhase::Cancelled;
                        break 'rounds;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        probes.detach_all();
                        phase = LookupPhase::TimedOut;
                        break 'rounds;
                    }
                };
                let (contact, result) = match joined {
                    None => break,
                    Some(Ok(settled)) => settled,
                    Some(Err(e)) => {
                        warn!(target = %target, error = %e, "Lookup probe task failed");
                        continue;
                    }
                };
                match result {
                    Ok(reply) => {
                        if let Some(value) = self.absorb(kind, &mut shortlist, &mut lacking, contact, reply).await {
                            found = Some(value);
                            probes.detach_all();
                            phase = LookupPhase::Converged;
                            break 'rounds;
                        }
                    }
                    Err(e) => {
                        debug!(target = %target, peer = %contact.id, error = %e, "Lookup probe failed");
                        shortlist.fail(&contact.id);
                    }
                }
            }

            let improved = match (best_before, shortlist.best()) {
                (Some(before), Some(after)) => after < before,
                (None, Some(_)) => true,
                _ => false,
            };
            if !improved && shortlist.best().is_some() {
                phase = LookupPhase::Converged;
            }
        }

        let report = LookupReport {
            target,
            phase,
            closest: shortlist.contacts(),
            rounds,
            queried,
            elapsed: started.elapsed(),
        };
        info!(
            target = %target,
            phase = ?report.phase,
            rounds = report.rounds,
            queried = report.queried,
            found = report.closest.len(),
            "Lookup finished"
        );
        Outcome {
            report,
            found,
            lacking,
        }
    }

    /// Fold one reply into the shortlist. Returns the value if `reply`
    /// carries one for a `FIND_VALUE` lookup.
    async fn absorb(
        &self,
        kind: LookupKind,
        shortlist: &mut Shortlist,
        lacking: &mut Vec<Contact>,
        contact: Contact,
        reply: Reply,
    ) -> Option<(Vec<u8>, Contact)> {
        self.dispatcher.learn(reply.from).await;
        match reply.result {
            RpcResult::NodeList(contacts) => {
                if kind == LookupKind::FindValue {
                    lacking.push(reply.from);
                }
                shortlist.merge(contacts);
                None
            }
            RpcResult::Value(value) if kind == LookupKind::FindValue => Some((value, reply.from)),
            other => {
                debug!(peer = %contact.id, result = other.result_type(), "Ignoring unexpected lookup reply");
                None
            }
        }
    }
}
