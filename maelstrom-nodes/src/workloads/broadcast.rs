//! Broadcast: every value any node receives must eventually be seen by all.
//!
//! The engine keeps one grow-only `seen` set and disseminates it according
//! to a [`DeliveryPolicy`]:
//!
//! | policy         | when values move                 | acknowledged |
//! |----------------|----------------------------------|--------------|
//! | `Flood`        | on first receipt                 | no           |
//! | `Gossip`       | every tick, whole set            | no           |
//! | `AntiEntropy`  | every tick, what peers lack      | no           |
//! | `Acknowledged` | on first receipt, until acked    | yes          |
//!
//! Neighbors come from a [`TopologyStrategy`]. Clients always get their
//! `broadcast_ok` before any propagation happens.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::error::{DomainError, HandlerError};
use crate::message::{Envelope, NodeId, Payload};
use crate::node::Node;
use crate::runtime::Workload;
use crate::topology::{Announced, TopologyStrategy};

const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_FULL_SYNC_EVERY: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Forward each new value to every neighbor once, without waiting.
    Flood,
    /// Periodically send the whole `seen` set to every neighbor.
    Gossip,
    /// Periodically send each neighbor only what it is believed to lack,
    /// with a full send every `full_sync_every` rounds to repair losses.
    AntiEntropy { full_sync_every: u64 },
    /// Forward each new value as a correlated call and retry each neighbor
    /// until it acknowledges.
    Acknowledged { timeout: Duration, backoff: Duration },
}

impl DeliveryPolicy {
    pub fn anti_entropy() -> Self {
        DeliveryPolicy::AntiEntropy {
            full_sync_every: DEFAULT_FULL_SYNC_EVERY,
        }
    }

    pub fn acknowledged() -> Self {
        DeliveryPolicy::Acknowledged {
            timeout: DEFAULT_RPC_TIMEOUT,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    fn is_periodic(&self) -> bool {
        matches!(
            self,
            DeliveryPolicy::Gossip | DeliveryPolicy::AntiEntropy { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub delivery: DeliveryPolicy,
    pub topology: TopologyStrategy,
    pub gossip_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryPolicy::Gossip,
            topology: TopologyStrategy::Harness,
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    seen: BTreeSet<i64>,
    announced: Option<Announced>,
    /// Values each peer is believed to hold. Only used by anti-entropy.
    known: HashMap<NodeId, BTreeSet<i64>>,
    rounds: u64,
}

/// Neighbors each value is still waiting on an ack from.
type InFlight = Arc<Mutex<BTreeMap<i64, BTreeSet<NodeId>>>>;

pub struct BroadcastEngine {
    config: BroadcastConfig,
    state: Mutex<State>,
    in_flight: InFlight,
}

impl BroadcastEngine {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            in_flight: InFlight::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every value this node has seen.
    pub fn seen(&self) -> BTreeSet<i64> {
        self.state().seen.clone()
    }

    /// Values still being pushed to neighbors that have not acknowledged.
    pub fn in_flight(&self) -> BTreeMap<i64, BTreeSet<NodeId>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// This node's current neighbors.
    pub fn neighbors(&self, node: &Node) -> Result<Vec<NodeId>, HandlerError> {
        let identity = node.identity()?;
        let state = self.state();
        Ok(self
            .config
            .topology
            .neighbors(&identity.id, &identity.node_ids, state.announced.as_ref()))
    }

    fn handle_topology(&self, announced: &Announced) {
        let mut state = self.state();
        if state.announced.is_some() {
            debug!("topology already set; ignoring");
            return;
        }
        state.announced = Some(announced.clone());
    }

    fn handle_broadcast(
        &self,
        node: &Arc<Node>,
        request: &Envelope,
        message: i64,
    ) -> Result<(), HandlerError> {
        let fresh = self.state().seen.insert(message);
        node.reply(request, Payload::BroadcastOk)?;
        if !fresh {
            trace!(message, "already seen");
            return Ok(());
        }

        let targets: Vec<NodeId> = self
            .neighbors(node)?
            .into_iter()
            .filter(|n| *n != request.src)
            .collect();

        match self.config.delivery {
            DeliveryPolicy::Flood => {
                for neighbor in &targets {
                    node.send(neighbor, Payload::Broadcast { message })?;
                }
            }
            DeliveryPolicy::Acknowledged { timeout, backoff } => {
                self.replicate(node, message, targets, timeout, backoff);
            }
            DeliveryPolicy::Gossip | DeliveryPolicy::AntiEntropy { .. } => {}
        }
        Ok(())
    }

    /// Pushes `message` to every target on a background task, retrying each
    /// target independently until it acknowledges.
    fn replicate(
        &self,
        node: &Arc<Node>,
        message: i64,
        targets: Vec<NodeId>,
        timeout: Duration,
        backoff: Duration,
    ) {
        if targets.is_empty() {
            return;
        }
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(message)
            .or_default()
            .extend(targets.iter().cloned());

        let node = Arc::clone(node);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let deliveries = targets.iter().map(|dest| {
                deliver_until_acked(&node, &in_flight, dest, message, timeout, backoff)
            });
            join_all(deliveries).await;
            debug!(message, "all neighbors acknowledged");
        });
    }

    /// Merges an incoming set and returns what the sender appears to lack.
    fn handle_gossip(&self, src: &str, incoming: &BTreeSet<i64>) -> BTreeSet<i64> {
        let anti_entropy = matches!(self.config.delivery, DeliveryPolicy::AntiEntropy { .. });
        let mut state = self.state();
        let State { seen, known, .. } = &mut *state;

        let missing: BTreeSet<i64> = seen.difference(incoming).copied().collect();
        seen.extend(incoming.iter().copied());
        if !anti_entropy {
            return missing;
        }

        let peer = known.entry(src.to_string()).or_default();
        peer.extend(incoming.iter().copied());
        let missing: BTreeSet<i64> = missing.difference(peer).copied().collect();
        peer.extend(missing.iter().copied());
        missing
    }

    fn handle_gossip_ok(&self, src: &str, messages: &BTreeSet<i64>) {
        let mut state = self.state();
        state.seen.extend(messages.iter().copied());
        if matches!(self.config.delivery, DeliveryPolicy::AntiEntropy { .. }) {
            state
                .known
                .entry(src.to_string())
                .or_default()
                .extend(messages.iter().copied());
        }
    }

    /// Builds this round's outgoing gossip, one set per neighbor.
    fn gossip_round(&self, neighbors: &[NodeId]) -> Vec<(NodeId, BTreeSet<i64>)> {
        let mut state = self.state();
        if state.seen.is_empty() {
            return Vec::new();
        }

        match self.config.delivery {
            DeliveryPolicy::Gossip => neighbors
                .iter()
                .map(|n| (n.clone(), state.seen.clone()))
                .collect(),
            DeliveryPolicy::AntiEntropy { full_sync_every } => {
                state.rounds += 1;
                let full = full_sync_every > 0 && state.rounds % full_sync_every == 0;
                let State { seen, known, .. } = &mut *state;

                let mut outgoing = Vec::new();
                for neighbor in neighbors {
                    let peer = known.entry(neighbor.clone()).or_default();
                    let delta: BTreeSet<i64> = if full {
                        seen.clone()
                    } else {
                        seen.difference(peer).copied().collect()
                    };
                    if delta.is_empty() {
                        continue;
                    }
                    peer.extend(delta.iter().copied());
                    outgoing.push((neighbor.clone(), delta));
                }
                outgoing
            }
            DeliveryPolicy::Flood | DeliveryPolicy::Acknowledged { .. } => Vec::new(),
        }
    }
}

async fn deliver_until_acked(
    node: &Node,
    in_flight: &InFlight,
    dest: &str,
    message: i64,
    timeout: Duration,
    backoff: Duration,
) {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match node.call(dest, Payload::Broadcast { message }, timeout).await {
            Ok(Payload::BroadcastOk) => break,
            Ok(other) => {
                warn!(%dest, kind = other.kind(), "unexpected reply to broadcast; treating as ack");
                break;
            }
            Err(err @ (HandlerError::Closed | HandlerError::Domain(_))) => {
                warn!(%dest, message, error = %err, "giving up on neighbor");
                break;
            }
            Err(err) => {
                debug!(%dest, message, attempt, error = %err, "broadcast not acknowledged; retrying");
                let max_jitter = (backoff.as_millis() / 2) as u64;
                let jitter = rand::thread_rng().gen_range(0..=max_jitter);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
            }
        }
    }

    let mut pending = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(waiting) = pending.get_mut(&message) {
        waiting.remove(dest);
        if waiting.is_empty() {
            pending.remove(&message);
        }
    }
}

impl Workload for BroadcastEngine {
    async fn handle(&self, node: &Arc<Node>, request: &Envelope) -> Result<(), HandlerError> {
        match &request.body.payload {
            Payload::Topology { topology } => {
                self.handle_topology(topology);
                node.reply(request, Payload::TopologyOk)
            }
            Payload::Broadcast { message } => self.handle_broadcast(node, request, *message),
            Payload::Read => node.reply(
                request,
                Payload::ReadOk {
                    messages: Some(self.seen()),
                    value: None,
                },
            ),
            Payload::Gossip {
                messages: Some(incoming),
                ..
            } => {
                let missing = self.handle_gossip(&request.src, incoming);
                if missing.is_empty() {
                    return Ok(());
                }
                node.send(&request.src, Payload::GossipOk { messages: missing })
            }
            Payload::GossipOk { messages } => {
                self.handle_gossip_ok(&request.src, messages);
                Ok(())
            }
            other => Err(DomainError::Unsupported(other.kind()).into()),
        }
    }

    fn gossip_interval(&self) -> Option<Duration> {
        self.config
            .delivery
            .is_periodic()
            .then_some(self.config.gossip_interval)
    }

    fn gossip(&self, node: &Node) -> Result<(), HandlerError> {
        let neighbors = self.neighbors(node)?;
        for (neighbor, messages) in self.gossip_round(&neighbors) {
            node.send(
                &neighbor,
                Payload::Gossip {
                    messages: Some(messages),
                    counters: None,
                },
            )?;
        }
        Ok(())
    }
}
