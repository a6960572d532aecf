//! Grow-only counter replicated as a version vector.
//!
//! Each node owns one `(version, value)` entry and is the only writer of it.
//! Peers learn entries through periodic gossip of the whole map and keep,
//! per node, whichever entry has the higher version. The counter's value is
//! the sum over all entries.
//!
//! Two entries for the same node with equal versions but different values
//! cannot arise from a single owner; if they did, the local one would be
//! kept and the other lost.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::error::{DomainError, HandlerError};
use crate::message::{Envelope, NodeId, Payload, VersionedValue};
use crate::node::Node;
use crate::runtime::Workload;

const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(500);

pub type Counters = BTreeMap<NodeId, VersionedValue>;

#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub gossip_interval: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
        }
    }
}

/// Folds `incoming` into `local`, keeping the higher version per node.
/// Returns how many entries changed.
pub fn merge(local: &mut Counters, incoming: &Counters) -> usize {
    let mut changed = 0;
    for (owner, theirs) in incoming {
        let newer = local
            .get(owner)
            .map_or(true, |ours| theirs.version > ours.version);
        if newer {
            local.insert(owner.clone(), *theirs);
            changed += 1;
        }
    }
    changed
}

pub struct Counter {
    config: CounterConfig,
    counters: Mutex<Counters>,
}

impl Counter {
    pub fn new(config: CounterConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters::new()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `delta` to this node's own entry. An overflowing delta is
    /// refused and leaves the entry untouched.
    pub fn add(&self, owner: &str, delta: i64) -> Result<VersionedValue, DomainError> {
        let mut counters = self.counters();
        let entry = counters.entry(owner.to_string()).or_default();
        let overflow = || DomainError::CounterOverflow {
            owner: owner.to_string(),
            delta,
        };
        let value = entry.value.checked_add(delta).ok_or_else(overflow)?;
        let version = entry.version.checked_add(1).ok_or_else(overflow)?;
        *entry = VersionedValue { version, value };
        Ok(*entry)
    }

    /// Sum over every known entry, saturating at the `i64` bounds.
    pub fn value(&self) -> i64 {
        self.counters()
            .values()
            .fold(0i64, |total, entry| total.saturating_add(entry.value))
    }

    pub fn entry(&self, owner: &str) -> Option<VersionedValue> {
        self.counters().get(owner).copied()
    }

    pub fn snapshot(&self) -> Counters {
        self.counters().clone()
    }

    pub fn merge(&self, incoming: &Counters) -> usize {
        merge(&mut self.counters(), incoming)
    }
}

impl Workload for Counter {
    async fn handle(&self, node: &Arc<Node>, request: &Envelope) -> Result<(), HandlerError> {
        match &request.body.payload {
            Payload::Add { delta } => {
                let entry = self.add(node.id()?, *delta)?;
                trace!(delta, version = entry.version, "added");
                node.reply(request, Payload::AddOk)
            }
            Payload::Read => node.reply(
                request,
                Payload::ReadOk {
                    messages: None,
                    value: Some(self.value()),
                },
            ),
            Payload::Gossip {
                counters: Some(incoming),
                ..
            } => {
                let changed = self.merge(incoming);
                trace!(src = %request.src, changed, "merged gossip");
                Ok(())
            }
            other => Err(DomainError::Unsupported(other.kind()).into()),
        }
    }

    fn gossip_interval(&self) -> Option<Duration> {
        Some(self.config.gossip_interval)
    }

    fn gossip(&self, node: &Node) -> Result<(), HandlerError> {
        let counters = self.snapshot();
        if counters.is_empty() {
            return Ok(());
        }
        for peer in node.identity()?.peers() {
            node.send(
                peer,
                Payload::Gossip {
                    messages: None,
                    counters: Some(counters.clone()),
                },
            )?;
        }
        Ok(())
    }
}
