//! Kafka-style partitioned log.
//!
//! Every key belongs to exactly one node (see [`topology::owner`]). The
//! owner keeps the key's log and committed offset; any other node serves
//! requests for the key by forwarding a `*_rpc` call to the owner. Requests
//! that span several keys are split by owner, the remote parts issued
//! concurrently, and the partial results merged into one reply.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tracing::trace;

use crate::error::{DomainError, HandlerError, RpcError};
use crate::message::{Envelope, NodeId, Payload};
use crate::node::Node;
use crate::runtime::Workload;
use crate::topology;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);

pub type Offsets = BTreeMap<String, u64>;
pub type Messages = BTreeMap<String, Vec<(u64, i64)>>;

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub rpc_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct Logs {
    /// Entry `i` of a key's log has offset `i + 1`.
    entries: HashMap<String, Vec<i64>>,
    committed: HashMap<String, u64>,
}

/// Logs and committed offsets for the keys this node owns.
#[derive(Debug, Default)]
pub struct LogStore {
    inner: Mutex<Logs>,
}

impl LogStore {
    fn logs(&self) -> MutexGuard<'_, Logs> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `msg` and returns its offset. Offsets start at 1 and have no gaps.
    pub fn append(&self, key: &str, msg: i64) -> u64 {
        let mut logs = self.logs();
        let log = logs.entries.entry(key.to_string()).or_default();
        log.push(msg);
        log.len() as u64
    }

    /// Every entry at or after the requested offset, per key. Keys without
    /// a log are left out.
    pub fn poll(&self, offsets: &Offsets) -> Messages {
        let logs = self.logs();
        offsets
            .iter()
            .filter_map(|(key, from)| {
                let log = logs.entries.get(key)?;
                let skip = from.saturating_sub(1) as usize;
                let entries = log
                    .iter()
                    .enumerate()
                    .skip(skip)
                    .map(|(i, msg)| (i as u64 + 1, *msg))
                    .collect();
                Some((key.clone(), entries))
            })
            .collect()
    }

    /// Records committed offsets. The latest commit wins.
    pub fn commit(&self, offsets: &Offsets) {
        let mut logs = self.logs();
        for (key, offset) in offsets {
            logs.committed.insert(key.clone(), *offset);
        }
    }

    /// Committed offsets for those of `keys` that have one.
    pub fn committed<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> Offsets {
        let logs = self.logs();
        keys.into_iter()
            .filter_map(|key| Some((key.clone(), *logs.committed.get(key)?)))
            .collect()
    }
}

/// A multi-key request split by key owner.
#[derive(Debug)]
struct Partition<T> {
    local: BTreeMap<String, T>,
    remote: BTreeMap<NodeId, BTreeMap<String, T>>,
}

fn partition<T>(
    node: &Node,
    items: impl IntoIterator<Item = (String, T)>,
) -> Result<Partition<T>, HandlerError> {
    let identity = node.identity()?;
    let mut split = Partition {
        local: BTreeMap::new(),
        remote: BTreeMap::new(),
    };
    for (key, value) in items {
        let owner = topology::owner(&key, &identity.node_ids)?;
        if *owner == identity.id {
            split.local.insert(key, value);
        } else {
            split
                .remote
                .entry(owner.clone())
                .or_default()
                .insert(key, value);
        }
    }
    Ok(split)
}

/// Rejects forwarded requests for keys owned elsewhere.
fn ensure_owned<'a>(node: &Node, keys: impl IntoIterator<Item = &'a String>) -> Result<(), HandlerError> {
    let identity = node.identity()?;
    for key in keys {
        let owner = topology::owner(key, &identity.node_ids)?;
        if *owner != identity.id {
            return Err(DomainError::NotOwner {
                key: key.clone(),
                owner: owner.clone(),
            }
            .into());
        }
    }
    Ok(())
}

pub struct Kafka {
    config: KafkaConfig,
    store: LogStore,
}

impl Kafka {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            store: LogStore::default(),
        }
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    async fn send(&self, node: &Node, key: &str, msg: i64) -> Result<u64, HandlerError> {
        let owner = topology::owner(key, node.node_ids())?;
        if owner == node.id()? {
            let offset = self.store.append(key, msg);
            trace!(key, offset, "appended");
            return Ok(offset);
        }

        let forward = Payload::SendRpc {
            key: key.to_string(),
            msg,
        };
        match node.call(owner, forward, self.config.rpc_timeout).await? {
            Payload::SendRpcOk { offset } => Ok(offset),
            other => Err(RpcError::UnexpectedReply(other.kind()).into()),
        }
    }

    async fn poll(&self, node: &Node, offsets: &Offsets) -> Result<Messages, HandlerError> {
        let split = partition(node, offsets.clone())?;
        let mut msgs = self.store.poll(&split.local);

        let calls = split.remote.into_iter().map(|(owner, offsets)| async move {
            node.call(&owner, Payload::PollRpc { offsets }, self.config.rpc_timeout)
                .await
        });
        for reply in join_all(calls).await {
            match reply? {
                Payload::PollRpcOk { msgs: remote } => msgs.extend(remote),
                other => return Err(RpcError::UnexpectedReply(other.kind()).into()),
            }
        }
        Ok(msgs)
    }

    async fn commit(&self, node: &Node, offsets: &Offsets) -> Result<(), HandlerError> {
        let split = partition(node, offsets.clone())?;
        self.store.commit(&split.local);

        let calls = split.remote.into_iter().map(|(owner, offsets)| async move {
            node.call(
                &owner,
                Payload::CommitOffsetsRpc { offsets },
                self.config.rpc_timeout,
            )
            .await
        });
        for reply in join_all(calls).await {
            match reply? {
                Payload::CommitOffsetsRpcOk => {}
                other => return Err(RpcError::UnexpectedReply(other.kind()).into()),
            }
        }
        Ok(())
    }

    async fn list_committed(&self, node: &Node, keys: &[String]) -> Result<Offsets, HandlerError> {
        let split = partition(node, keys.iter().map(|key| (key.clone(), ())))?;
        let mut offsets = self.store.committed(split.local.keys());

        let calls = split.remote.into_iter().map(|(owner, keys)| async move {
            let keys = keys.into_keys().collect();
            node.call(
                &owner,
                Payload::ListCommittedOffsetsRpc { keys },
                self.config.rpc_timeout,
            )
            .await
        });
        for reply in join_all(calls).await {
            match reply? {
                Payload::ListCommittedOffsetsRpcOk { offsets: remote } => offsets.extend(remote),
                other => return Err(RpcError::UnexpectedReply(other.kind()).into()),
            }
        }
        Ok(offsets)
    }
}

impl Workload for Kafka {
    async fn handle(&self, node: &Arc<Node>, request: &Envelope) -> Result<(), HandlerError> {
        match &request.body.payload {
            Payload::Send { key, msg } => {
                let offset = self.send(node, key, *msg).await?;
                node.reply(request, Payload::SendOk { offset })
            }
            Payload::Poll { offsets } => {
                let msgs = self.poll(node, offsets).await?;
                node.reply(request, Payload::PollOk { msgs })
            }
            Payload::CommitOffsets { offsets } => {
                self.commit(node, offsets).await?;
                node.reply(request, Payload::CommitOffsetsOk)
            }
            Payload::ListCommittedOffsets { keys } => {
                let offsets = self.list_committed(node, keys).await?;
                node.reply(request, Payload::ListCommittedOffsetsOk { offsets })
            }

            Payload::SendRpc { key, msg } => {
                ensure_owned(node, [key])?;
                let offset = self.store.append(key, *msg);
                node.reply(request, Payload::SendRpcOk { offset })
            }
            Payload::PollRpc { offsets } => {
                ensure_owned(node, offsets.keys())?;
                let msgs = self.store.poll(offsets);
                node.reply(request, Payload::PollRpcOk { msgs })
            }
            Payload::CommitOffsetsRpc { offsets } => {
                ensure_owned(node, offsets.keys())?;
                self.store.commit(offsets);
                node.reply(request, Payload::CommitOffsetsRpcOk)
            }
            Payload::ListCommittedOffsetsRpc { keys } => {
                ensure_owned(node, keys)?;
                let offsets = self.store.committed(keys);
                node.reply(request, Payload::ListCommittedOffsetsRpcOk { offsets })
            }

            other => Err(DomainError::Unsupported(other.kind()).into()),
        }
    }
}
