//! Transactional key/value store with write replication.
//!
//! A transaction is a list of reads and writes applied in order under one
//! lock, so it observes its own writes and no other transaction's partial
//! effects. With replication on, the writes of a transaction are first
//! sent to the replica (this node's successor in the membership ring) as a
//! `txn_rpc`; only after the replica acknowledges are they applied locally
//! and the client answered. If replication fails the local store is left
//! as it was.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{DomainError, HandlerError, RpcError};
use crate::message::{Envelope, OpKind, Payload, TxnOp};
use crate::node::Node;
use crate::runtime::Workload;
use crate::topology;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TxnConfig {
    pub replicate: bool,
    pub rpc_timeout: Duration,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            replicate: true,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

/// Key/value map where a key may be present with a null value.
#[derive(Debug, Default)]
pub struct KvStore {
    data: Mutex<HashMap<u64, Option<i64>>>,
}

impl KvStore {
    fn data(&self) -> MutexGuard<'_, HashMap<u64, Option<i64>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `txn` atomically, returning each op with the value it read or wrote.
    pub fn apply(&self, txn: &[TxnOp]) -> Vec<TxnOp> {
        let mut data = self.data();
        txn.iter()
            .map(|op| match op.kind {
                OpKind::Read => TxnOp::read_value(op.key, data.get(&op.key).copied().flatten()),
                OpKind::Write => {
                    data.insert(op.key, op.value);
                    *op
                }
            })
            .collect()
    }

    /// `None` if the key was never written, `Some(None)` if it holds null.
    pub fn get(&self, key: u64) -> Option<Option<i64>> {
        self.data().get(&key).copied()
    }
}

pub struct Txn {
    config: TxnConfig,
    store: KvStore,
}

impl Txn {
    pub fn new(config: TxnConfig) -> Self {
        Self {
            config,
            store: KvStore::default(),
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Ships the writes of `txn` to the replica and waits for its ack.
    async fn replicate(&self, node: &Node, txn: &[TxnOp]) -> Result<(), HandlerError> {
        if !self.config.replicate {
            return Ok(());
        }
        let writes: Vec<TxnOp> = txn.iter().filter(|op| op.is_write()).copied().collect();
        if writes.is_empty() {
            return Ok(());
        }
        let identity = node.identity()?;
        let Some(replica) = topology::successor(&identity.id, &identity.node_ids) else {
            if identity.node_ids.len() > 1 {
                return Err(DomainError::NoReplica.into());
            }
            trace!("single node; applying locally only");
            return Ok(());
        };

        debug!(%replica, writes = writes.len(), "replicating");
        match node
            .call(&replica, Payload::TxnRpc { txn: writes }, self.config.rpc_timeout)
            .await?
        {
            Payload::TxnRpcOk { .. } => Ok(()),
            other => Err(RpcError::UnexpectedReply(other.kind()).into()),
        }
    }
}

impl Workload for Txn {
    async fn handle(&self, node: &Arc<Node>, request: &Envelope) -> Result<(), HandlerError> {
        match &request.body.payload {
            Payload::Txn { txn } => {
                self.replicate(node, txn).await?;
                let txn = self.store.apply(txn);
                node.reply(request, Payload::TxnOk { txn })
            }
            Payload::TxnRpc { txn } => {
                let txn = self.store.apply(txn);
                node.reply(request, Payload::TxnRpcOk { txn })
            }
            other => Err(DomainError::Unsupported(other.kind()).into()),
        }
    }
}
