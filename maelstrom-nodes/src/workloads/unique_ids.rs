use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{DomainError, HandlerError};
use crate::message::{Envelope, Payload};
use crate::node::Node;
use crate::runtime::Workload;

/// Hands out `"<node>-<seq>"` ids. Node ids are unique in the cluster and
/// the sequence never repeats within a node, so no coordination is needed.
#[derive(Debug, Default)]
pub struct UniqueIds {
    next: AtomicU64,
}

impl UniqueIds {
    fn generate(&self, node: &Node) -> Result<String, HandlerError> {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(format!("{}-{seq}", node.id()?))
    }
}

impl Workload for UniqueIds {
    async fn handle(&self, node: &Arc<Node>, request: &Envelope) -> Result<(), HandlerError> {
        match &request.body.payload {
            Payload::Generate => {
                let id = self.generate(node)?;
                node.reply(request, Payload::GenerateOk { id })
            }
            other => Err(DomainError::Unsupported(other.kind()).into()),
        }
    }
}
