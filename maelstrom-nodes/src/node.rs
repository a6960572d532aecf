//! Node identity and the primitives every workload builds on.
//!
//! A [`Node`] knows who it is (once `init` arrives), who else is in the
//! cluster, and how to talk to them:
//!
//! - [`Node::send`]: fire-and-forget, no `msg_id`.
//! - [`Node::reply`]: answers a request, copying its `msg_id` into `in_reply_to`.
//! - [`Node::call`]: a correlated request that waits for the reply or a deadline.
//!
//! The node is shared between all handler tasks behind an `Arc`; its own
//! state is either set once ([`Identity`]) or atomic (the message id counter).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::channel::Outbox;
use crate::error::{DomainError, ErrorCode, HandlerError, RpcError};
use crate::message::{Body, Envelope, NodeId, Payload};
use crate::rpc::Correlator;

/// Cluster membership as announced by `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: NodeId,
    pub node_ids: Vec<NodeId>,
}

impl Identity {
    /// Every member except this node, in `init` order.
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.node_ids.iter().filter(move |n| **n != self.id)
    }
}

pub struct Node {
    identity: OnceLock<Identity>,
    next_msg_id: AtomicU64,
    outbox: Outbox,
    calls: Correlator,
}

impl Node {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            identity: OnceLock::new(),
            next_msg_id: AtomicU64::new(1),
            outbox,
            calls: Correlator::new(),
        }
    }

    /// Records this node's identity. Returns `false` if it was already set,
    /// in which case the first `init` wins.
    pub fn init(&self, id: NodeId, node_ids: Vec<NodeId>) -> bool {
        self.identity.set(Identity { id, node_ids }).is_ok()
    }

    pub fn is_initialized(&self) -> bool {
        self.identity.get().is_some()
    }

    pub fn identity(&self) -> Result<&Identity, DomainError> {
        self.identity.get().ok_or(DomainError::NotInitialized)
    }

    pub fn id(&self) -> Result<&str, DomainError> {
        self.identity().map(|identity| identity.id.as_str())
    }

    /// Cluster membership, empty until `init`.
    pub fn node_ids(&self) -> &[NodeId] {
        self.identity
            .get()
            .map(|identity| identity.node_ids.as_slice())
            .unwrap_or_default()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.calls
    }

    fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push(&self, dest: &str, body: Body) -> Result<(), HandlerError> {
        let src = self.id()?.to_string();
        let envelope = Envelope {
            src,
            dest: dest.to_string(),
            body,
        };
        self.outbox.push(envelope)?;
        Ok(())
    }

    /// Sends `payload` to `dest` without expecting a reply.
    pub fn send(&self, dest: &str, payload: Payload) -> Result<(), HandlerError> {
        trace!(%dest, kind = payload.kind(), "send");
        self.push(dest, Body::new(payload))
    }

    /// Answers `request` with `payload`.
    ///
    /// Requests without a `msg_id` (peer forwards sent with [`Node::send`])
    /// expect no answer; the reply is skipped.
    pub fn reply(&self, request: &Envelope, payload: Payload) -> Result<(), HandlerError> {
        let Some(msg_id) = request.body.msg_id else {
            trace!(src = %request.src, kind = payload.kind(), "request has no msg_id; not replying");
            return Ok(());
        };
        let body = Body {
            msg_id: None,
            in_reply_to: Some(msg_id),
            payload,
        };
        self.push(&request.src, body)
    }

    /// Reports `err` back to the sender of `request` as an `error` body.
    pub fn reply_error(&self, request: &Envelope, err: &HandlerError) {
        let payload = Payload::Error {
            code: err.code().code(),
            text: Some(err.to_string()),
        };
        if let Err(send_err) = self.reply(request, payload) {
            warn!(src = %request.src, error = %send_err, "could not report error to requester");
        }
    }

    /// Sends an error body for a request that never decoded into an envelope.
    pub fn reply_error_to(&self, dest: &str, msg_id: u64, code: ErrorCode, text: String) {
        let body = Body {
            msg_id: None,
            in_reply_to: Some(msg_id),
            payload: Payload::Error {
                code: code.code(),
                text: Some(text),
            },
        };
        if let Err(err) = self.push(dest, body) {
            warn!(%dest, error = %err, "could not report error to requester");
        }
    }

    /// Issues a correlated request to `dest` and waits up to `timeout` for
    /// the reply.
    ///
    /// An `error` reply resolves to [`RpcError::Remote`]. On timeout the
    /// pending entry is removed, so a late reply is ignored. The call is
    /// never retried here; callers that want retries call again and get a
    /// fresh message id.
    pub async fn call(
        &self,
        dest: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload, HandlerError> {
        let msg_id = self.next_msg_id();
        let rx = self.calls.register(msg_id);
        let body = Body {
            msg_id: Some(msg_id),
            in_reply_to: None,
            payload,
        };

        if let Err(err) = self.push(dest, body) {
            self.calls.cancel(msg_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => match reply.payload {
                Payload::Error { code, text } => Err(RpcError::Remote { code, text }.into()),
                payload => Ok(payload),
            },
            Ok(Err(_)) => Err(RpcError::Closed.into()),
            Err(_) => {
                let waited = self.calls.cancel(msg_id);
                debug!(%dest, msg_id, ?waited, "rpc timed out");
                Err(RpcError::Timeout {
                    dest: dest.to_string(),
                    msg_id,
                }
                .into())
            }
        }
    }

    /// Routes a reply to its pending call. Hands the envelope back when no
    /// call is waiting for it.
    pub fn resolve(&self, envelope: Envelope) -> Result<(), Envelope> {
        let Some(in_reply_to) = envelope.body.in_reply_to else {
            return Err(envelope);
        };
        let Envelope { src, dest, body } = envelope;
        self.calls
            .resolve(in_reply_to, body)
            .map_err(|body| Envelope { src, dest, body })
    }
}
