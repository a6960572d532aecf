//! Error taxonomy shared by the codec, the RPC correlator and the workloads.
//!
//! Three families exist, matching how far a failure reaches:
//!
//! - [`DecodeError`]: a line that is not a message we understand. The
//!   dispatch loop logs it and moves on.
//! - [`RpcError`]: an outbound call that did not produce a usable reply.
//! - [`DomainError`]: a request that violates a protocol or configuration
//!   invariant (bad key, wrong owner, node not initialized yet).
//!
//! A handler returns [`HandlerError`], which folds the last two together and
//! knows which Maelstrom [`ErrorCode`] to report back to the requester.

use thiserror::Error;

use crate::channel::OutboxClosed;
use crate::message::NodeId;

/// Numeric error codes understood by the Maelstrom harness.
///
/// Codes below 1000 are reserved by Maelstrom; definite errors (the
/// operation certainly did not happen) and indefinite ones (it may have)
/// are distinguished by the harness from the code alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    NodeNotFound,
    NotSupported,
    TemporarilyUnavailable,
    MalformedRequest,
    Crash,
    Abort,
    KeyDoesNotExist,
    KeyAlreadyExists,
    PreconditionFailed,
    TxnConflict,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::Timeout => 0,
            ErrorCode::NodeNotFound => 1,
            ErrorCode::NotSupported => 10,
            ErrorCode::TemporarilyUnavailable => 11,
            ErrorCode::MalformedRequest => 12,
            ErrorCode::Crash => 13,
            ErrorCode::Abort => 14,
            ErrorCode::KeyDoesNotExist => 20,
            ErrorCode::KeyAlreadyExists => 21,
            ErrorCode::PreconditionFailed => 22,
            ErrorCode::TxnConflict => 30,
        }
    }

    /// Maps a wire code back to a known variant. Unknown codes are treated
    /// as crashes, which Maelstrom also considers indefinite.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => ErrorCode::Timeout,
            1 => ErrorCode::NodeNotFound,
            10 => ErrorCode::NotSupported,
            11 => ErrorCode::TemporarilyUnavailable,
            12 => ErrorCode::MalformedRequest,
            14 => ErrorCode::Abort,
            20 => ErrorCode::KeyDoesNotExist,
            21 => ErrorCode::KeyAlreadyExists,
            22 => ErrorCode::PreconditionFailed,
            30 => ErrorCode::TxnConflict,
            _ => ErrorCode::Crash,
        }
    }
}

/// A line from the input channel that could not be turned into an envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message body has no `type` field")]
    MissingType,

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("invalid `{kind}` body: {source}")]
    InvalidBody {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// The code to send back when the offending request can still be answered.
    pub fn code(&self) -> ErrorCode {
        match self {
            DecodeError::UnknownType(_) => ErrorCode::NotSupported,
            _ => ErrorCode::MalformedRequest,
        }
    }
}

/// Failure of a correlated call issued through [`crate::node::Node::call`].
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no reply from {dest} to msg {msg_id} before the deadline")]
    Timeout { dest: NodeId, msg_id: u64 },

    #[error("remote error {code}: {}", text.as_deref().unwrap_or("<no text>"))]
    Remote { code: u32, text: Option<String> },

    #[error("unexpected `{0}` reply")]
    UnexpectedReply(&'static str),

    #[error("outbound channel closed")]
    Closed,
}

/// A request that cannot be served because it breaks a protocol invariant.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("node has not received `init` yet")]
    NotInitialized,

    #[error("key `{0}` is not an integer")]
    InvalidKey(String),

    #[error("key `{key}` is owned by {owner}")]
    NotOwner { key: String, owner: NodeId },

    #[error("no replica available for this node")]
    NoReplica,

    #[error("`{0}` is not handled by this workload")]
    Unsupported(&'static str),

    #[error("adding {delta} to the counter of {owner} overflows")]
    CounterOverflow { owner: NodeId, delta: i64 },
}

/// Everything a workload handler can fail with.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("outbound channel closed")]
    Closed,
}

impl From<OutboxClosed> for HandlerError {
    fn from(_: OutboxClosed) -> Self {
        HandlerError::Closed
    }
}

impl HandlerError {
    /// True for a call that got no answer in time. Such failures are
    /// indefinite: the remote side may still have applied the request.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HandlerError::Rpc(RpcError::Timeout { .. }))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::Domain(DomainError::NotInitialized) => ErrorCode::TemporarilyUnavailable,
            HandlerError::Domain(DomainError::InvalidKey(_)) => ErrorCode::MalformedRequest,
            HandlerError::Domain(DomainError::NotOwner { .. }) => ErrorCode::PreconditionFailed,
            HandlerError::Domain(DomainError::NoReplica) => ErrorCode::TemporarilyUnavailable,
            HandlerError::Domain(DomainError::Unsupported(_)) => ErrorCode::NotSupported,
            HandlerError::Domain(DomainError::CounterOverflow { .. }) => ErrorCode::PreconditionFailed,
            HandlerError::Rpc(RpcError::Timeout { .. }) => ErrorCode::Timeout,
            HandlerError::Rpc(RpcError::Remote { code, .. }) => ErrorCode::from_code(*code),
            HandlerError::Rpc(RpcError::UnexpectedReply(_)) => ErrorCode::Crash,
            HandlerError::Rpc(RpcError::Closed) | HandlerError::Closed => ErrorCode::Crash,
        }
    }
}
