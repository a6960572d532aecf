//! Maelstrom wire protocol: envelopes, bodies and the tagged payload union.
//!
//! Every message is one JSON object per line:
//!
//! ```json
//! {"src":"c1","dest":"n0","body":{"type":"send","msg_id":2,"key":"5","msg":100}}
//! ```
//!
//! The body's `type` field selects the [`Payload`] variant. `msg_id` and
//! `in_reply_to` are common to all bodies and live on [`Body`] itself.
//!
//! Decoding is tag-first: [`decode`] reads `body.type`, rejects unknown tags
//! with [`DecodeError::UnknownType`], and only then parses the body into the
//! matching variant. A body of one type is never accepted as another type
//! just because the fields happen to fit.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// Node or client identifier such as `"n0"` or `"c3"`.
pub type NodeId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Body {
    pub fn new(payload: Payload) -> Self {
        Self {
            msg_id: None,
            in_reply_to: None,
            payload,
        }
    }
}

/// Per-node counter entry carried by counter gossip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub version: u64,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

impl OpKind {
    fn code(self) -> &'static str {
        match self {
            OpKind::Read => "r",
            OpKind::Write => "w",
        }
    }
}

/// One micro-operation of a transaction, `["r", 1, null]` or `["w", 1, 5]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnOp {
    pub kind: OpKind,
    pub key: u64,
    pub value: Option<i64>,
}

impl TxnOp {
    pub fn read(key: u64) -> Self {
        Self {
            kind: OpKind::Read,
            key,
            value: None,
        }
    }

    /// A read together with the value it observed.
    pub fn read_value(key: u64, value: Option<i64>) -> Self {
        Self {
            kind: OpKind::Read,
            key,
            value,
        }
    }

    pub fn write(key: u64, value: Option<i64>) -> Self {
        Self {
            kind: OpKind::Write,
            key,
            value,
        }
    }

    pub fn is_write(&self) -> bool {
        self.kind == OpKind::Write
    }
}

impl Serialize for TxnOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(self.kind.code())?;
        tuple.serialize_element(&self.key)?;
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for TxnOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TxnOpVisitor;

        impl<'de> Visitor<'de> for TxnOpVisitor {
            type Value = TxnOp;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [op, key, value] triple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<TxnOp, A::Error> {
                let op: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let key: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                // Reads may omit the trailing value entirely.
                let value: Option<i64> = seq.next_element()?.flatten();
                let kind = match op.as_str() {
                    "r" => OpKind::Read,
                    "w" => OpKind::Write,
                    other => {
                        return Err(de::Error::invalid_value(
                            de::Unexpected::Str(other),
                            &"\"r\" or \"w\"",
                        ))
                    }
                };
                Ok(TxnOp { kind, key, value })
            }
        }

        deserializer.deserialize_seq(TxnOpVisitor)
    }
}

/// Every message type this crate speaks, keyed by the body's `type` field.
///
/// The `*_rpc` variants carry the same shapes as their client-facing
/// counterparts; the distinct names let a node tell a peer forwarding a
/// request apart from a client issuing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    InitOk,
    Error {
        code: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    Echo {
        echo: Value,
    },
    EchoOk {
        echo: Value,
    },
    Generate,
    GenerateOk {
        id: String,
    },

    Topology {
        topology: BTreeMap<NodeId, Vec<NodeId>>,
    },
    TopologyOk,
    Broadcast {
        message: i64,
    },
    BroadcastOk,
    Read,
    /// Broadcast nodes answer with `messages`, counter nodes with `value`.
    ReadOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messages: Option<BTreeSet<i64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<i64>,
    },
    /// Broadcast gossip carries `messages`, counter gossip carries `counters`.
    Gossip {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messages: Option<BTreeSet<i64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        counters: Option<BTreeMap<NodeId, VersionedValue>>,
    },
    GossipOk {
        messages: BTreeSet<i64>,
    },

    Add {
        delta: i64,
    },
    AddOk,

    Send {
        key: String,
        msg: i64,
    },
    SendOk {
        offset: u64,
    },
    SendRpc {
        key: String,
        msg: i64,
    },
    SendRpcOk {
        offset: u64,
    },
    Poll {
        offsets: BTreeMap<String, u64>,
    },
    PollOk {
        msgs: BTreeMap<String, Vec<(u64, i64)>>,
    },
    PollRpc {
        offsets: BTreeMap<String, u64>,
    },
    PollRpcOk {
        msgs: BTreeMap<String, Vec<(u64, i64)>>,
    },
    CommitOffsets {
        offsets: BTreeMap<String, u64>,
    },
    CommitOffsetsOk,
    CommitOffsetsRpc {
        offsets: BTreeMap<String, u64>,
    },
    CommitOffsetsRpcOk,
    ListCommittedOffsets {
        keys: Vec<String>,
    },
    ListCommittedOffsetsOk {
        offsets: BTreeMap<String, u64>,
    },
    ListCommittedOffsetsRpc {
        keys: Vec<String>,
    },
    ListCommittedOffsetsRpcOk {
        offsets: BTreeMap<String, u64>,
    },

    Txn {
        txn: Vec<TxnOp>,
    },
    TxnOk {
        txn: Vec<TxnOp>,
    },
    TxnRpc {
        txn: Vec<TxnOp>,
    },
    TxnRpcOk {
        txn: Vec<TxnOp>,
    },
}

impl Payload {
    /// Every `type` tag [`decode`] accepts.
    pub const KINDS: &'static [&'static str] = &[
        "init",
        "init_ok",
        "error",
        "echo",
        "echo_ok",
        "generate",
        "generate_ok",
        "topology",
        "topology_ok",
        "broadcast",
        "broadcast_ok",
        "read",
        "read_ok",
        "gossip",
        "gossip_ok",
        "add",
        "add_ok",
        "send",
        "send_ok",
        "send_rpc",
        "send_rpc_ok",
        "poll",
        "poll_ok",
        "poll_rpc",
        "poll_rpc_ok",
        "commit_offsets",
        "commit_offsets_ok",
        "commit_offsets_rpc",
        "commit_offsets_rpc_ok",
        "list_committed_offsets",
        "list_committed_offsets_ok",
        "list_committed_offsets_rpc",
        "list_committed_offsets_rpc_ok",
        "txn",
        "txn_ok",
        "txn_rpc",
        "txn_rpc_ok",
    ];

    /// The wire tag of this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Init { .. } => "init",
            Payload::InitOk => "init_ok",
            Payload::Error { .. } => "error",
            Payload::Echo { .. } => "echo",
            Payload::EchoOk { .. } => "echo_ok",
            Payload::Generate => "generate",
            Payload::GenerateOk { .. } => "generate_ok",
            Payload::Topology { .. } => "topology",
            Payload::TopologyOk => "topology_ok",
            Payload::Broadcast { .. } => "broadcast",
            Payload::BroadcastOk => "broadcast_ok",
            Payload::Read => "read",
            Payload::ReadOk { .. } => "read_ok",
            Payload::Gossip { .. } => "gossip",
            Payload::GossipOk { .. } => "gossip_ok",
            Payload::Add { .. } => "add",
            Payload::AddOk => "add_ok",
            Payload::Send { .. } => "send",
            Payload::SendOk { .. } => "send_ok",
            Payload::SendRpc { .. } => "send_rpc",
            Payload::SendRpcOk { .. } => "send_rpc_ok",
            Payload::Poll { .. } => "poll",
            Payload::PollOk { .. } => "poll_ok",
            Payload::PollRpc { .. } => "poll_rpc",
            Payload::PollRpcOk { .. } => "poll_rpc_ok",
            Payload::CommitOffsets { .. } => "commit_offsets",
            Payload::CommitOffsetsOk => "commit_offsets_ok",
            Payload::CommitOffsetsRpc { .. } => "commit_offsets_rpc",
            Payload::CommitOffsetsRpcOk => "commit_offsets_rpc_ok",
            Payload::ListCommittedOffsets { .. } => "list_committed_offsets",
            Payload::ListCommittedOffsetsOk { .. } => "list_committed_offsets_ok",
            Payload::ListCommittedOffsetsRpc { .. } => "list_committed_offsets_rpc",
            Payload::ListCommittedOffsetsRpcOk { .. } => "list_committed_offsets_rpc_ok",
            Payload::Txn { .. } => "txn",
            Payload::TxnOk { .. } => "txn_ok",
            Payload::TxnRpc { .. } => "txn_rpc",
            Payload::TxnRpcOk { .. } => "txn_rpc_ok",
        }
    }
}

/// Where a request came from, recovered from a line that failed to decode
/// so the requester can still be told why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub src: NodeId,
    pub dest: NodeId,
    pub msg_id: u64,
}

/// Decodes one line into an envelope, dispatching on `body.type` first.
pub fn decode(line: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(line)?;
    let kind = value
        .pointer("/body/type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;

    if !Payload::KINDS.contains(&kind) {
        return Err(DecodeError::UnknownType(kind.to_string()));
    }

    let kind = kind.to_string();
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidBody { kind, source })
}

/// Best-effort extraction of `src`, `dest` and `body.msg_id` from a line.
pub fn peek_origin(line: &str) -> Option<Origin> {
    let value: Value = serde_json::from_str(line).ok()?;
    Some(Origin {
        src: value.get("src")?.as_str()?.to_string(),
        dest: value.get("dest")?.as_str()?.to_string(),
        msg_id: value.pointer("/body/msg_id")?.as_u64()?,
    })
}

/// Encodes an envelope as a single newline-terminated JSON line.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    // Compact serialization never emits raw newlines; strings escape theirs.
    let mut encoded = serde_json::to_vec(envelope)?;
    encoded.push(b'\n');
    Ok(encoded)
}
