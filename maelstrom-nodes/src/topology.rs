//! Who talks to whom: broadcast neighbor selection, key ownership for the
//! partitioned log and replica placement for transactions.

use std::collections::BTreeMap;

use crate::error::DomainError;
use crate::message::NodeId;

/// Neighbor map as announced by a `topology` message.
pub type Announced = BTreeMap<NodeId, Vec<NodeId>>;

/// How a broadcast node picks the peers it forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyStrategy {
    /// Use the neighbors from the `topology` message.
    Harness,
    /// The first node is the hub and links to everyone else.
    Star,
    /// A `fanout`-ary tree over `node_ids` in the order given.
    Tree { fanout: usize },
    /// Every other node.
    Full,
}

impl TopologyStrategy {
    /// Neighbors of `me`. Empty if `me` is not a member, or for
    /// [`TopologyStrategy::Harness`] until a topology has been announced.
    pub fn neighbors(
        &self,
        me: &str,
        node_ids: &[NodeId],
        announced: Option<&Announced>,
    ) -> Vec<NodeId> {
        let Some(index) = node_ids.iter().position(|n| n == me) else {
            return Vec::new();
        };

        match *self {
            TopologyStrategy::Harness => announced
                .and_then(|topology| topology.get(me))
                .map(|neighbors| neighbors.iter().filter(|n| *n != me).cloned().collect())
                .unwrap_or_default(),
            TopologyStrategy::Star => {
                if index == 0 {
                    node_ids[1..].to_vec()
                } else {
                    vec![node_ids[0].clone()]
                }
            }
            TopologyStrategy::Tree { fanout } => {
                let fanout = fanout.max(1);
                let mut neighbors = Vec::new();
                if index > 0 {
                    neighbors.push(node_ids[(index - 1) / fanout].clone());
                }
                let first_child = index.saturating_mul(fanout).saturating_add(1);
                let children = first_child..first_child.saturating_add(fanout).min(node_ids.len());
                neighbors.extend(children.filter_map(|i| node_ids.get(i).cloned()));
                neighbors
            }
            TopologyStrategy::Full => node_ids.iter().filter(|n| *n != me).cloned().collect(),
        }
    }
}

/// The node responsible for `key`: `node_ids[key mod len]`.
///
/// Keys must be integer strings; negative keys wrap around.
pub fn owner<'a>(key: &str, node_ids: &'a [NodeId]) -> Result<&'a NodeId, DomainError> {
    let parsed: i64 = key
        .trim()
        .parse()
        .map_err(|_| DomainError::InvalidKey(key.to_string()))?;
    if node_ids.is_empty() {
        return Err(DomainError::NotInitialized);
    }
    let index = parsed.rem_euclid(node_ids.len() as i64) as usize;
    Ok(&node_ids[index])
}

/// The node after `me` in the sorted membership ring, or `None` when `me`
/// is alone or not a member.
pub fn successor(me: &str, node_ids: &[NodeId]) -> Option<NodeId> {
    let mut ring: Vec<&NodeId> = node_ids.iter().collect();
    ring.sort();
    ring.dedup();
    if ring.len() < 2 {
        return None;
    }
    let index = ring.iter().position(|n| *n == me)?;
    Some(ring[(index + 1) % ring.len()].clone())
}
