//! Nodes for the Maelstrom distributed-systems workbench.
//!
//! A node reads one JSON message per line on stdin and writes one per line
//! on stdout. The crate splits that into layers:
//!
//! - [`message`]: the wire format and tag-first decoding.
//! - [`channel`]: line framing and the single serialized writer.
//! - [`rpc`] and [`node`]: identity, replies and correlated calls.
//! - [`runtime`]: the dispatch loop and the [`runtime::Workload`] trait.
//! - [`workloads`]: echo, unique ids, broadcast, counter, kafka-style
//!   logs and transactions.

pub mod channel;
pub mod cli;
pub mod error;
pub mod message;
pub mod node;
pub mod rpc;
pub mod runtime;
pub mod topology;
pub mod workloads;
