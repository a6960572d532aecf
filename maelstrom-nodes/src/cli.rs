use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::topology::TopologyStrategy;
use crate::workloads::broadcast::{BroadcastConfig, DeliveryPolicy};
use crate::workloads::counter::CounterConfig;
use crate::workloads::kafka::KafkaConfig;
use crate::workloads::txn::TxnConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Echo every request body back to its sender.
    Echo,
    /// Generate cluster-wide unique ids.
    UniqueIds,
    /// Disseminate broadcast values to every node.
    Broadcast(BroadcastArgs),
    /// Grow-only counter replicated by gossip.
    Counter(CounterArgs),
    /// Partitioned append-only logs with committed offsets.
    Kafka(KafkaArgs),
    /// Transactional key/value store.
    Txn(TxnArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Flood,
    Gossip,
    AntiEntropy,
    Acknowledged,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Neighbors from the harness's `topology` message.
    Harness,
    Star,
    Tree,
    Full,
}

#[derive(Args, Debug, Clone)]
pub struct BroadcastArgs {
    /// How new values reach neighbors.
    #[arg(long, value_enum, default_value_t = Delivery::Gossip)]
    pub delivery: Delivery,

    /// How neighbors are chosen.
    #[arg(long, value_enum, default_value_t = Topology::Harness)]
    pub topology: Topology,

    /// Children per node for the tree topology.
    #[arg(long, default_value_t = 4)]
    pub fanout: usize,

    /// Period of background gossip rounds.
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u64).range(1..))]
    pub gossip_interval_ms: u64,

    /// Deadline for one acknowledged delivery attempt.
    #[arg(long, default_value_t = 1000)]
    pub rpc_timeout_ms: u64,

    /// Pause before retrying an unacknowledged delivery.
    #[arg(long, default_value_t = 500)]
    pub retry_backoff_ms: u64,

    /// Anti-entropy sends the full set every this many rounds (0 never).
    #[arg(long, default_value_t = 10)]
    pub full_sync_every: u64,
}

#[derive(Args, Debug, Clone)]
pub struct CounterArgs {
    #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(1..))]
    pub gossip_interval_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct KafkaArgs {
    /// Deadline for requests forwarded to a key's owner.
    #[arg(long, default_value_t = 1000)]
    pub rpc_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct TxnArgs {
    /// Replicate writes to the next node before acknowledging.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub replicate: bool,

    #[arg(long, default_value_t = 1000)]
    pub rpc_timeout_ms: u64,
}

impl From<&BroadcastArgs> for BroadcastConfig {
    fn from(args: &BroadcastArgs) -> Self {
        let delivery = match args.delivery {
            Delivery::Flood => DeliveryPolicy::Flood,
            Delivery::Gossip => DeliveryPolicy::Gossip,
            Delivery::AntiEntropy => DeliveryPolicy::AntiEntropy {
                full_sync_every: args.full_sync_every,
            },
            Delivery::Acknowledged => DeliveryPolicy::Acknowledged {
                timeout: Duration::from_millis(args.rpc_timeout_ms),
                backoff: Duration::from_millis(args.retry_backoff_ms),
            },
        };
        let topology = match args.topology {
            Topology::Harness => TopologyStrategy::Harness,
            Topology::Star => TopologyStrategy::Star,
            Topology::Tree => TopologyStrategy::Tree {
                fanout: args.fanout,
            },
            Topology::Full => TopologyStrategy::Full,
        };
        BroadcastConfig {
            delivery,
            topology,
            gossip_interval: Duration::from_millis(args.gossip_interval_ms),
        }
    }
}

impl From<&CounterArgs> for CounterConfig {
    fn from(args: &CounterArgs) -> Self {
        CounterConfig {
            gossip_interval: Duration::from_millis(args.gossip_interval_ms),
        }
    }
}

impl From<&KafkaArgs> for KafkaConfig {
    fn from(args: &KafkaArgs) -> Self {
        KafkaConfig {
            rpc_timeout: Duration::from_millis(args.rpc_timeout_ms),
        }
    }
}

impl From<&TxnArgs> for TxnConfig {
    fn from(args: &TxnArgs) -> Self {
        TxnConfig {
            replicate: args.replicate,
            rpc_timeout: Duration::from_millis(args.rpc_timeout_ms),
        }
    }
}
