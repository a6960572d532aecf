mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{bail, Result};
use common::{eventually, TestCluster};
use maelstrom_nodes::message::Payload;
use maelstrom_nodes::topology::TopologyStrategy;
use maelstrom_nodes::workloads::broadcast::{BroadcastConfig, BroadcastEngine, DeliveryPolicy};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(50);
const CONVERGENCE: Duration = Duration::from_secs(5);

async fn cluster(
    n: usize,
    delivery: DeliveryPolicy,
    topology: TopologyStrategy,
) -> Result<TestCluster<BroadcastEngine>> {
    TestCluster::spawn(n, || {
        BroadcastEngine::new(BroadcastConfig {
            delivery,
            topology,
            gossip_interval: GOSSIP_INTERVAL,
        })
    })
    .await
}

async fn broadcast(cluster: &mut TestCluster<BroadcastEngine>, node: &str, message: i64) -> Result<()> {
    match cluster.expect_ok(node, Payload::Broadcast { message }).await? {
        Payload::BroadcastOk => Ok(()),
        other => bail!("unexpected reply {other:?}"),
    }
}

async fn read(cluster: &mut TestCluster<BroadcastEngine>, node: &str) -> Result<BTreeSet<i64>> {
    match cluster.expect_ok(node, Payload::Read).await? {
        Payload::ReadOk {
            messages: Some(messages),
            ..
        } => Ok(messages),
        other => bail!("unexpected reply {other:?}"),
    }
}

fn converged(cluster: &TestCluster<BroadcastEngine>, expected: &BTreeSet<i64>) -> bool {
    cluster
        .ids()
        .iter()
        .all(|id| cluster.workload(id).seen() == *expected)
}

#[tokio::test]
async fn star_hub_reaches_every_child() -> Result<()> {
    let mut cluster = cluster(25, DeliveryPolicy::Gossip, TopologyStrategy::Star).await?;
    broadcast(&mut cluster, "n0", 42).await?;

    let expected = BTreeSet::from([42]);
    eventually(GOSSIP_INTERVAL * 10, || converged(&cluster, &expected)).await?;
    for id in cluster.ids().to_vec() {
        assert_eq!(read(&mut cluster, &id).await?, expected, "{id}");
    }
    Ok(())
}

#[tokio::test]
async fn every_delivery_policy_converges_on_the_union() -> Result<()> {
    let policies = [
        DeliveryPolicy::Flood,
        DeliveryPolicy::Gossip,
        DeliveryPolicy::anti_entropy(),
        DeliveryPolicy::Acknowledged {
            timeout: Duration::from_millis(200),
            backoff: Duration::from_millis(50),
        },
    ];
    for delivery in policies {
        let mut cluster = cluster(7, delivery, TopologyStrategy::Tree { fanout: 2 }).await?;
        let mut expected = BTreeSet::new();
        for (i, id) in cluster.ids().to_vec().iter().enumerate() {
            let value = i as i64 * 10;
            broadcast(&mut cluster, id, value).await?;
            // Re-delivery must not change anything.
            broadcast(&mut cluster, id, value).await?;
            expected.insert(value);
        }
        eventually(CONVERGENCE, || converged(&cluster, &expected))
            .await
            .map_err(|err| err.context(format!("{delivery:?}")))?;
    }
    Ok(())
}

#[tokio::test]
async fn harness_topology_is_used_once_announced() -> Result<()> {
    let mut cluster = cluster(3, DeliveryPolicy::Gossip, TopologyStrategy::Harness).await?;
    let line = [
        ("n0".to_string(), vec!["n1".to_string()]),
        ("n1".to_string(), vec!["n0".to_string(), "n2".to_string()]),
        ("n2".to_string(), vec!["n1".to_string()]),
    ];
    for id in cluster.ids().to_vec() {
        let reply = cluster
            .expect_ok(&id, Payload::Topology { topology: line.clone().into() })
            .await?;
        assert_eq!(reply, Payload::TopologyOk);
    }

    broadcast(&mut cluster, "n0", 1).await?;
    broadcast(&mut cluster, "n2", 2).await?;
    let expected = BTreeSet::from([1, 2]);
    eventually(CONVERGENCE, || converged(&cluster, &expected)).await
}

#[tokio::test]
async fn acknowledged_delivery_outlasts_a_partition() -> Result<()> {
    let delivery = DeliveryPolicy::Acknowledged {
        timeout: Duration::from_millis(100),
        backoff: Duration::from_millis(50),
    };
    let mut cluster = cluster(3, delivery, TopologyStrategy::Full).await?;
    cluster.isolate("n2");

    broadcast(&mut cluster, "n0", 5).await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!cluster.workload("n2").seen().contains(&5));
    assert!(cluster.workload("n0").in_flight().contains_key(&5));

    cluster.heal();
    let expected = BTreeSet::from([5]);
    eventually(CONVERGENCE, || {
        converged(&cluster, &expected)
            && cluster
                .ids()
                .iter()
                .all(|id| cluster.workload(id).in_flight().is_empty())
    })
    .await
}

#[tokio::test]
async fn anti_entropy_repairs_values_lost_in_a_partition() -> Result<()> {
    let delivery = DeliveryPolicy::AntiEntropy { full_sync_every: 5 };
    let mut cluster = cluster(3, delivery, TopologyStrategy::Full).await?;
    cluster.isolate("n2");
    broadcast(&mut cluster, "n0", 9).await?;
    tokio::time::sleep(GOSSIP_INTERVAL * 3).await;
    assert!(!cluster.workload("n2").seen().contains(&9));

    cluster.heal();
    let expected = BTreeSet::from([9]);
    eventually(CONVERGENCE, || converged(&cluster, &expected)).await
}
