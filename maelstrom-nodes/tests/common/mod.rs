//! In-process cluster: N runtimes wired together by router tasks.
//!
//! Each node's outbox is drained by a router that delivers node-bound
//! envelopes to the destination runtime and hands everything else to the
//! test as client traffic. Nodes can be isolated to simulate a partition;
//! traffic to or from an isolated node is dropped.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use maelstrom_nodes::channel::outbox;
use maelstrom_nodes::message::{Body, Envelope, NodeId, Payload};
use maelstrom_nodes::runtime::{Runtime, Workload};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const CLIENT: &str = "c1";
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestCluster<W: Workload> {
    ids: Vec<NodeId>,
    runtimes: Arc<BTreeMap<NodeId, Runtime<W>>>,
    isolated: Arc<Mutex<HashSet<NodeId>>>,
    client_rx: mpsc::UnboundedReceiver<Envelope>,
    stashed: HashMap<u64, Envelope>,
    tasks: Vec<JoinHandle<()>>,
    next_msg_id: u64,
}

impl<W: Workload> TestCluster<W> {
    /// Spawns `n` nodes named `n0..n{n-1}`, each running `make()`, and
    /// initializes them.
    pub async fn spawn(n: usize, make: impl Fn() -> W) -> Result<Self> {
        let ids: Vec<NodeId> = (0..n).map(|i| format!("n{i}")).collect();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let isolated = Arc::new(Mutex::new(HashSet::new()));

        let mut runtimes = BTreeMap::new();
        let mut receivers = Vec::new();
        for id in &ids {
            let (outbox, rx) = outbox();
            runtimes.insert(id.clone(), Runtime::new(make(), outbox));
            receivers.push(rx);
        }
        let runtimes = Arc::new(runtimes);

        let mut tasks = Vec::new();
        for mut rx in receivers {
            let runtimes = Arc::clone(&runtimes);
            let isolated = Arc::clone(&isolated);
            let client_tx = client_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    let Some(target) = runtimes.get(&envelope.dest) else {
                        let _ = client_tx.send(envelope);
                        continue;
                    };
                    let cut = {
                        let isolated = isolated.lock().unwrap();
                        isolated.contains(&envelope.src) || isolated.contains(&envelope.dest)
                    };
                    if !cut {
                        target.deliver(envelope);
                    }
                }
            }));
        }
        for runtime in runtimes.values() {
            tasks.extend(runtime.spawn_background());
        }

        let mut cluster = Self {
            ids,
            runtimes,
            isolated,
            client_rx,
            stashed: HashMap::new(),
            tasks,
            next_msg_id: 1,
        };
        cluster.init().await?;
        Ok(cluster)
    }

    async fn init(&mut self) -> Result<()> {
        for id in self.ids.clone() {
            let reply = self
                .request(
                    &id,
                    Payload::Init {
                        node_id: id.clone(),
                        node_ids: self.ids.clone(),
                    },
                )
                .await?;
            if reply != Payload::InitOk {
                bail!("{id} answered init with {reply:?}");
            }
        }
        Ok(())
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn node(&self, id: &str) -> &Runtime<W> {
        &self.runtimes[id]
    }

    pub fn workload(&self, id: &str) -> &W {
        self.node(id).workload()
    }

    pub fn isolate(&self, id: &str) {
        self.isolated.lock().unwrap().insert(id.to_string());
    }

    pub fn heal(&self) {
        self.isolated.lock().unwrap().clear();
    }

    /// Sends `payload` from the client to `node` and waits for the answer.
    pub async fn request(&mut self, node: &str, payload: Payload) -> Result<Payload> {
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        self.node(node).deliver(Envelope {
            src: CLIENT.to_string(),
            dest: node.to_string(),
            body: Body {
                msg_id: Some(msg_id),
                in_reply_to: None,
                payload,
            },
        });
        self.reply(msg_id).await
    }

    /// Like [`TestCluster::request`] but fails on an `error` reply.
    pub async fn expect_ok(&mut self, node: &str, payload: Payload) -> Result<Payload> {
        match self.request(node, payload).await? {
            Payload::Error { code, text } => Err(anyhow!("{node} failed with {code}: {text:?}")),
            reply => Ok(reply),
        }
    }

    async fn reply(&mut self, msg_id: u64) -> Result<Payload> {
        if let Some(envelope) = self.stashed.remove(&msg_id) {
            return Ok(envelope.body.payload);
        }
        let wait = async {
            while let Some(envelope) = self.client_rx.recv().await {
                match envelope.body.in_reply_to {
                    Some(id) if id == msg_id => return Ok(envelope.body.payload),
                    Some(id) => {
                        self.stashed.insert(id, envelope);
                    }
                    None => {}
                }
            }
            Err(anyhow!("client channel closed"))
        };
        tokio::time::timeout(REPLY_TIMEOUT, wait)
            .await
            .with_context(|| format!("no reply to msg {msg_id}"))?
    }
}

impl<W: Workload> Drop for TestCluster<W> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Polls `check` until it returns true or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {within:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
