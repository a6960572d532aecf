//! Dispatch loop shared by every workload.
//!
//! The runtime reads one line at a time, decodes it and routes it:
//!
//! - replies (`in_reply_to` set) complete a pending [`Node::call`],
//! - `init` is handled inline so later messages always see the identity,
//! - everything else runs on its own task through [`Workload::handle`].
//!
//! Workloads that converge through periodic gossip also get one background
//! task ticking at [`Workload::gossip_interval`].

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufRead;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::channel::{self, Outbox};
use crate::error::HandlerError;
use crate::message::{self, Envelope, Payload};
use crate::node::Node;

pub const MIN_GOSSIP_INTERVAL: Duration = Duration::from_millis(1);

/// A protocol engine plugged into the runtime.
pub trait Workload: Send + Sync + 'static {
    /// Serves one request. The runtime turns an `Err` into an `error` reply.
    fn handle(
        &self,
        node: &Arc<Node>,
        request: &Envelope,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;

    /// Called once, right after the node learns its identity.
    fn on_init(&self, _node: &Node) {}

    /// Period of [`Workload::gossip`], or `None` for request/response-only
    /// workloads.
    fn gossip_interval(&self) -> Option<Duration> {
        None
    }

    /// One round of background dissemination.
    fn gossip(&self, _node: &Node) -> Result<(), HandlerError> {
        Ok(())
    }
}

pub struct Runtime<W> {
    node: Arc<Node>,
    workload: Arc<W>,
}

impl<W> Clone for Runtime<W> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            workload: Arc::clone(&self.workload),
        }
    }
}

impl<W: Workload> Runtime<W> {
    pub fn new(workload: W, outbox: Outbox) -> Self {
        Self {
            node: Arc::new(Node::new(outbox)),
            workload: Arc::new(workload),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn workload(&self) -> &Arc<W> {
        &self.workload
    }

    /// Reads lines until end of input, dispatching each one.
    ///
    /// Handler tasks still running at end of input keep their own handle on
    /// the node and finish on their own.
    pub async fn run<R>(&self, mut reader: R) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let background = self.spawn_background();
        while let Some(line) = channel::read_line(&mut reader).await? {
            self.deliver_line(&line);
        }
        debug!("input closed");
        if let Some(task) = background {
            task.abort();
        }
        Ok(())
    }

    /// Decodes and dispatches one raw line.
    pub fn deliver_line(&self, line: &str) {
        match message::decode(line) {
            Ok(envelope) => self.deliver(envelope),
            Err(err) => {
                warn!(error = %err, "dropping undecodable message");
                if let Some(origin) = message::peek_origin(line) {
                    self.node
                        .reply_error_to(&origin.src, origin.msg_id, err.code(), err.to_string());
                }
            }
        }
    }

    /// Dispatches one decoded envelope.
    pub fn deliver(&self, envelope: Envelope) {
        if envelope.body.in_reply_to.is_some() {
            if let Err(unmatched) = self.node.resolve(envelope) {
                debug!(
                    src = %unmatched.src,
                    kind = unmatched.body.payload.kind(),
                    in_reply_to = ?unmatched.body.in_reply_to,
                    "dropping reply with no pending call"
                );
            }
            return;
        }

        if let Payload::Init { node_id, node_ids } = &envelope.body.payload {
            self.init(&envelope, node_id.clone(), node_ids.clone());
            return;
        }

        let node = Arc::clone(&self.node);
        let workload = Arc::clone(&self.workload);
        tokio::spawn(async move {
            if let Err(err) = workload.handle(&node, &envelope).await {
                warn!(
                    src = %envelope.src,
                    kind = envelope.body.payload.kind(),
                    error = %err,
                    "request failed"
                );
                node.reply_error(&envelope, &err);
            }
        });
    }

    fn init(&self, request: &Envelope, node_id: String, node_ids: Vec<String>) {
        if self.node.init(node_id, node_ids) {
            if let Ok(identity) = self.node.identity() {
                info!(node = %identity.id, members = identity.node_ids.len(), "initialized");
            }
            self.workload.on_init(&self.node);
        } else {
            warn!(src = %request.src, "ignoring repeated init");
        }
        if let Err(err) = self.node.reply(request, Payload::InitOk) {
            warn!(error = %err, "could not acknowledge init");
        }
    }

    /// Starts the periodic gossip task if the workload has one.
    ///
    /// Ticks before `init` are skipped. The task stops once the outbound
    /// channel is gone. Periods shorter than [`MIN_GOSSIP_INTERVAL`] are
    /// raised to it.
    pub fn spawn_background(&self) -> Option<JoinHandle<()>> {
        let period = self.workload.gossip_interval()?.max(MIN_GOSSIP_INTERVAL);
        let node = Arc::clone(&self.node);
        let workload = Arc::clone(&self.workload);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !node.is_initialized() {
                    continue;
                }
                match workload.gossip(&node) {
                    Ok(()) => {}
                    Err(HandlerError::Closed) => break,
                    Err(err) => warn!(error = %err, "gossip round failed"),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::io::BufReader;

    use super::*;
    use crate::channel::{outbox, OutboxReceiver};
    use crate::error::DomainError;
    use crate::message::Body;

    /// Answers `read` with how many gossip rounds have run; rejects the rest.
    #[derive(Default)]
    struct Recorder {
        rounds: AtomicUsize,
        inits: AtomicUsize,
        period: Option<Duration>,
    }

    impl Workload for Recorder {
        async fn handle(&self, node: &Arc<Node>, request: &Envelope) -> Result<(), HandlerError> {
            match request.body.payload {
                Payload::Read => {
                    let rounds = self.rounds.load(Ordering::SeqCst) as i64;
                    node.reply(request, Payload::ReadOk {
                        messages: None,
                        value: Some(rounds),
                    })
                }
                ref other => Err(DomainError::Unsupported(other.kind()).into()),
            }
        }

        fn on_init(&self, _node: &Node) {
            self.inits.fetch_add(1, Ordering::SeqCst);
        }

        fn gossip_interval(&self) -> Option<Duration> {
            Some(self.period.unwrap_or(Duration::from_millis(100)))
        }

        fn gossip(&self, _node: &Node) -> Result<(), HandlerError> {
            self.rounds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn runtime() -> (Runtime<Recorder>, OutboxReceiver) {
        let (outbox, rx) = outbox();
        (Runtime::new(Recorder::default(), outbox), rx)
    }

    fn init_line(msg_id: u64, node_id: &str) -> String {
        json!({
            "src": "c0",
            "dest": node_id,
            "body": {"type": "init", "msg_id": msg_id, "node_id": node_id, "node_ids": [node_id]}
        })
        .to_string()
    }

    async fn next(rx: &mut OutboxReceiver) -> Envelope {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("reply in time")
            .expect("outbox open")
    }

    #[tokio::test]
    async fn init_is_acknowledged_and_runs_once() {
        let (runtime, mut rx) = runtime();
        runtime.deliver_line(&init_line(1, "n0"));
        let ack = next(&mut rx).await;
        assert_eq!(ack.body.payload, Payload::InitOk);
        assert_eq!(ack.body.in_reply_to, Some(1));

        runtime.deliver_line(&init_line(2, "n7"));
        let second = next(&mut rx).await;
        assert_eq!(second.body.in_reply_to, Some(2));
        assert_eq!(runtime.node().id().unwrap(), "n0");
        assert_eq!(runtime.workload().inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_type_gets_not_supported() {
        let (runtime, mut rx) = runtime();
        runtime.deliver_line(&init_line(1, "n0"));
        next(&mut rx).await;

        runtime.deliver_line(r#"{"src":"c1","dest":"n0","body":{"type":"frobnicate","msg_id":4}}"#);
        let reply = next(&mut rx).await;
        assert_eq!(reply.dest, "c1");
        assert_eq!(reply.body.in_reply_to, Some(4));
        assert!(matches!(reply.body.payload, Payload::Error { code: 10, .. }));
    }

    #[tokio::test]
    async fn malformed_body_gets_malformed_request() {
        let (runtime, mut rx) = runtime();
        runtime.deliver_line(&init_line(1, "n0"));
        next(&mut rx).await;

        runtime.deliver_line(r#"{"src":"c1","dest":"n0","body":{"type":"add","msg_id":5,"delta":"x"}}"#);
        let reply = next(&mut rx).await;
        assert!(matches!(reply.body.payload, Payload::Error { code: 12, .. }));
    }

    #[tokio::test]
    async fn garbage_is_dropped_without_reply() {
        let (runtime, mut rx) = runtime();
        runtime.deliver_line(&init_line(1, "n0"));
        next(&mut rx).await;

        runtime.deliver_line("not json at all");
        runtime.deliver(Envelope {
            src: "n1".into(),
            dest: "n0".into(),
            body: Body {
                msg_id: None,
                in_reply_to: Some(99),
                payload: Payload::BroadcastOk,
            },
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handler_errors_become_error_replies() {
        let (runtime, mut rx) = runtime();
        runtime.deliver_line(&init_line(1, "n0"));
        next(&mut rx).await;

        runtime.deliver_line(r#"{"src":"c1","dest":"n0","body":{"type":"add","msg_id":6,"delta":1}}"#);
        let reply = next(&mut rx).await;
        assert_eq!(reply.body.in_reply_to, Some(6));
        assert!(matches!(reply.body.payload, Payload::Error { code: 10, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn background_ticks_only_after_init() {
        let (runtime, mut rx) = runtime();
        let task = runtime.spawn_background().expect("recorder gossips");

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(runtime.workload().rounds.load(Ordering::SeqCst), 0);

        runtime.deliver_line(&init_line(1, "n0"));
        next(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(runtime.workload().rounds.load(Ordering::SeqCst) >= 3);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_gossip_period_still_ticks() {
        let (outbox, mut rx) = outbox();
        let workload = Recorder {
            period: Some(Duration::ZERO),
            ..Recorder::default()
        };
        let runtime = Runtime::new(workload, outbox);
        let task = runtime.spawn_background().expect("recorder gossips");
        runtime.deliver_line(&init_line(1, "n0"));
        next(&mut rx).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        assert!(runtime.workload().rounds.load(Ordering::SeqCst) >= 5);
        task.abort();
    }

    #[tokio::test]
    async fn run_dispatches_until_end_of_input() {
        let (runtime, mut rx) = runtime();
        let input = format!(
            "{}\n\n{}\n",
            init_line(1, "n0"),
            r#"{"src":"c1","dest":"n0","body":{"type":"read","msg_id":2}}"#
        );
        runtime.run(BufReader::new(input.as_bytes())).await.unwrap();

        assert_eq!(next(&mut rx).await.body.payload, Payload::InitOk);
        let read = next(&mut rx).await;
        assert_eq!(read.body.in_reply_to, Some(2));
        assert!(matches!(read.body.payload, Payload::ReadOk { value: Some(_), .. }));
    }

    #[tokio::test]
    async fn run_survives_a_line_that_is_not_utf8() {
        let (runtime, mut rx) = runtime();
        let mut input = format!("{}\n", init_line(1, "n0")).into_bytes();
        input.extend_from_slice(b"{\"src\":\"c1\",\xff}\n");
        input.extend_from_slice(
            br#"{"src":"c1","dest":"n0","body":{"type":"read","msg_id":3}}"#,
        );
        input.push(b'\n');
        runtime.run(BufReader::new(input.as_slice())).await.unwrap();

        assert_eq!(next(&mut rx).await.body.payload, Payload::InitOk);
        let read = next(&mut rx).await;
        assert_eq!(read.body.in_reply_to, Some(3));
        assert!(matches!(read.body.payload, Payload::ReadOk { .. }));
        assert!(rx.try_recv().is_err());
    }
}
