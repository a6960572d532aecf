//! Correlation of outbound requests with their replies.
//!
//! The correlator is a table from `msg_id` to a one-shot waiter. A call
//! registers its id before the request leaves the node, the dispatch loop
//! hands every reply to [`Correlator::resolve`], and whichever comes first,
//! the reply or the caller's deadline, removes the entry. A reply that
//! arrives after its entry is gone is reported back to the caller of
//! `resolve` and dropped.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::message::Body;

/// One in-flight request waiting for its reply.
#[derive(Debug)]
pub struct PendingCall {
    pub msg_id: u64,
    pub created_at: Instant,
    reply: oneshot::Sender<Body>,
}

/// Process-wide table of pending calls.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<u64, PendingCall>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter for `msg_id` and returns the receiving end.
    ///
    /// Message ids are allocated from a monotonic counter and never reused,
    /// so a second registration under the same id replaces a stale entry.
    pub fn register(&self, msg_id: u64) -> oneshot::Receiver<Body> {
        let (reply, rx) = oneshot::channel();
        let call = PendingCall {
            msg_id,
            created_at: Instant::now(),
            reply,
        };
        self.table().insert(msg_id, call);
        rx
    }

    /// Completes the call waiting on `in_reply_to` with `body`.
    ///
    /// Hands the body back if no call is waiting, either because it never
    /// existed or because it already timed out.
    pub fn resolve(&self, in_reply_to: u64, body: Body) -> Result<(), Body> {
        let Some(call) = self.table().remove(&in_reply_to) else {
            return Err(body);
        };
        // The caller may have given up between our removal and this send.
        call.reply.send(body)
    }

    /// Drops the waiter for `msg_id`, if any, returning how long it waited.
    pub fn cancel(&self, msg_id: u64) -> Option<Duration> {
        self.table()
            .remove(&msg_id)
            .map(|call| call.created_at.elapsed())
    }

    pub fn is_pending(&self, msg_id: u64) -> bool {
        self.table().contains_key(&msg_id)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    #[tokio::test]
    async fn resolve_completes_the_matching_waiter() {
        let correlator = Correlator::new();
        let rx = correlator.register(7);
        assert!(correlator.is_pending(7));

        correlator
            .resolve(7, Body::new(Payload::BroadcastOk))
            .expect("waiter present");

        let body = rx.await.expect("reply delivered");
        assert_eq!(body.payload, Payload::BroadcastOk);
        assert!(correlator.is_empty());
    }

    #[test]
    fn unmatched_reply_is_handed_back() {
        let correlator = Correlator::new();
        let _rx = correlator.register(1);
        let rejected = correlator
            .resolve(2, Body::new(Payload::AddOk))
            .expect_err("nobody waits on 2");
        assert_eq!(rejected.payload, Payload::AddOk);
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn cancel_reports_how_long_the_call_waited() {
        let correlator = Correlator::new();
        let _rx = correlator.register(8);
        std::thread::sleep(Duration::from_millis(5));
        let waited = correlator.cancel(8).expect("was pending");
        assert!(waited >= Duration::from_millis(5));
    }

    #[test]
    fn cancelled_call_drops_late_replies() {
        let correlator = Correlator::new();
        let rx = correlator.register(3);
        assert!(correlator.cancel(3).is_some());
        assert!(correlator.resolve(3, Body::new(Payload::TopologyOk)).is_err());
        drop(rx);
        assert!(correlator.cancel(3).is_none());
    }

    #[test]
    fn reply_to_an_abandoned_receiver_is_not_delivered() {
        let correlator = Correlator::new();
        drop(correlator.register(4));
        assert!(correlator.resolve(4, Body::new(Payload::InitOk)).is_err());
        assert!(correlator.is_empty());
    }
}
