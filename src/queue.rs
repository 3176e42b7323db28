use std::collections::VecDeque;

use crate::protocol::OpEnvelope;
use crate::result::LdapError;

use log::debug;

/// FIFO buffer for requests issued while the connection is unavailable.
///
/// The connection controller drains the queue onto the wire, in submission
/// order, the moment a connection becomes ready. A frozen or full queue
/// refuses new entries so callers fail immediately instead of hanging for
/// an unbounded reconnection.
#[derive(Debug)]
pub(crate) struct RequestQueue {
    entries: VecDeque<OpEnvelope>,
    max_size: usize,
    frozen: bool,
}

impl RequestQueue {
    /// Create a queue holding at most `max_size` entries; zero means
    /// unbounded. `frozen` starts the queue in the refusing state.
    pub fn new(max_size: usize, frozen: bool) -> RequestQueue {
        RequestQueue {
            entries: VecDeque::new(),
            max_size,
            frozen,
        }
    }

    /// Buffer a request until the connection recovers. The envelope is
    /// handed back when the queue is frozen or at capacity.
    pub fn enqueue(&mut self, env: OpEnvelope) -> Result<(), OpEnvelope> {
        if self.frozen || (self.max_size > 0 && self.entries.len() >= self.max_size) {
            return Err(env);
        }
        self.entries.push_back(env);
        Ok(())
    }

    /// Drain all buffered requests, oldest first, into `sink`.
    pub fn flush<F>(&mut self, mut sink: F)
    where
        F: FnMut(OpEnvelope),
    {
        if !self.entries.is_empty() {
            debug!("flushing {} queued request(s)", self.entries.len());
        }
        while let Some(env) = self.entries.pop_front() {
            sink(env);
        }
    }

    /// Fail every buffered request with the error produced by `err`.
    pub fn purge<E>(&mut self, err: E)
    where
        E: Fn() -> LdapError,
    {
        while let Some(env) = self.entries.pop_front() {
            let _ = env.tx.send(Err(err()));
        }
    }

    /// Put requests back at the head of the queue, in iteration order.
    /// Used when a connection breaks in the middle of a flush; capacity
    /// and freeze checks don't apply, since the entries were accepted once
    /// already.
    pub fn requeue_front<I>(&mut self, envs: I)
    where
        I: DoubleEndedIterator<Item = OpEnvelope>,
    {
        for env in envs.rev() {
            self.entries.push_front(env);
        }
    }

    /// Refuse all further enqueues.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Accept enqueues again.
    #[allow(dead_code)]
    pub fn thaw(&mut self) {
        self.frozen = false;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::protocol::{LdapOp, ResultReceiver};

    use lber::structures::{Null, Tag};
    use tokio::sync::oneshot;

    fn envelope(id: i32) -> (OpEnvelope, ResultReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            OpEnvelope {
                id,
                op: LdapOp::Single,
                tag: Tag::Null(Null {
                    ..Default::default()
                }),
                controls: None,
                tx,
            },
            rx,
        )
    }

    #[test]
    fn flush_preserves_fifo_order() {
        let mut queue = RequestQueue::new(0, false);
        let mut rxs = vec![];
        for id in 1..=3 {
            let (env, rx) = envelope(id);
            assert!(queue.enqueue(env).is_ok());
            rxs.push(rx);
        }
        let mut drained = vec![];
        queue.flush(|env| drained.push(env.id));
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn bounded_queue_refuses_overflow() {
        let mut queue = RequestQueue::new(2, false);
        let (e1, _r1) = envelope(1);
        let (e2, _r2) = envelope(2);
        let (e3, _r3) = envelope(3);
        assert!(queue.enqueue(e1).is_ok());
        assert!(queue.enqueue(e2).is_ok());
        let refused = queue.enqueue(e3).expect_err("queue at capacity");
        assert_eq!(refused.id, 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn frozen_queue_refuses_everything() {
        let mut queue = RequestQueue::new(0, true);
        let (env, _rx) = envelope(1);
        assert!(queue.enqueue(env).is_err());
        queue.thaw();
        let (env, _rx) = envelope(2);
        assert!(queue.enqueue(env).is_ok());
        queue.freeze();
        let (env, _rx) = envelope(3);
        assert!(queue.enqueue(env).is_err());
    }

    #[tokio::test]
    async fn purge_fails_buffered_requests() {
        let mut queue = RequestQueue::new(0, false);
        let (env, rx) = envelope(1);
        queue.enqueue(env).unwrap();
        queue.purge(|| LdapError::QueueUnavailable);
        match rx.await.expect("reply") {
            Err(LdapError::QueueUnavailable) => (),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(queue.is_empty());
    }
}
