use std::collections::{HashMap, HashSet};

use crate::protocol::{ItemSender, ResultSender};
use crate::RequestId;

/// The response sink of an outstanding request.
///
/// A request is either waiting for a single terminal response, streaming
/// search items to an emitter, or is the connection's outstanding unbind,
/// which no server response will ever answer.
#[derive(Debug)]
pub(crate) enum PendingSink {
    /// ID handed out, request not yet on the wire.
    Reserved,
    Single(ResultSender),
    Search(ItemSender),
    Unbind(ResultSender),
}

/// An outstanding request held by the tracker.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub sink: PendingSink,
}

/// Registry of outstanding requests, keyed by LDAP message ID.
///
/// Message IDs are allocated monotonically in the 1..2³¹−1 domain, wrapping
/// back to 1 and skipping any value that is still pending or has been
/// abandoned. An abandoned ID keeps swallowing late server responses until
/// the next disconnect purges the registry.
#[derive(Debug, Default)]
pub(crate) struct MessageTracker {
    next_id: RequestId,
    pending: HashMap<RequestId, PendingRequest>,
    abandoned: HashSet<RequestId>,
}

impl MessageTracker {
    pub fn new() -> MessageTracker {
        MessageTracker {
            next_id: 0,
            pending: HashMap::new(),
            abandoned: HashSet::new(),
        }
    }

    /// Allocate the next free message ID.
    ///
    /// The ID is reserved against reallocation from the moment it's handed
    /// out; the caller must follow up with [`register()`](#method.register)
    /// or [`remove()`](#method.remove).
    pub fn alloc_id(&mut self) -> RequestId {
        let last_id = self.next_id;
        let mut id = last_id;
        loop {
            if id == RequestId::MAX {
                id = 1;
            } else {
                id += 1;
            }
            if !self.pending.contains_key(&id) && !self.abandoned.contains(&id) {
                break;
            }
            assert_ne!(
                id, last_id,
                "LDAP message id wraparound with no free slots"
            );
        }
        self.next_id = id;
        self.pending.insert(
            id,
            PendingRequest {
                sink: PendingSink::Reserved,
            },
        );
        id
    }

    /// Attach the response sink for an allocated ID.
    pub fn register(&mut self, id: RequestId, pending: PendingRequest) {
        self.pending.insert(id, pending);
    }

    /// Allocate an ID and attach the sink in one step.
    #[cfg(test)]
    pub fn track(&mut self, pending: PendingRequest) -> RequestId {
        let id = self.alloc_id();
        self.register(id, pending);
        id
    }

    /// Look up the sink for an ID without removing it. Used for the
    /// intermediate items of a Search, which is terminated by a separate
    /// `Done` response.
    pub fn fetch(&self, id: RequestId) -> Option<&PendingRequest> {
        self.pending.get(&id)
    }

    /// Drop the outstanding request for an ID, returning it. Used when a
    /// terminal response arrives.
    pub fn remove(&mut self, id: RequestId) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    /// Record the ID as abandoned and drop its outstanding request.
    /// Responses arriving for it afterwards are silently discarded.
    pub fn abandon(&mut self, id: RequestId) {
        self.abandoned.insert(id);
        self.pending.remove(&id);
    }

    /// Whether the ID was abandoned during the current connection epoch.
    pub fn is_abandoned(&self, id: RequestId) -> bool {
        self.abandoned.contains(&id)
    }

    /// Drain every outstanding request through `f` and clear the registry,
    /// including the abandoned set. Idempotent: a second purge sees an
    /// empty map. Called when the connection closes, so that one epoch's
    /// requests can never be answered by another epoch's responses.
    pub fn purge<F>(&mut self, mut f: F)
    where
        F: FnMut(RequestId, PendingRequest),
    {
        for (id, pending) in self.pending.drain() {
            f(id, pending);
        }
        self.abandoned.clear();
    }

    /// Number of outstanding requests.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::sync::oneshot;

    fn single() -> (PendingRequest, crate::protocol::ResultReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            PendingRequest {
                sink: PendingSink::Single(tx),
            },
            rx,
        )
    }

    #[test]
    fn ids_start_at_one_and_ascend() {
        let mut tracker = MessageTracker::new();
        let (p1, _rx1) = single();
        let (p2, _rx2) = single();
        assert_eq!(tracker.track(p1), 1);
        assert_eq!(tracker.track(p2), 2);
        assert_eq!(tracker.pending(), 2);
    }

    #[test]
    fn fetch_returns_registered_sink() {
        let mut tracker = MessageTracker::new();
        let (p, _rx) = single();
        let id = tracker.track(p);
        assert!(matches!(
            tracker.fetch(id),
            Some(PendingRequest {
                sink: PendingSink::Single(_)
            })
        ));
        tracker.remove(id);
        assert!(tracker.fetch(id).is_none());
    }

    #[test]
    fn abandoned_id_is_not_reallocated() {
        let mut tracker = MessageTracker::new();
        let (p, _rx) = single();
        let id = tracker.track(p);
        tracker.abandon(id);
        assert!(tracker.fetch(id).is_none());
        assert!(tracker.is_abandoned(id));
        let (p2, _rx2) = single();
        assert_ne!(tracker.track(p2), id);
    }

    #[test]
    fn wraparound_skips_live_ids() {
        let mut tracker = MessageTracker::new();
        tracker.next_id = RequestId::MAX - 1;
        let (p1, _rx1) = single();
        let (p2, _rx2) = single();
        let (p3, _rx3) = single();
        assert_eq!(tracker.track(p1), RequestId::MAX);
        // wraps past the still-pending MAX back to the bottom of the domain
        assert_eq!(tracker.track(p2), 1);
        tracker.next_id = RequestId::MAX;
        assert_eq!(tracker.track(p3), 2);
    }

    #[test]
    fn purge_is_idempotent_and_clears() {
        let mut tracker = MessageTracker::new();
        let (p1, _rx1) = single();
        let (p2, _rx2) = single();
        let a = tracker.track(p1);
        tracker.track(p2);
        tracker.abandon(a);
        let mut seen = 0;
        tracker.purge(|_, _| seen += 1);
        assert_eq!(seen, 1);
        assert_eq!(tracker.pending(), 0);
        assert!(!tracker.is_abandoned(a));
        tracker.purge(|_, _| panic!("purge of an empty tracker ran the sink"));
    }
}
