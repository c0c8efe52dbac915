//! Pending synchronous requests awaiting their reply.
//!
//! ```text
//! send_synch:
//!   1. next_id() -> CorrelationId
//!   2. register(id) -> PendingSlot (owns the map entry)
//!   3. enqueue Request frame
//!   4. await slot
//!
//! reader task:
//!   Reply frame -> complete(id, payload)
//!
//! disconnect / failure:
//!   fail_all(Closed)
//! ```
//!
//! Dropping a [`PendingSlot`] removes its entry, so a caller whose future is
//! cancelled (timeout, `select!`) never leaks a slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ConnectionError;

use super::frame::CorrelationId;

type ReplySender = oneshot::Sender<Result<Vec<u8>, ConnectionError>>;

/// Map of correlation ID to reply channel.
#[derive(Debug)]
pub(crate) struct PendingRequests {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, ReplySender>>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl PendingRequests {
    /// Next correlation ID; monotonically increasing from 1.
    pub(crate) fn next_id(&self) -> CorrelationId {
        CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a pending request.
    pub(crate) fn register(&self, id: CorrelationId) -> PendingSlot<'_> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        PendingSlot {
            requests: self,
            id,
            receiver: rx,
        }
    }

    /// Complete a pending request. Returns false for unknown or already
    /// completed IDs.
    pub(crate) fn complete(&self, id: CorrelationId, result: Result<Vec<u8>, ConnectionError>) -> bool {
        let Some(sender) = self.pending.lock().remove(&id) else {
            debug!(correlation = %id, "reply for unknown request");
            return false;
        };
        // The waiter may have given up already.
        let _ = sender.send(result);
        true
    }

    /// Fail every pending request with `error`.
    pub(crate) fn fail_all(&self, error: ConnectionError) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, sender) in drained {
            let _ = sender.send(Err(error.clone()));
        }
    }

    /// Number of requests still waiting.
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Owns one pending entry until the reply arrives or the slot is dropped.
pub(crate) struct PendingSlot<'a> {
    requests: &'a PendingRequests,
    id: CorrelationId,
    receiver: oneshot::Receiver<Result<Vec<u8>, ConnectionError>>,
}

impl PendingSlot<'_> {
    /// Wait for the reply.
    pub(crate) async fn wait(&mut self) -> Result<Vec<u8>, ConnectionError> {
        match (&mut self.receiver).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Closed),
        }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.requests.pending.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increase() {
        let requests = PendingRequests::default();
        let a = requests.next_id();
        let b = requests.next_id();
        assert_eq!(a.value(), 1);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_complete_delivers_reply() {
        let requests = PendingRequests::default();
        let id = requests.next_id();
        let mut slot = requests.register(id);
        assert!(requests.complete(id, Ok(b"ok".to_vec())));
        assert_eq!(slot.wait().await.unwrap(), b"ok");
    }

    #[test]
    fn test_double_completion_ignored() {
        let requests = PendingRequests::default();
        let id = requests.next_id();
        let _slot = requests.register(id);
        assert!(requests.complete(id, Ok(vec![])));
        assert!(!requests.complete(id, Ok(vec![])));
    }

    #[test]
    fn test_dropped_slot_releases_entry() {
        let requests = PendingRequests::default();
        let id = requests.next_id();
        let slot = requests.register(id);
        assert_eq!(requests.len(), 1);
        drop(slot);
        assert_eq!(requests.len(), 0);
        assert!(!requests.complete(id, Ok(vec![])));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let requests = PendingRequests::default();
        let mut a = requests.register(requests.next_id());
        let mut b = requests.register(requests.next_id());
        requests.fail_all(ConnectionError::Closed);
        assert_eq!(a.wait().await, Err(ConnectionError::Closed));
        assert_eq!(b.wait().await, Err(ConnectionError::Closed));
        assert_eq!(requests.len(), 0);
    }
}
