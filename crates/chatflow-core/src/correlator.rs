//! Pairs requests sent on one connection with the responses that come back on it.
//!
//! The chat protocol carries no request id. The server answers every frame once and in
//! order, so pairing is first-in-first-out, refined by the `(userId, message)` fields a
//! success response echoes. Requests that timed out leave a tombstone in the queue so a
//! late answer is discarded instead of being credited to the next request.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::oneshot;

use crate::message::{ChatResponse, EchoKey};

/// Tombstones kept for requests that timed out; the oldest are forgotten past this.
const MAX_TOMBSTONES: usize = 1024;

#[derive(Debug)]
pub enum Resolution {
    Response {
        response: ChatResponse,
        received_at: Instant,
    },
    Malformed,
    ConnectionClosed,
}

/// Handle returned to the sender of a request.
#[derive(Debug)]
pub struct Ticket {
    pub id: u64,
    pub sent_at: Instant,
    pub rx: oneshot::Receiver<Resolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionClosed;

struct Entry {
    id: u64,
    key: EchoKey,
    /// `None` once the request timed out.
    slot: Option<oneshot::Sender<Resolution>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    queue: VecDeque<Entry>,
    /// Entries in `queue` whose slot is `None`.
    tombstones: usize,
    closed: bool,
    stale: u64,
}

impl Inner {
    fn remove(&mut self, idx: usize) -> Option<Entry> {
        let entry = self.queue.remove(idx)?;
        if entry.slot.is_none() {
            self.tombstones -= 1;
        }
        Some(entry)
    }

    /// Forget the oldest tombstone once more than `MAX_TOMBSTONES` are held.
    fn trim_tombstones(&mut self) {
        if self.tombstones <= MAX_TOMBSTONES {
            return;
        }
        if let Some(idx) = self.queue.iter().position(|e| e.slot.is_none()) {
            self.remove(idx);
        }
    }

    /// Drop every tombstone ahead of `idx`; returns the new index of that entry.
    fn purge_tombstones_before(&mut self, idx: usize) -> usize {
        let mut i = 0;
        let mut removed = 0;
        self.queue.retain(|e| {
            let keep = i >= idx || e.slot.is_some();
            if !keep {
                removed += 1;
            }
            i += 1;
            keep
        });
        self.tombstones -= removed;
        idx - removed
    }
}

#[derive(Default)]
pub struct Correlator {
    inner: Mutex<Inner>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound request. Fails once the connection has closed.
    pub fn register(&self, key: EchoKey) -> Result<Ticket, ConnectionClosed> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ConnectionClosed);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let (tx, rx) = oneshot::channel();
        inner.queue.push_back(Entry {
            id,
            key,
            slot: Some(tx),
        });
        Ok(Ticket {
            id,
            sent_at: Instant::now(),
            rx,
        })
    }

    /// Forget a request that never reached the wire.
    pub fn cancel(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.queue.iter().position(|e| e.id == id) {
            inner.remove(idx);
        }
    }

    /// Mark a request as timed out. Returns `true` if the timeout won; `false` means a
    /// resolution was already delivered and is waiting in the ticket's receiver.
    pub fn expire(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let won = match inner.queue.iter_mut().find(|e| e.id == id) {
            Some(entry) => entry.slot.take().is_some(),
            None => false,
        };
        if won {
            inner.tombstones += 1;
            inner.trim_tombstones();
        }
        won
    }

    /// Deliver a parsed response. Returns `false` when it matched no live request.
    pub fn resolve(&self, response: ChatResponse, received_at: Instant) -> bool {
        let mut inner = self.inner.lock();

        let idx = match response.echo_key() {
            Some(key) => match inner
                .queue
                .iter()
                .position(|e| e.slot.is_some() && e.key == key)
            {
                // Answers arrive in send order: nothing queued ahead of this
                // request is still going to be answered.
                Some(idx) => Some(inner.purge_tombstones_before(idx)),
                None => {
                    if let Some(t) = inner
                        .queue
                        .iter()
                        .position(|e| e.slot.is_none() && e.key == key)
                    {
                        inner.remove(t);
                    }
                    None
                }
            },
            None => match inner.queue.front() {
                Some(front) if front.slot.is_some() => Some(0),
                Some(_) => {
                    inner.remove(0);
                    None
                }
                None => None,
            },
        };

        match idx.and_then(|i| inner.remove(i)) {
            Some(entry) => {
                if let Some(slot) = entry.slot {
                    let _ = slot.send(Resolution::Response {
                        response,
                        received_at,
                    });
                }
                true
            }
            None => {
                inner.stale += 1;
                false
            }
        }
    }

    /// An inbound frame that could not be parsed answers the oldest outstanding request.
    pub fn resolve_malformed(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.remove(0) {
            Some(Entry {
                slot: Some(slot), ..
            }) => {
                let _ = slot.send(Resolution::Malformed);
                true
            }
            Some(_) | None => {
                inner.stale += 1;
                false
            }
        }
    }

    /// Resolve everything still outstanding as closed and refuse new requests.
    /// Returns how many live requests were resolved.
    pub fn close_all(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.tombstones = 0;
        let mut resolved = 0;
        for entry in inner.queue.drain(..) {
            if let Some(slot) = entry.slot {
                let _ = slot.send(Resolution::ConnectionClosed);
                resolved += 1;
            }
        }
        resolved
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .queue
            .iter()
            .filter(|e| e.slot.is_some())
            .count()
    }

    pub fn stale_responses(&self) -> u64 {
        self.inner.lock().stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(user_id: u32, message: &str) -> EchoKey {
        EchoKey {
            user_id,
            message: message.to_string(),
        }
    }

    fn echo(user_id: u32, message: &str) -> ChatResponse {
        ChatResponse {
            status: Some("success".to_string()),
            user_id: Some(user_id),
            message: Some(message.to_string()),
            ..ChatResponse::default()
        }
    }

    fn error_payload() -> ChatResponse {
        ChatResponse {
            status: Some("error".to_string()),
            errors: vec!["message is required".to_string()],
            ..ChatResponse::default()
        }
    }

    #[tokio::test]
    async fn test_response_resolves_ticket() {
        let correlator = Correlator::new();
        let ticket = correlator.register(key(1, "hi")).unwrap();
        assert_eq!(correlator.in_flight(), 1);

        assert!(correlator.resolve(echo(1, "hi"), Instant::now()));
        match ticket.rx.await.unwrap() {
            Resolution::Response { response, .. } => assert_eq!(response.user_id, Some(1)),
            other => panic!("unexpected resolution: {:?}", other),
        }
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_keyless_response_pairs_fifo() {
        let correlator = Correlator::new();
        let first = correlator.register(key(1, "a")).unwrap();
        let second = correlator.register(key(2, "b")).unwrap();

        assert!(correlator.resolve(error_payload(), Instant::now()));
        assert!(matches!(first.rx.await.unwrap(), Resolution::Response { .. }));
        assert_eq!(correlator.in_flight(), 1);
        drop(second);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_resolves_once() {
        let correlator = Correlator::new();
        let mut ticket = correlator.register(key(5, "late")).unwrap();

        assert!(correlator.expire(ticket.id));
        // Second expiry is a no-op.
        assert!(!correlator.expire(ticket.id));
        // The late echo is discarded rather than delivered.
        assert!(!correlator.resolve(echo(5, "late"), Instant::now()));
        assert_eq!(correlator.stale_responses(), 1);
        assert!(ticket.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_response_before_expire_wins() {
        let correlator = Correlator::new();
        let mut ticket = correlator.register(key(5, "quick")).unwrap();

        assert!(correlator.resolve(echo(5, "quick"), Instant::now()));
        assert!(!correlator.expire(ticket.id));
        assert!(matches!(
            ticket.rx.try_recv().unwrap(),
            Resolution::Response { .. }
        ));
    }

    #[tokio::test]
    async fn test_late_answer_not_credited_to_next_request() {
        let correlator = Correlator::new();
        let old = correlator.register(key(1, "old")).unwrap();
        assert!(correlator.expire(old.id));

        let next = correlator.register(key(2, "new")).unwrap();
        // Late keyless answer for the expired request hits its tombstone.
        assert!(!correlator.resolve(error_payload(), Instant::now()));
        assert_eq!(correlator.in_flight(), 1);

        assert!(correlator.resolve(echo(2, "new"), Instant::now()));
        assert!(matches!(next.rx.await.unwrap(), Resolution::Response { .. }));
    }

    #[tokio::test]
    async fn test_retry_answer_clears_older_tombstone() {
        let correlator = Correlator::new();
        let first = correlator.register(key(3, "again")).unwrap();
        assert!(correlator.expire(first.id));
        let retry = correlator.register(key(3, "again")).unwrap();

        assert!(correlator.resolve(echo(3, "again"), Instant::now()));
        assert!(matches!(retry.rx.await.unwrap(), Resolution::Response { .. }));

        // The second copy of the answer finds nothing left to claim.
        assert!(!correlator.resolve(echo(3, "again"), Instant::now()));
    }

    #[tokio::test]
    async fn test_answer_clears_unanswered_tombstones_ahead_of_it() {
        let correlator = Correlator::new();
        let a = correlator.register(key(1, "a")).unwrap();
        assert!(correlator.expire(a.id));
        let b = correlator.register(key(2, "b")).unwrap();
        assert!(correlator.resolve(echo(2, "b"), Instant::now()));
        assert!(matches!(b.rx.await.unwrap(), Resolution::Response { .. }));

        // A was never answered; the rejection for C must not be spent on it.
        let c = correlator.register(key(3, "")).unwrap();
        assert!(correlator.resolve(error_payload(), Instant::now()));
        match c.rx.await.unwrap() {
            Resolution::Response { response, .. } => assert!(!response.errors.is_empty()),
            other => panic!("unexpected resolution: {:?}", other),
        }
        assert_eq!(correlator.in_flight(), 0);
        assert_eq!(correlator.inner.lock().tombstones, 0);
    }

    #[test]
    fn test_tombstones_are_capped() {
        let correlator = Correlator::new();
        for i in 0..(MAX_TOMBSTONES as u32 + 50) {
            let ticket = correlator.register(key(i, "lost")).unwrap();
            assert!(correlator.expire(ticket.id));
        }
        let inner = correlator.inner.lock();
        assert_eq!(inner.tombstones, MAX_TOMBSTONES);
        assert_eq!(inner.queue.len(), MAX_TOMBSTONES);
        // The oldest were forgotten first.
        assert_eq!(inner.queue.front().map(|e| e.key.user_id), Some(50));
    }

    #[tokio::test]
    async fn test_close_all_resolves_pending() {
        let correlator = Correlator::new();
        let a = correlator.register(key(1, "a")).unwrap();
        let b = correlator.register(key(2, "b")).unwrap();
        assert!(correlator.expire(b.id));

        assert_eq!(correlator.close_all(), 1);
        assert!(matches!(a.rx.await.unwrap(), Resolution::ConnectionClosed));
        assert!(correlator.is_closed());
        assert_eq!(correlator.register(key(3, "c")).unwrap_err(), ConnectionClosed);
    }

    #[tokio::test]
    async fn test_malformed_resolves_oldest() {
        let correlator = Correlator::new();
        let ticket = correlator.register(key(1, "a")).unwrap();
        assert!(correlator.resolve_malformed());
        assert!(matches!(ticket.rx.await.unwrap(), Resolution::Malformed));
        assert!(!correlator.resolve_malformed());
    }

    #[tokio::test]
    async fn test_cancel_removes_entry() {
        let correlator = Correlator::new();
        let ticket = correlator.register(key(1, "a")).unwrap();
        correlator.cancel(ticket.id);
        assert_eq!(correlator.in_flight(), 0);
        assert!(!correlator.resolve(echo(1, "a"), Instant::now()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_timeout_and_response_race() {
        for round in 0..500u32 {
            let correlator = Arc::new(Correlator::new());
            let mut ticket = correlator.register(key(round, "race")).unwrap();
            let id = ticket.id;

            let responder = {
                let correlator = correlator.clone();
                tokio::spawn(async move { correlator.resolve(echo(round, "race"), Instant::now()) })
            };
            let expirer = {
                let correlator = correlator.clone();
                tokio::spawn(async move { correlator.expire(id) })
            };

            let delivered = responder.await.unwrap();
            let expired = expirer.await.unwrap();
            assert!(delivered ^ expired, "round {}: both or neither resolved", round);
            assert_eq!(ticket.rx.try_recv().is_ok(), delivered);
        }
    }
}
