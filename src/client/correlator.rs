//! Reply correlation
//!
//! Acks are matched to callers by request id. Count replies are matched by
//! request type: every caller waiting on a type is resolved by the first
//! `REQUEST-COUNT` for that type, whichever connection it arrived on.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

struct CountWaiter {
    id: u64,
    tx: oneshot::Sender<u32>,
}

/// One-shot listener tables shared by the client and its connections
#[derive(Default)]
pub(crate) struct Correlator {
    /// request id -> "limit reached" flag
    acks: DashMap<u64, oneshot::Sender<bool>>,
    counts: DashMap<String, Vec<CountWaiter>>,
    next_waiter: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_ack(&self, request_id: u64) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.acks.insert(request_id, tx);
        rx
    }

    /// Resolve the listener for `request_id`. Returns false if nobody is waiting.
    pub fn receive_ack(&self, request_id: u64, limit_reached: bool) -> bool {
        match self.acks.remove(&request_id) {
            Some((_, tx)) => tx.send(limit_reached).is_ok(),
            None => false,
        }
    }

    pub fn cancel_ack(&self, request_id: u64) {
        self.acks.remove(&request_id);
    }

    /// Join the waiters for `request_type`. The returned id is needed to cancel.
    pub fn expect_count(&self, request_type: &str) -> (u64, oneshot::Receiver<u32>) {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.counts
            .entry(request_type.to_string())
            .or_default()
            .push(CountWaiter { id, tx });
        (id, rx)
    }

    /// Fan a count out to every waiter of the type. Returns how many were resolved.
    pub fn receive_count(&self, request_type: &str, count: u32) -> usize {
        match self.counts.remove(request_type) {
            Some((_, waiters)) => waiters
                .into_iter()
                .filter_map(|waiter| waiter.tx.send(count).ok())
                .count(),
            None => 0,
        }
    }

    /// Drop one waiter without disturbing the others on the same type
    pub fn cancel_count(&self, request_type: &str, waiter_id: u64) {
        if let Some(mut waiters) = self.counts.get_mut(request_type) {
            waiters.retain(|waiter| waiter.id != waiter_id);
        }
        self.counts.remove_if(request_type, |_, waiters| waiters.is_empty());
    }

    /// Drop every listener; waiting callers see their channel close
    pub fn clear(&self) {
        self.acks.clear();
        self.counts.clear();
    }

    #[cfg(test)]
    fn waiting_on(&self, request_type: &str) -> usize {
        self.counts.get(request_type).map(|w| w.len()).unwrap_or(0)
    }
}
