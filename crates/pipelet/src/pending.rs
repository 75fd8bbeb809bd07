//! Pending-call table - outstanding outbound calls awaiting a response.
//!
//! Each entry owns a oneshot sender and its own timeout task. Every settlement
//! path (response, timeout, shutdown) starts by removing the entry from the map,
//! so whichever path removes it first is the only one that settles it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::CallError;

pub type CallResult = Result<Value, CallError>;

struct PendingCall {
    created_at: Instant,
    settle: oneshot::Sender<CallResult>,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn settle(self, result: CallResult) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // Receiver gone means the caller stopped waiting; nothing to do.
        let _ = self.settle.send(result);
    }
}

/// Future returned for a registered call. Resolves exactly once.
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<CallResult>,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingReply {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(CallError::ChannelClosed)))
    }
}

pub struct PendingCalls {
    next_id: AtomicU64,
    calls: DashMap<u64, PendingCall>,
    timeout: Duration,
}

impl PendingCalls {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            calls: DashMap::new(),
            timeout,
        }
    }

    /// Allocate a fresh correlation id, insert the entry and arm its timer.
    ///
    /// Must be called within a Tokio runtime.
    pub fn register(self: &Arc<Self>) -> PendingReply {
        let (tx, rx) = oneshot::channel();

        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = self.calls.entry(id) {
                slot.insert(PendingCall {
                    created_at: Instant::now(),
                    settle: tx,
                    timer: None,
                });
                break id;
            }
        };

        let table = Arc::downgrade(self);
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire(id);
            }
        });

        // The timer may already have fired for a zero timeout; then the entry is gone.
        if let Some(mut entry) = self.calls.get_mut(&id) {
            entry.timer = Some(timer.abort_handle());
        }

        tracing::trace!(id, "Registered pending call");
        PendingReply { id, rx }
    }

    /// Settle a call with the peer's result. Returns false for unknown or already-settled ids.
    pub fn resolve(&self, id: u64, result: Value) -> bool {
        match self.calls.remove(&id) {
            Some((_, call)) => {
                tracing::trace!(
                    id,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "Resolved pending call"
                );
                call.settle(Ok(result));
                true
            }
            None => false,
        }
    }

    /// Drop a call whose request never made it onto the wire.
    pub fn cancel(&self, id: u64) {
        if let Some((_, call)) = self.calls.remove(&id)
            && let Some(timer) = call.timer
        {
            timer.abort();
        }
    }

    fn expire(&self, id: u64) {
        if let Some((_, call)) = self.calls.remove(&id) {
            let after = call.created_at.elapsed();
            tracing::warn!(id, elapsed_ms = after.as_millis() as u64, "Request timed out");
            // Our own task is the timer; nothing left to abort.
            let _ = call.settle.send(Err(CallError::Timeout { id, after }));
        }
    }

    /// Reject every outstanding call with `ChannelClosed`. Returns how many were rejected.
    pub fn reject_all(&self) -> usize {
        let ids: Vec<u64> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                call.settle(Err(CallError::ChannelClosed));
                rejected += 1;
            }
        }
        rejected
    }

    #[cfg(test)]
    fn contains(&self, id: u64) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(timeout_ms: u64) -> Arc<PendingCalls> {
        Arc::new(PendingCalls::new(Duration::from_millis(timeout_ms)))
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_unique() {
        let pending = table(1000);

        let a = pending.register();
        let b = pending.register();
        let c = pending.register();

        assert_eq!((a.id(), b.id(), c.id()), (1, 2, 3));
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn resolve_settles_and_removes() {
        let pending = table(1000);
        let reply = pending.register();
        let id = reply.id();

        assert!(pending.resolve(id, json!(42)));
        assert!(!pending.contains(id));
        assert_eq!(reply.await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn second_resolve_is_a_no_op() {
        let pending = table(1000);
        let reply = pending.register();
        let id = reply.id();

        assert!(pending.resolve(id, json!("first")));
        assert!(!pending.resolve(id, json!("second")));
        assert_eq!(reply.await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn times_out_without_response() {
        let pending = table(50);
        let started = Instant::now();
        let reply = pending.register();
        let id = reply.id();

        let err = reply.await.unwrap_err();
        assert!(matches!(err, CallError::Timeout { id: got, .. } if got == id));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_discarded() {
        let pending = table(20);
        let reply = pending.register();
        let id = reply.id();

        assert!(reply.await.is_err());
        assert!(!pending.resolve(id, json!(1)));
    }

    #[tokio::test]
    async fn timer_after_resolve_does_not_resettle() {
        let pending = table(20);
        let reply = pending.register();
        let id = reply.id();

        pending.resolve(id, json!("ok"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(reply.await.unwrap(), json!("ok"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn reject_all_closes_outstanding_calls() {
        let pending = table(1000);
        let a = pending.register();
        let b = pending.register();

        assert_eq!(pending.reject_all(), 2);
        assert!(matches!(a.await, Err(CallError::ChannelClosed)));
        assert!(matches!(b.await, Err(CallError::ChannelClosed)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn cancel_removes_entry() {
        let pending = table(1000);
        let reply = pending.register();

        pending.cancel(reply.id());

        assert!(pending.is_empty());
        assert!(matches!(reply.await, Err(CallError::ChannelClosed)));
    }
}
