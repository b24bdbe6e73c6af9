//! Serialized counter allocation.
//!
//! Requests queue locally in arrival order.  At most one acquire/increment
//! cycle runs at a time, always under the scope's cross-process lease, so ids
//! come out strictly increasing and gap-free no matter how many processes
//! share the scope.  A request may carry a write that runs with its id before
//! the lease is released, which orders those writes by id as well.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use super::lock::{Lock, LockEvent};
use crate::error::{Error, Result};
use crate::persistence::Persistence;
use crate::store::{expect_int, Batch};

/// Prefix of the lease key guarding a counter scope.
pub const LOCK_PREFIX: &str = "persistence_lock:/";

/// Completes one queued request with its id, or with the error that stopped
/// the allocation.  Runs while the lease is held.
type Waiter = Box<dyn FnOnce(Result<u64>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

#[derive(Default)]
struct Queue {
    waiters: VecDeque<Waiter>,
    processing: bool,
}

struct Inner {
    persistence: Arc<Persistence>,
    scope: String,
    expiry: Option<u64>,
    lock: Lock,
    queue: Mutex<Queue>,
}

/// FIFO allocator for one counter key.  Must be created inside a tokio
/// runtime.
pub struct IdGen {
    inner: Arc<Inner>,
}

impl IdGen {
    pub fn new(persistence: Arc<Persistence>, scope: impl Into<String>, expiry: Option<u64>) -> Self {
        let scope = scope.into();
        let lock = Lock::new(Arc::clone(&persistence), format!("{LOCK_PREFIX}{scope}"), None);
        let events = lock.subscribe();
        let inner = Arc::new(Inner {
            persistence,
            scope,
            expiry,
            lock,
            queue: Mutex::new(Queue::default()),
        });
        tokio::spawn(watch_lock(Arc::downgrade(&inner), events));
        Self { inner }
    }

    pub fn scope(&self) -> &str {
        &self.inner.scope
    }

    pub fn lock_scope(&self) -> &str {
        self.inner.lock.scope()
    }

    /// Queue a request for the next id.
    ///
    /// The request joins the queue before this returns, so the order of
    /// `alloc()` calls is the order ids are handed out, whenever the returned
    /// futures are awaited.
    pub fn alloc(&self) -> impl Future<Output = Result<u64>> + Send + 'static {
        self.alloc_with(|id| async move { Ok(id) })
    }

    /// Like [`IdGen::alloc`], but `write` runs with the new id before the
    /// lease is released.  Writes from successive requests never overlap and
    /// land in id order.  The write runs even if the returned future is
    /// dropped.
    pub fn alloc_with<F, Fut, T>(&self, write: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let waiter: Waiter = Box::new(move |id| {
            Box::pin(async move {
                let result = match id {
                    Ok(id) => write(id).await,
                    Err(e) => Err(e),
                };
                let _ = tx.send(result);
            })
        });
        self.inner.queue.lock().waiters.push_back(waiter);
        Inner::unblock(&self.inner);
        let scope = self.inner.scope.clone();
        async move {
            rx.await
                .unwrap_or_else(|_| Err(Error::Canceled(format!("id allocation for {scope}"))))
        }
    }

    /// Retry the queue head now, e.g. after a lease was cleared by hand.
    pub fn unblock(&self) {
        Inner::unblock(&self.inner);
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().waiters.len()
    }
}

/// Retry on every lease event until the allocator goes away.
async fn watch_lock(inner: Weak<Inner>, mut events: broadcast::Receiver<LockEvent>) {
    loop {
        match events.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
        let Some(inner) = inner.upgrade() else { break };
        Inner::unblock(&inner);
    }
}

impl Inner {
    fn unblock(this: &Arc<Self>) {
        {
            let mut queue = this.queue.lock();
            if queue.processing || queue.waiters.is_empty() {
                return;
            }
            queue.processing = true;
        }
        let this = Arc::clone(this);
        tokio::spawn(async move { this.advance().await });
    }

    async fn advance(self: Arc<Self>) {
        match self.lock.acquire().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(scope = %self.scope, "lease busy, waiting for lock event");
                self.queue.lock().processing = false;
                return;
            }
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "lease acquire failed");
                self.fail_head(e).await;
                self.queue.lock().processing = false;
                Self::unblock(&self);
                return;
            }
        }

        match self.increment().await {
            Ok(id) => {
                debug!(scope = %self.scope, id, "allocated");
                self.persistence.metrics().ids_allocated.inc();
                let waiter = self.queue.lock().waiters.pop_front();
                if let Some(waiter) = waiter {
                    waiter(Ok(id)).await;
                }
            }
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "counter increment failed");
                self.fail_head(e).await;
            }
        }

        // Requests queued during the release wait for it to finish.
        self.lock.release().await;
        self.queue.lock().processing = false;
        Self::unblock(&self);
    }

    async fn fail_head(&self, error: Error) {
        self.persistence.metrics().id_alloc_failures.inc();
        let waiter = self.queue.lock().waiters.pop_front();
        if let Some(waiter) = waiter {
            waiter(Err(error)).await;
        }
    }

    async fn increment(&self) -> Result<u64> {
        let mut batch = Batch::new();
        batch.incr(&self.scope);
        if let Some(expiry) = self.expiry {
            batch.expire(&self.scope, expiry);
        }
        let reply = self
            .persistence
            .redis()?
            .exec(batch)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::transport("INCR", "empty transaction reply"))?;
        let value = expect_int("INCR", reply)?;
        u64::try_from(value)
            .map_err(|_| Error::transport("INCR", format!("counter went negative: {value}")))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::persistence::test_support::{connected, settings};
    use crate::store::memory::Latency;

    #[tokio::test]
    async fn ids_are_monotonic_and_gap_free() {
        let (persistence, _) = connected(settings(false, false)).await;
        let id_gen = IdGen::new(persistence, "id_gen:/counter", None);
        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(id_gen.alloc().await.unwrap());
        }
        assert_eq!(ids, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_in_call_order() {
        let (persistence, _) = connected(settings(false, false)).await;
        let id_gen = IdGen::new(persistence, "id_gen:/fifo", None);

        let futures: Vec<_> = (0..8).map(|_| id_gen.alloc()).collect();
        let mut handles = Vec::new();
        for (i, fut) in futures.into_iter().enumerate().rev() {
            handles.push((i, tokio::spawn(fut)));
        }
        for (i, handle) in handles {
            assert_eq!(handle.await.unwrap().unwrap(), i as u64 + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn two_allocators_share_one_counter() {
        let (persistence, _) = connected(settings(false, false)).await;
        let a = IdGen::new(persistence.clone(), "id_gen:/shared", None);
        let b = IdGen::new(persistence, "id_gen:/shared", None);

        let futures: Vec<_> = (0..6)
            .map(|i| if i % 2 == 0 { a.alloc() } else { b.alloc() })
            .collect();
        let mut ids = Vec::new();
        for fut in futures {
            ids.push(tokio::time::timeout(Duration::from_secs(60), fut).await.unwrap().unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=6).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn counter_expiry_is_refreshed() {
        let (persistence, _) = connected(settings(false, false)).await;
        let id_gen = IdGen::new(persistence.clone(), "id_gen:/expiring", Some(300));
        assert_eq!(id_gen.alloc().await.unwrap(), 1);
        let ttl = persistence.ttl("id_gen:/expiring").await.unwrap();
        assert!(ttl > 0 && ttl <= 300);
    }

    #[tokio::test]
    async fn failed_increment_reaches_head_and_queue_moves_on() {
        let (persistence, connector) = connected(settings(false, false)).await;
        let id_gen = IdGen::new(persistence, "id_gen:/flaky", None);

        connector.primary().fail_command("INCRBY");
        let first = id_gen.alloc().await;
        assert!(matches!(first, Err(Error::Transport { .. })));
        assert!(!connector.primary().exists("persistence_lock:/id_gen:/flaky"));

        connector.primary().clear_failures();
        assert_eq!(id_gen.alloc().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transport_error_on_acquire_fails_every_queued_request() {
        let (persistence, connector) = connected(settings(false, false)).await;
        let id_gen = IdGen::new(persistence, "id_gen:/down", None);

        connector.primary().fail_command("SET");
        let a = id_gen.alloc();
        let b = id_gen.alloc();
        assert!(a.await.is_err());
        assert!(b.await.is_err());
        assert_eq!(id_gen.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn held_lease_is_retried_after_expiry() {
        let (persistence, connector) = connected(settings(false, false)).await;
        let foreign = Lock::new(persistence.clone(), "persistence_lock:/id_gen:/busy", Some(10));
        assert!(foreign.acquire().await.unwrap());

        let id_gen = IdGen::new(persistence, "id_gen:/busy", None);
        let pending = tokio::spawn(id_gen.alloc());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!pending.is_finished());
        assert!(connector.primary().exists("persistence_lock:/id_gen:/busy"));

        // Foreign lease lapses at 10s; the local timer armed by the failed
        // acquire fires at the same point and drives a retry.
        let id = tokio::time::timeout(Duration::from_secs(30), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_queued_during_release_is_served_at_once() {
        let (persistence, connector) = connected(settings(false, false)).await;
        connector.primary().set_latency("SET", Latency::Reply(Duration::from_millis(50)));
        connector.primary().set_latency("DEL", Latency::Request(Duration::from_millis(10)));
        let id_gen = Arc::new(IdGen::new(persistence, "id_gen:/slow", None));
        let started = tokio::time::Instant::now();

        let first = id_gen.alloc();
        // Lands while the first cycle's DEL is in flight.
        let late = tokio::spawn({
            let id_gen = Arc::clone(&id_gen);
            async move {
                tokio::time::sleep(Duration::from_millis(55)).await;
                id_gen.alloc().await
            }
        });

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(late.await.unwrap().unwrap(), 2);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn writes_run_under_the_lease_in_id_order() {
        let (persistence, connector) = connected(settings(false, false)).await;
        let id_gen = IdGen::new(persistence, "id_gen:/writes", None);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let pending: Vec<_> = (0..5)
            .map(|_| {
                let seen = Arc::clone(&seen);
                let backend = Arc::clone(connector.primary());
                id_gen.alloc_with(move |id| async move {
                    assert!(backend.exists("persistence_lock:/id_gen:/writes"));
                    tokio::task::yield_now().await;
                    seen.lock().push(id);
                    Ok(id * 10)
                })
            })
            .collect();
        let mut results = Vec::new();
        for fut in pending.into_iter().rev() {
            results.push(fut.await.unwrap());
        }

        assert_eq!(results, vec![50, 40, 30, 20, 10]);
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
        assert!(!connector.primary().exists("persistence_lock:/id_gen:/writes"));
    }

    #[tokio::test]
    async fn failed_write_reaches_its_request_only() {
        let (persistence, _) = connected(settings(false, false)).await;
        let id_gen = IdGen::new(persistence, "id_gen:/partial", None);

        let failing = id_gen.alloc_with(|id| async move {
            Err::<u64, _>(Error::InvalidEntry(format!("rejected {id}")))
        });
        let next = id_gen.alloc();
        assert!(matches!(failing.await, Err(Error::InvalidEntry(_))));
        assert_eq!(next.await.unwrap(), 2);
    }
}
