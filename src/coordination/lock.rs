//! Lease-based mutual exclusion over a single store key.
//!
//! Whether the lease is held is never tracked locally: the key's presence in
//! the store is the only authority.  A failed [`Lock::acquire`] arms a local
//! timer matching the lease TTL which emits [`LockEvent::Expired`], so that an
//! owner blocked on the lease can retry without polling the store.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::node;
use crate::error::Result;
use crate::metrics::LockOutcome;
use crate::persistence::Persistence;
use crate::store::StoreExt;

/// Lease length when none is given.
pub const DEFAULT_LEASE_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    /// The local timer armed by a failed acquire fired; the holder's lease has
    /// probably lapsed.
    Expired,
    /// `release()` ran.
    Released,
}

pub struct Lock {
    persistence: Arc<Persistence>,
    scope: String,
    ttl_secs: u64,
    events: broadcast::Sender<LockEvent>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Lock {
    pub fn new(persistence: Arc<Persistence>, scope: impl Into<String>, ttl_secs: Option<u64>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            persistence,
            scope: scope.into(),
            ttl_secs: ttl_secs.unwrap_or(DEFAULT_LEASE_SECS),
            events,
            timer: Mutex::new(None),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Observe `Expired` / `Released`.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    /// `SET scope holder EX ttl NX`.  `Ok(false)` means someone else holds the
    /// lease; that is contention, not an error.
    pub async fn acquire(&self) -> Result<bool> {
        self.cancel_timer();
        let holder = node::lease_holder(self.persistence.node_id());
        let acquired = self
            .persistence
            .redis()?
            .set_nx_ex(&self.scope, &holder, self.ttl_secs)
            .await?;

        let metrics = self.persistence.metrics();
        if acquired {
            metrics.lock_event(LockOutcome::Acquired);
        } else {
            metrics.lock_event(LockOutcome::Contended);
            self.arm_timer();
        }
        debug!(scope = %self.scope, acquired, "acquire");
        Ok(acquired)
    }

    /// Delete the lease key, then emit `Released`.  A failed delete is logged
    /// and not retried; the key then lapses with its TTL.  Returns whether the
    /// delete went through.
    pub async fn release(&self) -> bool {
        let deleted = match self.persistence.redis() {
            Ok(store) => store.del(&self.scope).await,
            Err(e) => Err(e),
        };
        self.cancel_timer();
        self.persistence.metrics().lock_event(LockOutcome::Released);
        let _ = self.events.send(LockEvent::Released);

        match deleted {
            Ok(_) => {
                debug!(scope = %self.scope, "released");
                true
            }
            Err(e) => {
                error!(scope = %self.scope, error = %e, "lease release failed");
                false
            }
        }
    }

    fn arm_timer(&self) {
        let mut timer = self.timer.lock();
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let events = self.events.clone();
        let metrics = Arc::clone(&self.persistence.metrics_registry().metrics);
        let scope = self.scope.clone();
        let ttl = Duration::from_secs(self.ttl_secs);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            metrics.lock_event(LockOutcome::Expired);
            debug!(%scope, "lease presumed expired");
            let _ = events.send(LockEvent::Expired);
        }));
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
