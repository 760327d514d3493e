//! # Lifetime Guard
//!
//! Purpose: Count the asynchronous tasks working on behalf of an owner so the
//! owner can wait until none of them can touch its state any more.
//!
//! ## Usage Notes
//!
//! - Every spawned task takes a [`Lease`] and keeps it for as long as it may
//!   run. Dropping the lease (normal exit or abort) releases it.
//! - [`LifetimeGuard::retire`] marks the owner dead and resolves once the
//!   last lease is gone. Tasks that wake up late check [`Lease::is_alive`]
//!   and do nothing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug)]
struct GuardState {
    alive: AtomicBool,
    leases: AtomicUsize,
    released: Notify,
}

/// Shared lease counter for one owner.
#[derive(Debug, Clone)]
pub struct LifetimeGuard {
    state: Arc<GuardState>,
}

impl LifetimeGuard {
    /// Creates a live guard with no leases.
    pub fn new() -> Self {
        LifetimeGuard {
            state: Arc::new(GuardState {
                alive: AtomicBool::new(true),
                leases: AtomicUsize::new(0),
                released: Notify::new(),
            }),
        }
    }

    /// Takes a lease that keeps `retire` waiting until it is dropped.
    pub fn lease(&self) -> Lease {
        self.state.leases.fetch_add(1, Ordering::AcqRel);
        Lease {
            state: self.state.clone(),
        }
    }

    /// Returns false once `retire` has been called.
    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::Acquire)
    }

    /// Number of leases not yet dropped.
    pub fn outstanding(&self) -> usize {
        self.state.leases.load(Ordering::Acquire)
    }

    /// Marks the owner dead and waits until every lease is dropped.
    pub async fn retire(&self) {
        self.state.alive.store(false, Ordering::Release);
        loop {
            let released = self.state.released.notified();
            tokio::pin!(released);
            // Register before checking the count so a concurrent release
            // cannot slip between the check and the wait.
            released.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            released.await;
        }
    }
}

impl Default for LifetimeGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Counted handle held by a task working for the guard's owner.
#[derive(Debug)]
pub struct Lease {
    state: Arc<GuardState>,
}

impl Lease {
    /// Returns false once the owner started retiring.
    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::Acquire)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.state.leases.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.released.notify_waiters();
        }
    }
}
