//! Handles for in-flight asynchronous transfers.
//!
//! The teacher crate models an in-flight transfer as a boxed `futures` 0.1 future
//! (`src/memory/transfer.rs`'s `BoxFuture`). This crate has no async runtime to drive such a
//! future, so a `SyncToken` is instead a plain `Arc`'d handle around a `Mutex`/`Condvar` pair —
//! the same "something that will finish later and can be waited on" contract, built from `std`
//! alone.

use std::sync::{Arc, Mutex, MutexGuard, Condvar};

use crate::error::{Error, ErrorKind, Result};
use crate::manager::{AccessRef, ContextDataManager};

/// One outcome a [`SyncToken`] can settle on.
type Outcome = Option<std::result::Result<(), ErrorKind>>;

struct TokenInner {
    outcome: Mutex<Outcome>,
    condvar: Condvar,
    // Accesses this token has taken ownership of releasing once it settles. See `attach`.
    deferred: Mutex<Vec<DeferredRelease>>,
}

struct DeferredRelease {
    manager: Arc<ContextDataManager>,
    access: AccessRef,
}

/// Handle for an in-flight asynchronous transfer or computation.
///
/// States are `Pending` and `Done`; the transition is one-way and monotonic. A token produced
/// synchronously (there was nothing to wait for) is already `Done` at construction.
#[derive(Clone)]
pub struct SyncToken {
    inner: Arc<TokenInner>,
}

impl SyncToken {
    /// A token that is already `Done`. Used by the degenerate synchronous path — e.g. a blocking
    /// `Memory::copy` that completed before returning.
    pub fn done() -> SyncToken {
        SyncToken {
            inner: Arc::new(TokenInner {
                outcome: Mutex::new(Some(Ok(()))),
                condvar: Condvar::new(),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A token representing work that has not finished yet. The caller is responsible for
    /// eventually calling [`complete`](SyncToken::complete) or [`fail`](SyncToken::fail).
    pub fn pending() -> SyncToken {
        SyncToken {
            inner: Arc::new(TokenInner {
                outcome: Mutex::new(None),
                condvar: Condvar::new(),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Transitions the token to `Done` successfully, running any deferred releases registered
    /// via [`attach`](SyncToken::attach).
    pub fn complete(&self) {
        self.settle(Ok(()));
    }

    /// Transitions the token to `Done` with a failure, running any deferred releases.
    pub fn fail(&self, kind: ErrorKind) {
        self.settle(Err(kind));
    }

    fn settle(&self, outcome: std::result::Result<(), ErrorKind>) {
        {
            let mut guard = self.inner.outcome.lock().expect("sync token poisoned");

            if guard.is_some() {
                // Already settled; transitions are one-way.
                return;
            }

            *guard = Some(outcome);
        }

        self.inner.condvar.notify_all();

        let deferred = std::mem::take(&mut *self.inner.deferred.lock().expect("sync token poisoned"));
        for release in deferred {
            release.manager.release(release.access);
        }
    }

    /// Blocks the calling thread until the token is `Done`, returning the transfer's outcome.
    pub fn wait(&self) -> Result {
        let mut guard: MutexGuard<Outcome> = self.inner.outcome.lock().expect("sync token poisoned");

        while guard.is_none() {
            guard = self.inner.condvar.wait(guard).expect("sync token poisoned");
        }

        match guard.expect("checked above") {
            Ok(()) => Ok(()),
            Err(kind) => Err(Error::from(kind)),
        }
    }

    /// Non-blocking query: `true` once the token has settled (successfully or not).
    pub fn probe(&self) -> bool {
        self.inner.outcome.lock().expect("sync token poisoned").is_some()
    }

    /// `true` iff `self` and `other` are clones of the same token.
    ///
    /// Used by `ContextDataManager::finish_transfer` to recognize a transfer that settled after
    /// its slot was already invalidated/repurposed by someone else — the slot's `pending` field
    /// no longer names this token, so its outcome no longer applies.
    pub(crate) fn is(&self, other: &SyncToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The token assumes responsibility for releasing `access` once it transitions to `Done`.
    ///
    /// This models an asynchronous kernel that produced output into a write-locked slot: the
    /// caller hands the write access to the token instead of dropping it immediately, and the
    /// token releases it for them when the kernel's work actually finishes.
    pub fn attach(&self, manager: Arc<ContextDataManager>, access: AccessRef) {
        let mut guard = self.inner.outcome.lock().expect("sync token poisoned");

        if guard.is_some() {
            // Already done — release immediately rather than leaking the access.
            drop(guard);
            manager.release(access);
            return;
        }

        // Keep the lock ordering consistent: outcome is still held while we push, so a
        // concurrent `settle` cannot run the deferred list out from under us.
        self.inner.deferred.lock().expect("sync token poisoned").push(DeferredRelease { manager, access });
        drop(guard);
    }
}
