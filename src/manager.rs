//! The `ContextDataManager`: a table of [`Slot`]s for one logical array, driving allocation,
//! transfer, validity invalidation and locking.
//!
//! Grounded on the teacher's `src/api/tensor/shared.rs` `SharedTensor`, which keeps a
//! `LinearMap<Context, Memory>` plus a `HashSet` of "up to date" locations and walks it linearly
//! on every access to find or create a copy. This module generalizes that shape with the proper
//! read/write locking protocol the teacher's tensor never implemented (its own copy tracking has
//! no notion of an outstanding access at all).

use std::sync::{Arc, Mutex};

use linear_map::LinearMap;

use crate::context::{Context, ContextKind};
use crate::context_data::Slot;
use crate::error::{ErrorKind, Result};
use crate::memory::RawBlockHandle;
use crate::sync_token::SyncToken;

/// Identity of a slot within one manager: the context's `(kind, index)` pair.
pub(crate) type SlotKey = (ContextKind, u32);

fn key_of(ctx: &Arc<Context>) -> SlotKey {
    (ctx.kind(), ctx.index())
}

/// Which kind of access an [`AccessRef`] was granted for, and therefore what `release` does with
/// it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AccessKind {
    Read,
    Write,
}

/// A manager-level handle produced by `acquire_read`/`acquire_write`.
///
/// Bare and `Copy`-free by design: it carries just enough to find its slot again and to hand a
/// raw pointer up to `TypedArray`'s typed `ReadAccess`/`WriteAccess` wrappers, which are
/// responsible for the actual RAII release-on-drop behavior.
pub struct AccessRef {
    pub(crate) key: SlotKey,
    pub(crate) kind: AccessKind,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the pointer is only ever dereferenced by the `TypedArray` access wrapper that owns this
// `AccessRef`, under the locking discipline the manager itself enforces; moving the handle
// between threads (e.g. into a `SyncToken`'s deferred-release list) does not race with that.
unsafe impl Send for AccessRef {}

impl AccessRef {
    /// Raw pointer to the start of the accessed slot's bytes.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Mutable raw pointer to the start of the accessed slot's bytes. Only meaningful for a
    /// write access; a read access's `TypedArray` wrapper never exposes a mutable view of it.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Length in bytes the caller may access.
    pub fn len(&self) -> usize {
        self.len
    }
}

struct Inner {
    slots: LinearMap<SlotKey, Slot>,
}

/// Table of [`Slot`]s for one logical array.
///
/// Owned exclusively by one [`TypedArray`](crate::typed_array::TypedArray); wrapped in an `Arc`
/// so asynchronous transfers (`prefetch`) and [`SyncToken`] deferred releases can reach back into
/// it after the call that started them has returned.
pub struct ContextDataManager {
    inner: Mutex<Inner>,
}

impl ContextDataManager {
    pub fn new() -> ContextDataManager {
        ContextDataManager { inner: Mutex::new(Inner { slots: LinearMap::new() }) }
    }

    fn ensure_slot(&self, guard: &mut Inner, key: SlotKey, ctx: &Arc<Context>) {
        if !guard.slots.contains_key(&key) {
            guard.slots.insert(key, Slot::empty(ctx.clone()));
        }
    }

    fn any_write_locked(guard: &Inner) -> bool {
        guard.slots.values().any(Slot::is_write_locked)
    }

    fn any_outstanding(guard: &Inner) -> bool {
        guard.slots.values().any(|s| s.is_write_locked() || s.read_count > 0)
    }

    fn pick_source(guard: &Inner, exclude: SlotKey) -> Option<SlotKey> {
        guard.slots.iter().find(|(k, s)| **k != exclude && s.is_valid()).map(|(k, _)| *k)
    }

    /// Records a transfer's outcome on the slot it was filling: clears `pending`, and marks the
    /// slot valid iff the transfer succeeded.
    ///
    /// No-ops if the slot's `pending` no longer names `token` — a concurrent write acquisition
    /// (or `clear`/`resize`) can invalidate or free a slot while its transfer is still settling,
    /// and that transfer's outcome must not resurrect the slot out from under whoever did that.
    fn finish_transfer(&self, key: SlotKey, token: &SyncToken, outcome: &Result<()>) {
        let mut guard = self.inner.lock().expect("manager poisoned");
        if let Some(slot) = guard.slots.get_mut(&key) {
            if slot.pending.as_ref().map_or(false, |p| p.is(token)) {
                slot.pending = None;
                slot.set_valid(outcome.is_ok());
            }
        }
    }

    /// `acquire_read(ctx) → AccessRef` (spec.md §4.3).
    pub fn acquire_read(&self, ctx: &Arc<Context>, logical_bytes: usize) -> Result<AccessRef> {
        let key = key_of(ctx);

        loop {
            let pending = {
                let mut guard = self.inner.lock().expect("manager poisoned");

                if Self::any_write_locked(&guard) {
                    return Err(ErrorKind::ArrayBusy.into());
                }

                self.ensure_slot(&mut guard, key, ctx);

                let slot = guard.slots.get_mut(&key).unwrap();

                if let Some(token) = slot.pending.clone() {
                    Some(token)
                } else if slot.is_valid() {
                    slot.read_count += 1;
                    return Ok(AccessRef { key, kind: AccessKind::Read, ptr: slot.block.as_mut_ptr(), len: logical_bytes });
                } else if logical_bytes == 0 {
                    slot.set_valid(true);
                    slot.read_count += 1;
                    return Ok(AccessRef { key, kind: AccessKind::Read, ptr: slot.block.as_mut_ptr(), len: 0 });
                } else {
                    None
                }
            };

            if let Some(token) = pending {
                let outcome = token.wait();
                self.finish_transfer(key, &token, &outcome);
                outcome?;
                continue;
            }

            // Nobody else is filling this slot; we start the transfer ourselves.
            let started = {
                let mut guard = self.inner.lock().expect("manager poisoned");

                // Re-check: another thread may have raced us between the block above and here.
                let slot = guard.slots.get(&key).unwrap();
                if slot.is_valid() || slot.pending.is_some() {
                    None
                } else {
                    let source_key = match Self::pick_source(&guard, key) {
                        Some(k) => k,
                        None => return Err(ErrorKind::NoValidSource.into()),
                    };

                    if let Err(e) = guard.slots.get_mut(&key).unwrap().reserve(logical_bytes) {
                        return Err(e);
                    }

                    let token = SyncToken::pending();
                    guard.slots.get_mut(&key).unwrap().attach_token(token.clone());

                    let dst = RawBlockHandle::of(&guard.slots.get(&key).unwrap().block);
                    let src = RawBlockHandle::of(&guard.slots.get(&source_key).unwrap().block);
                    let memory_ctx = guard.slots.get(&key).unwrap().context.clone();

                    Some((token, dst, src, memory_ctx))
                }
            };

            if let Some((token, dst, src, memory_ctx)) = started {
                let outcome = memory_ctx.memory().copy_blocking(dst, src, logical_bytes);
                match &outcome {
                    Ok(()) => token.complete(),
                    Err(e) => token.fail(e.kind()),
                }
                self.finish_transfer(key, &token, &outcome);
                outcome?;
            }

            // Either we just filled it, or a racing thread already did/failed to; loop around
            // to re-evaluate from the top.
        }
    }

    /// `acquire_write(ctx, keep) → AccessRef` (spec.md §4.3).
    ///
    /// When `keep` is set, the destination slot is first brought up to date exactly like a read
    /// acquisition (including joining/starting a transfer with the manager's metadata lock
    /// released). The write lock itself is only granted once, in the same critical section that
    /// re-checks validity — if a racing writer invalidated the slot again in between, this loops
    /// and re-joins rather than silently handing out a write access over stale "kept" bytes.
    ///
    /// Before invalidating every other slot, this joins (waits out) any of them that still has a
    /// pending transfer — otherwise a `prefetch` racing us could settle just after we clear
    /// `VALID` and mark the slot valid again with bytes from before this write. `finish_transfer`
    /// also refuses to validate a slot whose `pending` no longer names the settling token, so even
    /// a transfer that settles in the gap between the join and the invalidation loop below cannot
    /// resurrect it.
    pub fn acquire_write(&self, ctx: &Arc<Context>, keep: bool, logical_bytes: usize) -> Result<AccessRef> {
        let key = key_of(ctx);

        loop {
            if keep {
                let already_valid = {
                    let guard = self.inner.lock().expect("manager poisoned");
                    guard.slots.get(&key).map_or(false, Slot::is_valid)
                };

                if !already_valid {
                    let read = self.acquire_read(ctx, logical_bytes)?;
                    self.release(read);
                }
            }

            let mut guard = self.inner.lock().expect("manager poisoned");

            if Self::any_outstanding(&guard) {
                return Err(ErrorKind::ArrayBusy.into());
            }

            self.ensure_slot(&mut guard, key, ctx);

            if keep && !guard.slots.get(&key).unwrap().is_valid() {
                drop(guard);
                continue;
            }

            let others_pending: Vec<SyncToken> = guard.slots.iter()
                .filter(|(k, _)| **k != key)
                .filter_map(|(_, s)| s.pending.clone())
                .collect();

            if !others_pending.is_empty() {
                drop(guard);
                for token in others_pending {
                    let _ = token.wait();
                }
                continue;
            }

            if let Err(e) = guard.slots.get_mut(&key).unwrap().reserve(logical_bytes) {
                return Err(e);
            }

            let other_keys: Vec<SlotKey> = guard.slots.keys().filter(|k| **k != key).cloned().collect();
            for other in other_keys {
                let slot = guard.slots.get_mut(&other).unwrap();
                slot.pending = None;
                slot.set_valid(false);
            }

            let slot = guard.slots.get_mut(&key).unwrap();
            slot.set_write_locked(true);

            return Ok(AccessRef { key, kind: AccessKind::Write, ptr: slot.block.as_mut_ptr(), len: logical_bytes });
        }
    }

    /// `release(access_ref)` (spec.md §4.3).
    pub fn release(&self, access: AccessRef) {
        let mut guard = self.inner.lock().expect("manager poisoned");

        if let Some(slot) = guard.slots.get_mut(&access.key) {
            match access.kind {
                AccessKind::Read => {
                    slot.read_count = slot.read_count.saturating_sub(1);
                }
                AccessKind::Write => {
                    slot.set_write_locked(false);
                    slot.set_valid(true);
                }
            }
        }
    }

    /// `prefetch(ctx) → SyncToken` (spec.md §4.3).
    ///
    /// Non-blocking: starts (or joins) an asynchronous transfer into `ctx`'s slot and returns
    /// immediately. Two prefetches racing for the same destination share one transfer — the
    /// second observes `pending` already set and returns a clone of the same token — but
    /// prefetches to *different* destinations that both read from the same valid, untouched
    /// source proceed concurrently: the source is read-only for the duration, so nothing guards
    /// it beyond its own `valid` flag staying `true`.
    pub fn prefetch(self: Arc<Self>, ctx: &Arc<Context>, logical_bytes: usize) -> Result<SyncToken> {
        let key = key_of(ctx);
        let mut guard = self.inner.lock().expect("manager poisoned");

        self.ensure_slot(&mut guard, key, ctx);
        let slot = guard.slots.get_mut(&key).unwrap();

        if let Some(token) = slot.pending.clone() {
            return Ok(token);
        }

        if slot.is_valid() {
            return Ok(SyncToken::done());
        }

        if logical_bytes == 0 {
            slot.set_valid(true);
            return Ok(SyncToken::done());
        }

        let source_key = match Self::pick_source(&guard, key) {
            Some(k) => k,
            None => return Err(ErrorKind::NoValidSource.into()),
        };

        guard.slots.get_mut(&key).unwrap().reserve(logical_bytes)?;

        let token = SyncToken::pending();
        guard.slots.get_mut(&key).unwrap().attach_token(token.clone());

        let dst = RawBlockHandle::of(&guard.slots.get(&key).unwrap().block);
        let src = RawBlockHandle::of(&guard.slots.get(&source_key).unwrap().block);
        let memory_ctx = guard.slots.get(&key).unwrap().context.clone();

        drop(guard);

        let manager = Arc::clone(&self);
        let done = token.clone();
        std::thread::spawn(move || {
            let outcome = memory_ctx.memory().copy_blocking(dst, src, logical_bytes);
            match &outcome {
                Ok(()) => done.complete(),
                Err(e) => done.fail(e.kind()),
            }
            manager.finish_transfer(key, &done, &outcome);
        });

        Ok(token)
    }

    /// `resize(new_bytes, old_bytes)` (spec.md §4.3). Requires no outstanding access.
    ///
    /// A resize to zero bytes is routed through `clear()` rather than duplicating its logic —
    /// spec.md §8 requires `resize(0)` and `clear()` to leave the array in the same state
    /// (`valid_context(None) == None`), and a shrink that only grows/no-ops slot capacity (as the
    /// non-zero path below does) never clears validity, so the two would otherwise drift apart.
    pub fn resize(&self, new_bytes: usize, _old_bytes: usize) -> Result {
        if new_bytes == 0 {
            return self.clear();
        }

        let mut guard = self.inner.lock().expect("manager poisoned");

        if Self::any_outstanding(&guard) {
            return Err(ErrorKind::ArrayBusy.into());
        }

        for slot in guard.slots.values_mut() {
            if slot.is_valid() {
                slot.reserve(new_bytes)?;
            }
        }

        Ok(())
    }

    /// Frees every slot's block and returns the array to the empty state. Requires no
    /// outstanding access (spec's Open Question: `clear()` while a handle is live is
    /// `ArrayBusy`, not a silent invalidation of a live pointer).
    ///
    /// Also joins any slot with a pending transfer before freeing it — a background `prefetch`
    /// still holds a raw pointer into that block via `RawBlockHandle` and is actively writing
    /// through it, so freeing it first would be a use-after-free from the transfer's side.
    pub fn clear(&self) -> Result {
        loop {
            let mut guard = self.inner.lock().expect("manager poisoned");

            if Self::any_outstanding(&guard) {
                return Err(ErrorKind::ArrayBusy.into());
            }

            let pending: Vec<SyncToken> = guard.slots.values().filter_map(|s| s.pending.clone()).collect();

            if pending.is_empty() {
                for slot in guard.slots.values_mut() {
                    slot.free();
                }
                return Ok(());
            }

            drop(guard);
            for token in pending {
                let _ = token.wait();
            }
        }
    }

    /// `valid_context(preferred_kind) → Context?` (spec.md §4.3).
    pub fn valid_context(&self, preferred: Option<ContextKind>) -> Option<Arc<Context>> {
        let guard = self.inner.lock().expect("manager poisoned");

        if let Some(kind) = preferred {
            if let Some((_, slot)) = guard.slots.iter().find(|(k, s)| k.0 == kind && s.is_valid()) {
                return Some(slot.context.clone());
            }
        }

        guard.slots.values().find(|s| s.is_valid()).map(|s| s.context.clone())
    }

    /// `is_valid(ctx) → bool`.
    pub fn is_valid(&self, ctx: &Arc<Context>) -> bool {
        let guard = self.inner.lock().expect("manager poisoned");
        guard.slots.get(&key_of(ctx)).map_or(false, Slot::is_valid)
    }

    /// `capacity(ctx) → bytes`.
    pub fn capacity(&self, ctx: &Arc<Context>) -> usize {
        let guard = self.inner.lock().expect("manager poisoned");
        guard.slots.get(&key_of(ctx)).map_or(0, Slot::capacity)
    }
}

impl Default for ContextDataManager {
    fn default() -> ContextDataManager {
        ContextDataManager::new()
    }
}

impl Drop for ContextDataManager {
    /// Frees every slot's block. `TypedArray` never frees its slots itself (only `clear`,
    /// `resize(0, _)` and this do), so without this every array that goes out of scope without an
    /// explicit `clear()` call first — the common case — would leak.
    ///
    /// Dropping with a live `Access` outstanding is a programming error (spec.md §5) and panics
    /// rather than being tolerated silently. A live `prefetch`, unlike a live `Access`, is joined
    /// rather than rejected: nothing holds a reference to a dropping manager except that
    /// prefetch's own background thread (which keeps its own `Arc` clone alive), so waiting it out
    /// here is the only party left who can.
    fn drop(&mut self) {
        loop {
            let mut guard = self.inner.lock().expect("manager poisoned");

            assert!(
                !Self::any_outstanding(&guard),
                "ContextDataManager dropped while a read or write access was still outstanding"
            );

            let pending: Vec<SyncToken> = guard.slots.values().filter_map(|s| s.pending.clone()).collect();

            if pending.is_empty() {
                for slot in guard.slots.values_mut() {
                    slot.free();
                }
                return;
            }

            drop(guard);
            for token in pending {
                let _ = token.wait();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::{current_context, host, ContextKind};

    #[test]
    fn read_on_empty_array_is_a_no_op() {
        let manager = ContextDataManager::new();
        let access = manager.acquire_read(&host(), 0).unwrap();
        assert_eq!(access.len(), 0);
        manager.release(access);
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let manager = ContextDataManager::new();
        let ctx = host();

        let write = manager.acquire_write(&ctx, false, 4).unwrap();
        unsafe { std::ptr::write_bytes(write.as_mut_ptr(), 9, 4) };
        manager.release(write);

        let read = manager.acquire_read(&ctx, 4).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(read.as_ptr(), 4) };
        assert_eq!(bytes, &[9u8; 4]);
        manager.release(read);
    }

    #[test]
    fn read_migrates_to_a_second_context_and_both_stay_valid() {
        let manager = ContextDataManager::new();
        let host_ctx = host();
        let accel_ctx = current_context(ContextKind::Accel(0), 0);

        let write = manager.acquire_write(&host_ctx, false, 4).unwrap();
        unsafe { std::ptr::write_bytes(write.as_mut_ptr(), 3, 4) };
        manager.release(write);

        let read = manager.acquire_read(&accel_ctx, 4).unwrap();
        manager.release(read);

        assert!(manager.is_valid(&host_ctx));
        assert!(manager.is_valid(&accel_ctx));
    }

    #[test]
    fn write_invalidates_other_slots() {
        let manager = ContextDataManager::new();
        let host_ctx = host();
        let accel_ctx = current_context(ContextKind::Accel(1), 0);

        let write = manager.acquire_write(&host_ctx, false, 4).unwrap();
        manager.release(write);
        let read = manager.acquire_read(&accel_ctx, 4).unwrap();
        manager.release(read);
        assert!(manager.is_valid(&host_ctx));

        let write2 = manager.acquire_write(&accel_ctx, true, 4).unwrap();
        manager.release(write2);

        assert!(!manager.is_valid(&host_ctx));
        assert!(manager.is_valid(&accel_ctx));
    }

    #[test]
    fn concurrent_write_attempt_is_busy() {
        let manager = ContextDataManager::new();
        let ctx = host();

        let write = manager.acquire_write(&ctx, false, 4).unwrap();
        let err = manager.acquire_read(&ctx, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArrayBusy);
        manager.release(write);
    }

    #[test]
    fn reading_a_never_written_array_fails_with_no_valid_source() {
        let manager = ContextDataManager::new();
        let err = manager.acquire_read(&host(), 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoValidSource);
    }

    #[test]
    fn resize_preserves_leading_bytes_on_every_valid_slot() {
        let manager = ContextDataManager::new();
        let ctx = host();

        let write = manager.acquire_write(&ctx, false, 4).unwrap();
        unsafe { std::ptr::write_bytes(write.as_mut_ptr(), 5, 4) };
        manager.release(write);

        manager.resize(8, 4).unwrap();
        assert!(manager.capacity(&ctx) >= 8);

        let read = manager.acquire_read(&ctx, 4).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(read.as_ptr(), 4) };
        assert_eq!(bytes, &[5u8; 4]);
        manager.release(read);
    }

    #[test]
    fn clear_while_access_outstanding_is_busy() {
        let manager = ContextDataManager::new();
        let ctx = host();
        let write = manager.acquire_write(&ctx, false, 4).unwrap();
        let err = manager.clear().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArrayBusy);
        manager.release(write);
    }

    #[test]
    fn resize_to_zero_behaves_like_clear() {
        let manager = ContextDataManager::new();
        let ctx = host();

        let write = manager.acquire_write(&ctx, false, 4).unwrap();
        manager.release(write);

        manager.resize(0, 4).unwrap();

        assert!(!manager.is_valid(&ctx));
        assert_eq!(manager.capacity(&ctx), 0);
    }

    #[test]
    #[should_panic(expected = "outstanding")]
    fn dropping_with_outstanding_access_panics() {
        let manager = ContextDataManager::new();
        let _write = manager.acquire_write(&host(), false, 4).unwrap();
        drop(manager);
    }

    #[test]
    fn dropping_frees_every_slot_without_an_explicit_clear() {
        let manager = ContextDataManager::new();
        let ctx = host();
        let accel = current_context(ContextKind::Accel(4), 0);

        let write = manager.acquire_write(&ctx, false, 4).unwrap();
        manager.release(write);
        let read = manager.acquire_read(&accel, 4).unwrap();
        manager.release(read);

        // Dropping without calling `clear()` first must not panic or leak: `Drop` frees both
        // slots' blocks on its own.
        drop(manager);
    }

    #[test]
    fn two_prefetches_to_different_destinations_both_complete() {
        let manager = Arc::new(ContextDataManager::new());
        let host_ctx = host();
        let a = current_context(ContextKind::Accel(2), 0);
        let b = current_context(ContextKind::Accel(3), 0);

        let write = manager.acquire_write(&host_ctx, false, 4).unwrap();
        manager.release(write);

        let t1 = manager.prefetch(&a, 4).unwrap();
        let t2 = manager.prefetch(&b, 4).unwrap();
        t1.wait().unwrap();
        t2.wait().unwrap();

        assert!(manager.is_valid(&a));
        assert!(manager.is_valid(&b));
    }
}
