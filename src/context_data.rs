//! The slot: one copy of an array's bytes, living in one [`Memory`], plus its validity and lock
//! state.
//!
//! Exposed only through [`ContextDataManager`](crate::manager::ContextDataManager) — every field
//! here is private to the crate; external callers only ever see a
//! [`crate::manager::AccessRef`].

use std::sync::Arc;

use bitflags::bitflags;

use crate::context::Context;
use crate::error::Result;
use crate::memory::Block;
use crate::sync_token::SyncToken;

bitflags! {
    /// Per-slot validity/lock flags.
    ///
    /// `WRITE_LOCKED` and `VALID` are never set together for longer than the duration of a
    /// `release` call: a write access clears `VALID` on acquisition and sets it again (alone)
    /// once the access is released.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct SlotFlags: u8 {
        /// The slot's bytes equal the array's authoritative contents.
        const VALID = 0b01;
        /// Exactly one outstanding write access holds this slot.
        const WRITE_LOCKED = 0b10;
    }
}

/// One copy of an array's bytes in one [`Memory`].
pub(crate) struct Slot {
    pub(crate) context: Arc<Context>,
    pub(crate) block: Block,
    pub(crate) flags: SlotFlags,
    pub(crate) read_count: usize,
    /// Set while an asynchronous transfer is filling this slot (the `PendingIn` state).
    /// The slot is not `valid` while this is `Some`.
    pub(crate) pending: Option<SyncToken>,
}

impl Slot {
    pub(crate) fn empty(context: Arc<Context>) -> Slot {
        Slot {
            context,
            block: Block::empty(),
            flags: SlotFlags::empty(),
            read_count: 0,
            pending: None,
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.flags.contains(SlotFlags::VALID)
    }

    pub(crate) fn is_write_locked(&self) -> bool {
        self.flags.contains(SlotFlags::WRITE_LOCKED)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.block.capacity()
    }

    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.flags.set(SlotFlags::VALID, valid);
    }

    pub(crate) fn set_write_locked(&mut self, locked: bool) {
        self.flags.set(SlotFlags::WRITE_LOCKED, locked);
    }

    /// Grows the slot's block to at least `n_bytes`. On failure the slot is left exactly as it
    /// was (spec.md §4.3 "Failure semantics": "the slot stays in its prior state").
    pub(crate) fn reserve(&mut self, n_bytes: usize) -> Result {
        if self.capacity() >= n_bytes {
            return Ok(());
        }

        if self.capacity() == 0 {
            self.block = self.context.memory().allocate(n_bytes)?;
        } else {
            self.context.memory().reallocate(&mut self.block, n_bytes)?;
        }

        Ok(())
    }

    /// Releases the slot's block and clears validity.
    pub(crate) fn free(&mut self) {
        let block = std::mem::replace(&mut self.block, Block::empty());
        self.context.memory().free(block);
        self.flags = SlotFlags::empty();
    }

    /// Records a pending asynchronous transfer filling this slot. The manager joins it (and
    /// clears it) the next time this slot is acquired — see `ContextDataManager::finish_transfer`.
    pub(crate) fn attach_token(&mut self, token: SyncToken) {
        self.pending = Some(token);
    }
}
