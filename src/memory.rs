//! Provides a unified representation of memory across different frameworks.
//!
//! A [`Memory`] is the allocator living inside a [`Context`](crate::context::Context). It only
//! ever produces and moves raw [`Block`]s for its own context; orchestrating a transfer between
//! two different contexts is the [`ContextDataManager`](crate::manager::ContextDataManager)'s
//! job, not `Memory`'s — exactly as spec'd: "a Memory only allocates blocks usable by its
//! Context; cross-Context transfer is orchestrated by the ContextDataManager, not by Memory."
//!
//! Real backends (CUDA, OpenCL) are out of scope for this crate (spec.md §1 Non-goals: "device
//! backends"); every `MemoryKind` here is backed by the host heap via `libc`, which is enough to
//! exercise the full coherence protocol — the manager does not care *how* a `Memory` moves bytes,
//! only that it does.

use std::ptr;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::sync_token::SyncToken;

/// General categories describing how a [`Memory`] is reachable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Ordinary host RAM.
    Host,
    /// Memory local to an accelerator.
    Device,
    /// Host RAM pinned/page-locked for fast DMA transfers.
    PinnedHost,
    /// Memory reachable from both host and device without an explicit copy.
    Managed,
}

/// A raw allocation handed out by a [`Memory`].
///
/// `Block` is intentionally bare: a pointer and a capacity, with no notion of the element type
/// stored inside it. The [`ContextData`](crate::context_data::Slot) slot that owns a `Block` is
/// what tracks validity and locking.
#[derive(Debug)]
pub struct Block {
    ptr: *mut u8,
    capacity: usize,
}

// SAFETY: a `Block` is only ever mutated through the owning `ContextDataManager`, which
// serializes all access to it behind its slot's lock flags; moving the raw pointer between
// threads to run a background transfer is sound as long as that discipline holds.
unsafe impl Send for Block {}

impl Block {
    /// An allocation of zero bytes — never dereferenced.
    pub fn empty() -> Block {
        Block { ptr: ptr::null_mut(), capacity: 0 }
    }

    /// The allocation's capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw pointer to the start of the allocation.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Mutable raw pointer to the start of the allocation.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }
}

/// An allocator living inside one [`Context`](crate::context::Context).
#[derive(Debug)]
pub struct Memory {
    kind: MemoryKind,
}

impl Memory {
    pub(crate) fn new(kind: MemoryKind) -> Memory {
        Memory { kind }
    }

    /// The reachability category of this memory.
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Declares whether a direct transfer from `other` into this memory is supported.
    ///
    /// Every `MemoryKind` in this crate is host-heap backed (see the module docs), so a direct
    /// transfer is always possible; a real device backend would answer `false` for
    /// cross-framework pairs, forcing the manager to stage the transfer through `Host`.
    pub fn can_copy_from(&self, _other: &Memory) -> bool {
        true
    }

    /// Allocates `n_bytes`, zero-initialized.
    pub fn allocate(&self, n_bytes: usize) -> Result<Block> {
        if n_bytes == 0 {
            return Ok(Block::empty());
        }

        let ptr = unsafe { libc::calloc(n_bytes, 1) } as *mut u8;

        if ptr.is_null() {
            return Err(ErrorKind::OutOfMemory.into());
        }

        Ok(Block { ptr, capacity: n_bytes })
    }

    /// Releases a block allocated by this memory.
    pub fn free(&self, block: Block) {
        if !block.ptr.is_null() {
            unsafe { libc::free(block.ptr as *mut libc::c_void) };
        }
    }

    /// Grows `block` to at least `n_bytes`, preserving its first `min(old, new)` bytes.
    pub fn reallocate(&self, block: &mut Block, n_bytes: usize) -> Result {
        if n_bytes <= block.capacity {
            return Ok(());
        }

        let new_ptr = unsafe { libc::realloc(block.ptr as *mut libc::c_void, n_bytes) } as *mut u8;

        if new_ptr.is_null() {
            return Err(ErrorKind::OutOfMemory.into());
        }

        // realloc does not zero the grown tail.
        unsafe {
            let tail = new_ptr.add(block.capacity);
            ptr::write_bytes(tail, 0, n_bytes - block.capacity);
        }

        block.ptr = new_ptr;
        block.capacity = n_bytes;

        Ok(())
    }

    /// Blocking copy of `n_bytes` from `src` into `dst`.
    pub fn copy(&self, dst: &mut Block, src: &Block, n_bytes: usize) -> Result {
        copy_bytes(RawBlockHandle::of(dst), RawBlockHandle::of(src), n_bytes)
    }

    /// Blocking copy of `n_bytes` between two raw handles, for callers (the manager) that have
    /// already released the slot-table lock and are holding only raw addresses.
    pub fn copy_blocking(&self, dst: RawBlockHandle, src: RawBlockHandle, n_bytes: usize) -> Result {
        copy_bytes(dst, src, n_bytes)
    }

    /// Schedules an asynchronous copy of `n_bytes` from `src` into `dst` on a background
    /// thread, returning a [`SyncToken`] that completes when the copy finishes.
    ///
    /// `dst` and `src` must remain valid and exclusively owned by the caller for the duration of
    /// the transfer; the manager enforces this via its slot lock flags before calling here.
    pub fn copy_async(&self, dst: RawBlockHandle, src: RawBlockHandle, n_bytes: usize) -> SyncToken {
        let token = SyncToken::pending();
        let done = token.clone();

        std::thread::spawn(move || {
            match copy_bytes(dst, src, n_bytes) {
                Ok(()) => done.complete(),
                Err(e) => done.fail(e.kind()),
            }
        });

        token
    }
}

fn copy_bytes(dst: RawBlockHandle, src: RawBlockHandle, n_bytes: usize) -> Result {
    if n_bytes == 0 {
        return Ok(());
    }

    if n_bytes > dst.capacity || n_bytes > src.capacity {
        return Err(Error::new(ErrorKind::TransferFailed, "copy length exceeds block capacity"));
    }

    unsafe {
        ptr::copy_nonoverlapping(src.ptr, dst.ptr, n_bytes);
    }

    Ok(())
}

/// A `Send`-able view of a [`Block`]'s raw pointer and capacity, used to hand a block's address
/// across the thread boundary for [`Memory::copy_async`] without moving (and thus invalidating)
/// the owning slot's `Block`.
#[derive(Clone, Copy)]
pub struct RawBlockHandle {
    ptr: *mut u8,
    capacity: usize,
}

unsafe impl Send for RawBlockHandle {}

impl RawBlockHandle {
    pub fn of(block: &Block) -> RawBlockHandle {
        RawBlockHandle { ptr: block.ptr, capacity: block.capacity }
    }
}

/// A reference-counted handle to a context's default memory, used where a slot needs to keep its
/// owning memory alive independent of the context registry's lifetime.
pub type SharedMemory = Arc<Memory>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_and_copy_roundtrip() {
        let mem = Memory::new(MemoryKind::Host);
        let mut dst = mem.allocate(8).unwrap();
        let src = mem.allocate(8).unwrap();

        unsafe {
            ptr::write_bytes(src.ptr, 7u8, 8);
        }

        mem.copy(&mut dst, &src, 8).unwrap();

        unsafe {
            let s = std::slice::from_raw_parts(dst.ptr, 8);
            assert_eq!(s, &[7u8; 8]);
        }

        mem.free(dst);
        mem.free(src);
    }

    #[test]
    fn zero_length_allocate_is_empty() {
        let mem = Memory::new(MemoryKind::Host);
        let block = mem.allocate(0).unwrap();
        assert_eq!(block.capacity(), 0);
    }
}
