//! `TypedArray`: a thin value-typed facade over a [`ContextDataManager`], plus the scoped
//! [`ReadAccess`]/[`WriteAccess`] handles it hands out.
//!
//! Grounded on the teacher's `src/shared/tensor.rs` `SharedTensor::read`/`read_write`/
//! `write_only` lifetime-extension trio: that code reaches for `unsafe { mem::transmute }` to
//! stretch a borrow of `&self`-owned memory to the lifetime the caller wants, then leans on the
//! container never dropping or moving an entry while any tensor handle is alive. This module
//! keeps that idea (the pointer a handle exposes is valid for as long as the handle exists) but
//! replaces the ad hoc transmute with an explicit RAII guard: a `ReadAccess`/`WriteAccess` owns
//! an `Arc<ContextDataManager>` and the `AccessRef` it was granted, and its `Drop` is the only
//! way the underlying lock is released (spec.md §9, "Scoped access objects").

use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::context::{Context, ContextKind};
use crate::error::{ErrorKind, Result};
use crate::manager::{AccessRef, ContextDataManager};
use crate::sync_token::SyncToken;

/// A value-typed, multi-context coherent array.
///
/// Non-generic over its element type: element width is a runtime quantity, so that generic code
/// (the [`Factory`](crate::factory::Factory)) can hand out a `TypedArray` for a type it only
/// knows as a runtime tag. `read`/`write` are the generic entry points that recover `T`.
pub struct TypedArray {
    element_width: usize,
    read_only: bool,
    size: AtomicUsize,
    manager: Arc<ContextDataManager>,
}

impl TypedArray {
    /// Allocates an array of `n` elements of `element_width` bytes each, with no context holding
    /// valid data yet.
    pub fn new(n: usize, element_width: usize) -> TypedArray {
        TypedArray {
            element_width,
            read_only: false,
            size: AtomicUsize::new(n),
            manager: Arc::new(ContextDataManager::new()),
        }
    }

    /// Allocates an array of `n` elements of `element_width` bytes each and immediately seeds it
    /// with `initial_data`, making `home` the array's sole valid context.
    pub fn with_data(n: usize, element_width: usize, initial_data: &[u8], home: &Arc<Context>) -> Result<TypedArray> {
        let array = TypedArray::new(n, element_width);

        if initial_data.len() != n * element_width {
            return Err(ErrorKind::SizeMismatch.into());
        }

        let access = array.manager.acquire_write(home, false, initial_data.len())?;
        if !initial_data.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(initial_data.as_ptr(), access.as_mut_ptr(), initial_data.len());
            }
        }
        array.manager.release(access);

        Ok(array)
    }

    /// Marks this array read-only: subsequent `write` calls panic rather than silently
    /// succeeding. Used by collaborators that hand out a `TypedArray` view over data the caller
    /// must not mutate (e.g. a constant operand).
    pub fn into_read_only(mut self) -> TypedArray {
        self.read_only = true;
        self
    }

    /// The number of elements currently allocated.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// The width, in bytes, of one element.
    pub fn element_width(&self) -> usize {
        self.element_width
    }

    fn logical_bytes(&self) -> usize {
        self.size() * self.element_width
    }

    /// Grows or shrinks the array to `n` elements, preserving leading bytes on every
    /// currently-valid slot (spec.md §4.3 `resize`). `resize(0)` is exactly [`clear`](Self::clear)
    /// (spec.md §8): it frees every slot rather than leaving an empty-but-still-valid one behind.
    pub fn resize(&self, n: usize) -> Result {
        let old_bytes = self.logical_bytes();
        let new_bytes = n * self.element_width;
        self.manager.resize(new_bytes, old_bytes)?;
        self.size.store(n, Ordering::SeqCst);
        Ok(())
    }

    /// Equivalent to `resize(0)`: frees every slot's block and leaves the array empty.
    pub fn clear(&self) -> Result {
        self.manager.clear()?;
        self.size.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Starts (or joins) a non-blocking transfer into `ctx`'s slot.
    pub fn prefetch(&self, ctx: &Arc<Context>) -> Result<SyncToken> {
        Arc::clone(&self.manager).prefetch(ctx, self.logical_bytes())
    }

    /// Returns a context that currently holds valid data, preferring `preferred` if given.
    pub fn valid_context(&self, preferred: Option<ContextKind>) -> Option<Arc<Context>> {
        self.manager.valid_context(preferred)
    }

    /// Whether `ctx`'s slot currently holds valid data.
    pub fn is_valid(&self, ctx: &Arc<Context>) -> bool {
        self.manager.is_valid(ctx)
    }

    /// The byte capacity currently reserved for `ctx`'s slot (`0` if none has been allocated).
    pub fn capacity(&self, ctx: &Arc<Context>) -> usize {
        self.manager.capacity(ctx)
    }

    /// Acquires a scoped read access to this array's data at `ctx`, viewed as `[T]`.
    ///
    /// `size_of::<T>()` must equal `element_width()`; a mismatch is a caller bug, surfaced as
    /// `SizeMismatch` rather than silently reinterpreting the bytes.
    pub fn read<T>(&self, ctx: &Arc<Context>) -> Result<ReadAccess<T>> {
        if size_of::<T>() != self.element_width {
            return Err(ErrorKind::SizeMismatch.into());
        }

        let access = self.manager.acquire_read(ctx, self.logical_bytes())?;
        Ok(ReadAccess { manager: Arc::clone(&self.manager), access: Some(access), _marker: PhantomData })
    }

    /// Acquires a scoped write access to this array's data at `ctx`, viewed as `[T]`.
    ///
    /// `keep` mirrors spec.md §4.3: when set, the destination is first brought up to date with
    /// the array's current contents before the write lock is granted.
    pub fn write<T>(&self, ctx: &Arc<Context>, keep: bool) -> Result<WriteAccess<T>> {
        assert!(!self.read_only, "write access requested on a read-only array");

        if size_of::<T>() != self.element_width {
            return Err(ErrorKind::SizeMismatch.into());
        }

        let access = self.manager.acquire_write(ctx, keep, self.logical_bytes())?;
        Ok(WriteAccess { manager: Arc::clone(&self.manager), access: Some(access), _marker: PhantomData })
    }
}

/// A scoped read-only view of a [`TypedArray`]'s data at one context.
///
/// Releasing the manager's read lock happens exactly once, on `Drop`; there is no other way to
/// release it, so a lock leak is unrepresentable.
pub struct ReadAccess<T> {
    manager: Arc<ContextDataManager>,
    access: Option<AccessRef>,
    _marker: PhantomData<T>,
}

impl<T> ReadAccess<T> {
    fn len(&self) -> usize {
        self.access.as_ref().map_or(0, |a| a.len() / size_of::<T>())
    }

    /// The accessed data as a typed slice.
    pub fn as_slice(&self) -> &[T] {
        match &self.access {
            Some(access) => unsafe { std::slice::from_raw_parts(access.as_ptr() as *const T, self.len()) },
            None => &[],
        }
    }
}

impl<T> Deref for ReadAccess<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> Drop for ReadAccess<T> {
    fn drop(&mut self) {
        if let Some(access) = self.access.take() {
            self.manager.release(access);
        }
    }
}

/// A scoped read-write view of a [`TypedArray`]'s data at one context.
///
/// On `Drop`, the manager validates the accessed slot and invalidates every other slot — the
/// caller may have written any content, so the array ends up with exactly one authoritative
/// copy, exactly as spec.md §4.3's write-release postcondition requires.
pub struct WriteAccess<T> {
    manager: Arc<ContextDataManager>,
    access: Option<AccessRef>,
    _marker: PhantomData<T>,
}

impl<T> WriteAccess<T> {
    fn len(&self) -> usize {
        self.access.as_ref().map_or(0, |a| a.len() / size_of::<T>())
    }

    /// The accessed data as a typed slice.
    pub fn as_slice(&self) -> &[T] {
        match &self.access {
            Some(access) => unsafe { std::slice::from_raw_parts(access.as_ptr() as *const T, self.len()) },
            None => &[],
        }
    }

    /// The accessed data as a mutable typed slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.len();
        match &mut self.access {
            Some(access) => unsafe { std::slice::from_raw_parts_mut(access.as_mut_ptr() as *mut T, len) },
            None => &mut [],
        }
    }

    /// Hands this access's release off to `token`: the manager's write lock is released (and the
    /// slot validated) only once `token` transitions to `Done`, instead of immediately on drop.
    ///
    /// Models an asynchronous kernel that writes into the accessed slot on another thread.
    pub fn defer_release_to(mut self, token: &SyncToken) {
        if let Some(access) = self.access.take() {
            token.attach(Arc::clone(&self.manager), access);
        }
    }
}

impl<T> Deref for WriteAccess<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> DerefMut for WriteAccess<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T> Drop for WriteAccess<T> {
    fn drop(&mut self) {
        if let Some(access) = self.access.take() {
            self.manager.release(access);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::{current_context, host, ContextKind};

    #[test]
    fn s1_host_only_round_trip() {
        let data: [f64; 4] = [1.0, 2.0, 3.0, 4.0];
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, 4 * 8) };
        let array = TypedArray::with_data(4, 8, bytes, &host()).unwrap();

        {
            let read = array.read::<f64>(&host()).unwrap();
            assert_eq!(&*read, &[1.0, 2.0, 3.0, 4.0]);
        }

        {
            let mut write = array.write::<f64>(&host(), true).unwrap();
            write[2] = 9.0;
        }

        let read = array.read::<f64>(&host()).unwrap();
        assert_eq!(&*read, &[1.0, 2.0, 9.0, 4.0]);
    }

    #[test]
    fn s2_lazy_migration() {
        let data: [f64; 4] = [1.0, 2.0, 3.0, 4.0];
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, 4 * 8) };
        let array = TypedArray::with_data(4, 8, bytes, &host()).unwrap();

        let accel = current_context(ContextKind::Accel(0), 0);
        {
            let read = array.read::<f64>(&accel).unwrap();
            assert_eq!(&*read, &[1.0, 2.0, 3.0, 4.0]);
        }

        assert!(array.is_valid(&host()));
        assert!(array.is_valid(&accel));
    }

    #[test]
    fn s3_write_invalidates_other_copies() {
        let data: [f64; 4] = [1.0, 2.0, 3.0, 4.0];
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, 4 * 8) };
        let array = TypedArray::with_data(4, 8, bytes, &host()).unwrap();

        let accel = current_context(ContextKind::Accel(1), 0);
        {
            let read = array.read::<f64>(&accel).unwrap();
            drop(read);
        }

        {
            let mut write = array.write::<f64>(&accel, true).unwrap();
            write[0] = -1.0;
        }

        assert!(!array.is_valid(&host()));
        assert!(array.is_valid(&accel));

        let read = array.read::<f64>(&host()).unwrap();
        assert_eq!(&*read, &[-1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn s4_busy_detection() {
        let array = TypedArray::new(4, 8);
        let write = array.write::<f64>(&host(), false).unwrap();

        let err = array.write::<f64>(&host(), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArrayBusy);

        drop(write);
    }

    #[test]
    fn s5_resize_preserves_valid_contents() {
        let data: [f64; 4] = [1.0, 2.0, 3.0, 4.0];
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, 4 * 8) };
        let array = TypedArray::with_data(4, 8, bytes, &host()).unwrap();

        let accel = current_context(ContextKind::Accel(2), 0);
        {
            let read = array.read::<f64>(&accel).unwrap();
            drop(read);
        }

        array.resize(6).unwrap();
        assert_eq!(array.size(), 6);

        let read = array.read::<f64>(&host()).unwrap();
        assert_eq!(&read[..4], &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn clear_resets_size_and_valid_context() {
        let array = TypedArray::with_data(4, 8, &[0u8; 32], &host()).unwrap();
        array.clear().unwrap();
        assert_eq!(array.size(), 0);
        assert!(array.valid_context(None).is_none());
    }

    #[test]
    fn resize_to_zero_is_equivalent_to_clear() {
        let array = TypedArray::with_data(4, 8, &[0u8; 32], &host()).unwrap();
        array.resize(0).unwrap();
        assert_eq!(array.size(), 0);
        assert!(array.valid_context(None).is_none());
        assert_eq!(array.capacity(&host()), 0);
    }

    #[test]
    fn dropping_without_clear_does_not_panic() {
        let array = TypedArray::with_data(4, 8, &[0u8; 32], &host()).unwrap();
        drop(array);
    }

    #[test]
    fn size_mismatch_on_wrong_element_type() {
        let array = TypedArray::new(4, 8);
        let err = array.read::<f32>(&host()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeMismatch);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn write_on_read_only_array_panics() {
        let array = TypedArray::new(4, 8).into_read_only();
        let _ = array.write::<f64>(&host(), false);
    }
}
