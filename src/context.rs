//! Contexts identify a memory/compute space — the host, or one accelerator.
//!
//! A `Context` is the only thing that can hand out a [`Memory`](crate::memory::Memory) for its
//! space, and two `Context`s are equal iff their `(kind, index)` pair is equal. Contexts are
//! process-scoped singletons: looking one up twice by the same identity returns the same handle,
//! mirroring the way the teacher crate interns its framework contexts behind `lazy_static!`
//! registries (`src/frameworks/loader.rs`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::memory::{Memory, MemoryKind};

/// General categories for the memory/compute space a [`Context`] addresses.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum ContextKind {
    /// The host CPU.
    Host,
    /// An accelerator, identified by an implementation-defined ordinal (e.g. "the second CUDA
    /// device", "the first OpenCL device").
    Accel(u32),
    /// Any other kind of compute space a collaborator wants to register, identified by an
    /// opaque id.
    UserKind(u32),
}

/// Identity of a memory/compute space.
///
/// Attributes are a kind tag, a device index and a handle to the context's default
/// [`Memory`]. Lifetime is process-scoped: contexts are acquired through
/// [`current_context`] and are never individually dropped.
#[derive(Debug)]
pub struct Context {
    kind: ContextKind,
    index: u32,
    memory: Memory,
}

impl Context {
    /// The kind tag of this context.
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// The device index within `kind`.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The default [`Memory`] for this context.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// This context's own device-local memory (spec.md §4.1's `context.device_memory()`).
    ///
    /// For `ContextKind::Host` this is the same handle as [`host_memory`](Context::host_memory):
    /// the host context's own memory already *is* host memory.
    pub fn device_memory(&self) -> &Memory {
        &self.memory
    }

    /// A host-reachable [`Memory`] handle, usable by the manager to stage a transfer this
    /// context's own memory cannot directly participate in (spec.md §4.1's
    /// `context.host_memory()`).
    ///
    /// Every `MemoryKind` this crate backs is host-heap-allocated (see the `memory` module docs)
    /// and [`Memory::can_copy_from`] always answers `true`, so no transfer here actually needs to
    /// stage through a distinct host handle — `host_memory` and `device_memory` collapse onto the
    /// same `Memory` for every `Context`. The accessor exists so collaborators that model a real
    /// two-memory-space backend (where they genuinely differ) can call it without special-casing
    /// `Host`.
    pub fn host_memory(&self) -> &Memory {
        &self.memory
    }

    fn new(kind: ContextKind, index: u32) -> Arc<Context> {
        let memory_kind = match kind {
            ContextKind::Host => MemoryKind::Host,
            ContextKind::Accel(_) | ContextKind::UserKind(_) => MemoryKind::Device,
        };

        Arc::new(Context { kind, index, memory: Memory::new(memory_kind) })
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Context) -> bool {
        self.kind == other.kind && self.index == other.index
    }
}

impl Eq for Context {}

lazy_static::lazy_static! {
    static ref REGISTRY: Mutex<HashMap<(ContextKind, u32), Arc<Context>>> = Mutex::new(HashMap::new());
}

/// Returns the shared `Context` for `(kind, index)`, creating it on first lookup.
///
/// Acquiring the same identity twice returns the same `Arc`, matching the spec's "two Contexts
/// are equal iff kind and device index are equal" identity rule as physical handle sharing, not
/// just value equality.
pub fn current_context(kind: ContextKind, index: u32) -> Arc<Context> {
    let mut registry = REGISTRY.lock().expect("context registry poisoned");

    registry
        .entry((kind, index))
        .or_insert_with(|| Context::new(kind, index))
        .clone()
}

/// Shorthand for `current_context(ContextKind::Host, 0)`.
pub fn host() -> Arc<Context> {
    current_context(ContextKind::Host, 0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn same_identity_yields_same_handle() {
        let a = current_context(ContextKind::Accel(0), 0);
        let b = current_context(ContextKind::Accel(0), 0);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_identity_yields_distinct_handles() {
        let a = current_context(ContextKind::Accel(0), 0);
        let b = current_context(ContextKind::Accel(1), 0);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(*a, *b);
    }

    #[test]
    fn host_memory_and_device_memory_agree_with_the_default_accessor() {
        let accel = current_context(ContextKind::Accel(5), 0);
        assert_eq!(accel.host_memory().kind(), accel.memory().kind());
        assert_eq!(accel.device_memory().kind(), accel.memory().kind());
    }
}
