//! The multi-context coherent array core: context descriptors, per-context data slots, the
//! coherence state machine on those slots, and the read/write access protocol that drives it.
//!
//! Everything else in a full heterogeneous numerical library — BLAS/sparse kernels, storage
//! formats, solvers, distribution, file I/O — is an external collaborator that consumes this
//! layer's guarantees through [`TypedArray`](typed_array::TypedArray) and
//! [`factory`](factory)'s registry; none of it lives here.

pub mod context;
mod context_data;
pub mod error;
pub mod factory;
pub mod manager;
pub mod memory;
pub mod sync_token;
pub mod typed_array;

pub use context::{current_context, host, Context, ContextKind};
pub use error::{Error, ErrorKind, Result};
pub use factory::{create_array, make_array, register_array_type, ElementTag};
pub use memory::{Memory, MemoryKind};
pub use sync_token::SyncToken;
pub use typed_array::{ReadAccess, TypedArray, WriteAccess};
