//! A process-wide registry mapping an element-type tag to a zero-argument [`TypedArray`]
//! constructor, so generic code can allocate a correctly-typed temporary at runtime without
//! knowing the concrete element type at compile time (spec.md §4.6).
//!
//! Grounded on `original_source`'s `scai/common/TypeTraits.hpp` `ScalarType` enumeration for the
//! tag list, and on the teacher's `lazy_static!` module-level registry pattern
//! (`src/frameworks/loader.rs`) for the registry itself. `num_enum` gives `ElementTag` a stable
//! primitive representation in place of the teacher's abandoned `enum_primitive` dependency (see
//! DESIGN.md).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::context::Context;
use crate::error::{ErrorKind, Result};
use crate::typed_array::TypedArray;

/// The element types the factory can tag a [`TypedArray`] with.
///
/// Covers the numeric kinds spec.md §4.6 names in prose ("the integer index type, single/double/
/// extended floating-point, and their complex forms when built with complex support").
/// `ExtendedFloat` is represented with the same byte width as `Double`: Rust has no native
/// 80-bit extended-precision float, so the tag exists for factory dispatch and width bookkeeping,
/// not bit-exact x87 semantics (see DESIGN.md Open Question 4).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ElementTag {
    /// The integer index type used for sparse-storage row/column indices elsewhere in the
    /// library.
    Index = 0,
    /// Single-precision floating point (`f32`).
    Float = 1,
    /// Double-precision floating point (`f64`).
    Double = 2,
    /// Extended-precision floating point, represented as `f64` (see type docs).
    ExtendedFloat = 3,
    /// Single-precision complex (`num::Complex<f32>`), gated behind the `complex` feature.
    #[cfg(feature = "complex")]
    ComplexFloat = 4,
    /// Double-precision complex (`num::Complex<f64>`), gated behind the `complex` feature.
    #[cfg(feature = "complex")]
    ComplexDouble = 5,
}

impl ElementTag {
    /// The byte width of one element of this tag.
    pub fn width(&self) -> usize {
        match self {
            ElementTag::Index => std::mem::size_of::<i32>(),
            ElementTag::Float => std::mem::size_of::<f32>(),
            ElementTag::Double | ElementTag::ExtendedFloat => std::mem::size_of::<f64>(),
            #[cfg(feature = "complex")]
            ElementTag::ComplexFloat => std::mem::size_of::<num::Complex<f32>>(),
            #[cfg(feature = "complex")]
            ElementTag::ComplexDouble => std::mem::size_of::<num::Complex<f64>>(),
        }
    }
}

type Ctor = Arc<dyn Fn() -> TypedArray + Send + Sync>;

/// Registry mapping an [`ElementTag`] to a zero-argument `TypedArray` constructor.
pub struct Factory {
    ctors: Mutex<HashMap<ElementTag, Ctor>>,
}

impl Factory {
    fn new() -> Factory {
        Factory { ctors: Mutex::new(HashMap::new()) }
    }

    /// Registers `ctor` as the constructor for `tag`, replacing any prior registration.
    pub fn register(&self, tag: ElementTag, ctor: impl Fn() -> TypedArray + Send + Sync + 'static) {
        self.ctors.lock().expect("factory poisoned").insert(tag, Arc::new(ctor));
    }

    /// Creates a zero-element `TypedArray` for `tag` via its registered constructor.
    pub fn create(&self, tag: ElementTag) -> Result<TypedArray> {
        let ctor = self.ctors.lock().expect("factory poisoned").get(&tag).cloned();

        match ctor {
            Some(ctor) => Ok(ctor()),
            None => Err(ErrorKind::UnsupportedType.into()),
        }
    }
}

lazy_static::lazy_static! {
    // Deliberately empty: this crate knows nothing about concrete element types (kernels and
    // their scalar types are out of scope, spec.md §1). Collaborators register the tags they
    // support via `register_array_type`; asking `create_array` for a tag nobody has registered
    // yet is exactly the `UnsupportedType` case spec.md §7 describes.
    static ref FACTORY: Factory = Factory::new();
}

/// Registers `ctor` as the process-wide constructor for `tag`.
///
/// Collaborators that introduce their own element representation (spec.md's "UserKind" analog
/// for types) call this once at startup to make `create_array`/`make_array` aware of it.
pub fn register_array_type(tag: ElementTag, ctor: impl Fn() -> TypedArray + Send + Sync + 'static) {
    FACTORY.register(tag, ctor);
}

/// Creates a zero-element `TypedArray` of `tag`'s registered type.
///
/// Used by generic algorithms that must allocate a temporary "of the same type as this other
/// array" at runtime.
pub fn create_array(tag: ElementTag) -> Result<TypedArray> {
    FACTORY.create(tag)
}

/// Constructs a `TypedArray` of `n` elements of `tag`'s width, optionally establishing
/// `initial_context` as its first (zero-initialized) valid context (spec.md §6).
pub fn make_array(tag: ElementTag, n: usize, initial_context: Option<&Arc<Context>>) -> Result<TypedArray> {
    let array = TypedArray::new(n, tag.width());

    if let Some(ctx) = initial_context {
        let zeros = vec![0u8; n * tag.width()];
        let seeded = TypedArray::with_data(n, tag.width(), &zeros, ctx)?;
        return Ok(seeded);
    }

    Ok(array)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::host;

    #[test]
    fn create_array_resolves_a_registered_tag() {
        register_array_type(ElementTag::Double, || TypedArray::new(0, ElementTag::Double.width()));
        let array = create_array(ElementTag::Double).unwrap();
        assert_eq!(array.size(), 0);
        assert_eq!(array.element_width(), 8);
    }

    #[test]
    fn create_array_on_an_unregistered_tag_is_unsupported_type() {
        // `ExtendedFloat` is never registered by any other test in this module, so it is a
        // reliable stand-in for "a tag nobody has registered yet".
        let err = create_array(ElementTag::ExtendedFloat).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedType);
    }

    #[test]
    fn register_array_type_overrides_lookup() {
        register_array_type(ElementTag::Index, || TypedArray::new(7, ElementTag::Index.width()));
        let array = create_array(ElementTag::Index).unwrap();
        assert_eq!(array.size(), 7);
    }

    #[test]
    fn make_array_seeds_the_initial_context() {
        let array = make_array(ElementTag::Float, 4, Some(&host())).unwrap();
        assert!(array.is_valid(&host()));
        assert_eq!(array.size(), 4);
    }

    #[test]
    fn make_array_without_context_has_no_valid_slot() {
        let array = make_array(ElementTag::Float, 4, None).unwrap();
        assert!(array.valid_context(None).is_none());
    }
}
