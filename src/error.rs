//! Types for working with errors.
//!
//! `Error` keeps the teacher's "de-generization" shape (`ErrorKind` as a plain `Copy` enum,
//! wrapped by an `Error` that can carry an arbitrary boxed cause) but replaces the teacher's
//! framework/tensor-specific kinds with the core's own failure surface (spec.md §7).

use std::{error, fmt, result};

/// A specialized `Result` type.
pub type Result<T = (), E = Error> = result::Result<T, E>;

/// The core error type.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    payload: Option<Box<dyn error::Error + Send + Sync>>,
}

/// A set of general categories (spec.md §7).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// Conflicting access or mutation was attempted while a handle is live elsewhere. Fatal at
    /// the call site; the array remains consistent.
    ArrayBusy,
    /// A read was requested on a non-empty array with no valid slot anywhere (only reachable
    /// after a failed write left every slot invalid).
    NoValidSource,
    /// Allocation inside a `Memory` failed; the slot that requested it rolls back to its prior
    /// state.
    OutOfMemory,
    /// The underlying copy primitive failed. The destination slot stays non-valid; the array's
    /// other valid slots are untouched.
    TransferFailed,
    /// The factory was asked to create an array for an unregistered element tag.
    UnsupportedType,
    /// A resize or data-assignment call received inconsistent lengths.
    SizeMismatch,
    /// Any error not part of this list.
    Other,
    /// A marker variant that tells the compiler that users of this enum cannot match it
    /// exhaustively ([related RFC](https://github.com/rust-lang/rust/issues/32770)).
    #[doc(hidden)]
    _NonExhaustive,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        use self::ErrorKind::*;

        match *self {
            ArrayBusy => "a conflicting access or mutation is outstanding on this array",
            NoValidSource => "no valid context holds this array's data",
            OutOfMemory => "memory allocation failed",
            TransferFailed => "a transfer between contexts failed",
            UnsupportedType => "no array constructor is registered for this element tag",
            SizeMismatch => "inconsistent array lengths",
            Other => "other error",
            _NonExhaustive => unreachable!(),
        }
    }
}

impl From<ErrorKind> for Error {
    /// Creates a new error from a known kind of error.
    fn from(kind: ErrorKind) -> Error {
        Error::new_(kind, None)
    }
}

impl Error {
    /// Creates a new error from a known kind of error as well as an arbitrary error payload.
    pub fn new<K, E>(kind: K, payload: E) -> Error
    where
        K: Into<ErrorKind>,
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::new_(kind.into(), Some(payload.into()))
    }

    // "De-generization" technique: keep `ErrorKind` a plain `Copy` enum usable for `match`/
    // equality, while still letting `Error` carry an arbitrary boxed cause when there is one.
    fn new_(kind: ErrorKind, payload: Option<Box<dyn error::Error + Send + Sync>>) -> Error {
        Error { kind, payload }
    }

    /// Returns a reference to the inner error wrapped by this error, if any.
    pub fn get_ref(&self) -> Option<&(dyn error::Error + Send + Sync + 'static)> {
        self.payload.as_deref()
    }

    /// Returns the corresponding `ErrorKind` for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match &self.payload {
            Some(payload) => write!(fmt, "{}: {}", self.kind.as_str(), payload),
            None => write!(fmt, "{}", self.kind.as_str()),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.payload.as_ref().map(|payload| payload.as_ref() as &(dyn error::Error + 'static))
    }
}

#[cfg(test)]
mod test {
    use super::{Error, ErrorKind};
    use std::{error, fmt};

    #[test]
    fn downcasting_recovers_the_payload() {
        #[derive(Debug)]
        struct TestError;
        impl fmt::Display for TestError {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "abc")
            }
        }
        impl error::Error for TestError {}

        let err = Error::new(ErrorKind::Other, TestError);
        assert!(err.get_ref().unwrap().is::<TestError>());
    }

    #[test]
    fn kind_roundtrips_through_into() {
        let err: Error = ErrorKind::ArrayBusy.into();
        assert_eq!(err.kind(), ErrorKind::ArrayBusy);
        assert!(err.get_ref().is_none());
    }

    #[test]
    fn display_uses_kind_description() {
        let err: Error = ErrorKind::OutOfMemory.into();
        assert_eq!(err.to_string(), "memory allocation failed");
    }
}
