//! Result type definition and extension traits.
//!
//! Provides combinators that avoid unwrap/expect when a failure only needs
//! to be observed on its way through.

use crate::error::Error;

/// The standard Result type for fleet operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing inspection combinators for any `Result`.
pub trait ResultExt<T, E> {
    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&E)>(self, f: F) -> Self;
}

impl<T, E> ResultExt<T, E> for std::result::Result<T, E> {
    fn inspect_error<F: FnOnce(&E)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}
