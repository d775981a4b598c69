//! Core types shared by the fleet supervisor crates.
//!
//! All errors are explicit and typed; nothing in here panics.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod error;
pub mod result;

pub use error::Error;
pub use result::{Result, ResultExt};
