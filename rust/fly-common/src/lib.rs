//! Common, generic utilities that are shared across the fly-* client packages:
//! an injectable [Clock], an explicit exponential [Backoff] state machine and
//! a cancellable [retry] loop built on top of them.
#![warn(missing_docs)]

#[macro_use]
extern crate tracing as extern_tracing;

mod backoff;
mod clock;
mod retry;

pub mod tracing;

pub use backoff::*;
pub use clock::*;
pub use retry::*;

#[cfg(any(test, feature = "helpers"))]
pub mod helpers;
