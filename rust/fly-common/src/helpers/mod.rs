//! Generic helper utilities intended to be used exclusively in tests and hidden
//! setup for examples

mod clock;
mod wait;

pub use clock::*;
pub use wait::*;
