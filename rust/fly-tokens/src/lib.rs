//! Credential handling for fly.io API clients.
//!
//! A [Tokens] store holds a principal's macaroon tokens alongside any legacy
//! user (OAuth) tokens. It knows how to render itself as an `Authorization`
//! header for each [Service], how to [Tokens::prune] tokens that are expired
//! or no longer needed, and how to [Tokens::update] itself by fetching the
//! discharge tokens that third party caveats call for.
//!
//! ```rust
//! # use fly_tokens::Tokens;
//! let tokens = Tokens::parse("FlyV1 fm2_AbC,plainUserToken123");
//!
//! assert_eq!(tokens.macaroon_tokens(), vec!["fm2_AbC"]);
//! assert_eq!(tokens.user_tokens(), vec!["plainUserToken123"]);
//! assert_eq!(tokens.flaps_header(), "FlyV1 fm2_AbC");
//! assert_eq!(tokens.all_header(), "FlyV1 fm2_AbC,plainUserToken123");
//! ```

#[macro_use]
extern crate tracing;

mod debugger;
mod error;
mod prune;
mod tokens;
mod update;

pub mod discharge;
pub mod macaroon;

pub use debugger::*;
pub use error::*;
pub use macaroon::{is_macaroon, Macaroon, MACAROON_PREFIXES};
pub use tokens::*;
pub use update::*;

#[cfg(any(test, feature = "helpers"))]
pub mod helpers;
