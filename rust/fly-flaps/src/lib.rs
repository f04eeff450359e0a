//! A client for the fly.io Machines ("flaps") API.
//!
//! The [Client] resolves endpoint paths under the API root, authorizes each
//! call with a shared [fly_tokens::Tokens] store, retries exchanges that fail
//! for transient reasons and turns non-2xx responses into a [FlapsError]:
//!
//! ```rust,no_run
//! # use anyhow::Result;
//! # use fly_flaps::{Action, CallMetadata, Client, ClientOptions};
//! # use fly_tokens::Tokens;
//! # use reqwest::Method;
//! # use std::sync::Arc;
//! # use tokio_util::sync::CancellationToken;
//! # async fn example() -> Result<()> {
//! let tokens = Arc::new(Tokens::parse("FlyV1 fm2_..."));
//! let client = Client::new(ClientOptions::new("my-app", tokens))?;
//! let cancel = CancellationToken::new();
//!
//! match client
//!     .send(&cancel, &CallMetadata::new(Action::MachineGet), Method::GET, "/apps/my-app/machines/123", None::<&()>, None)
//!     .await
//! {
//!     Ok(response) => println!("{}", response.text()),
//!     Err(error) if error.is_not_found() => println!("No such machine"),
//!     Err(error) => return Err(error.into()),
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

mod action;
mod apps;
mod client;
mod error;
mod metadata;

pub mod transport;

pub use action::*;
pub use apps::*;
pub use client::*;
pub use error::*;
pub use metadata::*;
pub use transport::{FlapsRequest, FlapsResponse, Transport};
