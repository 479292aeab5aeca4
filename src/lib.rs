#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod message;
pub mod router;

mod queue;
mod worker;

pub use config::LinkConfig;
pub use endpoint::VirtualEndpoint;
pub use link::{Link, LinkState};
pub use message::{Message, SessionId, SessionOpts, CONTROL_SESSION};
pub use router::{ExitListener, SessionRouter};
