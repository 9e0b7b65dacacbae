//! Transport plumbing for natpunch: the multi-transport [`endpoint`], the
//! [`timer`] used for request retries, [`nat`] descriptors and [`socket`]
//! construction helpers. Nothing in this crate knows about opcodes; the
//! protocol layer plugs in through [`endpoint::WireMessage`].

pub mod endpoint;
pub mod error;
pub mod nat;
pub mod socket;
pub mod timer;

pub use error::{Error, Result};
