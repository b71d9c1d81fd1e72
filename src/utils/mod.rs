//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::SyncrepError;

pub(crate) use safetcp::{framed_read, framed_write, tcp_bind_with_retry};
