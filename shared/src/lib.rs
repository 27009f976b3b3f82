//! GuacTunnel Shared Library
//!
//! Guacamole protocol types, the instruction codec, and the readers, writers
//! and filters used to relay instructions between browsers and guacd.

pub mod protocol;
pub mod codec;
pub mod io;
pub mod filter;
pub mod status;
pub mod error;

pub use error::{Error, Result};
pub use status::Status;
