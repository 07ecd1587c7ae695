//! CLI subcommand implementations that run outside the server loop.
//!
//! - [`send`] - one-shot client: send text to a command port, collect replies

pub mod send;

#[doc(inline)]
pub use send::send;
