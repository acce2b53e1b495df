//! Local cache of the Unchained Index.
//!
//! Chunks are fetched by content hash as listed in a manifest, verified and
//! committed atomically ([`sync`]), then scanned bloom-first by the
//! [`walker`].

pub mod chain;
pub mod chunk;
pub mod cli;
pub mod error;
pub mod hash;
pub mod logging;
pub mod manifest;
pub mod sync;
pub mod timestamps;
pub mod walker;

#[cfg(test)]
mod test_utils;

pub use error::{IndexError, Result};
