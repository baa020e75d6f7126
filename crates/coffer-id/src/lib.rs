//! Object identity for the coffer storage engine.
//!
//! Provides the 20-byte SHA-1 [`ObjectId`] value type, hex prefixes as
//! [`AbbreviatedId`], streaming hash computation with collision detection,
//! and the fan-out table shared by pack index readers and writers.

mod abbrev;
mod error;
pub mod fanout;
pub mod hasher;
pub mod hex;
mod oid;

pub use abbrev::AbbreviatedId;
pub use error::IdError;
pub use fanout::FanoutTable;
pub use hasher::Hasher;
pub use oid::ObjectId;

/// Raw digest length in bytes.
pub const RAW_LEN: usize = 20;

/// Hex rendering length.
pub const HEX_LEN: usize = 40;
