//! Foundation utilities for the coffer storage engine.
//!
//! This crate provides the lock-file protocol shared by the ref and pack
//! layers, staged temporary files, and the identity type recorded in
//! reflog lines.

pub mod error;
pub mod ident;
pub mod lockfile;
pub mod stage;

pub use bstr::{BStr, BString, ByteSlice, ByteVec};
pub use error::{LockError, UtilError};
pub use ident::{Ident, When};
pub use lockfile::LockFile;
pub use stage::StagedFile;

pub type Result<T> = std::result::Result<T, UtilError>;
