//! coffer: a Git-compatible object and reference storage engine.
//!
//! This facade crate wires the two databases together: the
//! [`ObjectDirectory`] (loose objects, packs, alternates) and the
//! [`RefDirectory`] (loose refs, packed-refs, reflogs), plus the
//! [`OdbWalker`] that lets the ref-update engine classify movements
//! against the commit graph.
//!
//! ```no_run
//! use coffer::Repository;
//!
//! let repo = Repository::init("/tmp/demo.git")?;
//! let mut ins = repo.odb().new_inserter();
//! let blob = ins.insert(coffer::Kind::Blob, b"hello")?;
//! ins.flush()?;
//! assert!(repo.odb().contains(&blob));
//! # Ok::<(), coffer::RepoError>(())
//! ```

mod repository;
mod walker;

pub use repository::{Repository, RepoError};
pub use walker::OdbWalker;

pub use coffer_id::{AbbreviatedId, Hasher, ObjectId};
pub use coffer_object::{CommitBuilder, Kind, TagBuilder, TreeFormatter};
pub use coffer_odb::{Loader, ObjectDirectory, ObjectInserter};
pub use coffer_refs::{
    BatchRefUpdate, ReceiveCommand, Ref, RefDirectory, RefName, ReflogEntry, UpdateResult,
};
pub use coffer_util::{Ident, When};
