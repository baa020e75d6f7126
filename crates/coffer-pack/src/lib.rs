//! Pack tier: reading and writing `.pack` files and their `.idx` indexes.
//!
//! A pack aggregates many deflated objects, some stored as deltas against
//! an earlier entry (OFS) or an object named by id (REF). The index maps
//! sorted ids to pack offsets through a 256-entry fan-out table.

pub mod delta;
pub mod entry;
pub mod index;
pub mod pack;
pub mod write;

use std::path::PathBuf;

use coffer_id::ObjectId;
use coffer_object::Kind;

/// Pack file constants.
pub const PACK_MAGIC: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
pub const PACK_HEADER_LEN: usize = 12;

/// Index v2 constants. v1 files carry no magic at all.
pub const INDEX_MAGIC: [u8; 4] = [0xff, 0x74, 0x4f, 0x63]; // "\377tOc"
pub const INDEX_VERSION: u32 = 2;

/// Delta chains deeper than this are treated as corrupt.
pub const MAX_DELTA_DEPTH: usize = 512;

/// Errors from pack operations.
///
/// [`Mismatch`](PackError::Mismatch) is special: it means the index and
/// the pack disagree, which happens legitimately when another process
/// replaced the pack on disk. The object directory recovers from it by
/// rescanning; everything else is surfaced.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("invalid pack header: {0}")]
    BadHeader(String),

    #[error("invalid pack index: {0}")]
    BadIndex(String),

    #[error("unsupported pack version {0}")]
    UnsupportedVersion(u32),

    #[error("corrupt pack entry at offset {0}")]
    CorruptEntry(u64),

    #[error("invalid delta at offset {offset}: {reason}")]
    BadDelta { offset: u64, reason: String },

    #[error("delta base {0} not found")]
    MissingBase(ObjectId),

    #[error("delta chain exceeds {MAX_DELTA_DEPTH} levels at offset {0}")]
    ChainTooDeep(u64),

    #[error("pack {pack} disagrees with its index: {reason}")]
    Mismatch { pack: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Id(#[from] coffer_id::IdError),
}

impl PackError {
    /// True for the recoverable index-vs-pack disagreement.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch { .. })
    }
}

/// An object fully materialized out of a pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    pub kind: Kind,
    pub payload: Vec<u8>,
}
