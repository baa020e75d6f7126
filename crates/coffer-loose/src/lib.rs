//! Loose object tier: one zlib-deflated file per object.
//!
//! A loose object lives at `objects/xx/yyy…` where `xx` is the first id
//! byte in hex. The file holds `zlib("<type> <size>\0" || payload)`.

mod enumerate;
mod read;
mod stream;
mod write;

pub use enumerate::LooseIter;
pub use stream::LooseStream;
pub use write::compress_into;

use std::path::{Path, PathBuf};

use coffer_id::ObjectId;

/// Handle to an `objects/` directory's loose tier.
pub struct LooseStore {
    objects_dir: PathBuf,
    compression: flate2::Compression,
}

impl LooseStore {
    /// Open the loose store rooted at `objects_dir`.
    ///
    /// The directory need not exist yet; reads of a missing directory
    /// simply find nothing.
    pub fn open(objects_dir: impl AsRef<Path>) -> Self {
        Self {
            objects_dir: objects_dir.as_ref().to_path_buf(),
            compression: flate2::Compression::default(),
        }
    }

    /// Set the zlib level used for new objects (0–9).
    pub fn set_compression(&mut self, level: u32) {
        self.compression = flate2::Compression::new(level);
    }

    pub(crate) fn compression(&self) -> flate2::Compression {
        self.compression
    }

    /// Where the object with this id lives (whether or not it exists).
    pub fn path_for(&self, id: &ObjectId) -> PathBuf {
        self.objects_dir.join(id.loose_path())
    }

    /// The `objects/` directory this store reads.
    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }
}

/// Errors from loose object operations.
#[derive(Debug, thiserror::Error)]
pub enum LooseError {
    #[error("corrupt loose object {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("cannot inflate loose object {id}: {source}")]
    Inflate {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("loose object {path} hashes to {actual}, expected {expected}")]
    IdMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Object(#[from] coffer_object::ObjectError),

    #[error(transparent)]
    Id(#[from] coffer_id::IdError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_for_splits_after_one_byte() {
        let store = LooseStore::open("/repo/objects");
        let id = ObjectId::from_hex("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391").unwrap();
        assert_eq!(
            store.path_for(&id),
            PathBuf::from("/repo/objects/e6/9de29bb2d1d6434b8b29ae775ad8c2e48c5391")
        );
    }
}
