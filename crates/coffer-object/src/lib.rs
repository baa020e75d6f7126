//! Object model support for the coffer storage engine.
//!
//! The object database deals in raw payload bytes plus a [`Kind`]; this
//! crate owns the pieces that need to understand those payloads: the
//! `"<type> <size>\0"` header codec, commit and tag parsing (parent
//! enumeration and tag peeling), and the builders the object inserter
//! accepts.

pub mod commit;
pub mod header;
pub mod tag;
pub mod tree;

pub use commit::{Commit, CommitBuilder};
pub use tag::{Tag, TagBuilder};
pub use tree::{EntryMode, TreeEntry, TreeFormatter};

use bstr::BString;

/// Errors produced by object parsing and formatting.
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("invalid object type: {0}")]
    InvalidType(BString),

    #[error("invalid object header: {0}")]
    InvalidHeader(String),

    #[error("truncated object: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid commit: missing '{field}' header")]
    MissingCommitField { field: &'static str },

    #[error("invalid tag: missing '{field}' header")]
    MissingTagField { field: &'static str },

    #[error("invalid tree entry at offset {offset}: {reason}")]
    InvalidTreeEntry { offset: usize, reason: String },

    #[error("invalid identity: {0}")]
    Ident(#[from] coffer_util::UtilError),

    #[error(transparent)]
    Id(#[from] coffer_id::IdError),
}

/// The four kinds of stored objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl Kind {
    /// Parse the type name used in object headers.
    pub fn from_name(name: &[u8]) -> Result<Self, ObjectError> {
        match name {
            b"commit" => Ok(Self::Commit),
            b"tree" => Ok(Self::Tree),
            b"blob" => Ok(Self::Blob),
            b"tag" => Ok(Self::Tag),
            other => Err(ObjectError::InvalidType(BString::from(other))),
        }
    }

    /// The canonical type name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }

    /// The type number used in pack entry headers.
    pub const fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Inverse of [`pack_type`](Self::pack_type).
    pub const fn from_pack_type(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            _ => None,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Kind {
    type Err = ObjectError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_roundtrip() {
        for kind in [Kind::Commit, Kind::Tree, Kind::Blob, Kind::Tag] {
            assert_eq!(Kind::from_name(kind.name().as_bytes()).unwrap(), kind);
            assert_eq!(kind.name().parse::<Kind>().unwrap(), kind);
        }
        assert!(Kind::from_name(b"changeset").is_err());
    }

    #[test]
    fn pack_type_numbers() {
        assert_eq!(Kind::Commit.pack_type(), 1);
        assert_eq!(Kind::Tree.pack_type(), 2);
        assert_eq!(Kind::Blob.pack_type(), 3);
        assert_eq!(Kind::Tag.pack_type(), 4);
        assert_eq!(Kind::from_pack_type(3), Some(Kind::Blob));
        assert_eq!(Kind::from_pack_type(5), None);
        assert_eq!(Kind::from_pack_type(6), None);
    }
}
