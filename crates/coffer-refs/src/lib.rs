//! The reference database: a mutable name→object mapping over two
//! storage tiers.
//!
//! Refs live either as one loose file each under `refs/…` or packed
//! together in the `packed-refs` file, with the loose value winning
//! when both exist. Updates go through a compare-and-swap protocol on
//! lock files; batches add atomicity, name-conflict detection and
//! per-command reporting on top. Every successful write may append a
//! reflog line.

pub mod batch;
pub mod dir;
pub mod loose;
pub mod name;
pub mod packed;
pub mod reflog;
pub mod update;

pub use batch::{BatchRefUpdate, CommandType, ReceiveCommand};
pub use dir::{RefDirectory, RefLogPolicy};
pub use name::RefName;
pub use packed::{PackedRef, PackedRefs};
pub use reflog::ReflogEntry;
pub use update::{RefUpdate, UpdateResult};

use coffer_id::ObjectId;

/// Errors from reference operations.
///
/// Ordinary rejections (lost compare-and-swap races, conflicting names,
/// non-fast-forward pushes) are **not** errors; they come back as
/// [`UpdateResult`] values. These variants are reserved for a database
/// that cannot be read or written at all.
#[derive(Debug, thiserror::Error)]
pub enum RefError {
    #[error("invalid ref name: {0}")]
    InvalidName(String),

    #[error("cannot parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("walker failed: {0}")]
    Walk(String),

    #[error("lock file error: {0}")]
    Lock(#[from] coffer_util::LockError),

    #[error("I/O error on {path}: {source}")]
    IoAt {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Id(#[from] coffer_id::IdError),
}

impl From<coffer_util::UtilError> for RefError {
    fn from(e: coffer_util::UtilError) -> Self {
        match e {
            coffer_util::UtilError::Lock(l) => Self::Lock(l),
            coffer_util::UtilError::Io(io) => Self::Io(io),
            other => Self::Parse {
                what: "identity".into(),
                reason: other.to_string(),
            },
        }
    }
}

/// Where a ref record currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Not on disk yet (a ref being created).
    New,
    Loose,
    Packed,
    /// Both tiers hold it; the loose value is authoritative.
    LoosePacked,
}

impl Storage {
    pub fn is_loose(&self) -> bool {
        matches!(self, Self::Loose | Self::LoosePacked)
    }

    pub fn is_packed(&self) -> bool {
        matches!(self, Self::Packed | Self::LoosePacked)
    }
}

/// What is known about a direct ref's peeled value.
///
/// A peeled annotation is only trusted while the ref still points at
/// the id it was peeled from; any move resets it to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peeled {
    Unknown,
    /// The ref points at a non-tag; there is nothing to peel.
    NonTag,
    /// The ref points at an annotated tag whose chain bottoms out here.
    Tag(ObjectId),
}

/// What a ref points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    Direct { id: ObjectId, peeled: Peeled },
    Symbolic { target: RefName },
}

/// One reference record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref {
    pub name: RefName,
    pub value: RefValue,
    pub storage: Storage,
    /// Monotonic version where the backend tracks one. The files
    /// backend does not, so this stays `None` here.
    pub update_index: Option<u64>,
}

impl Ref {
    pub fn direct(name: RefName, id: ObjectId, storage: Storage) -> Self {
        Self {
            name,
            value: RefValue::Direct {
                id,
                peeled: Peeled::Unknown,
            },
            storage,
            update_index: None,
        }
    }

    pub fn symbolic(name: RefName, target: RefName, storage: Storage) -> Self {
        Self {
            name,
            value: RefValue::Symbolic { target },
            storage,
            update_index: None,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self.value, RefValue::Symbolic { .. })
    }

    /// The object id of a direct ref.
    pub fn id(&self) -> Option<ObjectId> {
        match &self.value {
            RefValue::Direct { id, .. } => Some(*id),
            RefValue::Symbolic { .. } => None,
        }
    }

    pub fn symbolic_target(&self) -> Option<&RefName> {
        match &self.value {
            RefValue::Symbolic { target } => Some(target),
            RefValue::Direct { .. } => None,
        }
    }

    /// Whether a peel attempt has been recorded.
    pub fn is_peeled(&self) -> bool {
        matches!(
            self.value,
            RefValue::Direct {
                peeled: Peeled::NonTag | Peeled::Tag(_),
                ..
            }
        )
    }

    /// The peeled id, when the ref points at an annotated tag.
    pub fn peeled_id(&self) -> Option<ObjectId> {
        match self.value {
            RefValue::Direct {
                peeled: Peeled::Tag(id),
                ..
            } => Some(id),
            _ => None,
        }
    }
}

/// The revision-walking collaborator the update engine consumes.
///
/// The ref layer never reads objects itself; it needs exactly three
/// capabilities: missing-object detection, parent enumeration (for the
/// fast-forward test), and tag dereferencing (for peeling).
pub trait Walker {
    fn has_object(&self, id: &ObjectId) -> bool;

    /// Parents of a commit. Non-commit objects have none.
    fn parents(&self, id: &ObjectId) -> Result<Vec<ObjectId>, RefError>;

    /// The target of an annotated tag; `None` when `id` is not a tag.
    fn tag_target(&self, id: &ObjectId) -> Result<Option<ObjectId>, RefError>;
}

/// Is `ancestor` reachable from `tip` by following parents?
///
/// This is the fast-forward test: an update old→new keeps all history
/// iff `old` is merged into `new`.
pub fn is_merged_into(
    walker: &dyn Walker,
    ancestor: &ObjectId,
    tip: &ObjectId,
) -> Result<bool, RefError> {
    if ancestor == tip {
        return Ok(true);
    }
    let mut queue = vec![*tip];
    let mut seen = std::collections::HashSet::new();
    seen.insert(*tip);
    while let Some(id) = queue.pop() {
        for parent in walker.parents(&id)? {
            if parent == *ancestor {
                return Ok(true);
            }
            if seen.insert(parent) {
                queue.push(parent);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::HashMap;

    /// A walker over a hand-built commit graph.
    #[derive(Default)]
    pub struct GraphWalker {
        pub parents: HashMap<ObjectId, Vec<ObjectId>>,
        pub tags: HashMap<ObjectId, ObjectId>,
    }

    impl GraphWalker {
        pub fn commit(&mut self, id: ObjectId, parents: &[ObjectId]) {
            self.parents.insert(id, parents.to_vec());
        }

        pub fn tag(&mut self, tag: ObjectId, target: ObjectId) {
            self.tags.insert(tag, target);
        }
    }

    impl Walker for GraphWalker {
        fn has_object(&self, id: &ObjectId) -> bool {
            self.parents.contains_key(id) || self.tags.contains_key(id)
        }

        fn parents(&self, id: &ObjectId) -> Result<Vec<ObjectId>, RefError> {
            Ok(self.parents.get(id).cloned().unwrap_or_default())
        }

        fn tag_target(&self, id: &ObjectId) -> Result<Option<ObjectId>, RefError> {
            Ok(self.tags.get(id).copied())
        }
    }

    pub fn oid(n: u8) -> ObjectId {
        let mut raw = [0u8; 20];
        raw[19] = n;
        raw[0] = n; // spread across fan-out buckets
        ObjectId::from_raw(raw)
    }

    pub fn ident() -> coffer_util::Ident {
        coffer_util::Ident::new(
            "Ref Writer",
            "refs@example.com",
            coffer_util::When::new(1600000000, 60),
        )
    }
}
