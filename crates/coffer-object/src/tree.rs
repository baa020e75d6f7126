use bstr::{BStr, BString, ByteSlice, ByteVec};
use coffer_id::ObjectId;

use crate::ObjectError;

/// File mode of a tree entry, restricted to the modes git actually writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    Tree,
    Blob,
    Executable,
    Symlink,
    Gitlink,
}

impl EntryMode {
    /// The octal string written into tree payloads.
    pub const fn octal(&self) -> &'static [u8] {
        match self {
            Self::Tree => b"40000",
            Self::Blob => b"100644",
            Self::Executable => b"100755",
            Self::Symlink => b"120000",
            Self::Gitlink => b"160000",
        }
    }

    pub fn from_octal(s: &[u8]) -> Result<Self, ObjectError> {
        match s {
            b"40000" => Ok(Self::Tree),
            b"100644" => Ok(Self::Blob),
            b"100755" => Ok(Self::Executable),
            b"120000" => Ok(Self::Symlink),
            b"160000" => Ok(Self::Gitlink),
            other => Err(ObjectError::InvalidTreeEntry {
                offset: 0,
                reason: format!("unknown mode {:?}", other.as_bstr()),
            }),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Self::Tree)
    }
}

/// One `<mode> <name>\0<raw id>` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: EntryMode,
    pub name: BString,
    pub id: ObjectId,
}

impl TreeEntry {
    /// Tree sort order: names compare with a trailing `/` on directories.
    pub fn sort_key(&self) -> BString {
        let mut key = self.name.clone();
        if self.mode.is_tree() {
            key.push(b'/');
        }
        key
    }
}

/// Builds a canonical tree payload for the object inserter.
///
/// Entries are kept in insertion order until [`into_payload`]
/// (or an insert) sorts them into tree order.
///
/// [`into_payload`]: Self::into_payload
#[derive(Debug, Default)]
pub struct TreeFormatter {
    entries: Vec<TreeEntry>,
}

impl TreeFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, mode: EntryMode, name: impl Into<BString>, id: ObjectId) {
        self.entries.push(TreeEntry {
            mode,
            name: name.into(),
            id,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sort into tree order and serialize.
    pub fn into_payload(mut self) -> Vec<u8> {
        self.entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let mut out = Vec::with_capacity(self.entries.len() * 40);
        for entry in &self.entries {
            out.extend_from_slice(entry.mode.octal());
            out.push(b' ');
            out.extend_from_slice(&entry.name);
            out.push(0);
            out.extend_from_slice(entry.id.as_bytes());
        }
        out
    }
}

/// Parse a tree payload into entries (used by tests and fsck-style checks).
pub fn parse_entries(payload: &[u8]) -> Result<Vec<TreeEntry>, ObjectError> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let start = pos;
        let space = payload[pos..]
            .find_byte(b' ')
            .map(|p| pos + p)
            .ok_or_else(|| invalid(start, "missing space"))?;
        let mode = EntryMode::from_octal(&payload[pos..space])?;
        let nul = payload[space + 1..]
            .find_byte(0)
            .map(|p| space + 1 + p)
            .ok_or_else(|| invalid(start, "missing NUL"))?;
        let name = BString::from(&payload[space + 1..nul]);
        if name.is_empty() {
            return Err(invalid(start, "empty name"));
        }
        let id_end = nul + 1 + 20;
        if id_end > payload.len() {
            return Err(invalid(start, "truncated id"));
        }
        let id = ObjectId::from_bytes(&payload[nul + 1..id_end])?;
        entries.push(TreeEntry { mode, name, id });
        pos = id_end;
    }
    Ok(entries)
}

fn invalid(offset: usize, reason: &str) -> ObjectError {
    ObjectError::InvalidTreeEntry {
        offset,
        reason: reason.into(),
    }
}

/// Compare two entry names the way tree order does.
pub fn name_cmp(a: &BStr, a_is_tree: bool, b: &BStr, b_is_tree: bool) -> std::cmp::Ordering {
    let mut ka = BString::from(a);
    if a_is_tree {
        ka.push(b'/');
    }
    let mut kb = BString::from(b);
    if b_is_tree {
        kb.push(b'/');
    }
    ka.cmp(&kb)
}
