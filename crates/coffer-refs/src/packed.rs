//! The `packed-refs` file: many refs in one sorted text file.
//!
//! ```text
//! # pack-refs with: peeled fully-peeled sorted
//! <hex-id> SP <name> LF
//! ^<hex-id> LF            (peeled target of the tag above)
//! ```
//!
//! The file is tracked by `(mtime, length)`; any change to either
//! triggers a reparse. Rewrites go through the lock-file protocol and
//! fsync the containing directory after the rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bstr::ByteSlice;
use coffer_id::ObjectId;
use coffer_util::LockFile;

use crate::name::RefName;
use crate::{Peeled, Ref, RefError, RefValue, Storage};

/// One packed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedRef {
    pub name: RefName,
    pub id: ObjectId,
    pub peeled: Option<ObjectId>,
}

impl PackedRef {
    /// View as a full ref record with `Packed` storage.
    pub fn to_ref(&self, peeled_header: bool) -> Ref {
        let peeled = match (self.peeled, peeled_header) {
            (Some(id), _) => Peeled::Tag(id),
            // With the peeled header, an absent `^` line means the ref
            // peels to nothing (it is not an annotated tag).
            (None, true) => Peeled::NonTag,
            (None, false) => Peeled::Unknown,
        };
        Ref {
            name: self.name.clone(),
            value: RefValue::Direct {
                id: self.id,
                peeled,
            },
            storage: Storage::Packed,
            update_index: None,
        }
    }
}

/// The `(mtime, length)` pair that detects concurrent rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub mtime: Option<SystemTime>,
    pub len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Self {
        match path.metadata() {
            Ok(meta) => Self {
                mtime: meta.modified().ok(),
                len: meta.len(),
            },
            Err(_) => Self {
                mtime: None,
                len: 0,
            },
        }
    }
}

/// A parsed snapshot of the packed-refs file.
#[derive(Debug, Clone)]
pub struct PackedRefs {
    entries: Vec<PackedRef>,
    /// The header advertised peeled annotations.
    peeled_header: bool,
    stamp: FileStamp,
}

impl PackedRefs {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            peeled_header: false,
            stamp: FileStamp {
                mtime: None,
                len: 0,
            },
        }
    }

    /// Parse file content (no filesystem access).
    pub fn parse(data: &[u8]) -> Result<Self, RefError> {
        let mut entries: Vec<PackedRef> = Vec::new();
        let mut peeled_header = false;

        for line in data.lines() {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(b"#") {
                if line.find(b"peeled").is_some() {
                    peeled_header = true;
                }
                continue;
            }
            if let Some(hex) = line.strip_prefix(b"^") {
                let id = parse_id(hex)?;
                match entries.last_mut() {
                    Some(entry) => entry.peeled = Some(id),
                    None => {
                        return Err(RefError::Parse {
                            what: "packed-refs".into(),
                            reason: "peel line before any ref".into(),
                        })
                    }
                }
                continue;
            }

            let space = line.find_byte(b' ').ok_or_else(|| RefError::Parse {
                what: "packed-refs".into(),
                reason: format!("no separator in {:?}", line.as_bstr()),
            })?;
            let id = parse_id(&line[..space])?;
            let name_str =
                std::str::from_utf8(line[space + 1..].trim()).map_err(|_| RefError::Parse {
                    what: "packed-refs".into(),
                    reason: "non-UTF-8 ref name".into(),
                })?;
            entries.push(PackedRef {
                name: RefName::new(name_str)?,
                id,
                peeled: None,
            });
        }

        // The file is normally sorted already; enforce it so lookups
        // can binary-search regardless of the writer.
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            entries,
            peeled_header,
            stamp: FileStamp {
                mtime: None,
                len: data.len() as u64,
            },
        })
    }

    /// Load from `git_dir/packed-refs`; a missing file is empty.
    pub fn load(git_dir: &Path) -> Result<Self, RefError> {
        let path = file_path(git_dir);
        let stamp = FileStamp::of(&path);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::empty()),
            Err(e) => {
                return Err(RefError::IoAt {
                    path,
                    source: e,
                })
            }
        };
        let mut parsed = Self::parse(&data)?;
        parsed.stamp = stamp;
        Ok(parsed)
    }

    /// Has the on-disk file changed since this snapshot was read?
    pub fn is_outdated(&self, git_dir: &Path) -> bool {
        FileStamp::of(&file_path(git_dir)) != self.stamp
    }

    pub fn stamp(&self) -> FileStamp {
        self.stamp
    }

    pub fn peeled_header(&self) -> bool {
        self.peeled_header
    }

    pub fn entries(&self) -> &[PackedRef] {
        &self.entries
    }

    pub fn find(&self, name: &RefName) -> Option<&PackedRef> {
        self.entries
            .binary_search_by(|e| e.name.cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn contains(&self, name: &RefName) -> bool {
        self.find(name).is_some()
    }

    /// A copy with `name` set to `id` (peeled annotation included when
    /// known).
    pub fn with_updated(&self, name: RefName, id: ObjectId, peeled: Option<ObjectId>) -> Self {
        let mut entries = self.entries.clone();
        match entries.binary_search_by(|e| e.name.cmp(&name)) {
            Ok(i) => {
                entries[i].id = id;
                entries[i].peeled = peeled;
            }
            Err(i) => entries.insert(
                i,
                PackedRef {
                    name,
                    id,
                    peeled,
                },
            ),
        }
        Self {
            entries,
            peeled_header: true,
            stamp: self.stamp,
        }
    }

    /// A copy without `name`; `None` when it was not present.
    pub fn without(&self, name: &RefName) -> Option<Self> {
        let i = self.entries.binary_search_by(|e| e.name.cmp(name)).ok()?;
        let mut entries = self.entries.clone();
        entries.remove(i);
        Some(Self {
            entries,
            peeled_header: self.peeled_header,
            stamp: self.stamp,
        })
    }

    /// Serialize in the canonical sorted form with the peeled header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.entries.len() * 64);
        out.extend_from_slice(b"# pack-refs with: peeled fully-peeled sorted \n");
        for entry in &self.entries {
            out.extend_from_slice(entry.id.to_hex().as_bytes());
            out.push(b' ');
            out.extend_from_slice(entry.name.as_bstr());
            out.push(b'\n');
            if let Some(peeled) = entry.peeled {
                out.push(b'^');
                out.extend_from_slice(peeled.to_hex().as_bytes());
                out.push(b'\n');
            }
        }
        out
    }

    /// Rewrite the on-disk file under its lock. The caller usually
    /// already holds logical ownership through the ref being updated.
    pub fn write(&self, git_dir: &Path) -> Result<(), RefError> {
        let path = file_path(git_dir);
        let mut lock = LockFile::acquire(&path)?;
        lock.write_all(&self.to_bytes()).map_err(|e| RefError::IoAt {
            path: path.clone(),
            source: e,
        })?;
        lock.commit_and_sync_dir()?;
        Ok(())
    }
}

/// Path of the packed-refs file.
pub fn file_path(git_dir: &Path) -> PathBuf {
    git_dir.join("packed-refs")
}

fn parse_id(hex: &[u8]) -> Result<ObjectId, RefError> {
    let hex = std::str::from_utf8(hex.trim()).map_err(|_| RefError::Parse {
        what: "packed-refs".into(),
        reason: "non-UTF-8 id".into(),
    })?;
    Ok(ObjectId::from_hex(hex)?)
}
