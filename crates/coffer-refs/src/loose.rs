//! Loose refs: one file per ref under the repository directory.
//!
//! A loose file holds either `<40 hex>\n` or `ref: <target>\n`. An
//! empty file (a writer died between create and write) is treated as if
//! the ref did not exist.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bstr::ByteSlice;
use coffer_id::ObjectId;

use crate::name::RefName;
use crate::RefError;

/// The decoded content of one loose ref file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LooseValue {
    Direct(ObjectId),
    Symbolic(RefName),
}

/// A loose value plus the file mtime it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LooseRead {
    pub value: LooseValue,
    pub mtime: Option<SystemTime>,
}

/// Path of the loose file for `name`.
pub fn path_for(git_dir: &Path, name: &RefName) -> PathBuf {
    git_dir.join(name.as_str())
}

/// Read a loose ref. `Ok(None)` when the file is missing or empty.
pub fn read(git_dir: &Path, name: &RefName) -> Result<Option<LooseRead>, RefError> {
    let path = path_for(git_dir, name);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        // A directory here means only nested refs exist under this name.
        Err(e) if path.is_dir() => {
            let _ = e;
            return Ok(None);
        }
        Err(e) => return Err(RefError::IoAt { path, source: e }),
    };
    let mtime = path.metadata().and_then(|m| m.modified()).ok();

    let trimmed = data.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value = if let Some(target) = trimmed.strip_prefix(b"ref: ") {
        let target = std::str::from_utf8(target.trim()).map_err(|_| RefError::Parse {
            what: name.to_string(),
            reason: "non-UTF-8 symbolic target".into(),
        })?;
        LooseValue::Symbolic(RefName::new(target)?)
    } else {
        let hex = std::str::from_utf8(trimmed).map_err(|_| RefError::Parse {
            what: name.to_string(),
            reason: "non-UTF-8 id".into(),
        })?;
        LooseValue::Direct(ObjectId::from_hex(hex).map_err(|e| RefError::Parse {
            what: name.to_string(),
            reason: e.to_string(),
        })?)
    };

    Ok(Some(LooseRead {
        value,
        mtime,
    }))
}

/// The current mtime of a loose ref file, if it exists.
pub fn mtime(git_dir: &Path, name: &RefName) -> Option<SystemTime> {
    path_for(git_dir, name).metadata().and_then(|m| m.modified()).ok()
}

/// Serialize a value the way the loose file stores it.
pub fn encode(value: &LooseValue) -> Vec<u8> {
    match value {
        LooseValue::Direct(id) => format!("{id}\n").into_bytes(),
        LooseValue::Symbolic(target) => format!("ref: {target}\n").into_bytes(),
    }
}

/// Remove the loose file and prune now-empty parent directories, up to
/// but excluding `refs/`.
pub fn remove(git_dir: &Path, name: &RefName) -> Result<(), RefError> {
    let path = path_for(git_dir, name);
    match fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(RefError::IoAt { path, source: e }),
    }

    let stop_at = git_dir.join("refs");
    let mut dir = path.parent().map(Path::to_path_buf);
    while let Some(d) = dir {
        if d == stop_at || d == *git_dir {
            break;
        }
        // Only empty directories go; a failure just means a sibling won.
        if fs::remove_dir(&d).is_err() {
            break;
        }
        dir = d.parent().map(Path::to_path_buf);
    }
    Ok(())
}

/// Every loose ref name under `git_dir` whose full name starts with
/// `prefix` (empty prefix means all), plus the root refs when they
/// apply. `.lock` files and unparsable names are skipped.
pub fn scan(git_dir: &Path, prefix: &str) -> Result<Vec<RefName>, RefError> {
    let mut found = Vec::new();

    let refs_root = git_dir.join("refs");
    if refs_root.is_dir() {
        walk(git_dir, &refs_root, prefix, &mut found)?;
    }

    for root in crate::name::ROOT_REFS {
        if !root.starts_with(prefix) {
            continue;
        }
        if git_dir.join(root).is_file() {
            if let Ok(name) = RefName::new(*root) {
                found.push(name);
            }
        }
    }

    found.sort();
    found.dedup();
    Ok(found)
}

fn walk(
    git_dir: &Path,
    dir: &Path,
    prefix: &str,
    found: &mut Vec<RefName>,
) -> Result<(), RefError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(RefError::IoAt {
                path: dir.to_path_buf(),
                source: e,
            })
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            walk(git_dir, &path, prefix, found)?;
            continue;
        }
        let rel = match path.strip_prefix(git_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let name_str = match rel.to_str() {
            Some(s) => s,
            None => continue,
        };
        if name_str.ends_with(".lock") || !name_str.starts_with(prefix) {
            continue;
        }
        if let Ok(name) = RefName::new(name_str) {
            found.push(name);
        }
    }
    Ok(())
}
