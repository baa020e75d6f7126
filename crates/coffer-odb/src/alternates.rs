//! `objects/info/alternates`: chained secondary object directories.
//!
//! Each line names another objects directory consulted after the local
//! tiers miss. Alternates may have alternates of their own; the chain
//! is capped and cycles are rejected.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{ObjectDirectory, OdbError, OdbOptions};
use std::sync::Arc;

/// Chains deeper than this are refused outright.
pub const MAX_DEPTH: usize = 5;

/// Load the alternates of `objects_dir`, recursively.
pub fn load(
    objects_dir: &Path,
    options: &OdbOptions,
) -> Result<Vec<Arc<ObjectDirectory>>, OdbError> {
    let mut visited = HashSet::new();
    visited.insert(canonical(objects_dir));
    load_level(objects_dir, options, &mut visited, 0)
}

fn load_level(
    objects_dir: &Path,
    options: &OdbOptions,
    visited: &mut HashSet<PathBuf>,
    depth: usize,
) -> Result<Vec<Arc<ObjectDirectory>>, OdbError> {
    if depth >= MAX_DEPTH {
        return Err(OdbError::AlternatesTooDeep(MAX_DEPTH));
    }

    let file = objects_dir.join("info").join("alternates");
    let content = match fs::read_to_string(&file) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut result = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let alt_dir = if Path::new(line).is_absolute() {
            PathBuf::from(line)
        } else {
            objects_dir.join(line)
        };
        if !alt_dir.is_dir() {
            debug!(path = %alt_dir.display(), "skipping missing alternate");
            continue;
        }

        if !visited.insert(canonical(&alt_dir)) {
            return Err(OdbError::AlternateCycle(alt_dir));
        }

        let nested = load_level(&alt_dir, options, visited, depth + 1)?;
        result.push(Arc::new(ObjectDirectory::open_single(
            alt_dir, options, nested,
        )));
    }
    Ok(result)
}

/// The raw alternate paths of a directory, without opening them.
pub fn list(objects_dir: &Path) -> Result<Vec<PathBuf>, OdbError> {
    let file = objects_dir.join("info").join("alternates");
    let content = match fs::read_to_string(&file) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            if Path::new(l).is_absolute() {
                PathBuf::from(l)
            } else {
                objects_dir.join(l)
            }
        })
        .collect())
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
