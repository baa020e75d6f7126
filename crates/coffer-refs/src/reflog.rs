//! Reflogs: the append-only per-ref history under `logs/`.
//!
//! Line format: `<old-id> SP <new-id> SP <identity> TAB <message> LF`.
//! Files are append-only and mirror the ref hierarchy; readers parse
//! without modifying.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bstr::{BStr, BString, ByteSlice, ByteVec};
use coffer_id::ObjectId;
use coffer_util::Ident;

use crate::name::RefName;
use crate::RefError;

/// One recorded ref movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflogEntry {
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    pub who: Ident,
    pub message: BString,
}

impl ReflogEntry {
    /// Parse one line (without the trailing newline).
    pub fn parse(line: &BStr) -> Result<Self, RefError> {
        let bad = |reason: &str| RefError::Parse {
            what: "reflog line".into(),
            reason: reason.into(),
        };
        let line = line.as_bytes();
        // Two 40-digit ids, two separating spaces, then the identity.
        if line.len() < 82 || line[40] != b' ' || line[81] != b' ' {
            return Err(bad("truncated id columns"));
        }

        let old_id = parse_hex(&line[..40])?;
        let new_id = parse_hex(&line[41..81])?;

        let rest = &line[82..];
        let (who_part, message) = match rest.find_byte(b'\t') {
            Some(tab) => (&rest[..tab], &rest[tab + 1..]),
            None => (rest, &b""[..]),
        };
        let who = Ident::parse(who_part.as_bstr())?;

        let message = message.strip_suffix(b"\n").unwrap_or(message);
        Ok(Self {
            old_id,
            new_id,
            who,
            message: BString::from(message),
        })
    }

    /// Render without the trailing newline.
    pub fn to_bytes(&self) -> BString {
        let mut out = BString::new(Vec::with_capacity(120));
        out.push_str(self.old_id.to_hex().as_bytes());
        out.push(b' ');
        out.push_str(self.new_id.to_hex().as_bytes());
        out.push(b' ');
        out.push_str(self.who.to_bytes());
        out.push(b'\t');
        out.push_str(&self.message);
        out
    }
}

fn parse_hex(bytes: &[u8]) -> Result<ObjectId, RefError> {
    let hex = std::str::from_utf8(bytes).map_err(|_| RefError::Parse {
        what: "reflog line".into(),
        reason: "non-UTF-8 id".into(),
    })?;
    Ok(ObjectId::from_hex(hex)?)
}

/// Where the log of `name` lives.
pub fn path_for(git_dir: &Path, name: &RefName) -> PathBuf {
    git_dir.join("logs").join(name.as_str())
}

/// Does a log exist for `name`?
pub fn exists(git_dir: &Path, name: &RefName) -> bool {
    path_for(git_dir, name).is_file()
}

/// Append one entry, creating the log and its directories on demand.
pub fn append(git_dir: &Path, name: &RefName, entry: &ReflogEntry) -> Result<(), RefError> {
    let path = path_for(git_dir, name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RefError::IoAt {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let mut line = entry.to_bytes();
    line.push(b'\n');
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(&line))
        .map_err(|e| RefError::IoAt { path, source: e })?;
    Ok(())
}

/// All entries, newest first. A missing log is empty.
pub fn read(git_dir: &Path, name: &RefName) -> Result<Vec<ReflogEntry>, RefError> {
    let path = path_for(git_dir, name);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RefError::IoAt { path, source: e }),
    };

    let mut entries = Vec::new();
    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        entries.push(ReflogEntry::parse(line.as_bstr())?);
    }
    entries.reverse();
    Ok(entries)
}

/// The entry `@{n}`: n hops back from the latest.
pub fn entry_at(git_dir: &Path, name: &RefName, n: usize) -> Result<Option<ReflogEntry>, RefError> {
    Ok(read(git_dir, name)?.into_iter().nth(n))
}

/// Entries whose author name or email contains `needle`, newest first.
pub fn filter_by_author(
    git_dir: &Path,
    name: &RefName,
    needle: &str,
) -> Result<Vec<ReflogEntry>, RefError> {
    Ok(read(git_dir, name)?
        .into_iter()
        .filter(|e| {
            e.who.name.contains_str(needle) || e.who.email.contains_str(needle)
        })
        .collect())
}

/// Entries whose message contains `needle`, newest first.
pub fn filter_by_message(
    git_dir: &Path,
    name: &RefName,
    needle: &str,
) -> Result<Vec<ReflogEntry>, RefError> {
    Ok(read(git_dir, name)?
        .into_iter()
        .filter(|e| e.message.contains_str(needle))
        .collect())
}

/// Drop entries older than `cutoff_seconds`, keeping the newest entry
/// unconditionally. Returns how many lines were removed.
pub fn expire(git_dir: &Path, name: &RefName, cutoff_seconds: i64) -> Result<usize, RefError> {
    let path = path_for(git_dir, name);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(RefError::IoAt { path, source: e }),
    };

    let lines: Vec<&[u8]> = data.lines().filter(|l| !l.is_empty()).collect();
    let total = lines.len();
    let mut kept = Vec::new();
    let mut removed = 0;
    for (i, line) in lines.iter().enumerate() {
        let entry = ReflogEntry::parse(line.as_bstr())?;
        if i + 1 == total || entry.who.when.seconds >= cutoff_seconds {
            kept.push(entry);
        } else {
            removed += 1;
        }
    }

    let mut out = Vec::new();
    for entry in &kept {
        out.extend_from_slice(&entry.to_bytes());
        out.push(b'\n');
    }
    fs::write(&path, &out).map_err(|e| RefError::IoAt { path, source: e })?;
    Ok(removed)
}
