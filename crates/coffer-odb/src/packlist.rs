//! The pack-list snapshot: an immutable view of `objects/pack/`.
//!
//! The list of open packs is published through a single atomic pointer.
//! Readers grab the current snapshot and run to completion against it;
//! rescans build a whole new list and swap it in. A snapshot remembers
//! when it was taken and the directory mtime it saw, so later readers
//! can tell whether the directory may have changed behind their back
//! even on filesystems with coarse timestamps.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use coffer_pack::pack::Pack;
use tracing::{debug, warn};

use crate::OdbError;

/// A directory mtime older than this, relative to the read, cannot be
/// racing with the read on a same-second timestamp.
const RACY_WINDOW: Duration = Duration::from_millis(2 * 60 * 1000);

/// An open pack plus its bookkeeping.
///
/// Marking a handle invalid (after an I/O error) makes every search skip
/// it; the next rescan drops it from the published list for good.
pub struct PackHandle {
    pack: Pack,
    file_name: String,
    mtime: SystemTime,
    invalid: AtomicBool,
}

impl PackHandle {
    pub fn pack(&self) -> &Pack {
        &self.pack
    }

    /// The `pack-<40 hex>.pack` file name, the reuse key across rescans.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }

    pub fn mark_invalid(&self) {
        warn!(pack = %self.file_name, "marking pack invalid");
        self.invalid.store(true, Ordering::Relaxed);
    }
}

/// One immutable published state of the pack directory.
pub struct PackList {
    /// Open packs, most recently modified first.
    packs: Vec<Arc<PackHandle>>,
    /// When this snapshot was taken.
    last_read: SystemTime,
    /// The pack directory mtime observed at that point.
    last_modified: SystemTime,
    /// True when `last_read - last_modified` comfortably exceeds the
    /// filesystem timestamp resolution, so an unchanged mtime proves an
    /// unchanged directory.
    cannot_be_racily_clean: bool,
}

impl PackList {
    /// The empty snapshot used before the first scan.
    pub fn empty() -> Self {
        Self {
            packs: Vec::new(),
            last_read: SystemTime::UNIX_EPOCH,
            last_modified: SystemTime::UNIX_EPOCH,
            cannot_be_racily_clean: false,
        }
    }

    pub fn packs(&self) -> &[Arc<PackHandle>] {
        &self.packs
    }

    /// Would a rescan possibly observe something new?
    ///
    /// True when the directory mtime differs from the one this snapshot
    /// saw, or when the snapshot was taken too close to that mtime to
    /// rule out a same-timestamp modification.
    pub fn try_again(&self, current_mtime: SystemTime) -> bool {
        current_mtime != self.last_modified || !self.cannot_be_racily_clean
    }

    /// True when publishing `self` in place of `other` would change
    /// nothing a reader can observe. Retry loops use this to detect
    /// lack of progress.
    pub fn same_as(&self, other: &PackList) -> bool {
        self.last_modified == other.last_modified
            && self.cannot_be_racily_clean == other.cannot_be_racily_clean
            && self.packs.len() == other.packs.len()
            && self
                .packs
                .iter()
                .zip(other.packs.iter())
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }

    /// Scan `pack_dir`, reusing still-valid handles from `old`.
    pub fn scan(pack_dir: &Path, old: &PackList) -> Result<Self, OdbError> {
        let last_read = SystemTime::now();
        let last_modified = dir_mtime(pack_dir);
        let cannot_be_racily_clean = last_read
            .duration_since(last_modified)
            .map(|age| age > RACY_WINDOW)
            .unwrap_or(false);

        let mut packs: Vec<Arc<PackHandle>> = Vec::new();
        let entries = match std::fs::read_dir(pack_dir) {
            Ok(rd) => rd.filter_map(|e| e.ok()).collect::<Vec<_>>(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let idx_name = entry.file_name();
            let idx_name = match idx_name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if !is_pack_index_name(idx_name) {
                continue;
            }
            let pack_name = format!("{}.pack", &idx_name[..idx_name.len() - 4]);
            let pack_path = pack_dir.join(&pack_name);
            if !pack_path.is_file() {
                // An index without its pack is a leftover; skip it.
                continue;
            }

            // Reuse the already-open handle for an unchanged file name.
            if let Some(existing) = old
                .packs
                .iter()
                .find(|h| h.file_name == pack_name && !h.is_invalid())
            {
                packs.push(Arc::clone(existing));
                continue;
            }

            match Pack::open(&pack_path) {
                Ok(pack) => {
                    let mtime = pack_path
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    packs.push(Arc::new(PackHandle {
                        pack,
                        file_name: pack_name,
                        mtime,
                        invalid: AtomicBool::new(false),
                    }));
                }
                Err(e) => {
                    warn!(pack = %pack_path.display(), error = %e, "skipping unreadable pack");
                }
            }
        }

        // Probe newly written packs first.
        packs.sort_by(|a, b| b.mtime.cmp(&a.mtime));

        debug!(
            dir = %pack_dir.display(),
            count = packs.len(),
            "scanned pack directory"
        );
        Ok(Self {
            packs,
            last_read,
            last_modified,
            cannot_be_racily_clean,
        })
    }
}

fn dir_mtime(dir: &Path) -> SystemTime {
    dir.metadata()
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Accept only `pack-<40 lowercase hex>.idx`.
fn is_pack_index_name(name: &str) -> bool {
    name.len() == 49
        && name.starts_with("pack-")
        && name.ends_with(".idx")
        && name[5..45]
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
