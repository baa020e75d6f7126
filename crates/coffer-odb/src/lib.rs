//! The unified object database: loose tier, pack tier, alternates.
//!
//! An [`ObjectDirectory`] serves `has`/`open` across every storage tier.
//! The pack list is an immutable snapshot behind an atomic pointer, so
//! readers never block; stale snapshots are detected and replaced by
//! rescanning the pack directory. A pack index that turns out to
//! disagree with its pack (because another process repacked) triggers a
//! bounded retry instead of an error.

pub mod abbrev;
pub mod alternates;
pub mod inserter;
pub mod packlist;

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use coffer_id::ObjectId;
use coffer_loose::LooseStore;
use coffer_object::Kind;
use parking_lot::Mutex;
use tracing::debug;

pub use inserter::{InserterReader, ObjectInserter};
pub use packlist::{PackHandle, PackList};

/// Errors from object database operations.
#[derive(Debug, thiserror::Error)]
pub enum OdbError {
    #[error("corrupt object {id}: {reason}")]
    Corrupt { id: ObjectId, reason: String },

    #[error("short id {prefix} is ambiguous: {count} candidates")]
    Ambiguous { prefix: String, count: usize },

    #[error("alternate chain loops through {0}")]
    AlternateCycle(PathBuf),

    #[error("alternate chain deeper than {0} levels")]
    AlternatesTooDeep(usize),

    #[error(transparent)]
    Loose(#[from] coffer_loose::LooseError),

    #[error(transparent)]
    Pack(#[from] coffer_pack::PackError),

    #[error(transparent)]
    Id(#[from] coffer_id::IdError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tuning knobs supplied by the (external) configuration layer.
#[derive(Debug, Clone, Default)]
pub struct OdbOptions {
    /// zlib level for new loose objects; `None` keeps the default.
    pub loose_compression: Option<u32>,
}

/// A materialized object handed out by the database.
///
/// Every source (loose, packed, staged) reduces to the same shape:
/// a kind, a size, and the payload bytes behind a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loader {
    kind: Kind,
    bytes: Vec<u8>,
}

impl Loader {
    pub fn new(kind: Kind, bytes: Vec<u8>) -> Self {
        Self { kind, bytes }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// A reader over the payload.
    pub fn open(&self) -> impl std::io::Read + '_ {
        Cursor::new(&self.bytes)
    }
}

/// One pack-resident representation of an object.
pub struct PackedHit {
    pub handle: Arc<PackHandle>,
    pub offset: u64,
}

enum PackProbe {
    Found(Loader),
    NotFound,
    /// At least one index claimed the id but its pack disagreed.
    Stale,
}

/// An `objects/` directory: loose files, packs, and optional alternates.
pub struct ObjectDirectory {
    objects_dir: PathBuf,
    pack_dir: PathBuf,
    loose: LooseStore,
    packs: ArcSwap<PackList>,
    rescan_lock: Mutex<()>,
    alternates: Vec<Arc<ObjectDirectory>>,
}

impl ObjectDirectory {
    /// Open the database rooted at `objects_dir`, following any
    /// `info/alternates` chain.
    pub fn open(objects_dir: impl AsRef<Path>) -> Result<Self, OdbError> {
        Self::open_with(objects_dir, &OdbOptions::default())
    }

    pub fn open_with(
        objects_dir: impl AsRef<Path>,
        options: &OdbOptions,
    ) -> Result<Self, OdbError> {
        let objects_dir = objects_dir.as_ref().to_path_buf();
        let alternates = alternates::load(&objects_dir, options)?;
        Ok(Self::open_single(objects_dir, options, alternates))
    }

    pub(crate) fn open_single(
        objects_dir: PathBuf,
        options: &OdbOptions,
        alternates: Vec<Arc<ObjectDirectory>>,
    ) -> Self {
        let mut loose = LooseStore::open(&objects_dir);
        if let Some(level) = options.loose_compression {
            loose.set_compression(level);
        }
        Self {
            pack_dir: objects_dir.join("pack"),
            objects_dir,
            loose,
            packs: ArcSwap::from_pointee(PackList::empty()),
            rescan_lock: Mutex::new(()),
            alternates,
        }
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    pub(crate) fn loose(&self) -> &LooseStore {
        &self.loose
    }

    pub fn alternates(&self) -> &[Arc<ObjectDirectory>] {
        &self.alternates
    }

    /// The currently published pack list.
    pub fn pack_list(&self) -> Arc<PackList> {
        self.packs.load_full()
    }

    /// Force a rescan of the pack directory.
    pub fn refresh(&self) -> Result<Arc<PackList>, OdbError> {
        let observed = self.pack_list();
        self.rescan(&observed, true)
    }

    /// Is `id` present in any tier? Packs are probed first (an index
    /// lookup is cheaper than a loose `stat`), then loose, then
    /// alternates.
    pub fn contains(&self, id: &ObjectId) -> bool {
        let mut snapshot = self.pack_list();
        for attempt in 0..2 {
            if snapshot
                .packs()
                .iter()
                .any(|h| !h.is_invalid() && h.pack().contains(id))
            {
                return true;
            }
            if attempt == 0 && snapshot.try_again(self.pack_dir_mtime()) {
                match self.rescan(&snapshot, false) {
                    Ok(new) if !Arc::ptr_eq(&new, &snapshot) => snapshot = new,
                    _ => break,
                }
            } else {
                break;
            }
        }
        if self.loose.contains(id) {
            return true;
        }
        self.alternates.iter().any(|alt| alt.contains(id))
    }

    /// Open an object, searching packs, then loose files, then
    /// alternates.
    ///
    /// A pack whose index claims the id but whose content disagrees has
    /// been replaced on disk; the pack list is refreshed and the search
    /// restarts. Every restart must observe a different list, so the
    /// loop is bounded by progress.
    pub fn open(&self, id: &ObjectId) -> Result<Option<Loader>, OdbError> {
        let mut snapshot = self.pack_list();
        loop {
            let stale = match self.probe_packs(&snapshot, id)? {
                PackProbe::Found(loader) => return Ok(Some(loader)),
                PackProbe::NotFound => false,
                PackProbe::Stale => true,
            };

            if let Some((kind, payload)) = self.loose.read(id)? {
                return Ok(Some(Loader::new(kind, payload)));
            }
            for alt in &self.alternates {
                if let Some(loader) = alt.open(id)? {
                    return Ok(Some(loader));
                }
            }

            if stale || snapshot.try_again(self.pack_dir_mtime()) {
                let new = self.rescan(&snapshot, false)?;
                if Arc::ptr_eq(&new, &snapshot) {
                    // No progress possible; the object is simply absent.
                    return Ok(None);
                }
                snapshot = new;
                continue;
            }
            return Ok(None);
        }
    }

    /// Every pack-resident representation of `id`, for delta reuse.
    pub fn open_in_all_packs(&self, id: &ObjectId) -> Result<Vec<PackedHit>, OdbError> {
        let mut snapshot = self.pack_list();
        if snapshot.try_again(self.pack_dir_mtime()) {
            snapshot = self.rescan(&snapshot, false)?;
        }
        let mut hits = Vec::new();
        for handle in snapshot.packs() {
            if handle.is_invalid() {
                continue;
            }
            if let Some(offset) = handle.pack().index().offset_of(id) {
                hits.push(PackedHit {
                    handle: Arc::clone(handle),
                    offset,
                });
            }
        }
        Ok(hits)
    }

    /// A new inserter staging objects against this database.
    pub fn new_inserter(&self) -> ObjectInserter<'_> {
        ObjectInserter::new(self)
    }

    fn probe_packs(&self, snapshot: &PackList, id: &ObjectId) -> Result<PackProbe, OdbError> {
        let mut stale = false;
        for handle in snapshot.packs() {
            if handle.is_invalid() {
                continue;
            }
            let resolve_base = |base: &ObjectId| self.resolve_delta_base(snapshot, handle, base);
            match handle.pack().read_with_base_resolver(id, resolve_base) {
                Ok(Some(unpacked)) => {
                    return Ok(PackProbe::Found(Loader::new(unpacked.kind, unpacked.payload)))
                }
                Ok(None) => {}
                Err(e) if e.is_mismatch() => {
                    debug!(pack = %handle.file_name(), error = %e, "stale pack index");
                    stale = true;
                }
                Err(coffer_pack::PackError::Io(e)) => {
                    // This pack is unreadable; evict it and keep looking.
                    debug!(pack = %handle.file_name(), error = %e, "pack read failed");
                    handle.mark_invalid();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(if stale {
            PackProbe::Stale
        } else {
            PackProbe::NotFound
        })
    }

    /// Find a REF-delta base outside the pack being read: loose first,
    /// then the other packs of the same snapshot, then alternates.
    fn resolve_delta_base(
        &self,
        snapshot: &PackList,
        reading: &PackHandle,
        base: &ObjectId,
    ) -> Option<(Kind, Vec<u8>)> {
        if let Ok(Some((kind, payload))) = self.loose.read(base) {
            return Some((kind, payload));
        }
        for other in snapshot.packs() {
            if std::ptr::eq(other.as_ref(), reading) || other.is_invalid() {
                continue;
            }
            if let Ok(Some(unpacked)) = other.pack().read(base) {
                return Some((unpacked.kind, unpacked.payload));
            }
        }
        for alt in &self.alternates {
            if let Ok(Some(loader)) = alt.open(base) {
                return Some((loader.kind(), loader.into_bytes()));
            }
        }
        None
    }

    /// Serialized rescan. The winner swaps a new snapshot in; a caller
    /// whose observed snapshot is already stale adopts the winner's
    /// published list instead of scanning again.
    fn rescan(&self, observed: &Arc<PackList>, force: bool) -> Result<Arc<PackList>, OdbError> {
        let _guard = self.rescan_lock.lock();

        let current = self.packs.load_full();
        if !force && !Arc::ptr_eq(&current, observed) {
            return Ok(current);
        }

        let scanned = PackList::scan(&self.pack_dir, &current)?;
        if !force && scanned.same_as(&current) {
            // Nothing observable changed; keep the published snapshot so
            // retry loops can detect the lack of progress.
            return Ok(current);
        }

        let new = Arc::new(scanned);
        self.packs.compare_and_swap(&current, Arc::clone(&new));
        Ok(new)
    }

    fn pack_dir_mtime(&self) -> SystemTime {
        self.pack_dir
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }
}
