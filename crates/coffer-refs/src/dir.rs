//! The reference directory: loose files + packed-refs + reflogs.
//!
//! Reads merge the two tiers with the loose value winning. The packed
//! file is cached and re-parsed only when its `(mtime, length)` stamp
//! moves; loose files are cached per name by mtime. Both caches hold
//! immutable values swapped in atomically, so readers never wait on a
//! reload in progress.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use coffer_id::ObjectId;
use coffer_util::{Ident, LockFile};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::loose::{self, LooseValue};
use crate::name::{RefName, SEARCH_PATH};
use crate::packed::PackedRefs;
use crate::reflog::{self, ReflogEntry};
use crate::{Peeled, Ref, RefError, RefValue, Storage, Walker};

/// Symbolic chains longer than this are treated as not found.
pub const MAX_SYMREF_DEPTH: usize = 5;

/// Typed configuration supplied by the (external) config layer.
#[derive(Debug, Clone)]
pub struct RefLogPolicy {
    /// `core.logAllRefUpdates`: log `HEAD`, branches and remote-tracking
    /// refs even when no log file exists yet.
    pub log_all_ref_updates: bool,
}

impl Default for RefLogPolicy {
    fn default() -> Self {
        Self {
            log_all_ref_updates: true,
        }
    }
}

#[derive(Clone)]
struct CachedLoose {
    mtime: Option<SystemTime>,
    value: LooseValue,
}

type ChangeListener = Box<dyn Fn(&RefName) + Send + Sync>;

/// The files-backed reference database of one repository.
pub struct RefDirectory {
    git_dir: PathBuf,
    packed: ArcSwap<PackedRefs>,
    packed_reload: Mutex<()>,
    loose_cache: RwLock<HashMap<RefName, CachedLoose>>,
    peel_cache: RwLock<HashMap<RefName, (ObjectId, Peeled)>>,
    policy: RefLogPolicy,
    ident: Option<Ident>,
    atomic_support: bool,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl RefDirectory {
    pub fn new(git_dir: impl AsRef<Path>) -> Self {
        Self::with_policy(git_dir, RefLogPolicy::default())
    }

    pub fn with_policy(git_dir: impl AsRef<Path>, policy: RefLogPolicy) -> Self {
        Self {
            git_dir: git_dir.as_ref().to_path_buf(),
            packed: ArcSwap::from_pointee(PackedRefs::empty()),
            packed_reload: Mutex::new(()),
            loose_cache: RwLock::new(HashMap::new()),
            peel_cache: RwLock::new(HashMap::new()),
            policy,
            ident: None,
            atomic_support: true,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Identity recorded in reflog lines when a command carries none.
    pub fn set_ident(&mut self, ident: Ident) {
        self.ident = Some(ident);
    }

    pub(crate) fn ident(&self) -> Option<&Ident> {
        self.ident.as_ref()
    }

    pub(crate) fn policy(&self) -> &RefLogPolicy {
        &self.policy
    }

    /// Whether batch updates may run with `atomic = true`.
    pub fn performs_atomic_transactions(&self) -> bool {
        self.atomic_support
    }

    /// Turn atomic transaction support off (some deployments disable it
    /// to match a replicated backend that cannot honor it).
    pub fn set_atomic_support(&mut self, supported: bool) {
        self.atomic_support = supported;
    }

    /// Register a callback run after every successful ref publish.
    pub fn on_change(&self, listener: impl Fn(&RefName) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }

    pub(crate) fn notify_changed(&self, name: &RefName) {
        for listener in self.listeners.lock().iter() {
            listener(name);
        }
    }

    /// The current packed-refs snapshot, reloading if the file moved.
    pub fn packed_snapshot(&self) -> Result<Arc<PackedRefs>, RefError> {
        let current = self.packed.load_full();
        if !current.is_outdated(&self.git_dir) {
            return Ok(current);
        }

        // Serialize the reload; parsing happens outside any read path.
        let _guard = self.packed_reload.lock();
        let current = self.packed.load_full();
        if !current.is_outdated(&self.git_dir) {
            return Ok(current);
        }
        debug!(dir = %self.git_dir.display(), "reloading packed-refs");
        let fresh = Arc::new(PackedRefs::load(&self.git_dir)?);
        self.packed.store(Arc::clone(&fresh));
        Ok(fresh)
    }

    pub(crate) fn install_packed(&self, packed: PackedRefs) {
        self.packed.store(Arc::new(packed));
    }

    /// Read the loose tier for `name`, honoring the per-file mtime
    /// cache.
    pub(crate) fn read_loose(&self, name: &RefName) -> Result<Option<LooseValue>, RefError> {
        let on_disk_mtime = loose::mtime(&self.git_dir, name);
        if let Some(cached) = self.loose_cache.read().get(name) {
            if cached.mtime.is_some() && cached.mtime == on_disk_mtime {
                return Ok(Some(cached.value.clone()));
            }
        }

        match loose::read(&self.git_dir, name)? {
            Some(read) => {
                self.loose_cache.write().insert(
                    name.clone(),
                    CachedLoose {
                        mtime: read.mtime,
                        value: read.value.clone(),
                    },
                );
                Ok(Some(read.value))
            }
            None => {
                self.loose_cache.write().remove(name);
                Ok(None)
            }
        }
    }

    pub(crate) fn forget_loose(&self, name: &RefName) {
        self.loose_cache.write().remove(name);
        self.peel_cache.write().remove(name);
    }

    /// Look up exactly `name`, without short-name expansion.
    ///
    /// A symbolic ref comes back as such; callers wanting the leaf use
    /// [`leaf_ref`](Self::leaf_ref) or [`resolve`](Self::resolve).
    pub fn exact_ref(&self, name: &RefName) -> Result<Option<Ref>, RefError> {
        let packed = self.packed_snapshot()?;
        match self.read_loose(name)? {
            Some(LooseValue::Symbolic(target)) => {
                Ok(Some(Ref::symbolic(name.clone(), target, Storage::Loose)))
            }
            Some(LooseValue::Direct(id)) => {
                let storage = if packed.contains(name) {
                    Storage::LoosePacked
                } else {
                    Storage::Loose
                };
                Ok(Some(Ref::direct(name.clone(), id, storage)))
            }
            None => Ok(packed
                .find(name)
                .map(|entry| entry.to_ref(packed.peeled_header()))),
        }
    }

    /// Follow symbolic chains from `name` to a direct ref.
    ///
    /// `Ok(None)` when the name does not exist, points (possibly
    /// transitively) at an unborn ref, or the chain exceeds
    /// [`MAX_SYMREF_DEPTH`].
    pub fn leaf_ref(&self, name: &RefName) -> Result<Option<Ref>, RefError> {
        let mut current = match self.exact_ref(name)? {
            Some(r) => r,
            None => return Ok(None),
        };
        for _ in 0..MAX_SYMREF_DEPTH {
            match &current.value {
                RefValue::Direct { .. } => return Ok(Some(current)),
                RefValue::Symbolic { target } => match self.exact_ref(target)? {
                    Some(next) => current = next,
                    None => return Ok(None),
                },
            }
        }
        // Still symbolic after the cap: report as absent, not an error.
        Ok(None)
    }

    /// The object id `name` ultimately points at.
    pub fn resolve(&self, name: &RefName) -> Result<Option<ObjectId>, RefError> {
        Ok(self.leaf_ref(name)?.and_then(|r| r.id()))
    }

    /// Resolve a short name along the standard search path.
    pub fn find_ref(&self, short: &str) -> Result<Option<Ref>, RefError> {
        for prefix in SEARCH_PATH {
            let full = format!("{prefix}{short}");
            let name = match RefName::new(full) {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Some(found) = self.exact_ref(&name)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// All refs whose full name starts with `prefix` (empty for all),
    /// sorted by name, loose values winning over packed ones.
    pub fn refs_under(&self, prefix: &str) -> Result<Vec<Ref>, RefError> {
        let packed = self.packed_snapshot()?;
        let mut by_name: HashMap<RefName, Ref> = HashMap::new();

        for entry in packed.entries() {
            if entry.name.as_str().starts_with(prefix) {
                by_name.insert(entry.name.clone(), entry.to_ref(packed.peeled_header()));
            }
        }

        for name in loose::scan(&self.git_dir, prefix)? {
            match self.read_loose(&name)? {
                Some(LooseValue::Direct(id)) => {
                    let storage = if packed.contains(&name) {
                        Storage::LoosePacked
                    } else {
                        Storage::Loose
                    };
                    by_name.insert(name.clone(), Ref::direct(name, id, storage));
                }
                Some(LooseValue::Symbolic(target)) => {
                    by_name.insert(
                        name.clone(),
                        Ref::symbolic(name, target, Storage::Loose),
                    );
                }
                None => {}
            }
        }

        let mut refs: Vec<Ref> = by_name.into_values().collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    /// Every existing full ref name (used by conflict pre-checks).
    pub fn all_names(&self) -> Result<Vec<RefName>, RefError> {
        Ok(self.refs_under("")?.into_iter().map(|r| r.name).collect())
    }

    /// Would creating `name` collide with an existing ref above or
    /// below it in the namespace?
    pub fn is_name_conflicting(&self, name: &RefName) -> Result<bool, RefError> {
        // An existing ref at any strict prefix of the new name.
        for prefix in name.prefixes() {
            if let Ok(prefix_name) = RefName::new(prefix) {
                if self.exact_ref(&prefix_name)?.is_some() {
                    return Ok(true);
                }
            }
        }
        // An existing ref strictly below the new name.
        let below = format!("{}/", name.as_str());
        let packed = self.packed_snapshot()?;
        if packed
            .entries()
            .iter()
            .any(|e| e.name.as_str().starts_with(&below))
        {
            return Ok(true);
        }
        Ok(!loose::scan(&self.git_dir, &below)?.is_empty())
    }

    /// Peel a direct ref through its tag chain.
    ///
    /// The result is cached per name and trusted only while the ref
    /// still points at the id it was peeled from. Non-tag refs are
    /// marked peeled-with-nothing so the walk is not repeated.
    pub fn peel(&self, r: &Ref, walker: &dyn Walker) -> Result<Ref, RefError> {
        if r.is_peeled() {
            return Ok(r.clone());
        }
        let id = match r.id() {
            Some(id) => id,
            None => return Ok(r.clone()), // symbolic: nothing to peel here
        };

        if let Some((cached_id, peeled)) = self.peel_cache.read().get(&r.name).copied() {
            if cached_id == id {
                return Ok(with_peeled(r, peeled));
            }
        }

        let peeled = match walker.tag_target(&id)? {
            None => Peeled::NonTag,
            Some(mut target) => {
                let mut seen = std::collections::HashSet::from([id, target]);
                while let Some(next) = walker.tag_target(&target)? {
                    if !seen.insert(next) {
                        return Err(RefError::Walk(format!(
                            "tag chain from {id} loops at {next}"
                        )));
                    }
                    target = next;
                }
                Peeled::Tag(target)
            }
        };

        self.peel_cache.write().insert(r.name.clone(), (id, peeled));
        Ok(with_peeled(r, peeled))
    }

    /// Atomically point `name` at another ref (`ref: <target>`).
    ///
    /// Reflog lines go to the leaf first, then to `name` itself when it
    /// is distinct from the leaf.
    pub fn link(&self, name: &RefName, target: &RefName, message: &str) -> Result<(), RefError> {
        let old_id = self.resolve(name)?.unwrap_or(ObjectId::ZERO);

        let path = loose::path_for(&self.git_dir, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RefError::IoAt {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let mut lock = LockFile::acquire(&path)?;
        lock.write_all(&loose::encode(&LooseValue::Symbolic(target.clone())))
            .map_err(|e| RefError::IoAt {
                path: path.clone(),
                source: e,
            })?;
        lock.commit()?;
        self.forget_loose(name);

        if let Some(new_id) = self.resolve(name)? {
            let who = match self.ident().cloned() {
                Some(who) => who,
                None => Ident::new("coffer", "coffer@localhost", coffer_util::When::now()),
            };
            let entry = ReflogEntry {
                old_id,
                new_id,
                who,
                message: message.into(),
            };
            let leaf = self.leaf_ref(name)?.map(|r| r.name);
            if let Some(leaf) = leaf.filter(|leaf| leaf != name) {
                self.maybe_log(&leaf, false, &entry)?;
            }
            self.maybe_log(name, false, &entry)?;
        }

        self.notify_changed(name);
        Ok(())
    }

    /// Append a reflog entry when policy allows it.
    ///
    /// Logging happens when it is not disabled for the command, and
    /// either the configured policy covers the ref name or its log file
    /// already exists.
    pub(crate) fn maybe_log(
        &self,
        name: &RefName,
        disabled: bool,
        entry: &ReflogEntry,
    ) -> Result<(), RefError> {
        if disabled {
            return Ok(());
        }
        let covered = self.policy.log_all_ref_updates
            && (name.as_str().starts_with("HEAD") || name.is_branch() || name.is_remote());
        if covered || reflog::exists(&self.git_dir, name) {
            reflog::append(&self.git_dir, name, entry)?;
        }
        Ok(())
    }

    /// Remove `name` from packed-refs, rewriting the file under its own
    /// lock. No-op when the name is not packed.
    pub(crate) fn remove_from_packed(&self, name: &RefName) -> Result<(), RefError> {
        let path = crate::packed::file_path(&self.git_dir);
        let mut lock = LockFile::acquire(&path)?;

        // Re-read under the lock; our cache may be stale.
        let on_disk = PackedRefs::load(&self.git_dir)?;
        match on_disk.without(name) {
            None => {
                lock.abort()?;
                self.install_packed(on_disk);
            }
            Some(updated) => {
                lock.write_all(&updated.to_bytes()).map_err(|e| RefError::IoAt {
                    path: path.clone(),
                    source: e,
                })?;
                lock.commit_and_sync_dir()?;
                // Pick up the rewritten file's stamp.
                self.install_packed(PackedRefs::load(&self.git_dir)?);
            }
        }
        Ok(())
    }

    /// Fold the current loose value of `name` into packed-refs and drop
    /// the loose file.
    pub fn pack_ref(&self, name: &RefName, walker: &dyn Walker) -> Result<(), RefError> {
        let current = match self.exact_ref(name)? {
            Some(r) if !r.is_symbolic() => r,
            _ => return Ok(()),
        };
        let id = current.id().expect("direct ref has an id");
        let peeled = self.peel(&current, walker)?.peeled_id();

        let path = crate::packed::file_path(&self.git_dir);
        let mut lock = LockFile::acquire(&path)?;
        let on_disk = PackedRefs::load(&self.git_dir)?;
        let updated = on_disk.with_updated(name.clone(), id, peeled);
        lock.write_all(&updated.to_bytes()).map_err(|e| RefError::IoAt {
            path: path.clone(),
            source: e,
        })?;
        lock.commit_and_sync_dir()?;
        self.install_packed(PackedRefs::load(&self.git_dir)?);

        loose::remove(&self.git_dir, name)?;
        self.forget_loose(name);
        self.notify_changed(name);
        Ok(())
    }
}

fn with_peeled(r: &Ref, peeled: Peeled) -> Ref {
    let mut out = r.clone();
    if let RefValue::Direct { id, .. } = &r.value {
        out.value = RefValue::Direct {
            id: *id,
            peeled,
        };
    }
    out
}
