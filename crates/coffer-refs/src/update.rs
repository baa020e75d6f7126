//! Single-ref updates: the compare-and-swap write protocol.
//!
//! An update locks the ref's loose file, re-reads the current value
//! under the lock, verifies the caller's expectation, classifies the
//! movement against the commit graph, and only then renames the new
//! value into place. Ordinary failures come back as [`UpdateResult`]
//! values; the operation itself returns `Ok` for all of them.

use std::io::Write;

use bstr::BString;
use coffer_id::ObjectId;
use coffer_util::{Ident, LockFile, When};
use tracing::debug;

use crate::dir::{RefDirectory, MAX_SYMREF_DEPTH};
use crate::loose::{self, LooseValue};
use crate::name::RefName;
use crate::reflog::ReflogEntry;
use crate::{is_merged_into, RefError, RefValue, Walker};

/// Terminal state of one ref update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    NotAttempted,
    /// The ref did not exist and was created.
    New,
    /// Old and new value were identical.
    NoChange,
    /// The new value is a descendant of the old.
    FastForward,
    /// History was discarded, permitted by force.
    Forced,
    /// Non-fast-forward without force.
    Rejected,
    /// Refused to delete the branch `HEAD` points at.
    RejectedCurrentBranch,
    /// The lock could not be taken or the expected value did not hold.
    LockFailure,
    IoFailure,
    Renamed,
    /// The proposed value is not present in the object database.
    RejectedMissingObject,
    RejectedOtherReason,
}

impl UpdateResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::New | Self::NoChange | Self::FastForward | Self::Forced | Self::Renamed
        )
    }
}

/// A pending update of one ref.
pub struct RefUpdate<'a> {
    refs: &'a RefDirectory,
    name: RefName,
    new_id: ObjectId,
    expected_old: Option<ObjectId>,
    force: bool,
    log_message: Option<BString>,
    log_append_status: bool,
    disable_log: bool,
    ident: Option<Ident>,
    result: UpdateResult,
}

impl RefDirectory {
    /// Start an update of `name`.
    pub fn new_update(&self, name: RefName) -> RefUpdate<'_> {
        RefUpdate {
            refs: self,
            name,
            new_id: ObjectId::ZERO,
            expected_old: None,
            force: false,
            log_message: None,
            log_append_status: false,
            disable_log: false,
            ident: None,
            result: UpdateResult::NotAttempted,
        }
    }
}

impl<'a> RefUpdate<'a> {
    pub fn name(&self) -> &RefName {
        &self.name
    }

    pub fn result(&self) -> UpdateResult {
        self.result
    }

    /// The value to install. Leave zero to delete.
    pub fn set_new_id(&mut self, id: ObjectId) -> &mut Self {
        self.new_id = id;
        self
    }

    /// Require the on-disk value at lock time. `Some(ObjectId::ZERO)`
    /// asserts the ref must not exist; `None` skips the check.
    pub fn set_expected_old_id(&mut self, expected: Option<ObjectId>) -> &mut Self {
        self.expected_old = expected;
        self
    }

    /// Permit non-fast-forward movement.
    pub fn set_force(&mut self, force: bool) -> &mut Self {
        self.force = force;
        self
    }

    /// Reflog message. `None` with `append_status` keeps an empty
    /// message and still appends the status suffix.
    pub fn set_log_message(&mut self, message: Option<&str>, append_status: bool) -> &mut Self {
        self.log_message = Some(BString::from(message.unwrap_or("")));
        self.log_append_status = append_status;
        self
    }

    /// Suppress the reflog for this update only.
    pub fn disable_log(&mut self) -> &mut Self {
        self.disable_log = true;
        self
    }

    pub fn set_ident(&mut self, ident: Ident) -> &mut Self {
        self.ident = Some(ident);
        self
    }

    /// Apply the update (create, move, or no-op).
    pub fn update(&mut self, walker: &dyn Walker) -> Result<UpdateResult, RefError> {
        self.result = match self.run(walker, false) {
            Ok(result) => result,
            Err(e) => {
                debug!(name = %self.name, error = %e, "ref update failed");
                UpdateResult::IoFailure
            }
        };
        Ok(self.result)
    }

    /// Remove the ref from both tiers.
    pub fn delete(&mut self, walker: &dyn Walker) -> Result<UpdateResult, RefError> {
        self.new_id = ObjectId::ZERO;
        self.result = match self.run(walker, true) {
            Ok(result) => result,
            Err(e) => {
                debug!(name = %self.name, error = %e, "ref delete failed");
                UpdateResult::IoFailure
            }
        };
        Ok(self.result)
    }

    fn run(&mut self, walker: &dyn Walker, deleting: bool) -> Result<UpdateResult, RefError> {
        let target = self.dereferenced_name()?;

        // A brand-new name must not collide with the namespace around it.
        if self.refs.exact_ref(&target)?.is_none() && self.refs.is_name_conflicting(&target)? {
            return Ok(UpdateResult::LockFailure);
        }

        let path = loose::path_for(self.refs.git_dir(), &target);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RefError::IoAt {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let mut lock = match LockFile::try_acquire(&path)? {
            Some(lock) => lock,
            None => return Ok(UpdateResult::LockFailure),
        };

        // Authoritative re-read under the lock.
        let old_id = match loose::read(self.refs.git_dir(), &target)? {
            Some(read) => match read.value {
                LooseValue::Direct(id) => Some(id),
                LooseValue::Symbolic(_) => {
                    // The chain changed between deref and lock; retreat.
                    lock.abort()?;
                    return Ok(UpdateResult::LockFailure);
                }
            },
            None => self
                .refs
                .packed_snapshot()?
                .find(&target)
                .map(|entry| entry.id),
        };

        if let Some(expected) = self.expected_old {
            let holds = if expected.is_zero() {
                old_id.is_none()
            } else {
                old_id == Some(expected)
            };
            if !holds {
                lock.abort()?;
                return Ok(UpdateResult::LockFailure);
            }
        }

        if deleting {
            return self.finish_delete(lock, &target, old_id);
        }

        if !walker.has_object(&self.new_id) {
            lock.abort()?;
            return Ok(UpdateResult::RejectedMissingObject);
        }

        let result = match old_id {
            None => UpdateResult::New,
            Some(old) if old == self.new_id => UpdateResult::NoChange,
            Some(old) => {
                if is_merged_into(walker, &old, &self.new_id)? {
                    UpdateResult::FastForward
                } else if self.force {
                    UpdateResult::Forced
                } else {
                    lock.abort()?;
                    return Ok(UpdateResult::Rejected);
                }
            }
        };

        if result == UpdateResult::NoChange {
            lock.abort()?;
            return Ok(UpdateResult::NoChange);
        }

        lock.write_all(&loose::encode(&LooseValue::Direct(self.new_id)))
            .map_err(|e| RefError::IoAt {
                path: path.clone(),
                source: e,
            })?;
        lock.commit()?;
        self.refs.forget_loose(&target);

        self.log(&target, old_id.unwrap_or(ObjectId::ZERO), self.new_id, result)?;
        self.refs.notify_changed(&target);
        Ok(result)
    }

    fn finish_delete(
        &mut self,
        lock: LockFile,
        target: &RefName,
        old_id: Option<ObjectId>,
    ) -> Result<UpdateResult, RefError> {
        if old_id.is_none() {
            lock.abort()?;
            return Ok(UpdateResult::NoChange);
        }

        // Never remove the branch HEAD currently points at.
        let head = RefName::new_unchecked("HEAD");
        if let Some(head_ref) = self.refs.exact_ref(&head)? {
            if let RefValue::Symbolic { target: head_target } = &head_ref.value {
                if head_target == target {
                    lock.abort()?;
                    return Ok(UpdateResult::RejectedCurrentBranch);
                }
            }
        }

        // Drop the packed entry first so a racing reader cannot resurrect
        // the name from the packed tier after the loose file goes.
        self.refs.remove_from_packed(target)?;
        lock.abort()?; // release before unlinking the loose file
        loose::remove(self.refs.git_dir(), target)?;
        self.refs.forget_loose(target);

        self.log(
            target,
            old_id.unwrap_or(ObjectId::ZERO),
            ObjectId::ZERO,
            UpdateResult::Forced,
        )?;
        let log_path = crate::reflog::path_for(self.refs.git_dir(), target);
        if log_path.is_file() {
            std::fs::remove_file(&log_path).map_err(|e| RefError::IoAt {
                path: log_path,
                source: e,
            })?;
        }

        self.refs.notify_changed(target);
        Ok(UpdateResult::Forced)
    }

    /// Resolve symbolic chains so the update lands on the leaf, the way
    /// a commit through `HEAD` moves the current branch.
    fn dereferenced_name(&self) -> Result<RefName, RefError> {
        let mut name = self.name.clone();
        for _ in 0..MAX_SYMREF_DEPTH {
            match self.refs.exact_ref(&name)? {
                Some(r) => match r.value {
                    RefValue::Symbolic { target } => name = target,
                    RefValue::Direct { .. } => return Ok(name),
                },
                None => return Ok(name),
            }
        }
        Ok(name)
    }

    fn log(
        &self,
        target: &RefName,
        old_id: ObjectId,
        new_id: ObjectId,
        result: UpdateResult,
    ) -> Result<(), RefError> {
        let mut message = self.log_message.clone().unwrap_or_default();
        if self.log_append_status {
            let status = match result {
                UpdateResult::FastForward => Some("fast-forward"),
                UpdateResult::Forced => Some("forced-update"),
                _ => None,
            };
            if let Some(status) = status {
                if !message.is_empty() {
                    message.extend_from_slice(b": ");
                }
                message.extend_from_slice(status.as_bytes());
            }
        }

        let who = self
            .ident
            .clone()
            .or_else(|| self.refs.ident().cloned())
            .unwrap_or_else(|| Ident::new("coffer", "coffer@localhost", When::now()));

        let entry = ReflogEntry {
            old_id,
            new_id,
            who,
            message,
        };
        self.refs.maybe_log(target, self.disable_log, &entry)?;

        // A write through a symbolic name also logs the symref itself.
        if *target != self.name {
            self.refs.maybe_log(&self.name, self.disable_log, &entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflog;
    use crate::testutil::{ident, oid, GraphWalker};
    use crate::{PackedRefs, Storage};

    fn graph() -> GraphWalker {
        let mut walker = GraphWalker::default();
        walker.commit(oid(1), &[]);
        walker.commit(oid(2), &[oid(1)]);
        walker.commit(oid(3), &[oid(2)]);
        walker.commit(oid(9), &[]); // unrelated history
        walker
    }

    fn refs(dir: &std::path::Path) -> RefDirectory {
        let mut refs = RefDirectory::new(dir);
        refs.set_ident(ident());
        refs
    }

    fn main_branch() -> RefName {
        RefName::new("refs/heads/main").unwrap()
    }

    fn create_main(refs: &RefDirectory, id: coffer_id::ObjectId) {
        let mut up = refs.new_update(main_branch());
        up.set_new_id(id);
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::New);
    }

    #[test]
    fn create_then_fast_forward() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        create_main(&refs, oid(1));

        let mut up = refs.new_update(main_branch());
        up.set_new_id(oid(2)).set_expected_old_id(Some(oid(1)));
        up.set_log_message(Some("commit: second"), false);
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::FastForward);

        assert_eq!(refs.resolve(&main_branch()).unwrap(), Some(oid(2)));
        let on_disk =
            std::fs::read_to_string(dir.path().join("refs/heads/main")).unwrap();
        assert_eq!(on_disk, format!("{}\n", oid(2).to_hex()));

        let log = reflog::read(dir.path(), &main_branch()).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].old_id, oid(1));
        assert_eq!(log[0].new_id, oid(2));
        assert_eq!(log[0].message, "commit: second");
    }

    #[test]
    fn non_fast_forward_needs_force() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        create_main(&refs, oid(3));

        let mut up = refs.new_update(main_branch());
        up.set_new_id(oid(9));
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::Rejected);
        assert_eq!(refs.resolve(&main_branch()).unwrap(), Some(oid(3)));

        let mut up = refs.new_update(main_branch());
        up.set_new_id(oid(9)).set_force(true);
        up.set_log_message(Some("reset"), true);
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::Forced);
        assert_eq!(refs.resolve(&main_branch()).unwrap(), Some(oid(9)));

        let log = reflog::read(dir.path(), &main_branch()).unwrap();
        assert_eq!(log[0].message, "reset: forced-update");
    }

    #[test]
    fn expectation_mismatch_is_lock_failure_and_leaves_disk_alone() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        create_main(&refs, oid(2));

        let mut up = refs.new_update(main_branch());
        up.set_new_id(oid(3)).set_expected_old_id(Some(oid(1)));
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::LockFailure);
        assert_eq!(refs.resolve(&main_branch()).unwrap(), Some(oid(2)));

        // Must-not-exist assertion against an existing ref.
        let mut up = refs.new_update(main_branch());
        up.set_new_id(oid(3))
            .set_expected_old_id(Some(ObjectId::ZERO));
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::LockFailure);
    }

    #[test]
    fn no_change_when_value_already_matches() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        create_main(&refs, oid(2));

        let mut up = refs.new_update(main_branch());
        up.set_new_id(oid(2));
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::NoChange);
        // No reflog line for a no-op.
        assert_eq!(reflog::read(dir.path(), &main_branch()).unwrap().len(), 1);
    }

    #[test]
    fn missing_object_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());

        let mut up = refs.new_update(main_branch());
        up.set_new_id(oid(42)); // not in the walker's graph
        assert_eq!(
            up.update(&graph()).unwrap(),
            UpdateResult::RejectedMissingObject
        );
        assert!(refs.resolve(&main_branch()).unwrap().is_none());
    }

    #[test]
    fn held_lock_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        create_main(&refs, oid(1));

        let _foreign = LockFile::acquire(dir.path().join("refs/heads/main")).unwrap();
        let mut up = refs.new_update(main_branch());
        up.set_new_id(oid(2));
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::LockFailure);
    }

    #[test]
    fn delete_removes_both_tiers_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        let name = RefName::new("refs/heads/team/topic").unwrap();

        PackedRefs::empty()
            .with_updated(name.clone(), oid(1), None)
            .write(dir.path())
            .unwrap();
        let mut up = refs.new_update(name.clone());
        up.set_new_id(oid(2)).set_force(true);
        up.update(&graph()).unwrap();
        assert_eq!(refs.exact_ref(&name).unwrap().unwrap().storage, Storage::LoosePacked);

        let mut del = refs.new_update(name.clone());
        del.set_expected_old_id(Some(oid(2)));
        assert_eq!(del.delete(&graph()).unwrap(), UpdateResult::Forced);

        assert!(refs.exact_ref(&name).unwrap().is_none());
        assert!(!dir.path().join("refs/heads/team").exists());
        assert!(!reflog::exists(dir.path(), &name));
    }

    #[test]
    fn delete_of_missing_ref_is_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        let mut del = refs.new_update(main_branch());
        assert_eq!(del.delete(&graph()).unwrap(), UpdateResult::NoChange);
    }

    #[test]
    fn deleting_the_current_branch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        create_main(&refs, oid(1));
        std::fs::write(dir.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();

        let mut del = refs.new_update(main_branch());
        assert_eq!(
            del.delete(&graph()).unwrap(),
            UpdateResult::RejectedCurrentBranch
        );
        assert_eq!(refs.resolve(&main_branch()).unwrap(), Some(oid(1)));
    }

    #[test]
    fn update_through_symref_moves_the_leaf_and_logs_both() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        create_main(&refs, oid(1));
        std::fs::write(dir.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();

        let head = RefName::new("HEAD").unwrap();
        let mut up = refs.new_update(head.clone());
        up.set_new_id(oid(2));
        up.set_log_message(Some("commit: via HEAD"), false);
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::FastForward);

        // The leaf moved; HEAD still points at the branch.
        assert_eq!(refs.resolve(&main_branch()).unwrap(), Some(oid(2)));
        assert!(refs.exact_ref(&head).unwrap().unwrap().is_symbolic());

        let branch_log = reflog::read(dir.path(), &main_branch()).unwrap();
        let head_log = reflog::read(dir.path(), &head).unwrap();
        assert_eq!(branch_log[0].message, "commit: via HEAD");
        assert_eq!(head_log[0].message, "commit: via HEAD");
    }

    #[test]
    fn create_under_existing_name_is_lock_failure() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        create_main(&refs, oid(1));

        let nested = RefName::new("refs/heads/main/sub").unwrap();
        let mut up = refs.new_update(nested);
        up.set_new_id(oid(2));
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::LockFailure);
    }

    #[test]
    fn empty_message_with_append_status() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        create_main(&refs, oid(1));

        let mut up = refs.new_update(main_branch());
        up.set_new_id(oid(2)).set_log_message(None, true);
        assert_eq!(up.update(&graph()).unwrap(), UpdateResult::FastForward);

        let log = reflog::read(dir.path(), &main_branch()).unwrap();
        assert_eq!(log[0].message, "fast-forward");
    }

    #[test]
    fn disabled_log_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let refs = refs(dir.path());
        create_main(&refs, oid(1));
        let before = reflog::read(dir.path(), &main_branch()).unwrap().len();

        let mut up = refs.new_update(main_branch());
        up.set_new_id(oid(2)).disable_log();
        up.update(&graph()).unwrap();

        assert_eq!(reflog::read(dir.path(), &main_branch()).unwrap().len(), before);
    }
}
