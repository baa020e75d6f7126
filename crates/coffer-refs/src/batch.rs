//! Batch ref updates: many commands, one coordinated application.
//!
//! The batch runs in phases: an atomicity gate, a timestamp barrier,
//! missing-object validation, type classification, deletions (freeing
//! their names), a namespace conflict pre-check for creations, and
//! finally the per-ref compare-and-swap protocol. Every command ends
//! with a terminal [`UpdateResult`] and an optional message; only a
//! database that cannot be used at all raises an error.

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::time::{Duration, Instant, SystemTime};

use coffer_id::ObjectId;
use coffer_util::{Ident, LockFile, When};
use tracing::debug;

use crate::dir::RefDirectory;
use crate::loose::{self, LooseValue};
use crate::name::RefName;
use crate::reflog::ReflogEntry;
use crate::update::UpdateResult;
use crate::{is_merged_into, RefError, Walker};

/// How a command moves its ref, derived from the ids and the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Create,
    Update,
    UpdateNonFastForward,
    Delete,
}

/// One unit of a batch: move `name` from `old_id` to `new_id`.
///
/// A zero `old_id` means create; a zero `new_id` means delete.
#[derive(Debug, Clone)]
pub struct ReceiveCommand {
    old_id: ObjectId,
    new_id: ObjectId,
    name: RefName,
    cmd_type: Option<CommandType>,
    result: UpdateResult,
    message: Option<String>,
    log_message_override: Option<String>,
    disable_log: bool,
}

impl ReceiveCommand {
    pub fn new(old_id: ObjectId, new_id: ObjectId, name: RefName) -> Self {
        Self {
            old_id,
            new_id,
            name,
            cmd_type: None,
            result: UpdateResult::NotAttempted,
            message: None,
            log_message_override: None,
            disable_log: false,
        }
    }

    pub fn create(new_id: ObjectId, name: RefName) -> Self {
        Self::new(ObjectId::ZERO, new_id, name)
    }

    pub fn update(old_id: ObjectId, new_id: ObjectId, name: RefName) -> Self {
        Self::new(old_id, new_id, name)
    }

    pub fn delete(old_id: ObjectId, name: RefName) -> Self {
        Self::new(old_id, ObjectId::ZERO, name)
    }

    /// Use a reflog message different from the batch-wide one.
    pub fn with_log_message(mut self, message: impl Into<String>) -> Self {
        self.log_message_override = Some(message.into());
        self
    }

    /// Keep this command out of the reflog.
    pub fn with_log_disabled(mut self) -> Self {
        self.disable_log = true;
        self
    }

    pub fn name(&self) -> &RefName {
        &self.name
    }

    pub fn old_id(&self) -> ObjectId {
        self.old_id
    }

    pub fn new_id(&self) -> ObjectId {
        self.new_id
    }

    /// The classification computed during execution.
    pub fn command_type(&self) -> Option<CommandType> {
        self.cmd_type
    }

    pub fn result(&self) -> UpdateResult {
        self.result
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_settled(&self) -> bool {
        self.result != UpdateResult::NotAttempted
    }

    fn settle(&mut self, result: UpdateResult, message: Option<&str>) {
        self.result = result;
        self.message = message.map(str::to_owned);
    }
}

/// Coordinates a set of [`ReceiveCommand`]s against one ref directory.
pub struct BatchRefUpdate {
    commands: Vec<ReceiveCommand>,
    atomic: bool,
    allow_non_fast_forwards: bool,
    log_message: Option<String>,
    log_append_status: bool,
    disable_log: bool,
    ident: Option<Ident>,
    wait_for: Vec<SystemTime>,
    max_wait: Duration,
    push_options: Vec<String>,
    push_cert: Option<String>,
}

/// Default ceiling on the timestamp barrier.
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

impl BatchRefUpdate {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            atomic: false,
            allow_non_fast_forwards: false,
            log_message: None,
            log_append_status: false,
            disable_log: false,
            ident: None,
            wait_for: Vec::new(),
            max_wait: DEFAULT_MAX_WAIT,
            push_options: Vec::new(),
            push_cert: None,
        }
    }

    pub fn add(&mut self, command: ReceiveCommand) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn commands(&self) -> &[ReceiveCommand] {
        &self.commands
    }

    /// All-or-nothing application.
    pub fn set_atomic(&mut self, atomic: bool) -> &mut Self {
        self.atomic = atomic;
        self
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn set_allow_non_fast_forwards(&mut self, allow: bool) -> &mut Self {
        self.allow_non_fast_forwards = allow;
        self
    }

    /// Batch-wide reflog message; commands may override individually.
    pub fn set_log_message(&mut self, message: Option<&str>, append_status: bool) -> &mut Self {
        self.log_message = message.map(str::to_owned);
        self.log_append_status = append_status;
        self
    }

    pub fn disable_log(&mut self) -> &mut Self {
        self.disable_log = true;
        self
    }

    pub fn set_ident(&mut self, ident: Ident) -> &mut Self {
        self.ident = Some(ident);
        self
    }

    /// Block until `timestamp` is in the past before touching any ref.
    pub fn wait_for_timestamp(&mut self, timestamp: SystemTime) -> &mut Self {
        self.wait_for.push(timestamp);
        self
    }

    pub fn set_max_timestamp_wait(&mut self, max_wait: Duration) -> &mut Self {
        self.max_wait = max_wait;
        self
    }

    /// Options the pushing client sent along (opaque to the engine).
    pub fn set_push_options(&mut self, options: Vec<String>) -> &mut Self {
        self.push_options = options;
        self
    }

    pub fn push_options(&self) -> &[String] {
        &self.push_options
    }

    /// The raw push certificate, if one was supplied (opaque).
    pub fn set_push_certificate(&mut self, cert: impl Into<String>) -> &mut Self {
        self.push_cert = Some(cert.into());
        self
    }

    pub fn push_certificate(&self) -> Option<&str> {
        self.push_cert.as_deref()
    }

    /// Run the batch. Per-command outcomes land on the commands.
    pub fn execute(
        &mut self,
        refs: &RefDirectory,
        walker: &dyn Walker,
    ) -> Result<(), RefError> {
        // Phase 1: atomicity gate.
        if self.atomic && !refs.performs_atomic_transactions() {
            self.reject_remaining("atomic updates not supported");
            return Ok(());
        }

        // Phase 2: timestamp barrier.
        if !self.await_timestamps() {
            self.reject_remaining("time is uncertain");
            return Ok(());
        }

        // Phase 3: every referenced object must exist.
        for cmd in self.commands.iter_mut().filter(|c| !c.is_settled()) {
            for id in [cmd.old_id, cmd.new_id] {
                if !id.is_zero() && !walker.has_object(&id) {
                    cmd.settle(UpdateResult::RejectedMissingObject, Some(&id.to_hex()));
                    break;
                }
            }
        }

        // Phase 4: classify by ids and ancestry.
        for cmd in self.commands.iter_mut().filter(|c| !c.is_settled()) {
            cmd.cmd_type = Some(if cmd.old_id.is_zero() {
                CommandType::Create
            } else if cmd.new_id.is_zero() {
                CommandType::Delete
            } else if is_merged_into(walker, &cmd.old_id, &cmd.new_id)? {
                CommandType::Update
            } else {
                CommandType::UpdateNonFastForward
            });
        }

        if self.atomic {
            self.execute_atomic(refs, walker)?;
        } else {
            self.execute_independent(refs, walker)?;
        }

        debug!(batch = %self, "batch ref update finished");
        Ok(())
    }

    /// Non-atomic path: each command stands alone.
    fn execute_independent(
        &mut self,
        refs: &RefDirectory,
        walker: &dyn Walker,
    ) -> Result<(), RefError> {
        // Phase 5: deletions first, freeing names for later creations.
        for i in self.pending_of_type(CommandType::Delete) {
            let (name, old_id, disable, _) = self.command_params(i);
            let mut up = refs.new_update(name);
            up.set_expected_old_id(Some(old_id));
            if disable {
                up.disable_log();
            }
            let result = up.delete(walker)?;
            self.commands[i].settle(result, None);
        }

        // Phase 6: namespace pre-check for creations.
        self.precheck_creations(refs)?;

        // Phase 7: remaining creations and updates.
        for i in 0..self.commands.len() {
            if self.commands[i].is_settled() {
                continue;
            }
            let cmd_type = match self.commands[i].cmd_type {
                Some(t) if t != CommandType::Delete => t,
                _ => continue,
            };
            if cmd_type == CommandType::UpdateNonFastForward && !self.allow_non_fast_forwards {
                self.commands[i].settle(UpdateResult::Rejected, Some("non-fast-forward"));
                continue;
            }

            let (name, old_id, disable, log_message) = self.command_params(i);
            let new_id = self.commands[i].new_id;
            let mut up = refs.new_update(name);
            up.set_new_id(new_id);
            up.set_expected_old_id(Some(if cmd_type == CommandType::Create {
                ObjectId::ZERO
            } else {
                old_id
            }));
            up.set_force(self.allow_non_fast_forwards);
            if disable {
                up.disable_log();
            } else {
                up.set_log_message(log_message.as_deref(), self.log_append_status);
            }
            if let Some(ident) = &self.ident {
                up.set_ident(ident.clone());
            }
            let result = up.update(walker)?;
            self.commands[i].settle(result, None);
        }
        Ok(())
    }

    /// Atomic path: lock everything, verify everything, then apply.
    ///
    /// Any failure before the apply step releases every lock without
    /// renaming and rejects the rest of the batch.
    fn execute_atomic(
        &mut self,
        refs: &RefDirectory,
        walker: &dyn Walker,
    ) -> Result<(), RefError> {
        self.precheck_creations(refs)?;
        if self.commands.iter().any(|c| c.is_settled()) {
            // A conflict already sank the transaction.
            self.reject_remaining("transaction aborted");
            return Ok(());
        }

        struct Prepared {
            index: usize,
            lock: LockFile,
            old_id: Option<ObjectId>,
            result: UpdateResult,
        }

        let mut prepared: Vec<Prepared> = Vec::new();
        let mut failed: Option<(usize, UpdateResult, String)> = None;

        for (index, cmd) in self.commands.iter().enumerate() {
            if cmd.is_settled() {
                continue;
            }
            let path = loose::path_for(refs.git_dir(), &cmd.name);
            if let Some(parent) = path.parent() {
                // A loose file occupying a parent (even one this batch is
                // about to delete) blocks the lock; sink the transaction.
                if std::fs::create_dir_all(parent).is_err() {
                    failed = Some((
                        index,
                        UpdateResult::LockFailure,
                        "cannot create ref directory".into(),
                    ));
                    break;
                }
            }
            let lock = match LockFile::try_acquire(&path)? {
                Some(lock) => lock,
                None => {
                    failed = Some((index, UpdateResult::LockFailure, "cannot lock".into()));
                    break;
                }
            };

            let old_id = match loose::read(refs.git_dir(), &cmd.name)? {
                Some(read) => match read.value {
                    LooseValue::Direct(id) => Some(id),
                    LooseValue::Symbolic(_) => {
                        failed = Some((
                            index,
                            UpdateResult::RejectedOtherReason,
                            "target is symbolic".into(),
                        ));
                        break;
                    }
                },
                None => refs.packed_snapshot()?.find(&cmd.name).map(|e| e.id),
            };

            let expected_holds = if cmd.old_id.is_zero() {
                old_id.is_none()
            } else {
                old_id == Some(cmd.old_id)
            };
            if !expected_holds {
                failed = Some((index, UpdateResult::LockFailure, "value moved".into()));
                break;
            }

            let result = match cmd.cmd_type {
                Some(CommandType::Create) => UpdateResult::New,
                Some(CommandType::Delete) => UpdateResult::Forced,
                Some(CommandType::Update) => UpdateResult::FastForward,
                Some(CommandType::UpdateNonFastForward) => {
                    if self.allow_non_fast_forwards {
                        UpdateResult::Forced
                    } else {
                        failed = Some((
                            index,
                            UpdateResult::Rejected,
                            "non-fast-forward".into(),
                        ));
                        break;
                    }
                }
                None => unreachable!("unclassified command in apply phase"),
            };

            prepared.push(Prepared {
                index,
                lock,
                old_id,
                result,
            });
        }

        if let Some((index, result, reason)) = failed {
            drop(prepared); // releases every lock without renaming
            self.commands[index].settle(result, Some(&reason));
            self.reject_remaining("transaction aborted");
            return Ok(());
        }

        // Point of no return: apply every command, deletions first so
        // creations observe the post-deletion namespace.
        prepared.sort_by_key(|p| !self.commands[p.index].new_id.is_zero());
        for p in prepared {
            let cmd = &self.commands[p.index];
            let name = cmd.name.clone();
            let new_id = cmd.new_id;
            let result = p.result;

            if new_id.is_zero() {
                refs.remove_from_packed(&name)?;
                p.lock.abort()?;
                loose::remove(refs.git_dir(), &name)?;
            } else {
                let mut lock = p.lock;
                lock.write_all(&loose::encode(&LooseValue::Direct(new_id)))
                    .map_err(|e| RefError::IoAt {
                        path: loose::path_for(refs.git_dir(), &name),
                        source: e,
                    })?;
                lock.commit()?;
            }
            refs.forget_loose(&name);

            let (_, _, disable, log_message) = self.command_params(p.index);
            if !new_id.is_zero() {
                let entry = ReflogEntry {
                    old_id: p.old_id.unwrap_or(ObjectId::ZERO),
                    new_id,
                    who: self.ident.clone().unwrap_or_else(|| {
                        refs.ident()
                            .cloned()
                            .unwrap_or_else(|| Ident::new("coffer", "coffer@localhost", When::now()))
                    }),
                    message: log_message.unwrap_or_default().into(),
                };
                refs.maybe_log(&name, disable, &entry)?;
            }

            self.commands[p.index].settle(result, None);
            refs.notify_changed(&name);
        }
        Ok(())
    }

    /// Phase 6: creations may not shadow or be shadowed by an existing
    /// name, nor by another creation in the same batch.
    fn precheck_creations(&mut self, refs: &RefDirectory) -> Result<(), RefError> {
        // Names this batch deletes are already free for its creations.
        let deleted: HashSet<String> = self
            .commands
            .iter()
            .filter(|c| !c.is_settled() && c.cmd_type == Some(CommandType::Delete))
            .map(|c| c.name.as_str().to_string())
            .collect();

        let mut taken_names: HashSet<String> = HashSet::new();
        let mut taken_prefixes: HashSet<String> = HashSet::new();
        for name in refs.all_names()? {
            if deleted.contains(name.as_str()) {
                continue;
            }
            for prefix in name.prefixes() {
                taken_prefixes.insert(prefix);
            }
            taken_names.insert(name.as_str().to_string());
        }

        for cmd in self.commands.iter_mut() {
            if cmd.is_settled() || cmd.cmd_type != Some(CommandType::Create) {
                continue;
            }
            let name = cmd.name.as_str().to_string();
            let prefixes = cmd.name.prefixes();

            if prefixes.iter().any(|p| taken_names.contains(p)) {
                cmd.settle(
                    UpdateResult::LockFailure,
                    Some("an existing ref shadows this name"),
                );
                continue;
            }
            if taken_prefixes.contains(&name) {
                cmd.settle(
                    UpdateResult::LockFailure,
                    Some("existing refs live under this name"),
                );
                continue;
            }
            taken_names.insert(name.clone());
            for prefix in prefixes {
                taken_prefixes.insert(prefix);
            }
        }
        Ok(())
    }

    /// Wait for every proposed timestamp to be in the past, within the
    /// per-batch budget. `false` on expiry.
    fn await_timestamps(&self) -> bool {
        if self.wait_for.is_empty() {
            return true;
        }
        let deadline = Instant::now() + self.max_wait;
        for &target in &self.wait_for {
            loop {
                if SystemTime::now() >= target {
                    break;
                }
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        true
    }

    fn reject_remaining(&mut self, reason: &str) {
        for cmd in self.commands.iter_mut().filter(|c| !c.is_settled()) {
            cmd.settle(UpdateResult::RejectedOtherReason, Some(reason));
        }
    }

    fn pending_of_type(&self, wanted: CommandType) -> Vec<usize> {
        self.commands
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_settled() && c.cmd_type == Some(wanted))
            .map(|(i, _)| i)
            .collect()
    }

    fn command_params(&self, i: usize) -> (RefName, ObjectId, bool, Option<String>) {
        let cmd = &self.commands[i];
        let message = cmd
            .log_message_override
            .clone()
            .or_else(|| self.log_message.clone());
        (
            cmd.name.clone(),
            cmd.old_id,
            self.disable_log || cmd.disable_log,
            message,
        )
    }
}

impl Default for BatchRefUpdate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchRefUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchRefUpdate[atomic={}", self.atomic)?;
        for cmd in &self.commands {
            write!(
                f,
                ", {} {}..{} {:?}",
                cmd.name,
                &cmd.old_id.to_hex()[..7],
                &cmd.new_id.to_hex()[..7],
                cmd.result
            )?;
            if let Some(message) = &cmd.message {
                write!(f, " ({message})")?;
            }
        }
        write!(f, "]")
    }
}
