//! End-to-end behavior of the assembled engine: real objects in the
//! object database driving real ref updates.

use coffer::{
    BatchRefUpdate, CommitBuilder, Hasher, Ident, Kind, ObjectId, ReceiveCommand, RefName,
    Repository, TagBuilder, TreeFormatter, UpdateResult, When,
};
use coffer_refs::reflog;

fn ident() -> Ident {
    Ident::new("Scenario Runner", "runner@example.com", When::new(1712000000, -120))
}

fn repo(dir: &std::path::Path) -> Repository {
    let mut repo = Repository::init(dir.join("scenario.git")).unwrap();
    repo.set_ident(ident());
    repo
}

/// Insert a commit on top of `parent`, returning its id.
fn commit(repo: &Repository, parent: Option<ObjectId>, message: &str) -> ObjectId {
    let mut ins = repo.odb().new_inserter();
    let tree = ins.insert_tree(TreeFormatter::new()).unwrap();
    let mut builder = CommitBuilder::new(tree, ident(), ident()).message(message);
    if let Some(parent) = parent {
        builder = builder.parent(parent);
    }
    let id = ins.insert_commit(&builder).unwrap();
    ins.flush().unwrap();
    id
}

fn branch(name: &str) -> RefName {
    RefName::new(name).unwrap()
}

#[test]
fn fast_forward_update_moves_ref_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repo(dir.path());

    let base = commit(&repo, None, "base\n");
    let next = commit(&repo, Some(base), "next\n");

    let mut up = repo.refs().new_update(branch("refs/heads/main"));
    up.set_new_id(base);
    assert_eq!(up.update(&repo.walker()).unwrap(), UpdateResult::New);

    let mut batch = BatchRefUpdate::new();
    batch.set_log_message(Some("push: fast-forward main"), false);
    batch.add(ReceiveCommand::update(base, next, branch("refs/heads/main")));
    batch.execute(repo.refs(), &repo.walker()).unwrap();

    assert_eq!(batch.commands()[0].result(), UpdateResult::FastForward);
    assert_eq!(repo.resolve("refs/heads/main").unwrap(), Some(next));

    // The loose file holds exactly "<hex>\n".
    let on_disk =
        std::fs::read_to_string(repo.git_dir().join("refs/heads/main")).unwrap();
    assert_eq!(on_disk, format!("{}\n", next.to_hex()));

    // One new reflog line with both ids and the batch message.
    let log = reflog::read(repo.git_dir(), &branch("refs/heads/main")).unwrap();
    assert_eq!(log[0].old_id, base);
    assert_eq!(log[0].new_id, next);
    assert_eq!(log[0].message, "push: fast-forward main");
}

#[test]
fn non_fast_forward_update_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repo(dir.path());

    let base = commit(&repo, None, "base\n");
    let unrelated = commit(&repo, None, "somewhere else\n");

    let mut up = repo.refs().new_update(branch("refs/heads/main"));
    up.set_new_id(base);
    up.update(&repo.walker()).unwrap();

    let mut batch = BatchRefUpdate::new();
    batch.set_allow_non_fast_forwards(false);
    batch.add(ReceiveCommand::update(base, unrelated, branch("refs/heads/main")));
    batch.execute(repo.refs(), &repo.walker()).unwrap();

    assert_eq!(batch.commands()[0].result(), UpdateResult::Rejected);
    assert_eq!(repo.resolve("refs/heads/main").unwrap(), Some(base));
}

#[test]
fn create_under_existing_name_is_a_lock_failure() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repo(dir.path());

    let a = commit(&repo, None, "a\n");
    let b = commit(&repo, Some(a), "b\n");

    let mut up = repo.refs().new_update(branch("refs/heads/foo"));
    up.set_new_id(a);
    up.update(&repo.walker()).unwrap();

    let mut batch = BatchRefUpdate::new();
    batch.add(ReceiveCommand::create(b, branch("refs/heads/foo/bar")));
    batch.execute(repo.refs(), &repo.walker()).unwrap();

    assert_eq!(batch.commands()[0].result(), UpdateResult::LockFailure);
    assert_eq!(repo.resolve("refs/heads/foo").unwrap(), Some(a));
    assert!(repo.resolve("refs/heads/foo/bar").unwrap().is_none());
}

#[test]
fn atomic_batch_against_non_atomic_backend() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = repo(dir.path());
    repo.refs_mut().set_atomic_support(false);

    let a = commit(&repo, None, "a\n");
    let b = commit(&repo, None, "b\n");

    let mut batch = BatchRefUpdate::new();
    batch.set_atomic(true);
    batch.add(ReceiveCommand::create(a, branch("refs/heads/a")));
    batch.add(ReceiveCommand::create(b, branch("refs/heads/b")));
    batch.execute(repo.refs(), &repo.walker()).unwrap();

    for cmd in batch.commands() {
        assert_eq!(cmd.result(), UpdateResult::RejectedOtherReason);
        assert_eq!(cmd.message(), Some("atomic updates not supported"));
    }
    assert!(repo.resolve("refs/heads/a").unwrap().is_none());
    assert!(repo.resolve("refs/heads/b").unwrap().is_none());
}

#[test]
fn delete_frees_namespace_for_create_in_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repo(dir.path());

    let a = commit(&repo, None, "a\n");
    let b = commit(&repo, Some(a), "b\n");

    let mut up = repo.refs().new_update(branch("refs/heads/foo"));
    up.set_new_id(a);
    up.update(&repo.walker()).unwrap();

    let mut batch = BatchRefUpdate::new();
    batch.add(ReceiveCommand::delete(a, branch("refs/heads/foo")));
    batch.add(ReceiveCommand::create(b, branch("refs/heads/foo/bar")));
    batch.execute(repo.refs(), &repo.walker()).unwrap();

    for cmd in batch.commands() {
        assert!(cmd.result().is_success(), "{:?} {:?}", cmd.name(), cmd.result());
    }
    assert!(repo.resolve("refs/heads/foo").unwrap().is_none());
    assert_eq!(repo.resolve("refs/heads/foo/bar").unwrap(), Some(b));
}

#[test]
fn inserted_objects_round_trip_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repo(dir.path());

    let payloads: [&[u8]; 3] = [b"", b"short", b"a slightly longer blob payload"];
    let mut ids = Vec::new();
    let mut ins = repo.odb().new_inserter();
    for payload in payloads {
        ids.push(ins.insert(Kind::Blob, payload).unwrap());
    }
    ins.flush().unwrap();

    for (payload, id) in payloads.iter().zip(&ids) {
        // The id is the hash of "type SP size NUL payload".
        assert_eq!(*id, Hasher::object_id("blob", payload).unwrap());
        let loader = repo.odb().open(id).unwrap().unwrap();
        assert_eq!(loader.kind(), Kind::Blob);
        assert_eq!(loader.bytes(), *payload);
    }
}

#[test]
fn head_link_tracks_branch_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repo(dir.path());

    let a = commit(&repo, None, "a\n");
    let mut up = repo.refs().new_update(branch("refs/heads/topic"));
    up.set_new_id(a);
    up.update(&repo.walker()).unwrap();

    repo.refs()
        .link(
            &branch("HEAD"),
            &branch("refs/heads/topic"),
            "checkout: moving to topic",
        )
        .unwrap();

    // HEAD's leaf and the branch resolve identically.
    assert_eq!(repo.head().unwrap(), Some(a));
    assert_eq!(repo.resolve("refs/heads/topic").unwrap(), Some(a));

    // A commit through HEAD moves the branch, not HEAD itself.
    let b = commit(&repo, Some(a), "b\n");
    let mut up = repo.refs().new_update(branch("HEAD"));
    up.set_new_id(b);
    up.set_log_message(Some("commit: b"), false);
    assert_eq!(up.update(&repo.walker()).unwrap(), UpdateResult::FastForward);
    assert_eq!(repo.resolve("refs/heads/topic").unwrap(), Some(b));
    assert!(repo
        .refs()
        .exact_ref(&branch("HEAD"))
        .unwrap()
        .unwrap()
        .is_symbolic());
}

#[test]
fn short_names_resolve_through_the_search_path() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repo(dir.path());

    let a = commit(&repo, None, "a\n");
    let mut up = repo.refs().new_update(branch("refs/heads/release"));
    up.set_new_id(a);
    up.update(&repo.walker()).unwrap();

    let found = repo.refs().find_ref("release").unwrap().unwrap();
    assert_eq!(found.name.as_str(), "refs/heads/release");
    assert_eq!(found.id(), Some(a));
}

#[test]
fn annotated_tags_peel_to_their_commit() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repo(dir.path());

    let target = commit(&repo, None, "tagged\n");
    let mut ins = repo.odb().new_inserter();
    let tag = ins
        .insert_tag(&TagBuilder::new(target, Kind::Commit, "v1.0", ident()).message("one\n"))
        .unwrap();
    ins.flush().unwrap();

    let name = branch("refs/tags/v1.0");
    let mut up = repo.refs().new_update(name.clone());
    up.set_new_id(tag);
    assert!(up.update(&repo.walker()).unwrap().is_success());

    let r = repo.refs().exact_ref(&name).unwrap().unwrap();
    let peeled = repo.refs().peel(&r, &repo.walker()).unwrap();
    assert!(peeled.is_peeled());
    assert_eq!(peeled.peeled_id(), Some(target));

    // Packing the ref writes the peeled annotation out.
    repo.refs().pack_ref(&name, &repo.walker()).unwrap();
    let packed = std::fs::read_to_string(repo.git_dir().join("packed-refs")).unwrap();
    assert!(packed.contains(&format!("{} refs/tags/v1.0\n^{}", tag.to_hex(), target.to_hex())));
}

#[test]
fn deleting_the_checked_out_branch_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repo(dir.path());

    let a = commit(&repo, None, "a\n");
    let mut up = repo.refs().new_update(branch("refs/heads/main"));
    up.set_new_id(a);
    up.update(&repo.walker()).unwrap();

    let mut del = repo.refs().new_update(branch("refs/heads/main"));
    assert_eq!(
        del.delete(&repo.walker()).unwrap(),
        UpdateResult::RejectedCurrentBranch
    );
    assert_eq!(repo.resolve("refs/heads/main").unwrap(), Some(a));
}
