//! Cross-thread behavior of the ref directory.

use std::sync::{Arc, Barrier};
use std::thread;

use coffer_id::ObjectId;
use coffer_refs::{RefDirectory, RefError, RefName, UpdateResult, Walker};
use coffer_util::{Ident, When};

/// Every id exists and nothing has parents: all moves are non-FF.
struct FlatWalker;

impl Walker for FlatWalker {
    fn has_object(&self, _id: &ObjectId) -> bool {
        true
    }
    fn parents(&self, _id: &ObjectId) -> Result<Vec<ObjectId>, RefError> {
        Ok(Vec::new())
    }
    fn tag_target(&self, _id: &ObjectId) -> Result<Option<ObjectId>, RefError> {
        Ok(None)
    }
}

fn oid(n: u64) -> ObjectId {
    let mut raw = [0u8; 20];
    raw[12..].copy_from_slice(&n.to_be_bytes());
    ObjectId::from_raw(raw)
}

fn make_refs(dir: &std::path::Path) -> RefDirectory {
    let mut refs = RefDirectory::new(dir);
    refs.set_ident(Ident::new("t", "t@example.com", When::new(1700000000, 0)));
    refs
}

#[test]
fn concurrent_creates_of_distinct_refs_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let git_dir = dir.path().to_path_buf();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let git_dir = git_dir.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let refs = make_refs(&git_dir);
                let name = RefName::new(format!("refs/heads/worker-{t}")).unwrap();
                let mut up = refs.new_update(name);
                up.set_new_id(oid(t as u64 + 1));
                up.update(&FlatWalker).unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), UpdateResult::New);
    }

    let refs = make_refs(&git_dir);
    assert_eq!(refs.refs_under("refs/heads/").unwrap().len(), threads);
}

#[test]
fn racing_cas_updates_let_exactly_one_win() {
    let dir = tempfile::tempdir().unwrap();
    let git_dir = dir.path().to_path_buf();
    let name = RefName::new("refs/heads/contended").unwrap();

    {
        let refs = make_refs(&git_dir);
        let mut up = refs.new_update(name.clone());
        up.set_new_id(oid(100));
        assert_eq!(up.update(&FlatWalker).unwrap(), UpdateResult::New);
    }

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let git_dir = git_dir.clone();
            let name = name.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let refs = make_refs(&git_dir);
                let mut up = refs.new_update(name);
                up.set_new_id(oid(200 + t as u64))
                    .set_expected_old_id(Some(oid(100)))
                    .set_force(true);
                up.update(&FlatWalker).unwrap()
            })
        })
        .collect();

    let results: Vec<UpdateResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let wins = results.iter().filter(|r| r.is_success()).count();
    let losses = results
        .iter()
        .filter(|r| **r == UpdateResult::LockFailure)
        .count();
    assert_eq!(wins, 1, "exactly one CAS may win: {results:?}");
    assert_eq!(wins + losses, threads);

    // The final value is whichever winner's id.
    let refs = make_refs(&git_dir);
    let value = refs.resolve(&name).unwrap().unwrap();
    assert!((200..200 + threads as u64).contains(&u64::from_be_bytes(
        value.as_bytes()[12..].try_into().unwrap()
    )));
}

#[test]
fn readers_see_consistent_values_during_updates() {
    let dir = tempfile::tempdir().unwrap();
    let git_dir = dir.path().to_path_buf();
    let name = RefName::new("refs/heads/hot").unwrap();

    {
        let refs = make_refs(&git_dir);
        let mut up = refs.new_update(name.clone());
        up.set_new_id(oid(1));
        up.update(&FlatWalker).unwrap();
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reader = {
        let git_dir = git_dir.clone();
        let name = name.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let refs = make_refs(&git_dir);
            let mut observations = 0usize;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                // Either a valid historical value or a newer one; never
                // a torn read or a vanished ref.
                let value = refs.resolve(&name).unwrap();
                assert!(value.is_some());
                observations += 1;
            }
            observations
        })
    };

    let refs = make_refs(&git_dir);
    let mut current = oid(1);
    for i in 2..30u64 {
        let mut up = refs.new_update(name.clone());
        up.set_new_id(oid(i))
            .set_expected_old_id(Some(current))
            .set_force(true);
        assert!(up.update(&FlatWalker).unwrap().is_success());
        current = oid(i);
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    assert!(reader.join().unwrap() > 0);
}
