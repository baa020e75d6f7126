//! The object inserter: staged writes with read-back before flush.
//!
//! Inserted objects are deflated into randomly-named staging files
//! inside `objects/`. Until [`flush`](ObjectInserter::flush) renames
//! them into their `xx/…` homes (or [`flush_packed`] folds them into a
//! pack), they are visible only through the inserter's own
//! [`reader`](ObjectInserter::reader). Dropping the inserter, or
//! crashing, leaves nothing discoverable.
//!
//! [`flush_packed`]: ObjectInserter::flush_packed

use std::collections::HashMap;
use std::io::Read;

use coffer_id::{Hasher, ObjectId};
use coffer_loose::compress_into;
use coffer_object::{header, Kind};
use coffer_object::{CommitBuilder, TagBuilder, TreeFormatter};
use coffer_util::StagedFile;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tracing::debug;

use crate::{Loader, ObjectDirectory, OdbError};

struct Pending {
    kind: Kind,
    size: u64,
    stage: StagedFile,
}

/// Stages new objects against an [`ObjectDirectory`].
///
/// An inserter is single-threaded (`&mut self` inserts); separate
/// inserters on the same database never collide because staging names
/// are random and final names are content-addressed.
pub struct ObjectInserter<'odb> {
    odb: &'odb ObjectDirectory,
    pending: HashMap<ObjectId, Pending>,
    order: Vec<ObjectId>,
}

impl<'odb> ObjectInserter<'odb> {
    pub(crate) fn new(odb: &'odb ObjectDirectory) -> Self {
        Self {
            odb,
            pending: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// The id a payload would get. Never writes.
    pub fn id_for(&self, kind: Kind, payload: &[u8]) -> Result<ObjectId, OdbError> {
        Ok(Hasher::object_id(kind.name(), payload)?)
    }

    /// The id a stream of `len` bytes would get. Never writes.
    pub fn id_for_stream(
        &self,
        kind: Kind,
        len: u64,
        reader: &mut dyn Read,
    ) -> Result<ObjectId, OdbError> {
        let mut hasher = Hasher::for_object(kind.name(), len);
        let mut buf = [0u8; 8192];
        let mut seen = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            seen += n as u64;
            hasher.update(&buf[..n]);
        }
        if seen != len {
            return Err(OdbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream declared {len} bytes, yielded {seen}"),
            )));
        }
        Ok(hasher.finalize()?)
    }

    /// Stage a payload. Multiple inserts before a flush are fine; a
    /// payload that already exists (staged or stored) is not re-staged.
    pub fn insert(&mut self, kind: Kind, payload: &[u8]) -> Result<ObjectId, OdbError> {
        let id = self.id_for(kind, payload)?;
        if self.pending.contains_key(&id) || self.odb.contains(&id) {
            return Ok(id);
        }

        let mut stage = StagedFile::in_dir(self.odb.objects_dir()).map_err(stage_io)?;
        compress_into(
            &mut stage,
            kind,
            payload,
            flate2::Compression::default(),
        )?;
        stage.sync().map_err(stage_io)?;

        self.remember(
            id,
            Pending {
                kind,
                size: payload.len() as u64,
                stage,
            },
        );
        Ok(id)
    }

    /// Stage from a reader with a declared length, hashing and deflating
    /// in one pass.
    pub fn insert_stream(
        &mut self,
        kind: Kind,
        len: u64,
        reader: &mut dyn Read,
    ) -> Result<ObjectId, OdbError> {
        let stage = StagedFile::in_dir(self.odb.objects_dir()).map_err(stage_io)?;
        let mut hasher = Hasher::for_object(kind.name(), len);
        let mut encoder = ZlibEncoder::new(stage, flate2::Compression::default());

        std::io::Write::write_all(&mut encoder, &header::encode(kind, len as usize))?;
        let mut buf = [0u8; 8192];
        let mut seen = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            seen += n as u64;
            hasher.update(&buf[..n]);
            std::io::Write::write_all(&mut encoder, &buf[..n])?;
        }
        if seen != len {
            return Err(OdbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream declared {len} bytes, yielded {seen}"),
            )));
        }

        let mut stage = encoder.finish()?;
        stage.sync().map_err(stage_io)?;
        let id = hasher.finalize()?;

        if self.pending.contains_key(&id) || self.odb.contains(&id) {
            return Ok(id); // drop the redundant stage
        }
        self.remember(
            id,
            Pending {
                kind,
                size: len,
                stage,
            },
        );
        Ok(id)
    }

    /// Format and stage a tree.
    pub fn insert_tree(&mut self, tree: TreeFormatter) -> Result<ObjectId, OdbError> {
        let payload = tree.into_payload();
        self.insert(Kind::Tree, &payload)
    }

    /// Format and stage a commit.
    pub fn insert_commit(&mut self, commit: &CommitBuilder) -> Result<ObjectId, OdbError> {
        self.insert(Kind::Commit, &commit.build())
    }

    /// Format and stage a tag.
    pub fn insert_tag(&mut self, tag: &TagBuilder) -> Result<ObjectId, OdbError> {
        self.insert(Kind::Tag, &tag.build())
    }

    /// A reader that sees staged objects first, then the database.
    pub fn reader(&self) -> InserterReader<'_, 'odb> {
        InserterReader { inserter: self }
    }

    /// Number of staged objects awaiting a flush.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Make every staged object durable and globally visible as loose
    /// objects, in insertion order.
    pub fn flush(&mut self) -> Result<(), OdbError> {
        for id in std::mem::take(&mut self.order) {
            let pending = match self.pending.remove(&id) {
                Some(p) => p,
                None => continue,
            };
            let target = self.odb.loose().path_for(&id);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(
                    pending.stage.path(),
                    std::fs::Permissions::from_mode(0o444),
                )?;
            }

            match pending.stage.persist(&target) {
                Ok(()) => {}
                // Someone else stored the same content; ours is redundant.
                Err(_) if target.is_file() => {}
                Err(e) => return Err(stage_io(e)),
            }
        }
        debug!(dir = %self.odb.objects_dir().display(), "flushed staged objects");
        Ok(())
    }

    /// Make every staged object durable inside a single new pack.
    ///
    /// The `.pack` lands first; writing the `.idx` is what makes the
    /// pack discoverable, so a crash in between leaves only an inert
    /// pack file behind.
    pub fn flush_packed(&mut self) -> Result<(), OdbError> {
        if self.order.is_empty() {
            return Ok(());
        }
        let mut objects = Vec::with_capacity(self.order.len());
        for id in std::mem::take(&mut self.order) {
            let pending = match self.pending.remove(&id) {
                Some(p) => p,
                None => continue,
            };
            objects.push((pending.kind, inflate_stage(&pending)?.1));
        }
        let pack_dir = self.odb.objects_dir().join("pack");
        coffer_pack::write::create_pack(&pack_dir, &objects)?;
        self.odb.refresh()?;
        Ok(())
    }

    /// Discard everything staged. The inserter stays usable.
    pub fn close(&mut self) {
        self.pending.clear();
        self.order.clear();
    }

    fn remember(&mut self, id: ObjectId, pending: Pending) {
        self.pending.insert(id, pending);
        self.order.push(id);
    }
}

/// Reads through an inserter: staged objects first, then the parent
/// database.
pub struct InserterReader<'ins, 'odb> {
    inserter: &'ins ObjectInserter<'odb>,
}

impl InserterReader<'_, '_> {
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inserter.pending.contains_key(id) || self.inserter.odb.contains(id)
    }

    pub fn open(&self, id: &ObjectId) -> Result<Option<Loader>, OdbError> {
        if let Some(pending) = self.inserter.pending.get(id) {
            let (kind, payload) = inflate_stage(pending)?;
            return Ok(Some(Loader::new(kind, payload)));
        }
        self.inserter.odb.open(id)
    }

    /// Kind and size without materializing a staged payload twice.
    pub fn header(&self, id: &ObjectId) -> Result<Option<(Kind, u64)>, OdbError> {
        if let Some(pending) = self.inserter.pending.get(id) {
            return Ok(Some((pending.kind, pending.size)));
        }
        Ok(self.inserter.odb.open(id)?.map(|l| (l.kind(), l.size())))
    }
}

fn inflate_stage(pending: &Pending) -> Result<(Kind, Vec<u8>), OdbError> {
    let file = std::fs::File::open(pending.stage.path())?;
    let mut decoder = ZlibDecoder::new(file);
    let mut raw = Vec::with_capacity(pending.size as usize + 32);
    decoder.read_to_end(&mut raw)?;
    let (kind, size, header_len) = header::parse(&raw).map_err(|e| OdbError::Io(
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    ))?;
    debug_assert_eq!(size as u64, pending.size);
    Ok((kind, raw[header_len..].to_vec()))
}

fn stage_io(e: coffer_util::UtilError) -> OdbError {
    match e {
        coffer_util::UtilError::Io(io) => OdbError::Io(io),
        other => OdbError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn odb(dir: &std::path::Path) -> ObjectDirectory {
        ObjectDirectory::open(dir).unwrap()
    }

    #[test]
    fn staged_objects_hide_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let db = odb(dir.path());
        let mut ins = db.new_inserter();

        let id = ins.insert(Kind::Blob, b"not yet visible").unwrap();
        assert!(db.open(&id).unwrap().is_none());
        assert!(!db.contains(&id));

        let reader = ins.reader();
        assert!(reader.contains(&id));
        let loader = reader.open(&id).unwrap().unwrap();
        assert_eq!(loader.bytes(), b"not yet visible");
        assert_eq!(reader.header(&id).unwrap(), Some((Kind::Blob, 15)));
        drop(reader);

        ins.flush().unwrap();
        let loader = db.open(&id).unwrap().unwrap();
        assert_eq!(loader.kind(), Kind::Blob);
        assert_eq!(loader.bytes(), b"not yet visible");
    }

    #[test]
    fn close_discards_staged_objects() {
        let dir = tempfile::tempdir().unwrap();
        let db = odb(dir.path());
        let mut ins = db.new_inserter();

        let id = ins.insert(Kind::Blob, b"discarded").unwrap();
        ins.close();
        assert_eq!(ins.pending_count(), 0);
        assert!(!ins.reader().contains(&id));

        // The inserter remains usable.
        let id2 = ins.insert(Kind::Blob, b"second life").unwrap();
        ins.flush().unwrap();
        assert!(db.contains(&id2));
        assert!(!db.contains(&id));
    }

    #[test]
    fn id_for_matches_insert() {
        let dir = tempfile::tempdir().unwrap();
        let db = odb(dir.path());
        let mut ins = db.new_inserter();

        let predicted = ins.id_for(Kind::Blob, b"same bytes").unwrap();
        let mut cursor = &b"same bytes"[..];
        let streamed = ins.id_for_stream(Kind::Blob, 10, &mut cursor).unwrap();
        let actual = ins.insert(Kind::Blob, b"same bytes").unwrap();
        assert_eq!(predicted, actual);
        assert_eq!(streamed, actual);
    }

    #[test]
    fn insert_stream_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = odb(dir.path());
        let mut ins = db.new_inserter();

        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut cursor = &payload[..];
        let id = ins
            .insert_stream(Kind::Blob, payload.len() as u64, &mut cursor)
            .unwrap();

        assert_eq!(
            ins.reader().open(&id).unwrap().unwrap().bytes(),
            &payload[..]
        );
        ins.flush().unwrap();
        assert_eq!(db.open(&id).unwrap().unwrap().bytes(), &payload[..]);
    }

    #[test]
    fn insert_stream_length_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = odb(dir.path());
        let mut ins = db.new_inserter();
        let mut short = &b"abc"[..];
        assert!(ins.insert_stream(Kind::Blob, 5, &mut short).is_err());
    }

    #[test]
    fn flush_packed_lands_in_a_pack() {
        let dir = tempfile::tempdir().unwrap();
        let db = odb(dir.path());
        let mut ins = db.new_inserter();

        let a = ins.insert(Kind::Blob, b"packed one").unwrap();
        let b = ins.insert(Kind::Blob, b"packed two").unwrap();
        ins.flush_packed().unwrap();

        assert_eq!(db.open(&a).unwrap().unwrap().bytes(), b"packed one");
        assert_eq!(db.open(&b).unwrap().unwrap().bytes(), b"packed two");
        // They went into the pack tier, not the loose tier.
        assert!(!db.loose().contains(&a));
        assert_eq!(db.pack_list().packs().len(), 1);
    }

    #[test]
    fn builders_insert_through_convenience_methods() {
        use coffer_object::EntryMode;
        use coffer_util::{Ident, When};

        let dir = tempfile::tempdir().unwrap();
        let db = odb(dir.path());
        let mut ins = db.new_inserter();

        let blob = ins.insert(Kind::Blob, b"file content").unwrap();
        let mut tree = TreeFormatter::new();
        tree.append(EntryMode::Blob, "file.txt", blob);
        let tree_id = ins.insert_tree(tree).unwrap();

        let who = Ident::new("I", "i@example.com", When::new(1700000000, 0));
        let commit = ins
            .insert_commit(
                &CommitBuilder::new(tree_id, who.clone(), who.clone()).message("import\n"),
            )
            .unwrap();
        let tag = ins
            .insert_tag(&TagBuilder::new(commit, Kind::Commit, "v0", who).message("first\n"))
            .unwrap();

        ins.flush().unwrap();
        for id in [blob, tree_id, commit, tag] {
            assert!(db.contains(&id), "{id} should be visible after flush");
        }
    }

    #[test]
    fn drop_without_flush_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = odb(dir.path());
        let id = {
            let mut ins = db.new_inserter();
            ins.insert(Kind::Blob, b"vanishes").unwrap()
        };
        assert!(!db.contains(&id));
        // No staging litter in objects/ either.
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .collect();
        assert!(files.is_empty(), "stray files: {files:?}");
    }
}
