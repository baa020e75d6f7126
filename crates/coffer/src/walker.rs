use coffer_id::ObjectId;
use coffer_object::{Commit, Kind, Tag};
use coffer_odb::ObjectDirectory;
use coffer_refs::{RefError, Walker};

/// The revision-walking collaborator backed by an [`ObjectDirectory`].
///
/// Supplies the three capabilities the ref-update engine needs:
/// missing-object detection, commit parent enumeration, and tag
/// dereferencing.
pub struct OdbWalker<'a> {
    odb: &'a ObjectDirectory,
}

impl<'a> OdbWalker<'a> {
    pub fn new(odb: &'a ObjectDirectory) -> Self {
        Self { odb }
    }
}

impl Walker for OdbWalker<'_> {
    fn has_object(&self, id: &ObjectId) -> bool {
        self.odb.contains(id)
    }

    fn parents(&self, id: &ObjectId) -> Result<Vec<ObjectId>, RefError> {
        let loader = match self.odb.open(id).map_err(walk_err)? {
            Some(loader) => loader,
            None => return Ok(Vec::new()),
        };
        if loader.kind() != Kind::Commit {
            return Ok(Vec::new());
        }
        let commit = Commit::parse(loader.bytes()).map_err(walk_err)?;
        Ok(commit.parents)
    }

    fn tag_target(&self, id: &ObjectId) -> Result<Option<ObjectId>, RefError> {
        let loader = match self.odb.open(id).map_err(walk_err)? {
            Some(loader) => loader,
            None => return Ok(None),
        };
        if loader.kind() != Kind::Tag {
            return Ok(None);
        }
        let tag = Tag::parse(loader.bytes()).map_err(walk_err)?;
        Ok(Some(tag.target))
    }
}

fn walk_err(e: impl std::fmt::Display) -> RefError {
    RefError::Walk(e.to_string())
}
