//! Abbreviated-id resolution across every storage tier.

use coffer_id::{AbbreviatedId, ObjectId};

use crate::{ObjectDirectory, OdbError};

impl ObjectDirectory {
    /// Resolve an abbreviation to the single object it names.
    ///
    /// `Ok(None)` when nothing matches; [`OdbError::Ambiguous`] when more
    /// than one object does. Loose objects, every pack, and the
    /// alternate chain all contribute candidates.
    pub fn resolve_abbrev(
        &self,
        abbrev: &AbbreviatedId,
    ) -> Result<Option<ObjectId>, OdbError> {
        if let Some(id) = abbrev.to_object_id() {
            return Ok(self.contains(&id).then_some(id));
        }

        let mut matches = Vec::new();
        self.collect_matches(abbrev, &mut matches)?;
        matches.sort();
        matches.dedup();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            count => Err(OdbError::Ambiguous {
                prefix: abbrev.to_hex(),
                count,
            }),
        }
    }

    fn collect_matches(
        &self,
        abbrev: &AbbreviatedId,
        out: &mut Vec<ObjectId>,
    ) -> Result<(), OdbError> {
        for found in self.loose().iter()? {
            let id = found?;
            if abbrev.matches(&id) {
                out.push(id);
            }
        }
        for handle in self.pack_list().packs().iter() {
            if handle.is_invalid() {
                continue;
            }
            out.extend(handle.pack().index().matching(abbrev));
        }
        for alt in self.alternates() {
            alt.collect_matches(abbrev, out)?;
        }
        Ok(())
    }

    /// Shortest unique abbreviation of `id`, at least `min_len` digits.
    pub fn abbreviate(&self, id: &ObjectId, min_len: usize) -> Result<AbbreviatedId, OdbError> {
        for len in min_len.max(2)..=40 {
            let candidate = AbbreviatedId::from_id(id, len)?;
            let mut matches = Vec::new();
            self.collect_matches(&candidate, &mut matches)?;
            matches.retain(|m| m != id);
            if matches.is_empty() {
                return Ok(candidate);
            }
        }
        Ok(AbbreviatedId::from_id(id, 40)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_object::Kind;

    #[test]
    fn resolves_across_loose_and_packed() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDirectory::open(dir.path()).unwrap();

        let mut ins = db.new_inserter();
        let loose_id = ins.insert(Kind::Blob, b"kept loose").unwrap();
        ins.flush().unwrap();

        let mut ins = db.new_inserter();
        let packed_id = ins.insert(Kind::Blob, b"kept packed").unwrap();
        ins.flush_packed().unwrap();

        for id in [loose_id, packed_id] {
            let abbrev = AbbreviatedId::new(&id.to_hex()[..8]).unwrap();
            assert_eq!(db.resolve_abbrev(&abbrev).unwrap(), Some(id));
        }
    }

    #[test]
    fn unknown_prefix_resolves_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDirectory::open(dir.path()).unwrap();
        let abbrev = AbbreviatedId::new("deadbeef").unwrap();
        assert_eq!(db.resolve_abbrev(&abbrev).unwrap(), None);
    }

    #[test]
    fn full_length_abbreviation_is_a_containment_check() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDirectory::open(dir.path()).unwrap();
        let mut ins = db.new_inserter();
        let id = ins.insert(Kind::Blob, b"whole").unwrap();
        ins.flush().unwrap();

        let abbrev = AbbreviatedId::new(&id.to_hex()).unwrap();
        assert_eq!(db.resolve_abbrev(&abbrev).unwrap(), Some(id));
    }

    #[test]
    fn abbreviate_extends_until_unique() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDirectory::open(dir.path()).unwrap();
        let mut ins = db.new_inserter();
        let id = ins.insert(Kind::Blob, b"to be abbreviated").unwrap();
        ins.flush().unwrap();

        let abbrev = db.abbreviate(&id, 7).unwrap();
        assert_eq!(abbrev.hex_len(), 7);
        assert!(abbrev.matches(&id));
        assert_eq!(db.resolve_abbrev(&abbrev).unwrap(), Some(id));
    }
}
