use std::fs;

use coffer_id::ObjectId;

use crate::{LooseError, LooseStore};

/// Iterator over every loose object id in a store.
///
/// Walks the 256 fan-out directories in name order; ids within one
/// directory come back in directory order.
pub struct LooseIter {
    dirs: std::vec::IntoIter<fs::DirEntry>,
    current: Option<(String, fs::ReadDir)>,
}

impl LooseStore {
    /// Enumerate all loose object ids.
    pub fn iter(&self) -> Result<LooseIter, LooseError> {
        let mut dirs: Vec<fs::DirEntry> = match fs::read_dir(self.objects_dir()) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .filter(|e| {
                    let name = e.file_name();
                    let name = name.to_string_lossy();
                    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit())
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        dirs.sort_by_key(|e| e.file_name());
        Ok(LooseIter {
            dirs: dirs.into_iter(),
            current: None,
        })
    }
}

impl Iterator for LooseIter {
    type Item = Result<ObjectId, LooseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((prefix, rd)) = self.current.as_mut() {
                for entry in rd.by_ref().filter_map(|e| e.ok()) {
                    let rest = entry.file_name();
                    let rest = rest.to_string_lossy();
                    if rest.len() != 38 {
                        continue;
                    }
                    match ObjectId::from_hex(&format!("{prefix}{rest}")) {
                        Ok(id) => return Some(Ok(id)),
                        Err(_) => continue, // stray file, not an object
                    }
                }
                self.current = None;
            }

            let dir = self.dirs.next()?;
            let prefix = dir.file_name().to_string_lossy().to_lowercase();
            match fs::read_dir(dir.path()) {
                Ok(rd) => self.current = Some((prefix, rd)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
