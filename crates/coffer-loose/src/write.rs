use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use coffer_id::{Hasher, ObjectId};
use coffer_object::{header, Kind};
use coffer_util::StagedFile;
use flate2::write::ZlibEncoder;

use crate::{LooseError, LooseStore};

impl LooseStore {
    /// Store a payload as a loose object, returning its id.
    ///
    /// Idempotent: when the object already exists nothing is written.
    /// New objects land under a fresh random name first and are renamed
    /// into place, so readers never observe a partial file.
    pub fn write(&self, kind: Kind, payload: &[u8]) -> Result<ObjectId, LooseError> {
        let id = Hasher::object_id(kind.name(), payload)?;
        if self.contains(&id) {
            return Ok(id);
        }

        let mut stage = StagedFile::in_dir(self.objects_dir()).map_err(util_io)?;
        compress_into(&mut stage, kind, payload, self.compression())?;
        stage.sync().map_err(util_io)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(stage.path(), fs::Permissions::from_mode(0o444))?;
        }

        let target = self.path_for(&id);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        install(stage, &target)?;
        Ok(id)
    }

    /// Store from a reader with a declared size.
    pub fn write_stream(
        &self,
        kind: Kind,
        size: u64,
        reader: &mut dyn std::io::Read,
    ) -> Result<ObjectId, LooseError> {
        let mut payload = Vec::with_capacity(size.min(1u64 << 20) as usize);
        reader.read_to_end(&mut payload)?;
        if payload.len() as u64 != size {
            return Err(LooseError::Corrupt {
                id: String::new(),
                reason: format!("stream declared {size} bytes, produced {}", payload.len()),
            });
        }
        self.write(kind, &payload)
    }
}

/// Deflate `"<type> <size>\0" || payload` into `out`.
pub fn compress_into(
    out: &mut impl Write,
    kind: Kind,
    payload: &[u8],
    level: flate2::Compression,
) -> Result<(), LooseError> {
    let mut encoder = ZlibEncoder::new(out, level);
    encoder.write_all(&header::encode(kind, payload.len()))?;
    encoder.write_all(payload)?;
    encoder.finish()?;
    Ok(())
}

/// Rename a staged object into place. Losing the race to a concurrent
/// writer of the same content is success.
fn install(stage: StagedFile, target: &Path) -> Result<(), LooseError> {
    match stage.persist(target) {
        Ok(()) => Ok(()),
        Err(_) if target.is_file() => Ok(()),
        Err(e) => Err(util_io(e)),
    }
}

fn util_io(e: coffer_util::UtilError) -> LooseError {
    match e {
        coffer_util::UtilError::Io(io) => LooseError::Io(io),
        other => LooseError::Io(std::io::Error::other(other.to_string())),
    }
}
