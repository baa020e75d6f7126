use std::fs;
use std::io::Read;

use coffer_id::{Hasher, ObjectId};
use coffer_object::{header, Kind};
use flate2::read::ZlibDecoder;

use crate::{LooseError, LooseStore};

impl LooseStore {
    /// True when a loose file exists for `id`.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.path_for(id).is_file()
    }

    /// Read a loose object, returning its kind and payload bytes.
    ///
    /// `Ok(None)` when no file exists; `Err` when a file exists but does
    /// not inflate or carries a malformed header.
    pub fn read(&self, id: &ObjectId) -> Result<Option<(Kind, Vec<u8>)>, LooseError> {
        let raw = match self.read_inflated(id)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let (kind, size, header_len) = header::parse(&raw)?;
        let payload = raw[header_len..].to_vec();
        if payload.len() != size {
            return Err(LooseError::Corrupt {
                id: id.to_hex(),
                reason: format!("header claims {size} bytes, payload has {}", payload.len()),
            });
        }
        Ok(Some((kind, payload)))
    }

    /// Read only the kind and declared size, inflating just the header.
    pub fn read_header(&self, id: &ObjectId) -> Result<Option<(Kind, u64)>, LooseError> {
        let file = match fs::File::open(self.path_for(id)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Headers fit comfortably in 64 bytes; inflate only that much.
        let mut decoder = ZlibDecoder::new(file);
        let mut buf = [0u8; 64];
        let mut filled = 0;
        loop {
            let n = decoder
                .read(&mut buf[filled..])
                .map_err(|e| LooseError::Inflate {
                    id: id.to_hex(),
                    source: e,
                })?;
            if n == 0 {
                return Err(LooseError::Corrupt {
                    id: id.to_hex(),
                    reason: "EOF before header terminator".into(),
                });
            }
            filled += n;
            if buf[..filled].contains(&0) {
                break;
            }
            if filled == buf.len() {
                return Err(LooseError::Corrupt {
                    id: id.to_hex(),
                    reason: "header exceeds 64 bytes".into(),
                });
            }
        }

        let (kind, size, _) = header::parse(&buf[..filled])?;
        Ok(Some((kind, size as u64)))
    }

    /// Read and re-hash, failing when the content does not match `id`.
    pub fn read_verified(&self, id: &ObjectId) -> Result<Option<(Kind, Vec<u8>)>, LooseError> {
        let raw = match self.read_inflated(id)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let actual = Hasher::digest(&raw)?;
        if actual != *id {
            return Err(LooseError::IdMismatch {
                path: self.path_for(id),
                expected: id.to_hex(),
                actual: actual.to_hex(),
            });
        }
        let (kind, _, header_len) = header::parse(&raw)?;
        Ok(Some((kind, raw[header_len..].to_vec())))
    }

    fn read_inflated(&self, id: &ObjectId) -> Result<Option<Vec<u8>>, LooseError> {
        let deflated = match fs::read(self.path_for(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut decoder = ZlibDecoder::new(&deflated[..]);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| LooseError::Inflate {
                id: id.to_hex(),
                source: e,
            })?;
        Ok(Some(raw))
    }
}
