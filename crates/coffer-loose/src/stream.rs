use std::fs;
use std::io::Read;

use coffer_id::ObjectId;
use coffer_object::{header, Kind};
use flate2::read::ZlibDecoder;

use crate::{LooseError, LooseStore};

/// Incremental reader over a loose object's payload.
///
/// The header is parsed when the stream is opened; [`Read`] then inflates
/// payload bytes on demand and stops at the declared size.
pub struct LooseStream {
    kind: Kind,
    size: u64,
    decoder: ZlibDecoder<fs::File>,
    consumed: u64,
}

impl LooseStream {
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Declared payload size.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.consumed)
    }
}

impl Read for LooseStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(0);
        }
        let want = remaining.min(buf.len() as u64) as usize;
        let n = self.decoder.read(&mut buf[..want])?;
        self.consumed += n as u64;
        Ok(n)
    }
}

impl LooseStore {
    /// Open a streaming reader for a loose object.
    ///
    /// `Ok(None)` when no file exists. The header is consumed eagerly so
    /// the stream yields payload bytes only.
    pub fn stream(&self, id: &ObjectId) -> Result<Option<LooseStream>, LooseError> {
        let file = match fs::File::open(self.path_for(id)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut decoder = ZlibDecoder::new(file);

        // Pull bytes one at a time until the header's NUL; the decoder
        // buffers internally so this is not one syscall per byte.
        let mut head = Vec::with_capacity(32);
        loop {
            let mut byte = [0u8; 1];
            let n = decoder.read(&mut byte).map_err(|e| LooseError::Inflate {
                id: id.to_hex(),
                source: e,
            })?;
            if n == 0 {
                return Err(LooseError::Corrupt {
                    id: id.to_hex(),
                    reason: "EOF before header terminator".into(),
                });
            }
            head.push(byte[0]);
            if byte[0] == 0 {
                break;
            }
            if head.len() > 64 {
                return Err(LooseError::Corrupt {
                    id: id.to_hex(),
                    reason: "header exceeds 64 bytes".into(),
                });
            }
        }

        let (kind, size, _) = header::parse(&head)?;
        Ok(Some(LooseStream {
            kind,
            size: size as u64,
            decoder,
            consumed: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_yields_payload_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::open(dir.path());
        let id = store.write(Kind::Blob, b"streamed payload bytes").unwrap();

        let mut stream = store.stream(&id).unwrap().unwrap();
        assert_eq!(stream.kind(), Kind::Blob);
        assert_eq!(stream.size(), 22);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"streamed payload bytes");
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn stream_in_small_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::open(dir.path());
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let id = store.write(Kind::Blob, &payload).unwrap();

        let mut stream = store.stream(&id).unwrap().unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 17];
        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn stream_of_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::open(dir.path());
        let id = ObjectId::from_hex("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391").unwrap();
        assert!(store.stream(&id).unwrap().is_none());
    }
}
