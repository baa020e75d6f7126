//! Pack file reader: random access, delta materialization, verification.

use std::io::Read;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use coffer_id::{Hasher, ObjectId, RAW_LEN};
use coffer_object::Kind;
use flate2::bufread::ZlibDecoder;
use lru::LruCache;
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::entry::{self, EntryKind};
use crate::index::PackIndex;
use crate::{PackError, Unpacked, MAX_DELTA_DEPTH, PACK_HEADER_LEN, PACK_MAGIC, PACK_VERSION};

/// Materialized objects kept around while walking delta chains.
const BASE_CACHE_ENTRIES: usize = 128;

/// A raw (still deflated) entry, CRC-verified against the index.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub kind: EntryKind,
    pub inflated_size: u64,
    /// The deflated bytes exactly as stored.
    pub compressed: Vec<u8>,
}

/// A memory-mapped `.pack` with its `.idx`.
///
/// Reads are position-independent and the handle is shared across
/// threads; the only interior state is the delta-base cache.
#[derive(Debug)]
pub struct Pack {
    data: Mmap,
    index: PackIndex,
    path: PathBuf,
    count: u32,
    base_cache: Mutex<LruCache<u64, (Kind, Arc<Vec<u8>>)>>,
}

impl Pack {
    /// Open `<name>.pack` together with its sibling `<name>.idx`.
    ///
    /// Header, version, object counts and the trailing checksum are
    /// cross-checked against the index before any object is served; a
    /// disagreement is reported as [`PackError::Mismatch`] so callers can
    /// rescan.
    pub fn open(pack_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let path = pack_path.as_ref().to_path_buf();
        let idx_path = path.with_extension("idx");

        let file = std::fs::File::open(&path)?;
        let data = unsafe { Mmap::map(&file)? };

        if data.len() < PACK_HEADER_LEN + RAW_LEN {
            return Err(PackError::BadHeader("file too small".into()));
        }
        if &data[..4] != PACK_MAGIC {
            return Err(PackError::BadHeader("bad PACK magic".into()));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        let count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let index = PackIndex::open(&idx_path)?;
        if index.count() != count {
            return Err(PackError::Mismatch {
                pack: path,
                reason: format!(
                    "pack holds {count} objects, index lists {}",
                    index.count()
                ),
            });
        }

        let trailer = ObjectId::from_bytes(&data[data.len() - RAW_LEN..])
            .expect("trailer slice is id-sized");
        if trailer != index.pack_checksum() {
            return Err(PackError::Mismatch {
                pack: path,
                reason: format!(
                    "pack checksum {trailer} but index records {}",
                    index.pack_checksum()
                ),
            });
        }

        Ok(Self {
            data,
            index,
            path,
            count,
            base_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(BASE_CACHE_ENTRIES).expect("cache size is nonzero"),
            )),
        })
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains(id)
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The checksum in the pack trailer.
    pub fn checksum(&self) -> ObjectId {
        ObjectId::from_bytes(&self.data[self.data.len() - RAW_LEN..])
            .expect("trailer slice is id-sized")
    }

    /// Read an object by id, verifying the reconstruction hashes back to
    /// `id`. A stale index (pack replaced underneath us) surfaces as
    /// [`PackError::Mismatch`].
    pub fn read(&self, id: &ObjectId) -> Result<Option<Unpacked>, PackError> {
        self.read_with_base_resolver(id, |_| None)
    }

    /// As [`read`](Self::read), consulting `resolve_base` for REF-delta
    /// bases this pack does not hold (thin packs).
    pub fn read_with_base_resolver(
        &self,
        id: &ObjectId,
        resolve_base: impl Fn(&ObjectId) -> Option<(Kind, Vec<u8>)>,
    ) -> Result<Option<Unpacked>, PackError> {
        let offset = match self.index.offset_of(id) {
            Some(offset) => offset,
            None => return Ok(None),
        };
        let unpacked = self.read_at_with(offset, &resolve_base)?;

        let actual = Hasher::object_id(unpacked.kind.name(), &unpacked.payload)?;
        if actual != *id {
            return Err(PackError::Mismatch {
                pack: self.path.clone(),
                reason: format!("index names {id} at {offset}, content hashes to {actual}"),
            });
        }
        Ok(Some(unpacked))
    }

    /// Read whatever entry lives at `offset`, without id verification.
    pub fn read_at(&self, offset: u64) -> Result<Unpacked, PackError> {
        self.read_at_with(offset, &|_| None)
    }

    /// Kind and inflated size of the object at `offset`, resolving delta
    /// chains for the kind but inflating nothing beyond headers when the
    /// entry is whole.
    pub fn header_at(&self, offset: u64) -> Result<(Kind, u64), PackError> {
        let header = self.decode_header(offset)?;
        match header.kind {
            EntryKind::Whole(kind) => Ok((kind, header.inflated_size)),
            _ => {
                // Delta: the ultimate kind is the innermost base's, and the
                // target size is declared inside the delta stream.
                let unpacked = self.read_at(offset)?;
                Ok((unpacked.kind, unpacked.payload.len() as u64))
            }
        }
    }

    /// The deflated entry bytes for `id`, CRC-checked against the index.
    ///
    /// This is the raw material for delta reuse: the caller may copy the
    /// compressed stream into a new pack without inflating it.
    pub fn raw_entry(&self, id: &ObjectId) -> Result<Option<RawEntry>, PackError> {
        let pos = match self.index.position_of(id) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let offset = self.index.offset_at(pos);
        let header = self.decode_header(offset)?;

        let (_, consumed) = self.inflate_at(&header, offset)?;
        let end = header.data_offset as usize + consumed;
        let raw = &self.data[offset as usize..end];

        if let Some(expected) = self.index.crc32_at(pos) {
            let actual = crc32fast::hash(raw);
            if actual != expected {
                return Err(PackError::Mismatch {
                    pack: self.path.clone(),
                    reason: format!(
                        "entry {id} at {offset}: crc32 {actual:#010x}, index records {expected:#010x}"
                    ),
                });
            }
        }

        Ok(Some(RawEntry {
            kind: header.kind,
            inflated_size: header.inflated_size,
            compressed: self.data[header.data_offset as usize..end].to_vec(),
        }))
    }

    /// Re-hash the whole pack and every object in it.
    ///
    /// Returns the number of verified objects. Any disagreement between
    /// pack, index and content is an error.
    pub fn verify(&self) -> Result<u32, PackError> {
        let body = &self.data[..self.data.len() - RAW_LEN];
        let mut hasher = Hasher::new();
        hasher.update(body);
        let actual = hasher.finalize()?;
        if actual != self.checksum() {
            return Err(PackError::Mismatch {
                pack: self.path.clone(),
                reason: format!("trailer says {}, content hashes to {actual}", self.checksum()),
            });
        }

        let mut verified = 0;
        for (id, _) in self.index.iter() {
            if self.read(&id)?.is_none() {
                return Err(PackError::Mismatch {
                    pack: self.path.clone(),
                    reason: format!("index lists {id} but lookup failed"),
                });
            }
            verified += 1;
        }
        Ok(verified)
    }

    fn decode_header(&self, offset: u64) -> Result<entry::EntryHeader, PackError> {
        let at = offset as usize;
        if at >= self.data.len().saturating_sub(RAW_LEN) {
            return Err(PackError::CorruptEntry(offset));
        }
        entry::decode(&self.data[at..], offset)
    }

    /// Inflate the deflated data of an entry. Returns the bytes and how
    /// many compressed bytes were consumed.
    fn inflate_at(
        &self,
        header: &entry::EntryHeader,
        entry_offset: u64,
    ) -> Result<(Vec<u8>, usize), PackError> {
        let from = header.data_offset as usize;
        if from > self.data.len() {
            return Err(PackError::CorruptEntry(entry_offset));
        }
        let mut decoder = ZlibDecoder::new(&self.data[from..]);
        let mut out = Vec::with_capacity(header.inflated_size as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(|_| PackError::CorruptEntry(entry_offset))?;
        if out.len() as u64 != header.inflated_size {
            return Err(PackError::CorruptEntry(entry_offset));
        }
        Ok((out, decoder.total_in() as usize))
    }

    fn read_at_with(
        &self,
        offset: u64,
        resolve_base: &dyn Fn(&ObjectId) -> Option<(Kind, Vec<u8>)>,
    ) -> Result<Unpacked, PackError> {
        // Walk toward the base, collecting delta streams outermost-first.
        let mut deltas: Vec<Vec<u8>> = Vec::new();
        let mut at = offset;

        let (kind, base) = loop {
            if deltas.len() > MAX_DELTA_DEPTH {
                return Err(PackError::ChainTooDeep(offset));
            }

            if let Some((kind, cached)) = self.base_cache.lock().get(&at).cloned() {
                break (kind, cached.as_ref().clone());
            }

            let header = self.decode_header(at)?;
            match header.kind {
                EntryKind::Whole(kind) => {
                    let (payload, _) = self.inflate_at(&header, at)?;
                    break (kind, payload);
                }
                EntryKind::OfsDelta { base_offset } => {
                    let (delta, _) = self.inflate_at(&header, at)?;
                    deltas.push(delta);
                    at = base_offset;
                }
                EntryKind::RefDelta { base } => {
                    let (delta, _) = self.inflate_at(&header, at)?;
                    deltas.push(delta);
                    match self.index.offset_of(&base) {
                        Some(base_offset) => at = base_offset,
                        None => match resolve_base(&base) {
                            Some((kind, payload)) => break (kind, payload),
                            None => return Err(PackError::MissingBase(base)),
                        },
                    }
                }
            }
        };

        // Apply innermost-first.
        let mut payload = base;
        for delta in deltas.iter().rev() {
            payload = crate::delta::apply(&payload, delta)?;
        }

        if !deltas.is_empty() {
            self.base_cache
                .lock()
                .put(offset, (kind, Arc::new(payload.clone())));
        }

        Ok(Unpacked { kind, payload })
    }
}
