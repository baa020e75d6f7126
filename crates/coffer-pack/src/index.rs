//! Pack index reader: sorted `id → (offset, crc32)` with a fan-out table.
//!
//! Two on-disk layouts exist. v2 (the default since git 1.5.2) starts
//! with the `\377tOc` magic and segregates ids, CRC32s, 32-bit offsets
//! and an optional 64-bit overflow table. v1 has no magic: the fan-out
//! is followed directly by `(offset, id)` pairs and carries no CRCs.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use coffer_id::{AbbreviatedId, ObjectId, RAW_LEN};
use memmap2::Mmap;

use crate::{PackError, INDEX_MAGIC, INDEX_VERSION};

const FANOUT_LEN: usize = 256 * 4;
const V1_ENTRY_LEN: usize = 4 + RAW_LEN;

#[derive(Debug)]
enum Layout {
    V1,
    V2 {
        oid_base: usize,
        crc_base: usize,
        ofs32_base: usize,
        ofs64_base: usize,
    },
}

/// A memory-mapped `.idx` file.
#[derive(Debug)]
pub struct PackIndex {
    data: Mmap,
    layout: Layout,
    count: u32,
    path: PathBuf,
}

impl PackIndex {
    /// Open and validate an index file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PackError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        let data = unsafe { Mmap::map(&file)? };

        if data.len() < FANOUT_LEN + 2 * RAW_LEN {
            return Err(PackError::BadIndex("file too small".into()));
        }

        let (layout, fanout_at) = if data[..4] == INDEX_MAGIC {
            let version = be32(&data, 4);
            if version != INDEX_VERSION {
                return Err(PackError::BadIndex(format!(
                    "unsupported index version {version}"
                )));
            }
            (None, 8)
        } else {
            (Some(Layout::V1), 0)
        };

        if data.len() < fanout_at + FANOUT_LEN + 2 * RAW_LEN {
            return Err(PackError::BadIndex("file too small".into()));
        }

        // The fan-out must be monotonic; the last entry is the object count.
        let mut prev = 0u32;
        for i in 0..256 {
            let v = be32(&data, fanout_at + i * 4);
            if v < prev {
                return Err(PackError::BadIndex(format!(
                    "fan-out not monotonic at bucket {i}"
                )));
            }
            prev = v;
        }
        let count = prev;
        let n = count as usize;

        let layout = match layout {
            Some(v1) => {
                let expected = FANOUT_LEN + n * V1_ENTRY_LEN + 2 * RAW_LEN;
                if data.len() < expected {
                    return Err(PackError::BadIndex(format!(
                        "v1 index too small: {} < {expected}",
                        data.len()
                    )));
                }
                v1
            }
            None => {
                let oid_base = fanout_at + FANOUT_LEN;
                let crc_base = oid_base + n * RAW_LEN;
                let ofs32_base = crc_base + n * 4;
                let ofs64_base = ofs32_base + n * 4;
                if data.len() < ofs64_base + 2 * RAW_LEN {
                    return Err(PackError::BadIndex(format!(
                        "v2 index too small: {} bytes for {n} objects",
                        data.len()
                    )));
                }
                Layout::V2 {
                    oid_base,
                    crc_base,
                    ofs32_base,
                    ofs64_base,
                }
            }
        };

        Ok(Self {
            data,
            layout,
            count,
            path,
        })
    }

    /// Number of objects covered by this index.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// 1 or 2.
    pub fn version(&self) -> u32 {
        match self.layout {
            Layout::V1 => 1,
            Layout::V2 { .. } => 2,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Binary-search for an id. Returns its table position.
    pub fn position_of(&self, id: &ObjectId) -> Option<u32> {
        let range = self.bucket_range(id.first_byte());
        let target = id.as_bytes();
        let mut lo = range.start;
        let mut hi = range.end;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.oid_raw(mid).cmp(target) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(mid as u32),
            }
        }
        None
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.position_of(id).is_some()
    }

    /// The pack offset of `id`, if present.
    pub fn offset_of(&self, id: &ObjectId) -> Option<u64> {
        self.position_of(id).map(|pos| self.offset_at(pos))
    }

    /// The id stored at a table position.
    pub fn oid_at(&self, pos: u32) -> ObjectId {
        ObjectId::from_bytes(self.oid_raw(pos as usize)).expect("index slice is id-sized")
    }

    /// The pack offset stored at a table position.
    pub fn offset_at(&self, pos: u32) -> u64 {
        match &self.layout {
            Layout::V1 => be32(&self.data, FANOUT_LEN + pos as usize * V1_ENTRY_LEN) as u64,
            Layout::V2 {
                ofs32_base,
                ofs64_base,
                ..
            } => {
                let raw = be32(&self.data, ofs32_base + pos as usize * 4);
                if raw & 0x8000_0000 == 0 {
                    raw as u64
                } else {
                    let slot = (raw & 0x7fff_ffff) as usize;
                    be64(&self.data, ofs64_base + slot * 8)
                }
            }
        }
    }

    /// The CRC32 of the raw entry bytes. v1 indexes store none.
    pub fn crc32_at(&self, pos: u32) -> Option<u32> {
        match &self.layout {
            Layout::V1 => None,
            Layout::V2 { crc_base, .. } => Some(be32(&self.data, crc_base + pos as usize * 4)),
        }
    }

    /// All ids matching an abbreviation, in table order.
    ///
    /// The fan-out bounds the scan to one bucket; within it a binary
    /// search refines to the matching run.
    pub fn matching(&self, abbrev: &AbbreviatedId) -> Vec<ObjectId> {
        let hex = abbrev.to_hex();
        let bucket = match u8::from_str_radix(&hex[..hex.len().min(2)], 16) {
            Ok(b) if hex.len() >= 2 => b,
            // A single digit spans 16 buckets; fall back to scanning them.
            _ => {
                let first = u8::from_str_radix(&hex[..1], 16).unwrap_or(0);
                let mut out = Vec::new();
                for b in (first << 4)..=((first << 4) | 0x0f) {
                    out.extend(self.bucket_matches(b, abbrev));
                }
                return out;
            }
        };
        self.bucket_matches(bucket, abbrev)
    }

    fn bucket_matches(&self, bucket: u8, abbrev: &AbbreviatedId) -> Vec<ObjectId> {
        self.bucket_range(bucket)
            .filter(|&i| abbrev.cmp_raw(self.oid_raw(i)) == Ordering::Equal)
            .map(|i| self.oid_at(i as u32))
            .collect()
    }

    /// Checksum of the pack this index describes.
    pub fn pack_checksum(&self) -> ObjectId {
        let at = self.data.len() - 2 * RAW_LEN;
        ObjectId::from_bytes(&self.data[at..at + RAW_LEN]).expect("trailer is id-sized")
    }

    /// Trailing checksum of the index file itself.
    pub fn self_checksum(&self) -> ObjectId {
        let at = self.data.len() - RAW_LEN;
        ObjectId::from_bytes(&self.data[at..]).expect("trailer is id-sized")
    }

    /// Iterate `(id, offset)` in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, u64)> + '_ {
        (0..self.count).map(|pos| (self.oid_at(pos), self.offset_at(pos)))
    }

    fn fanout_at(&self) -> usize {
        match self.layout {
            Layout::V1 => 0,
            Layout::V2 { .. } => 8,
        }
    }

    fn bucket_range(&self, bucket: u8) -> std::ops::Range<usize> {
        let base = self.fanout_at();
        let end = be32(&self.data, base + bucket as usize * 4) as usize;
        let start = match bucket {
            0 => 0,
            b => be32(&self.data, base + (b as usize - 1) * 4) as usize,
        };
        start..end
    }

    fn oid_raw(&self, pos: usize) -> &[u8] {
        let at = match &self.layout {
            Layout::V1 => FANOUT_LEN + pos * V1_ENTRY_LEN + 4,
            Layout::V2 { oid_base, .. } => oid_base + pos * RAW_LEN,
        };
        &self.data[at..at + RAW_LEN]
    }
}

fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn be64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_be_bytes(raw)
}
