//! Pack and index writing.
//!
//! The writer streams entries into a `.pack` with a running checksum;
//! the object count is declared up front so the header never needs a
//! fix-up pass. Deltas are accepted pre-computed (reused from another
//! pack); this engine never generates them.

use std::io::Write;
use std::path::{Path, PathBuf};

use coffer_id::{FanoutTable, Hasher, ObjectId};
use coffer_object::Kind;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::entry;
use crate::{PackError, INDEX_MAGIC, INDEX_VERSION, PACK_MAGIC, PACK_VERSION};

/// One written entry, retained for index construction.
#[derive(Debug, Clone)]
pub struct WrittenEntry {
    pub id: ObjectId,
    pub offset: u64,
    pub crc32: u32,
}

/// Streams a new `.pack` file to disk.
pub struct PackWriter {
    file: std::fs::File,
    hasher: Hasher,
    path: PathBuf,
    declared: u32,
    entries: Vec<WrittenEntry>,
    position: u64,
}

impl PackWriter {
    /// Start a pack that will hold exactly `count` objects.
    pub fn create(path: impl AsRef<Path>, count: u32) -> Result<Self, PackError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::create(&path)?;

        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(PACK_MAGIC);
        header.extend_from_slice(&PACK_VERSION.to_be_bytes());
        header.extend_from_slice(&count.to_be_bytes());

        let mut writer = Self {
            file,
            hasher: Hasher::new(),
            path,
            declared: count,
            entries: Vec::with_capacity(count as usize),
            position: 0,
        };
        writer.emit(&header)?;
        Ok(writer)
    }

    /// Append a whole (non-delta) object. Returns its entry offset.
    pub fn add_whole(&mut self, kind: Kind, payload: &[u8]) -> Result<u64, PackError> {
        let id = Hasher::object_id(kind.name(), payload)?;
        let header = entry::encode(kind.pack_type(), payload.len() as u64);
        let compressed = deflate(payload)?;
        self.add_entry(id, &header, &[], &compressed)
    }

    /// Append a reused delta against a base earlier in this pack.
    pub fn add_ofs_delta(
        &mut self,
        target: ObjectId,
        base_offset: u64,
        delta: &[u8],
    ) -> Result<u64, PackError> {
        let offset = self.position;
        if base_offset >= offset {
            return Err(PackError::CorruptEntry(offset));
        }
        let header = entry::encode(6, delta.len() as u64);
        let distance = entry::encode_ofs_distance(offset - base_offset);
        let compressed = deflate(delta)?;
        self.add_entry(target, &header, &distance, &compressed)
    }

    /// Append a reused delta against a base named by id (thin packs allow
    /// the base to live outside this pack).
    pub fn add_ref_delta(
        &mut self,
        target: ObjectId,
        base: ObjectId,
        delta: &[u8],
    ) -> Result<u64, PackError> {
        let header = entry::encode(7, delta.len() as u64);
        let compressed = deflate(delta)?;
        self.add_entry(target, &header, base.as_bytes(), &compressed)
    }

    fn add_entry(
        &mut self,
        id: ObjectId,
        header: &[u8],
        extra: &[u8],
        compressed: &[u8],
    ) -> Result<u64, PackError> {
        if self.entries.len() as u32 == self.declared {
            return Err(PackError::BadHeader(format!(
                "pack declared {} objects, adding more",
                self.declared
            )));
        }
        let offset = self.position;

        let mut crc = crc32fast::Hasher::new();
        crc.update(header);
        crc.update(extra);
        crc.update(compressed);

        self.emit(header)?;
        self.emit(extra)?;
        self.emit(compressed)?;

        self.entries.push(WrittenEntry {
            id,
            offset,
            crc32: crc.finalize(),
        });
        Ok(offset)
    }

    /// Entries written so far, in pack order.
    pub fn entries(&self) -> &[WrittenEntry] {
        &self.entries
    }

    /// Write the checksum trailer and close the file.
    pub fn finish(mut self) -> Result<(PathBuf, ObjectId), PackError> {
        if self.entries.len() as u32 != self.declared {
            return Err(PackError::BadHeader(format!(
                "pack declared {} objects, wrote {}",
                self.declared,
                self.entries.len()
            )));
        }
        let checksum = std::mem::take(&mut self.hasher).finalize()?;
        self.file.write_all(checksum.as_bytes())?;
        self.file.sync_all()?;
        Ok((self.path, checksum))
    }

    fn emit(&mut self, data: &[u8]) -> Result<(), PackError> {
        self.file.write_all(data)?;
        self.hasher.update(data);
        self.position += data.len() as u64;
        Ok(())
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, PackError> {
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    let mut encoder = ZlibEncoder::new(&mut out, Compression::default());
    encoder.write_all(data)?;
    encoder.finish()?;
    Ok(out)
}

/// Write a v2 index for `entries` (sorted in place by id).
pub fn write_index_v2(
    path: &Path,
    entries: &mut [(ObjectId, u64, u32)],
    pack_checksum: &ObjectId,
) -> Result<(), PackError> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let ids: Vec<ObjectId> = entries.iter().map(|e| e.0).collect();

    let mut buf = Vec::new();
    buf.extend_from_slice(&INDEX_MAGIC);
    buf.extend_from_slice(&INDEX_VERSION.to_be_bytes());
    buf.extend_from_slice(&FanoutTable::build(&ids).to_bytes());

    for (id, _, _) in entries.iter() {
        buf.extend_from_slice(id.as_bytes());
    }
    for (_, _, crc) in entries.iter() {
        buf.extend_from_slice(&crc.to_be_bytes());
    }

    let mut large: Vec<u64> = Vec::new();
    for (_, offset, _) in entries.iter() {
        if *offset < 1 << 31 {
            buf.extend_from_slice(&(*offset as u32).to_be_bytes());
        } else {
            buf.extend_from_slice(&(0x8000_0000u32 | large.len() as u32).to_be_bytes());
            large.push(*offset);
        }
    }
    for offset in &large {
        buf.extend_from_slice(&offset.to_be_bytes());
    }

    finish_index(path, buf, pack_checksum)
}

/// Write a legacy v1 index: fan-out followed by `(offset, id)` pairs.
///
/// v1 stores no CRCs and cannot express offsets at or beyond 2^32.
pub fn write_index_v1(
    path: &Path,
    entries: &mut [(ObjectId, u64, u32)],
    pack_checksum: &ObjectId,
) -> Result<(), PackError> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let ids: Vec<ObjectId> = entries.iter().map(|e| e.0).collect();

    let mut buf = Vec::new();
    buf.extend_from_slice(&FanoutTable::build(&ids).to_bytes());
    for (id, offset, _) in entries.iter() {
        let offset = u32::try_from(*offset)
            .map_err(|_| PackError::BadIndex(format!("offset {offset} exceeds v1 range")))?;
        buf.extend_from_slice(&offset.to_be_bytes());
        buf.extend_from_slice(id.as_bytes());
    }

    finish_index(path, buf, pack_checksum)
}

fn finish_index(path: &Path, mut buf: Vec<u8>, pack_checksum: &ObjectId) -> Result<(), PackError> {
    buf.extend_from_slice(pack_checksum.as_bytes());
    let mut hasher = Hasher::new();
    hasher.update(&buf);
    let self_checksum = hasher.finalize()?;
    buf.extend_from_slice(self_checksum.as_bytes());
    std::fs::write(path, &buf)?;
    Ok(())
}

/// Build a complete `pack-<checksum>.pack` + `.idx` pair of whole objects
/// inside `pack_dir`. The index lands last, making the pack discoverable.
pub fn create_pack(
    pack_dir: &Path,
    objects: &[(Kind, Vec<u8>)],
) -> Result<(PathBuf, PathBuf, ObjectId), PackError> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);

    std::fs::create_dir_all(pack_dir)?;
    let staging = pack_dir.join(format!(
        "incoming-{}-{}.pack",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let mut writer = PackWriter::create(&staging, objects.len() as u32)?;
    for (kind, payload) in objects {
        writer.add_whole(*kind, payload)?;
    }
    let mut entries: Vec<(ObjectId, u64, u32)> = writer
        .entries()
        .iter()
        .map(|e| (e.id, e.offset, e.crc32))
        .collect();
    let (staged_path, checksum) = writer.finish()?;

    let pack_path = pack_dir.join(format!("pack-{}.pack", checksum.to_hex()));
    let idx_path = pack_dir.join(format!("pack-{}.idx", checksum.to_hex()));
    std::fs::rename(&staged_path, &pack_path)?;
    write_index_v2(&idx_path, &mut entries, &checksum)?;

    Ok((pack_path, idx_path, checksum))
}
