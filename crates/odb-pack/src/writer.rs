use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use odb_crypto::ObjectHasher;
use odb_types::{ObjectFormat, ObjectKind, Oid};
use tracing::debug;

use crate::delta;
use crate::entry::{EntryHeader, EntryKind};
use crate::error::{PackError, PackResult};
use crate::index::{FANOUT_LEN, IDX_V2_MAGIC, LARGE_OFFSET_FLAG};
use crate::varint::encode_ofs;

/// One row of a pack index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub oid: Oid,
    pub offset: u64,
    pub crc: u32,
}

/// On-disk index layout to emit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexVersion {
    V1,
    #[default]
    V2,
}

/// Serialize an index for `entries` (sorted in place).
pub fn encode_index(
    format: ObjectFormat,
    version: IndexVersion,
    entries: &mut [IndexEntry],
    pack_checksum: &[u8],
) -> PackResult<Vec<u8>> {
    let hash_len = format.oid_len();
    if pack_checksum.len() != hash_len {
        return Err(PackError::IndexCorrupted(format!(
            "pack checksum is {} bytes, expected {hash_len}",
            pack_checksum.len()
        )));
    }
    entries.sort_by(|a, b| a.oid.cmp(&b.oid));
    if entries.windows(2).any(|w| w[0].oid == w[1].oid) {
        return Err(PackError::IndexCorrupted("duplicate object in index".into()));
    }
    if entries.iter().any(|e| e.oid.format() != format) {
        return Err(PackError::IndexCorrupted("object format does not match index".into()));
    }

    let mut fanout = [0u32; 256];
    for e in entries.iter() {
        fanout[usize::from(e.oid.first_byte())] += 1;
    }
    for i in 1..256 {
        fanout[i] += fanout[i - 1];
    }

    let mut buf = Vec::with_capacity(8 + FANOUT_LEN + entries.len() * (hash_len + 12) + 2 * hash_len);
    match version {
        IndexVersion::V1 => {
            if format != ObjectFormat::Sha1 {
                return Err(PackError::IndexCorrupted(
                    "version 1 indexes only hold SHA-1 identifiers".into(),
                ));
            }
            for count in fanout {
                buf.extend_from_slice(&count.to_be_bytes());
            }
            for e in entries.iter() {
                let offset = u32::try_from(e.offset).map_err(|_| {
                    PackError::IndexCorrupted(format!("offset {} does not fit a version 1 index", e.offset))
                })?;
                buf.extend_from_slice(&offset.to_be_bytes());
                buf.extend_from_slice(e.oid.as_bytes());
            }
        }
        IndexVersion::V2 => {
            buf.extend_from_slice(&IDX_V2_MAGIC);
            buf.extend_from_slice(&2u32.to_be_bytes());
            for count in fanout {
                buf.extend_from_slice(&count.to_be_bytes());
            }
            for e in entries.iter() {
                buf.extend_from_slice(e.oid.as_bytes());
            }
            for e in entries.iter() {
                buf.extend_from_slice(&e.crc.to_be_bytes());
            }
            let mut large = Vec::new();
            for e in entries.iter() {
                let small = if e.offset < u64::from(LARGE_OFFSET_FLAG) {
                    e.offset as u32
                } else {
                    large.push(e.offset);
                    LARGE_OFFSET_FLAG | (large.len() - 1) as u32
                };
                buf.extend_from_slice(&small.to_be_bytes());
            }
            for offset in large {
                buf.extend_from_slice(&offset.to_be_bytes());
            }
        }
    }
    buf.extend_from_slice(pack_checksum);
    let checksum = ObjectHasher::digest(format, &buf);
    buf.extend_from_slice(checksum.as_bytes());
    Ok(buf)
}

/// A finished pack and its index, held in memory.
#[derive(Clone, Debug)]
pub struct PackBytes {
    pub pack: Vec<u8>,
    pub index: Vec<u8>,
    pub checksum: Oid,
}

/// Builds version-2 packs with whole-object, ofs-delta and ref-delta entries.
///
/// Entries are appended in call order; a delta's base must already have been
/// added when it is an ofs-delta.
pub struct PackWriter {
    format: ObjectFormat,
    data: Vec<u8>,
    entries: Vec<IndexEntry>,
}

impl PackWriter {
    pub fn new(format: ObjectFormat) -> Self {
        let mut data = Vec::new();
        data.extend_from_slice(b"PACK");
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        Self {
            format,
            data,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a whole object. Returns its identifier and pack offset.
    pub fn add_object(&mut self, kind: ObjectKind, data: &[u8]) -> PackResult<(Oid, u64)> {
        let oid = ObjectHasher::hash_object(self.format, kind, data);
        let offset = self.push_entry(oid, kind.into(), &[], data)?;
        Ok((oid, offset))
    }

    /// Append `target` as an ofs-delta against the entry at `base_offset`
    /// whose content is `base`.
    pub fn add_ofs_delta_of(
        &mut self,
        base_offset: u64,
        base: &[u8],
        kind: ObjectKind,
        target: &[u8],
    ) -> PackResult<(Oid, u64)> {
        let oid = ObjectHasher::hash_object(self.format, kind, target);
        let offset = self.add_ofs_delta(base_offset, oid, &delta::encode(base, target))?;
        Ok((oid, offset))
    }

    /// Append `target` as a ref-delta against `base_oid` whose content is `base`.
    pub fn add_ref_delta_of(
        &mut self,
        base_oid: &Oid,
        base: &[u8],
        kind: ObjectKind,
        target: &[u8],
    ) -> PackResult<(Oid, u64)> {
        let oid = ObjectHasher::hash_object(self.format, kind, target);
        let offset = self.add_ref_delta(base_oid, oid, &delta::encode(base, target))?;
        Ok((oid, offset))
    }

    /// Append a raw delta instruction stream as an ofs-delta entry indexed
    /// under `oid`.
    pub fn add_ofs_delta(&mut self, base_offset: u64, oid: Oid, delta: &[u8]) -> PackResult<u64> {
        let offset = self.data.len() as u64;
        let distance = offset.checked_sub(base_offset).filter(|&d| d > 0).ok_or_else(|| {
            PackError::corrupt(offset, format!("base offset {base_offset} is not before this entry"))
        })?;
        let mut reference = Vec::new();
        encode_ofs(&mut reference, distance);
        self.push_entry(oid, EntryKind::OfsDelta, &reference, delta)
    }

    /// Append a raw delta instruction stream as a ref-delta entry indexed
    /// under `oid`.
    pub fn add_ref_delta(&mut self, base: &Oid, oid: Oid, delta: &[u8]) -> PackResult<u64> {
        self.push_entry(oid, EntryKind::RefDelta, base.as_bytes(), delta)
    }

    /// Append arbitrary entry bytes indexed under `oid`.
    pub fn add_raw(&mut self, oid: Oid, raw: &[u8]) -> u64 {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(raw);
        self.record(oid, offset);
        offset
    }

    fn push_entry(&mut self, oid: Oid, kind: EntryKind, reference: &[u8], payload: &[u8]) -> PackResult<u64> {
        let offset = self.data.len() as u64;
        EntryHeader::encode(&mut self.data, kind, payload.len() as u64);
        self.data.extend_from_slice(reference);
        let mut encoder = ZlibEncoder::new(std::mem::take(&mut self.data), Compression::default());
        encoder.write_all(payload)?;
        self.data = encoder.finish()?;
        self.record(oid, offset);
        Ok(offset)
    }

    fn record(&mut self, oid: Oid, offset: u64) {
        let crc = crc32fast::hash(&self.data[offset as usize..]);
        self.entries.push(IndexEntry { oid, offset, crc });
    }

    /// Patch the entry count, append the trailer and build the index.
    pub fn finish(mut self, version: IndexVersion) -> PackResult<PackBytes> {
        let count = u32::try_from(self.entries.len())
            .map_err(|_| PackError::corrupt(0, "too many entries for one pack"))?;
        self.data[8..12].copy_from_slice(&count.to_be_bytes());
        let checksum = ObjectHasher::digest(self.format, &self.data);
        self.data.extend_from_slice(checksum.as_bytes());
        let index = encode_index(self.format, version, &mut self.entries, checksum.as_bytes())?;
        Ok(PackBytes {
            pack: self.data,
            index,
            checksum,
        })
    }

    /// Finish and write `pack-<checksum>.pack` and `.idx` into `dir`.
    /// Returns the index path.
    pub fn write_to(self, dir: &Path, version: IndexVersion) -> PackResult<PathBuf> {
        let bytes = self.finish(version)?;
        fs::create_dir_all(dir)?;
        let stem = format!("pack-{}", bytes.checksum.to_hex());
        let pack_path = dir.join(format!("{stem}.pack"));
        let idx_path = dir.join(format!("{stem}.idx"));
        fs::write(&pack_path, &bytes.pack)?;
        fs::write(&idx_path, &bytes.index)?;
        debug!(path = %idx_path.display(), "wrote pack");
        Ok(idx_path)
    }
}
