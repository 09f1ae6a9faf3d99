//! Pack index (`.idx`) parsing and lookup.
//!
//! Two layouts are supported:
//!
//! - **v1**: 256-entry fan-out, then `count` × (u32 offset, 20-byte hash),
//!   then the pack checksum and the index checksum.
//! - **v2**: magic `\xfftOc`, version 2, fan-out, sorted hashes, a parallel
//!   CRC32 table, a parallel u32 offset table whose high bit redirects into a
//!   trailing u64 table for large offsets, then both checksums.
//!
//! `fanout[b]` is the number of objects whose first byte is `<= b`, so the
//! entries starting with byte `b` occupy `fanout[b-1]..fanout[b]`.

use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;
use odb_crypto::ObjectHasher;
use odb_types::{ObjectFormat, Oid, OidPrefix};

use crate::error::{PackError, PackResult};

pub(crate) const IDX_V2_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
pub(crate) const FANOUT_LEN: usize = 256 * 4;
pub(crate) const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

enum IndexBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for IndexBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Owned(vec) => vec,
        }
    }
}

/// An opened pack index. Immutable after open; safe to share across threads.
pub struct PackIndex {
    bytes: IndexBytes,
    format: ObjectFormat,
    version: u32,
    count: usize,
    fanout: [u32; 256],
    oid_base: usize,
    oid_stride: usize,
    offset_base: usize,
    offset_stride: usize,
    crc_base: Option<usize>,
    large_base: usize,
    large_count: usize,
}

impl PackIndex {
    /// Map and validate the index at `path`.
    pub fn open(path: &Path, format: ObjectFormat) -> PackResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < (FANOUT_LEN + 2 * format.oid_len()) as u64 {
            return Err(PackError::IndexCorrupted(format!(
                "{}: index file too small ({len} bytes)",
                path.display()
            )));
        }
        // SAFETY: index files are never rewritten in place; a replaced file
        // gets a new inode and the mapping keeps the old contents.
        let map = unsafe { Mmap::map(&file)? };
        Self::parse(IndexBytes::Mapped(map), format)
    }

    /// Validate an index held in memory.
    pub fn from_bytes(data: Vec<u8>, format: ObjectFormat) -> PackResult<Self> {
        Self::parse(IndexBytes::Owned(data), format)
    }

    fn parse(bytes: IndexBytes, format: ObjectFormat) -> PackResult<Self> {
        let hash_len = format.oid_len();
        let data: &[u8] = &bytes;

        let v2 = data.len() >= 8 && data[..4] == IDX_V2_MAGIC;
        let (version, header_len) = if v2 {
            let version = be32(data, 4);
            if version != 2 {
                return Err(PackError::UnsupportedVersion {
                    what: "pack index",
                    version,
                });
            }
            (2, 8)
        } else {
            if format != ObjectFormat::Sha1 {
                return Err(PackError::IndexCorrupted(
                    "version 1 indexes only hold SHA-1 identifiers".into(),
                ));
            }
            (1, 0)
        };

        if data.len() < header_len + FANOUT_LEN + 2 * hash_len {
            return Err(PackError::IndexCorrupted(format!(
                "index file too small ({} bytes)",
                data.len()
            )));
        }

        let mut fanout = [0u32; 256];
        for (i, slot) in fanout.iter_mut().enumerate() {
            *slot = be32(data, header_len + i * 4);
        }
        if fanout.windows(2).any(|w| w[1] < w[0]) {
            return Err(PackError::IndexCorrupted("non-monotonic fan-out table".into()));
        }

        let count = fanout[255] as usize;
        let n = count as u64;
        let h = hash_len as u64;
        let actual = data.len() as u64;
        let size_ok = if version == 1 {
            actual == FANOUT_LEN as u64 + n * (h + 4) + 2 * h
        } else {
            let min = 8 + FANOUT_LEN as u64 + n * (h + 8) + 2 * h;
            let max = min + n.saturating_sub(1) * 8;
            (min..=max).contains(&actual) && (actual - min) % 8 == 0
        };
        if !size_ok {
            return Err(PackError::IndexCorrupted(format!(
                "index size {actual} does not match {count} entries (version {version})"
            )));
        }

        let table = header_len + FANOUT_LEN;
        let index = if version == 1 {
            Self {
                format,
                version,
                count,
                fanout,
                oid_base: table + 4,
                oid_stride: hash_len + 4,
                offset_base: table,
                offset_stride: hash_len + 4,
                crc_base: None,
                large_base: 0,
                large_count: 0,
                bytes,
            }
        } else {
            let crc_base = table + count * hash_len;
            let offset_base = crc_base + count * 4;
            let large_base = offset_base + count * 4;
            let large_count = (data.len() - 2 * hash_len - large_base) / 8;
            Self {
                format,
                version,
                count,
                fanout,
                oid_base: table,
                oid_stride: hash_len,
                offset_base,
                offset_stride: 4,
                crc_base: Some(crc_base),
                large_base,
                large_count,
                bytes,
            }
        };
        index.check_order()?;
        Ok(index)
    }

    /// Every row must sit in the fan-out bucket of its first byte, and rows
    /// must be strictly increasing; lookups rely on both.
    fn check_order(&self) -> PackResult<()> {
        let mut lo = 0usize;
        for (byte, &end) in self.fanout.iter().enumerate() {
            let hi = end as usize;
            for pos in lo..hi {
                let row = self.oid_bytes_at(pos);
                if usize::from(row[0]) != byte {
                    return Err(PackError::IndexCorrupted(format!(
                        "entry {pos} starts with {:02x} but sits in fan-out bucket {byte:02x}",
                        row[0]
                    )));
                }
                if pos > 0 && self.oid_bytes_at(pos - 1) >= row {
                    return Err(PackError::IndexCorrupted(format!("entry {pos} is out of order")));
                }
            }
            lo = hi;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn format(&self) -> ObjectFormat {
        self.format
    }

    /// Checksum of the pack this index describes.
    pub fn pack_checksum(&self) -> &[u8] {
        let h = self.format.oid_len();
        let end = self.bytes.len();
        &self.bytes[end - 2 * h..end - h]
    }

    /// Checksum of the index itself.
    pub fn checksum(&self) -> &[u8] {
        let h = self.format.oid_len();
        &self.bytes[self.bytes.len() - h..]
    }

    /// Recompute the index checksum and compare it with the trailer.
    pub fn verify_checksum(&self) -> PackResult<()> {
        let h = self.format.oid_len();
        let body = &self.bytes[..self.bytes.len() - h];
        if ObjectHasher::digest(self.format, body).as_bytes() != self.checksum() {
            return Err(PackError::ChecksumMismatch("pack index trailer".into()));
        }
        Ok(())
    }

    fn oid_bytes_at(&self, pos: usize) -> &[u8] {
        let start = self.oid_base + pos * self.oid_stride;
        &self.bytes[start..start + self.format.oid_len()]
    }

    /// Identifier at sorted position `pos`.
    pub fn oid_at(&self, pos: usize) -> Option<Oid> {
        if pos >= self.count {
            return None;
        }
        Oid::from_slice(self.oid_bytes_at(pos)).ok()
    }

    /// Pack offset of the entry at sorted position `pos`.
    pub fn offset_at(&self, pos: usize) -> PackResult<u64> {
        if pos >= self.count {
            return Err(PackError::IndexCorrupted(format!("position {pos} out of range")));
        }
        let raw = be32(&self.bytes, self.offset_base + pos * self.offset_stride);
        if self.version == 1 || raw & LARGE_OFFSET_FLAG == 0 {
            return Ok(u64::from(raw));
        }
        let slot = (raw & !LARGE_OFFSET_FLAG) as usize;
        if slot >= self.large_count {
            return Err(PackError::IndexCorrupted(format!(
                "large offset slot {slot} out of range ({} present)",
                self.large_count
            )));
        }
        Ok(be64(&self.bytes, self.large_base + slot * 8))
    }

    /// CRC32 of the packed entry at `pos` (version 2 only).
    pub fn crc_at(&self, pos: usize) -> Option<u32> {
        let base = self.crc_base?;
        (pos < self.count).then(|| be32(&self.bytes, base + pos * 4))
    }

    /// All identifiers in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = Oid> + '_ {
        (0..self.count).filter_map(move |pos| self.oid_at(pos))
    }

    /// Position range of the entries whose first byte lies in `first..=last`.
    fn bucket(&self, first: u8, last: u8) -> (usize, usize) {
        let lo = match first {
            0 => 0,
            b => self.fanout[usize::from(b) - 1] as usize,
        };
        (lo, self.fanout[usize::from(last)] as usize)
    }

    /// First position in `lo..hi` whose identifier is `>= target`.
    fn lower_bound(&self, mut lo: usize, mut hi: usize, first: u8, last: u8, target: &[u8]) -> usize {
        let mut lo_key = u64::from(first) << 24;
        let mut hi_key = (u64::from(last) + 1) << 24;
        let target_key = search_key(target);
        while lo < hi {
            let mid = interpolation_pick(lo, hi, lo_key, hi_key, target_key);
            let candidate = self.oid_bytes_at(mid);
            if candidate < target {
                lo = mid + 1;
                lo_key = search_key(candidate);
            } else {
                hi = mid;
                hi_key = search_key(candidate);
            }
        }
        lo
    }

    /// Sorted position of `oid`, if present.
    pub fn find(&self, oid: &Oid) -> Option<usize> {
        if oid.format() != self.format {
            return None;
        }
        let first = oid.first_byte();
        let (lo, hi) = self.bucket(first, first);
        let pos = self.lower_bound(lo, hi, first, first, oid.as_bytes());
        (pos < hi && self.oid_bytes_at(pos) == oid.as_bytes()).then_some(pos)
    }

    /// Pack offset of `oid`, if present.
    pub fn lookup(&self, oid: &Oid) -> PackResult<Option<u64>> {
        self.find(oid).map(|pos| self.offset_at(pos)).transpose()
    }

    /// Sorted position of the unique entry starting with `prefix`.
    ///
    /// Every entry in the matching run is compared, so a prefix shared by
    /// three or more entries is reported as ambiguous too.
    pub fn find_prefix(&self, prefix: &OidPrefix) -> PackResult<Option<usize>> {
        let hash_len = self.format.oid_len();
        let (first, last) = prefix.first_byte_range();
        let (lo, hi) = self.bucket(first, last);
        let target = &prefix.padded()[..hash_len];
        let pos = self.lower_bound(lo, hi, first, last, target);
        if pos >= hi || !prefix.matches_bytes(self.oid_bytes_at(pos)) {
            return Ok(None);
        }
        if !prefix.is_full(self.format) {
            let found = self.oid_bytes_at(pos);
            let run = (pos + 1..hi).take_while(|&next| prefix.matches_bytes(self.oid_bytes_at(next)));
            for next in run {
                if self.oid_bytes_at(next) != found {
                    return Err(PackError::Ambiguous(prefix.to_hex()));
                }
            }
        }
        Ok(Some(pos))
    }

    /// Resolve `prefix` to a full identifier and its pack offset.
    pub fn lookup_prefix(&self, prefix: &OidPrefix) -> PackResult<Option<(Oid, u64)>> {
        let Some(pos) = self.find_prefix(prefix)? else {
            return Ok(None);
        };
        let oid = Oid::from_slice(self.oid_bytes_at(pos))
            .map_err(|e| PackError::IndexCorrupted(e.to_string()))?;
        Ok(Some((oid, self.offset_at(pos)?)))
    }
}

impl std::fmt::Debug for PackIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackIndex")
            .field("version", &self.version)
            .field("format", &self.format)
            .field("count", &self.count)
            .finish()
    }
}

/// Search key of an identifier: its first four bytes as a big-endian number.
fn search_key(oid: &[u8]) -> u64 {
    let mut key = [0u8; 4];
    let n = oid.len().min(4);
    key[..n].copy_from_slice(&oid[..n]);
    u64::from(u32::from_be_bytes(key))
}

/// Choose the next position to test in `lo..hi` for `target_key`.
///
/// Hashes are uniformly distributed, so the target's expected position is
/// its linear interpolation between the keys bounding the range. That
/// estimate is pulled a quarter of the way toward the midpoint so a skewed
/// bucket degrades toward bisection instead of crawling one entry per step.
/// The result always lies in `lo..hi` (requires `lo < hi`).
pub fn interpolation_pick(lo: usize, hi: usize, lo_key: u64, hi_key: u64, target_key: u64) -> usize {
    debug_assert!(lo < hi);
    let span = (hi - lo) as u128;
    let midpoint = span / 2;
    let estimate = if hi_key > lo_key {
        let target = target_key.clamp(lo_key, hi_key);
        span * u128::from(target - lo_key) / u128::from(hi_key - lo_key)
    } else {
        midpoint
    };
    let hedged = (3 * estimate + midpoint) / 4;
    lo + (hedged.min(span - 1) as usize)
}

fn be32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_be_bytes(buf)
}

fn be64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_be_bytes(buf)
}
