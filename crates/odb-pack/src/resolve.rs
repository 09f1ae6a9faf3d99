//! Turning pack entries into objects.
//!
//! An entry is either a whole object or a delta against a base entry, which
//! may itself be a delta. [`materialize`] walks the chain down to the whole
//! object iteratively, inflates it, then applies the deltas from the
//! innermost outwards. Chain length is bounded by
//! [`PackConfig::max_delta_depth`], which also stops ref-delta cycles.

use flate2::{Decompress, FlushDecompress, Status};
use odb_store::alloc_buffer;
use odb_types::{ObjectHeader, ObjectKind, Oid, RawObject};
use serde::{Deserialize, Serialize};

use crate::delta;
use crate::entry::{EntryHeader, EntryKind};
use crate::error::{PackError, PackResult};
use crate::file::{PackFile, PACK_HEADER_LEN};
use crate::varint::decode_ofs;

/// Longest entry prefix we ever need before the zlib stream starts: a
/// 10-byte size header plus a 32-byte base identifier.
const PEEK_LEN: usize = 64;

const SCRATCH_LEN: usize = 8 * 1024;

/// Enough inflated delta bytes to hold its two length varints.
const DELTA_HEADER_PEEK: u64 = 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Longest delta chain followed before giving up.
    pub max_delta_depth: usize,
    /// Check each entry's CRC-32 against the index before returning it.
    pub verify_crc: bool,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            max_delta_depth: 10_000,
            verify_crc: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Base {
    Offset(u64),
    Oid(Oid),
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    offset: u64,
    kind: EntryKind,
    size: u64,
    /// First byte of the zlib stream.
    data_offset: u64,
    base: Option<Base>,
}

fn read_entry(pack: &PackFile, offset: u64) -> PackResult<Entry> {
    if offset < PACK_HEADER_LEN || offset >= pack.data_end() {
        return Err(PackError::corrupt(offset, "entry offset outside pack data"));
    }
    let mut peek = [0u8; PEEK_LEN];
    let n = pack.read_at(offset, &mut peek)?;
    let peek = &peek[..n];

    let header = EntryHeader::decode(peek).map_err(|e| PackError::corrupt(offset, e.to_string()))?;
    let rest = &peek[header.len..];
    let (base, reference_len) = match header.kind {
        EntryKind::OfsDelta => {
            let (distance, used) =
                decode_ofs(rest).ok_or_else(|| PackError::corrupt(offset, "malformed base distance"))?;
            let base = offset
                .checked_sub(distance)
                .filter(|&b| distance > 0 && b >= PACK_HEADER_LEN)
                .ok_or_else(|| PackError::corrupt(offset, format!("base distance {distance} points outside the pack")))?;
            (Some(Base::Offset(base)), used)
        }
        EntryKind::RefDelta => {
            let hash_len = pack.hash_len();
            let raw = rest
                .get(..hash_len)
                .ok_or_else(|| PackError::corrupt(offset, "truncated base identifier"))?;
            let oid = Oid::from_slice(raw).map_err(|e| PackError::corrupt(offset, e.to_string()))?;
            (Some(Base::Oid(oid)), hash_len)
        }
        _ => (None, 0),
    };

    Ok(Entry {
        offset,
        kind: header.kind,
        size: header.size,
        data_offset: offset + (header.len + reference_len) as u64,
        base,
    })
}

/// Offset of the entry `entry` is a delta against, if any.
fn base_offset(pack: &PackFile, entry: &Entry) -> PackResult<Option<u64>> {
    match entry.base {
        None => Ok(None),
        Some(Base::Offset(offset)) => Ok(Some(offset)),
        Some(Base::Oid(base)) => match pack.index().lookup(&base)? {
            Some(offset) => Ok(Some(offset)),
            None => Err(PackError::BaseNotFound {
                offset: entry.offset,
                base,
            }),
        },
    }
}

/// Follow `top`'s bases down to a whole object. Returns the deltas
/// outermost first, and the whole entry.
fn walk_chain(pack: &PackFile, top: Entry, limit: usize) -> PackResult<(Vec<Entry>, Entry)> {
    let mut chain = Vec::new();
    let mut current = top;
    while let Some(next) = base_offset(pack, &current)? {
        if chain.len() >= limit {
            return Err(PackError::DeltaChainTooDeep {
                offset: top.offset,
                limit,
            });
        }
        chain.push(current);
        current = read_entry(pack, next)?;
    }
    Ok((chain, current))
}

/// Inflate `entry`'s zlib stream into `out`.
///
/// With `stop_at_limit`, returns as soon as `limit` bytes are available.
/// Otherwise producing more than `limit` bytes is an error. Returns the
/// offset just past the stream once it has ended.
fn inflate(
    pack: &PackFile,
    entry: &Entry,
    limit: u64,
    stop_at_limit: bool,
    out: &mut Vec<u8>,
) -> PackResult<Option<u64>> {
    let end = pack.data_end();
    let mut de = Decompress::new(true);
    let mut scratch = [0u8; SCRATCH_LEN];
    let mut pos = entry.data_offset;

    loop {
        let have = out.len() as u64;
        if stop_at_limit && have >= limit {
            return Ok(None);
        }
        if have > limit {
            return Err(PackError::corrupt(
                entry.offset,
                format!("entry inflates to more than its declared {limit} bytes"),
            ));
        }
        if pos >= end {
            return Err(PackError::corrupt(entry.offset, "zlib stream runs into the pack trailer"));
        }

        let window = pack.window(pos)?;
        let input = window.slice_from(pos);
        let input = &input[..input.len().min((end - pos) as usize)];
        let room = (limit.saturating_sub(have)).clamp(1, SCRATCH_LEN as u64) as usize;

        let before_in = de.total_in();
        let before_out = de.total_out();
        let status = de
            .decompress(input, &mut scratch[..room], FlushDecompress::None)
            .map_err(|e| PackError::DecompressionFailed {
                offset: entry.offset,
                reason: e.to_string(),
            })?;
        let consumed = de.total_in() - before_in;
        let produced = (de.total_out() - before_out) as usize;
        pos += consumed;
        out.extend_from_slice(&scratch[..produced]);

        match status {
            Status::StreamEnd => {
                if out.len() as u64 > limit && !stop_at_limit {
                    return Err(PackError::corrupt(
                        entry.offset,
                        format!("entry inflates to more than its declared {limit} bytes"),
                    ));
                }
                return Ok(Some(pos));
            }
            Status::Ok | Status::BufError => {
                if consumed == 0 && produced == 0 {
                    return Err(PackError::corrupt(entry.offset, "zlib stream stalled"));
                }
            }
        }
    }
}

/// Inflate the whole payload of `entry`, which must be exactly its
/// declared size. Returns the payload and the offset just past the entry.
fn inflate_exact(pack: &PackFile, entry: &Entry) -> PackResult<(Vec<u8>, u64)> {
    let mut out = alloc_buffer(entry.size)?;
    let end = inflate(pack, entry, entry.size, false, &mut out)?
        .ok_or_else(|| PackError::corrupt(entry.offset, "zlib stream did not end"))?;
    if out.len() as u64 != entry.size {
        return Err(PackError::corrupt(
            entry.offset,
            format!("entry inflated to {} bytes, header says {}", out.len(), entry.size),
        ));
    }
    Ok((out, end))
}

fn verify_crc(pack: &PackFile, start: u64, end: u64, expected: u32) -> PackResult<()> {
    let mut hasher = crc32fast::Hasher::new();
    let mut pos = start;
    while pos < end {
        let window = pack.window(pos)?;
        let avail = window.slice_from(pos);
        let take = avail.len().min((end - pos) as usize);
        hasher.update(&avail[..take]);
        pos += take as u64;
    }
    let actual = hasher.finalize();
    if actual != expected {
        return Err(PackError::CrcMismatch {
            offset: start,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Fully materialize the object whose entry starts at `offset`.
pub fn materialize(pack: &PackFile, offset: u64, config: &PackConfig) -> PackResult<RawObject> {
    materialize_checked(pack, offset, config, None)
}

/// Like [`materialize`], additionally checking the CRC-32 of the top
/// entry's raw bytes when `expected_crc` is given.
pub fn materialize_checked(
    pack: &PackFile,
    offset: u64,
    config: &PackConfig,
    expected_crc: Option<u32>,
) -> PackResult<RawObject> {
    let top = read_entry(pack, offset)?;
    let (chain, whole) = walk_chain(pack, top, config.max_delta_depth)?;
    let kind = whole
        .kind
        .object_kind()
        .ok_or_else(|| PackError::corrupt(whole.offset, "delta chain has no whole base"))?;

    let (top_payload, top_end) = inflate_exact(pack, &top)?;
    if let Some(expected) = expected_crc {
        verify_crc(pack, top.offset, top_end, expected)?;
    }
    if chain.is_empty() {
        return Ok(RawObject::new(kind, top_payload));
    }

    let (mut data, _) = inflate_exact(pack, &whole)?;
    for (depth, entry) in chain.iter().enumerate().rev() {
        let inner;
        let instructions: &[u8] = if depth == 0 {
            &top_payload
        } else {
            inner = inflate_exact(pack, entry)?.0;
            &inner
        };
        data = delta::apply(&data, instructions).map_err(|e| PackError::delta(entry.offset, e))?;
    }
    Ok(RawObject::new(kind, data))
}

/// Type and size of the object at `offset` without applying any deltas.
///
/// For a delta the size comes from the delta's own header, so only its
/// first few inflated bytes are read. The kind still requires walking the
/// chain down to the whole base.
pub fn read_header(pack: &PackFile, offset: u64, config: &PackConfig) -> PackResult<ObjectHeader> {
    let top = read_entry(pack, offset)?;
    if let Some(kind) = top.kind.object_kind() {
        return Ok(ObjectHeader { kind, size: top.size });
    }

    let mut peek = Vec::new();
    inflate(pack, &top, DELTA_HEADER_PEEK.min(top.size), true, &mut peek)?;
    let (_, size, _) = delta::header(&peek).map_err(|e| PackError::delta(top.offset, e))?;

    let (_, whole) = walk_chain(pack, top, config.max_delta_depth)?;
    let kind: ObjectKind = whole
        .kind
        .object_kind()
        .ok_or_else(|| PackError::corrupt(whole.offset, "delta chain has no whole base"))?;
    Ok(ObjectHeader { kind, size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeltaError;
    use crate::delta::{push_copy, push_insert};
    use crate::varint::{encode_leb128, encode_ofs};
    use crate::window::{WindowConfig, WindowManager};
    use crate::writer::{IndexVersion, PackBytes, PackWriter};
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use odb_crypto::ObjectHasher;
    use odb_types::ObjectFormat;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;

    const SHA1: ObjectFormat = ObjectFormat::Sha1;

    fn windows(window_size: u64) -> Arc<WindowManager> {
        Arc::new(WindowManager::new(&WindowConfig {
            window_size,
            mapped_limit: window_size * 4,
        }))
    }

    fn open(dir: &Path, writer: PackWriter, window_size: u64) -> PackFile {
        let idx = writer.write_to(dir, IndexVersion::V2).unwrap();
        PackFile::open(&idx, SHA1, windows(window_size)).unwrap()
    }

    fn open_bytes(dir: &Path, bytes: &PackBytes) -> PackFile {
        let stem = dir.join(format!("pack-{}", bytes.checksum.to_hex()));
        std::fs::write(stem.with_extension("pack"), &bytes.pack).unwrap();
        std::fs::write(stem.with_extension("idx"), &bytes.index).unwrap();
        PackFile::open(&stem.with_extension("idx"), SHA1, windows(1 << 16)).unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut e = ZlibEncoder::new(Vec::new(), Compression::default());
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    /// Deterministic incompressible-ish bytes.
    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed.wrapping_mul(2_654_435_761).max(1);
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    #[test]
    fn whole_object() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let (_, offset) = w.add_object(ObjectKind::Tree, b"tree bytes").unwrap();
        let pack = open(dir.path(), w, 1 << 16);
        let obj = materialize(&pack, offset, &PackConfig::default()).unwrap();
        assert_eq!(obj, RawObject::new(ObjectKind::Tree, b"tree bytes".to_vec()));
    }

    #[test]
    fn ofs_delta_copy_then_insert() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let (_, base) = w.add_object(ObjectKind::Blob, b"hello").unwrap();
        let mut instructions = Vec::new();
        encode_leb128(&mut instructions, 5);
        encode_leb128(&mut instructions, 10);
        push_copy(&mut instructions, 0, 5);
        push_insert(&mut instructions, b"world");
        let oid = ObjectHasher::hash_object(SHA1, ObjectKind::Blob, b"helloworld");
        let top = w.add_ofs_delta(base, oid, &instructions).unwrap();
        let pack = open(dir.path(), w, 1 << 16);

        let obj = materialize(&pack, top, &PackConfig::default()).unwrap();
        assert_eq!(obj.data, b"helloworld");
        assert_eq!(obj.kind, ObjectKind::Blob);
        let header = read_header(&pack, top, &PackConfig::default()).unwrap();
        assert_eq!(header, ObjectHeader { kind: ObjectKind::Blob, size: 10 });
    }

    #[test]
    fn ref_delta_resolves_through_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let base = b"#include <stdio.h>\nint main(void) { return 0; }\n".repeat(4);
        let (base_oid, _) = w.add_object(ObjectKind::Blob, &base).unwrap();
        let mut target = base.clone();
        target.extend_from_slice(b"/* trailer */\n");
        let (_, top) = w.add_ref_delta_of(&base_oid, &base, ObjectKind::Blob, &target).unwrap();
        let pack = open(dir.path(), w, 1 << 16);
        assert_eq!(materialize(&pack, top, &PackConfig::default()).unwrap().data, target);
    }

    #[test]
    fn ref_delta_to_absent_base() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let missing = ObjectHasher::hash_object(SHA1, ObjectKind::Blob, b"elsewhere");
        let top = w
            .add_ref_delta(&missing, Oid::sha1([9; 20]), &delta::encode(b"elsewhere", b"x"))
            .unwrap();
        let pack = open(dir.path(), w, 1 << 16);
        let err = materialize(&pack, top, &PackConfig::default()).unwrap_err();
        assert!(matches!(err, PackError::BaseNotFound { base, .. } if base == missing));
    }

    fn chain_pack(dir: &Path, links: usize) -> (PackFile, u64, Vec<u8>) {
        let mut w = PackWriter::new(SHA1);
        let mut content = b"version 0\n".repeat(8);
        let (_, mut offset) = w.add_object(ObjectKind::Blob, &content).unwrap();
        for i in 1..=links {
            let mut next = content.clone();
            next.extend_from_slice(format!("version {i}\n").as_bytes());
            offset = w.add_ofs_delta_of(offset, &content, ObjectKind::Blob, &next).unwrap().1;
            content = next;
        }
        (open(dir, w, 1 << 16), offset, content)
    }

    #[test]
    fn long_chain_within_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (pack, top, expected) = chain_pack(dir.path(), 50);
        let config = PackConfig {
            max_delta_depth: 50,
            ..PackConfig::default()
        };
        assert_eq!(materialize(&pack, top, &config).unwrap().data, expected);
        assert_eq!(read_header(&pack, top, &config).unwrap().size, expected.len() as u64);
    }

    #[test]
    fn chain_deeper_than_limit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (pack, top, _) = chain_pack(dir.path(), 12);
        let config = PackConfig {
            max_delta_depth: 5,
            ..PackConfig::default()
        };
        let err = materialize(&pack, top, &config).unwrap_err();
        assert!(matches!(err, PackError::DeltaChainTooDeep { limit: 5, .. }));
        assert!(err.is_corrupt());
        assert!(read_header(&pack, top, &config).is_err());
    }

    #[test]
    fn ref_delta_cycle_hits_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let a = Oid::sha1([0xaa; 20]);
        let b = Oid::sha1([0xbb; 20]);
        let d = delta::encode(b"x", b"y");
        let top = w.add_ref_delta(&b, a, &d).unwrap();
        w.add_ref_delta(&a, b, &d).unwrap();
        let pack = open(dir.path(), w, 1 << 16);
        let err = materialize(&pack, top, &PackConfig::default()).unwrap_err();
        assert!(matches!(err, PackError::DeltaChainTooDeep { .. }));
    }

    #[test]
    fn entries_spanning_many_small_windows() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let base = noise(6000, 1);
        let mut target = base.clone();
        target[3000..3100].copy_from_slice(&noise(100, 2));
        let (_, base_at) = w.add_object(ObjectKind::Blob, &base).unwrap();
        let (_, top) = w.add_ofs_delta_of(base_at, &base, ObjectKind::Blob, &target).unwrap();
        let pack = open(dir.path(), w, 64);

        assert_eq!(materialize(&pack, base_at, &PackConfig::default()).unwrap().data, base);
        assert_eq!(materialize(&pack, top, &PackConfig::default()).unwrap().data, target);
    }

    #[test]
    fn crc_is_checked_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let (_, offset) = w.add_object(ObjectKind::Blob, b"checked").unwrap();
        let mut bytes = w.finish(IndexVersion::V2).unwrap();

        // One object: the CRC table starts right after the fanout and oids.
        let crc_at = 8 + 1024 + 20;
        bytes.index[crc_at] ^= 0xff;
        let body = bytes.index.len() - 20;
        let digest = ObjectHasher::digest(SHA1, &bytes.index[..body]);
        bytes.index[body..].copy_from_slice(digest.as_bytes());

        let pack = open_bytes(dir.path(), &bytes);
        let expected = pack.index().crc_at(0);
        let config = PackConfig::default();
        assert!(materialize(&pack, offset, &config).is_ok());
        let err = materialize_checked(&pack, offset, &config, expected).unwrap_err();
        assert!(matches!(err, PackError::CrcMismatch { .. }));
    }

    #[test]
    fn truncated_zlib_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let payload = noise(400, 3);
        let mut raw = Vec::new();
        EntryHeader::encode(&mut raw, EntryKind::Blob, payload.len() as u64);
        let z = zlib(&payload);
        raw.extend_from_slice(&z[..z.len() / 2]);
        let offset = w.add_raw(Oid::sha1([1; 20]), &raw);
        let pack = open(dir.path(), w, 1 << 16);
        assert!(materialize(&pack, offset, &PackConfig::default()).unwrap_err().is_corrupt());
    }

    #[test]
    fn declared_size_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let mut short = Vec::new();
        EntryHeader::encode(&mut short, EntryKind::Blob, 3);
        short.extend_from_slice(&zlib(b"hello"));
        let mut long = Vec::new();
        EntryHeader::encode(&mut long, EntryKind::Blob, 9);
        long.extend_from_slice(&zlib(b"hello"));
        let a = w.add_raw(Oid::sha1([1; 20]), &short);
        let b = w.add_raw(Oid::sha1([2; 20]), &long);
        let pack = open(dir.path(), w, 1 << 16);
        assert!(materialize(&pack, a, &PackConfig::default()).unwrap_err().is_corrupt());
        assert!(materialize(&pack, b, &PackConfig::default()).unwrap_err().is_corrupt());
    }

    #[test]
    fn invalid_entry_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let mut raw = vec![5 << 4];
        raw.extend_from_slice(&zlib(b""));
        let offset = w.add_raw(Oid::sha1([1; 20]), &raw);
        let pack = open(dir.path(), w, 1 << 16);
        let err = materialize(&pack, offset, &PackConfig::default()).unwrap_err();
        assert!(matches!(err, PackError::CorruptEntry { .. }));
    }

    #[test]
    fn ofs_distance_outside_pack() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let mut raw = Vec::new();
        EntryHeader::encode(&mut raw, EntryKind::OfsDelta, 2);
        encode_ofs(&mut raw, 100);
        raw.extend_from_slice(&zlib(&[0, 0]));
        let offset = w.add_raw(Oid::sha1([1; 20]), &raw);
        let pack = open(dir.path(), w, 1 << 16);
        assert!(materialize(&pack, offset, &PackConfig::default()).unwrap_err().is_corrupt());
        assert!(read_header(&pack, offset, &PackConfig::default()).unwrap_err().is_corrupt());
    }

    #[test]
    fn bad_delta_reports_its_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let (_, base) = w.add_object(ObjectKind::Blob, b"abc").unwrap();
        // Declares a 4-byte base.
        let top = w.add_ofs_delta(base, Oid::sha1([3; 20]), &[4, 1, 1, b'z']).unwrap();
        let pack = open(dir.path(), w, 1 << 16);
        let err = materialize(&pack, top, &PackConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            PackError::Delta { offset, source: DeltaError::BaseLengthMismatch { .. } } if offset == top
        ));
    }

    #[test]
    fn offsets_outside_data_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        w.add_object(ObjectKind::Blob, b"x").unwrap();
        let pack = open(dir.path(), w, 1 << 16);
        assert!(materialize(&pack, 0, &PackConfig::default()).unwrap_err().is_corrupt());
        assert!(materialize(&pack, pack.size(), &PackConfig::default()).unwrap_err().is_corrupt());
    }

    #[test]
    fn config_from_toml() {
        let cfg: PackConfig = toml::from_str("verify_crc = true").unwrap();
        assert!(cfg.verify_crc);
        assert_eq!(cfg.max_delta_depth, 10_000);
    }
}
