//! Loose object storage: one zlib-compressed file per object.
//!
//! Layout is `objects/<first two hex digits>/<remaining hex digits>`. Each
//! file inflates to `"<type> <size>\0"` followed by the object bytes. A
//! legacy variant with a pack-style binary header in front of the deflate
//! stream is still readable.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use odb_crypto::ObjectHasher;
use odb_types::{ObjectFormat, ObjectHeader, ObjectKind, Oid, OidPrefix, RawObject};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{alloc_buffer, StoreError, StoreResult};
use crate::traits::{Backend, ObjectReader, ObjectWriter};

/// The textual header always fits in this many inflated bytes.
const MAX_HEADER_LEN: usize = 64;

const TEMP_PREFIX: &str = "tmp_obj_";

/// Tunables for the loose backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LooseConfig {
    /// zlib level used for new objects (0-9).
    pub compression_level: u32,
    /// `fsync` each object file before it is renamed into place.
    pub fsync: bool,
    /// Re-hash objects on read and fail on mismatch.
    pub verify_hashes: bool,
}

impl Default for LooseConfig {
    fn default() -> Self {
        Self {
            compression_level: 1,
            fsync: false,
            verify_hashes: false,
        }
    }
}

/// Backend over a directory of loose object files.
#[derive(Debug)]
pub struct LooseBackend {
    objects_dir: PathBuf,
    format: ObjectFormat,
    config: LooseConfig,
}

impl LooseBackend {
    pub fn new(objects_dir: impl Into<PathBuf>, format: ObjectFormat, config: LooseConfig) -> Self {
        Self {
            objects_dir: objects_dir.into(),
            format,
            config,
        }
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Path at which `oid` is (or would be) stored.
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        object_path(&self.objects_dir, oid)
    }

    /// Start a streamed write of an object of `kind` and exactly `size` bytes.
    pub fn writer(&self, kind: ObjectKind, size: u64) -> StoreResult<LooseWriter> {
        fs::create_dir_all(&self.objects_dir)?;
        let tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.objects_dir)?;
        let mut encoder = ZlibEncoder::new(tmp, Compression::new(self.config.compression_level));
        encoder.write_all(&RawObject::canonical_header(kind, size))?;
        Ok(LooseWriter {
            encoder,
            hasher: ObjectHasher::for_object(self.format, kind, size),
            objects_dir: self.objects_dir.clone(),
            fsync: self.config.fsync,
            kind,
            declared: size,
            written: 0,
        })
    }

    fn open(&self, oid: &Oid) -> StoreResult<Option<BufReader<File>>> {
        match File::open(self.object_path(oid)) {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn decode(&self, oid: &Oid, mut reader: BufReader<File>) -> StoreResult<RawObject> {
        let head = reader.fill_buf()?;
        if head.is_empty() {
            return Err(StoreError::Corrupt(format!("{oid}: empty object file")));
        }
        let obj = if is_zlib(head) {
            let mut inflater = ZlibDecoder::new(reader);
            let (header, leftover) = read_text_header(oid, &mut inflater)?;
            let data = read_body(oid, inflater, header.size, leftover)?;
            RawObject::new(header.kind, data)
        } else {
            let (header, used) = parse_binary_header(oid, head)?;
            reader.consume(used);
            let data = read_body(oid, ZlibDecoder::new(reader), header.size, Vec::new())?;
            RawObject::new(header.kind, data)
        };

        if self.config.verify_hashes {
            let computed = ObjectHasher::hash_object(oid.format(), obj.kind, &obj.data);
            if computed != *oid {
                return Err(StoreError::HashMismatch { id: *oid, computed });
            }
        }
        Ok(obj)
    }

    fn decode_header(&self, oid: &Oid, mut reader: BufReader<File>) -> StoreResult<ObjectHeader> {
        let head = reader.fill_buf()?;
        if head.is_empty() {
            return Err(StoreError::Corrupt(format!("{oid}: empty object file")));
        }
        if is_zlib(head) {
            let (header, _) = read_text_header(oid, &mut ZlibDecoder::new(reader))?;
            Ok(header)
        } else {
            Ok(parse_binary_header(oid, head)?.0)
        }
    }

    /// Identifiers stored under one fan-out directory, in name order.
    fn list_dir(&self, first_byte: u8) -> StoreResult<Vec<Oid>> {
        let dir = format!("{first_byte:02x}");
        let entries = match fs::read_dir(self.objects_dir.join(&dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let rest_len = self.format.hex_len() - 2;
        let mut oids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() != rest_len {
                continue;
            }
            if let Ok(oid) = Oid::from_hex(&format!("{dir}{name}")) {
                oids.push(oid);
            }
        }
        oids.sort();
        Ok(oids)
    }
}

impl Backend for LooseBackend {
    fn name(&self) -> &str {
        "loose"
    }

    fn format(&self) -> ObjectFormat {
        self.format
    }

    fn read(&self, oid: &Oid) -> StoreResult<Option<RawObject>> {
        match self.open(oid)? {
            Some(reader) => self.decode(oid, reader).map(Some),
            None => Ok(None),
        }
    }

    fn read_header(&self, oid: &Oid) -> StoreResult<Option<ObjectHeader>> {
        match self.open(oid)? {
            Some(reader) => self.decode_header(oid, reader).map(Some),
            None => Ok(None),
        }
    }

    fn exists(&self, oid: &Oid) -> StoreResult<bool> {
        Ok(self.object_path(oid).try_exists()?)
    }

    fn lookup_prefix(&self, prefix: &OidPrefix) -> StoreResult<Option<Oid>> {
        if let Some(oid) = prefix.to_oid(self.format) {
            return Ok(self.exists(&oid)?.then_some(oid));
        }
        let (first, last) = prefix.first_byte_range();
        let mut found: Option<Oid> = None;
        for byte in first..=last {
            for oid in self.list_dir(byte)? {
                if !prefix.matches(&oid) {
                    continue;
                }
                match found {
                    Some(prev) if prev != oid => return Err(StoreError::Ambiguous(prefix.to_hex())),
                    _ => found = Some(oid),
                }
            }
        }
        Ok(found)
    }

    fn read_stream(&self, oid: &Oid) -> StoreResult<Option<ObjectReader>> {
        let Some(mut reader) = self.open(oid)? else {
            return Ok(None);
        };
        let head = reader.fill_buf()?;
        if head.is_empty() {
            return Err(StoreError::Corrupt(format!("{oid}: empty object file")));
        }
        let stream = if is_zlib(head) {
            let mut inflater = ZlibDecoder::new(reader);
            let (header, leftover) = read_text_header(oid, &mut inflater)?;
            let Some(rest) = header.size.checked_sub(leftover.len() as u64) else {
                return Err(StoreError::Corrupt(format!("{oid}: data past declared size")));
            };
            ObjectReader::new(header, io::Cursor::new(leftover).chain(inflater.take(rest)))
        } else {
            let (header, used) = parse_binary_header(oid, head)?;
            reader.consume(used);
            ObjectReader::new(header, ZlibDecoder::new(reader).take(header.size))
        };
        Ok(Some(if self.config.verify_hashes {
            stream.verified(*oid)
        } else {
            stream
        }))
    }

    fn write(&self, kind: ObjectKind, data: &[u8]) -> StoreResult<Oid> {
        let mut writer = self.writer(kind, data.len() as u64)?;
        writer.write_all(data)?;
        writer.commit()
    }

    fn write_stream(&self, kind: ObjectKind, size: u64) -> StoreResult<Option<Box<dyn ObjectWriter>>> {
        Ok(Some(Box::new(self.writer(kind, size)?)))
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn for_each(&self, f: &mut dyn FnMut(&Oid) -> StoreResult<()>) -> StoreResult<()> {
        for byte in 0..=u8::MAX {
            for oid in self.list_dir(byte)? {
                f(&oid)?;
            }
        }
        Ok(())
    }
}

/// A loose object being written: content is deflated into a temporary file
/// and hashed on the way, then renamed into place by [`LooseWriter::commit`].
pub struct LooseWriter {
    encoder: ZlibEncoder<NamedTempFile>,
    hasher: ObjectHasher,
    objects_dir: PathBuf,
    fsync: bool,
    kind: ObjectKind,
    declared: u64,
    written: u64,
}

impl LooseWriter {
    /// Finish the stream and move the object under its final name. An
    /// object that is already present is left untouched.
    pub fn commit(self) -> StoreResult<Oid> {
        if self.written != self.declared {
            return Err(StoreError::LengthMismatch {
                declared: self.declared,
                written: self.written,
            });
        }
        let tmp = self.encoder.finish()?;
        let oid = self.hasher.finalize();

        let path = object_path(&self.objects_dir, &oid);
        if path.try_exists()? {
            debug!(%oid, "loose object already present");
            return Ok(oid);
        }
        if self.fsync {
            tmp.as_file().sync_all()?;
        }
        let mut perms = tmp.as_file().metadata()?.permissions();
        perms.set_readonly(true);
        tmp.as_file().set_permissions(perms)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = tmp.persist(&path) {
            // A concurrent writer may have renamed identical content into place.
            if !path.try_exists()? {
                return Err(e.error.into());
            }
        }
        debug!(%oid, kind = %self.kind, size = self.declared, "wrote loose object");
        Ok(oid)
    }
}

impl Write for LooseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.declared {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("object declared as {} bytes", self.declared),
            ));
        }
        let n = self.encoder.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl ObjectWriter for LooseWriter {
    fn finish(self: Box<Self>) -> StoreResult<Oid> {
        self.commit()
    }
}

impl std::fmt::Debug for LooseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LooseWriter")
            .field("kind", &self.kind)
            .field("declared", &self.declared)
            .field("written", &self.written)
            .finish()
    }
}

fn object_path(objects_dir: &Path, oid: &Oid) -> PathBuf {
    let (dir, file) = oid.loose_path_parts();
    objects_dir.join(dir).join(file)
}

/// Does `data` start with a zlib stream header (deflate, valid check bits)?
fn is_zlib(data: &[u8]) -> bool {
    if data.len() < 2 {
        return false;
    }
    let word = (u16::from(data[0]) << 8) | u16::from(data[1]);
    (data[0] & 0x8f) == 0x08 && word % 31 == 0
}

fn inflate_error(oid: &Oid, e: io::Error) -> StoreError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            StoreError::Corrupt(format!("{oid}: inflate failed: {e}"))
        }
        _ => StoreError::Io(e),
    }
}

/// Inflate until the NUL that ends the textual header. Returns the header
/// and any object bytes that were inflated past it.
fn read_text_header<R: Read>(oid: &Oid, inflater: &mut R) -> StoreResult<(ObjectHeader, Vec<u8>)> {
    let mut head = [0u8; MAX_HEADER_LEN];
    let mut filled = 0;
    let nul = loop {
        if let Some(pos) = head[..filled].iter().position(|&b| b == 0) {
            break pos;
        }
        if filled == MAX_HEADER_LEN {
            return Err(StoreError::Corrupt(format!("{oid}: object has no header")));
        }
        let n = inflater
            .read(&mut head[filled..])
            .map_err(|e| inflate_error(oid, e))?;
        if n == 0 {
            return Err(StoreError::Corrupt(format!("{oid}: truncated header")));
        }
        filled += n;
    };
    let header = parse_text_header(oid, &head[..nul])?;
    Ok((header, head[nul + 1..filled].to_vec()))
}

/// Parse `"<type> <decimal size>"` (the terminating NUL already stripped).
fn parse_text_header(oid: &Oid, raw: &[u8]) -> StoreResult<ObjectHeader> {
    let bad = || StoreError::Corrupt(format!("{oid}: malformed header"));
    let text = std::str::from_utf8(raw).map_err(|_| bad())?;
    let (name, size) = text.split_once(' ').ok_or_else(bad)?;
    let kind: ObjectKind = name
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("{oid}: unknown object type {name:?}")))?;
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    if size.len() > 1 && size.starts_with('0') {
        return Err(bad());
    }
    let size = size.parse::<u64>().map_err(|_| bad())?;
    Ok(ObjectHeader { kind, size })
}

/// Decode the legacy pack-style header: type in bits 4-6 of the first byte,
/// size as little-endian 7-bit groups starting with its low nibble.
fn parse_binary_header(oid: &Oid, data: &[u8]) -> StoreResult<(ObjectHeader, usize)> {
    let bad = |what: &str| StoreError::Corrupt(format!("{oid}: {what}"));
    let mut c = *data.first().ok_or_else(|| bad("object has no header"))?;
    let mut used = 1;
    let type_bits = (c >> 4) & 0x07;
    let mut size = u64::from(c & 0x0f);
    let mut shift = 4u32;
    while c & 0x80 != 0 {
        c = *data.get(used).ok_or_else(|| bad("truncated header"))?;
        used += 1;
        let bits = u64::from(c & 0x7f);
        if shift >= 64 || bits >> (64 - shift) != 0 {
            return Err(bad("header size overflows"));
        }
        size |= bits << shift;
        shift += 7;
    }
    let kind = match type_bits {
        1 => ObjectKind::Commit,
        2 => ObjectKind::Tree,
        3 => ObjectKind::Blob,
        4 => ObjectKind::Tag,
        _ => return Err(bad("wrong object type")),
    };
    Ok((ObjectHeader { kind, size }, used))
}

/// Read exactly `size` object bytes: `leftover` first, then the rest of the
/// stream, which must end there.
fn read_body<R: Read>(oid: &Oid, inflater: R, size: u64, leftover: Vec<u8>) -> StoreResult<Vec<u8>> {
    let mut data = alloc_buffer(size)?;
    data.extend_from_slice(&leftover);
    let have = data.len() as u64;
    if have > size {
        return Err(StoreError::Corrupt(format!("{oid}: data past declared size")));
    }
    inflater
        .take(size - have + 1)
        .read_to_end(&mut data)
        .map_err(|e| inflate_error(oid, e))?;
    match (data.len() as u64).cmp(&size) {
        std::cmp::Ordering::Less => Err(StoreError::Corrupt(format!(
            "{oid}: truncated object ({} of {size} bytes)",
            data.len()
        ))),
        std::cmp::Ordering::Greater => Err(StoreError::Corrupt(format!("{oid}: data past declared size"))),
        std::cmp::Ordering::Equal => Ok(data),
    }
}
