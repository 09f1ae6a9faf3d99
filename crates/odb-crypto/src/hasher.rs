use std::io;

use odb_types::{ObjectFormat, ObjectKind, Oid, RawObject};
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Format-selected incremental hasher producing an [`Oid`].
///
/// Use [`ObjectHasher::hash_object`] for the common one-shot case. The
/// incremental form (which also implements [`io::Write`]) lets writers hash
/// content while streaming it to disk.
#[derive(Clone)]
pub enum ObjectHasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl ObjectHasher {
    /// Create an empty hasher for the given format.
    pub fn new(format: ObjectFormat) -> Self {
        match format {
            ObjectFormat::Sha1 => Self::Sha1(Sha1::new()),
            ObjectFormat::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    /// Create a hasher already primed with the canonical object header.
    pub fn for_object(format: ObjectFormat, kind: ObjectKind, size: u64) -> Self {
        let mut hasher = Self::new(format);
        hasher.update(&RawObject::canonical_header(kind, size));
        hasher
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Consume the hasher and produce the identifier.
    pub fn finalize(self) -> Oid {
        match self {
            Self::Sha1(h) => Oid::sha1(h.finalize().into()),
            Self::Sha256(h) => Oid::sha256(h.finalize().into()),
        }
    }

    /// Hash an object's canonical encoding: `"<type> <size>\0" + data`.
    pub fn hash_object(format: ObjectFormat, kind: ObjectKind, data: &[u8]) -> Oid {
        let mut hasher = Self::for_object(format, kind, data.len() as u64);
        hasher.update(data);
        hasher.finalize()
    }

    /// Hash exactly `size` bytes from `reader` as an object of `kind`.
    ///
    /// A reader that ends early is an [`io::ErrorKind::UnexpectedEof`]
    /// error; bytes past `size` are not read.
    pub fn hash_reader(format: ObjectFormat, kind: ObjectKind, size: u64, mut reader: impl io::Read) -> io::Result<Oid> {
        let mut hasher = Self::for_object(format, kind, size);
        let copied = io::copy(&mut io::Read::take(&mut reader, size), &mut hasher)?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {size} bytes, read {copied}"),
            ));
        }
        Ok(hasher.finalize())
    }

    /// Plain digest of `data` with no header (pack and index trailers).
    pub fn digest(format: ObjectFormat, data: &[u8]) -> Oid {
        let mut hasher = Self::new(format);
        hasher.update(data);
        hasher.finalize()
    }

    /// Verify that `data` of `kind` hashes to `expected`.
    pub fn verify(kind: ObjectKind, data: &[u8], expected: &Oid) -> bool {
        Self::hash_object(expected.format(), kind, data) == *expected
    }
}

impl io::Write for ObjectHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
