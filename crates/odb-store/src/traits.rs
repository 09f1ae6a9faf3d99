use std::io::{self, Cursor, Read};

use odb_crypto::ObjectHasher;
use odb_types::{ObjectFormat, ObjectHeader, ObjectKind, Oid, OidPrefix, RawObject};

use crate::error::{StoreError, StoreResult};

/// Priority of the loose backend; higher priorities are queried first.
pub const LOOSE_PRIORITY: i32 = 2;

/// Priority of the pack backend.
pub const PACKED_PRIORITY: i32 = 1;

/// A source of objects registered with the database.
///
/// All implementations must satisfy these invariants:
/// - Objects are immutable once written; the same content always produces
///   the same identifier.
/// - A missing object is `Ok(None)` / `Ok(false)`, never an error.
/// - Damaged data is reported as an error (see [`StoreError::is_corrupt`]),
///   never as a miss.
/// - Concurrent reads are safe.
pub trait Backend: Send + Sync {
    /// Short name used in log messages.
    fn name(&self) -> &str;

    /// Hash algorithm of the identifiers this backend stores.
    fn format(&self) -> ObjectFormat;

    /// Read and fully materialize an object.
    fn read(&self, oid: &Oid) -> StoreResult<Option<RawObject>>;

    /// Read only the type and size of an object.
    ///
    /// The default materializes the object; backends override it when they
    /// can answer more cheaply.
    fn read_header(&self, oid: &Oid) -> StoreResult<Option<ObjectHeader>> {
        Ok(self.read(oid)?.map(|obj| obj.header()))
    }

    /// Check whether an object exists.
    fn exists(&self, oid: &Oid) -> StoreResult<bool>;

    /// Resolve an abbreviated identifier to the unique full identifier it
    /// names in this backend.
    ///
    /// Returns [`StoreError::Ambiguous`] if more than one object matches.
    fn lookup_prefix(&self, prefix: &OidPrefix) -> StoreResult<Option<Oid>>;

    /// Resolve a prefix and read the object it names.
    fn read_prefix(&self, prefix: &OidPrefix) -> StoreResult<Option<(Oid, RawObject)>> {
        let Some(oid) = self.lookup_prefix(prefix)? else {
            return Ok(None);
        };
        Ok(self.read(&oid)?.map(|obj| (oid, obj)))
    }

    /// Open a reader over an object's content.
    ///
    /// The default materializes the object and reads from memory.
    fn read_stream(&self, oid: &Oid) -> StoreResult<Option<ObjectReader>> {
        Ok(self
            .read(oid)?
            .map(|obj| ObjectReader::new(obj.header(), Cursor::new(obj.data))))
    }

    /// Store an object and return its identifier. Idempotent.
    fn write(&self, _kind: ObjectKind, _data: &[u8]) -> StoreResult<Oid> {
        Err(StoreError::ReadOnly)
    }

    /// Begin writing an object of `kind` whose content is exactly `size`
    /// bytes. `Ok(None)` means the backend only takes whole objects through
    /// [`Backend::write`].
    fn write_stream(&self, _kind: ObjectKind, _size: u64) -> StoreResult<Option<Box<dyn ObjectWriter>>> {
        Ok(None)
    }

    /// Whether [`Backend::write`] is supported.
    fn is_writable(&self) -> bool {
        false
    }

    /// Re-scan on-disk state so that objects added by other processes
    /// become visible.
    fn refresh(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Visit every object identifier this backend holds.
    fn for_each(&self, f: &mut dyn FnMut(&Oid) -> StoreResult<()>) -> StoreResult<()>;
}

/// Incremental writer for one object of a declared kind and size.
///
/// Dropping the writer without calling [`finish`](ObjectWriter::finish)
/// discards everything written so far.
pub trait ObjectWriter: io::Write + Send {
    /// Store the object. Fails unless exactly the declared number of bytes
    /// were written.
    fn finish(self: Box<Self>) -> StoreResult<Oid>;
}

/// Streaming view of one object's content.
///
/// Reads yield exactly `header().size` bytes; a source that ends early is
/// an [`io::ErrorKind::UnexpectedEof`] error. With [`verified`](Self::verified)
/// the content is hashed as it goes and the final read fails with
/// [`io::ErrorKind::InvalidData`] if it does not match.
pub struct ObjectReader {
    header: ObjectHeader,
    inner: Box<dyn Read + Send>,
    remaining: u64,
    verify: Option<(ObjectHasher, Oid)>,
}

impl ObjectReader {
    pub fn new(header: ObjectHeader, inner: impl Read + Send + 'static) -> Self {
        Self {
            header,
            inner: Box::new(inner),
            remaining: header.size,
            verify: None,
        }
    }

    /// Check the content against `oid` once it has been read in full.
    pub fn verified(mut self, oid: Oid) -> Self {
        let hasher = ObjectHasher::for_object(oid.format(), self.header.kind, self.header.size);
        self.verify = Some((hasher, oid));
        self
    }

    pub fn header(&self) -> ObjectHeader {
        self.header
    }

    pub fn kind(&self) -> ObjectKind {
        self.header.kind
    }

    pub fn size(&self) -> u64 {
        self.header.size
    }

    /// Read the rest of the content into a [`RawObject`].
    pub fn into_object(mut self) -> StoreResult<RawObject> {
        let mut data = crate::error::alloc_buffer(self.remaining)?;
        self.read_to_end(&mut data)?;
        Ok(RawObject::new(self.header.kind, data))
    }

    fn check_hash(&mut self) -> io::Result<()> {
        if let Some((hasher, expected)) = self.verify.take() {
            let computed = hasher.finalize();
            if computed != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("object {expected} hashes to {computed}"),
                ));
            }
        }
        Ok(())
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            self.check_hash()?;
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let want = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("object content ended {} bytes early", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        if let Some((hasher, _)) = self.verify.as_mut() {
            hasher.update(&buf[..n]);
        }
        if self.remaining == 0 {
            self.check_hash()?;
        }
        Ok(n)
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("header", &self.header)
            .field("remaining", &self.remaining)
            .finish()
    }
}
