use std::io;
use std::sync::Arc;

use odb_crypto::ObjectHasher;
use odb_store::{alloc_buffer, Backend, ObjectWriter};
use odb_types::{ObjectKind, Oid};
use tracing::debug;

use crate::database::ObjectDatabase;
use crate::error::{OdbError, OdbResult};

enum Sink {
    /// The target backend streams natively.
    Native(Box<dyn ObjectWriter>),
    /// Content is collected and handed to [`Backend::write`] at the end.
    Buffered(Vec<u8>),
}

/// An object being written through an [`ObjectDatabase`].
///
/// Write exactly the declared number of bytes, then call
/// [`finish`](Self::finish). If the database already holds the object at
/// that point, nothing is stored. Dropping the stream discards it.
pub struct ObjectStream<'a> {
    db: &'a ObjectDatabase,
    target: Arc<dyn Backend>,
    sink: Sink,
    hasher: ObjectHasher,
    kind: ObjectKind,
    declared: u64,
    written: u64,
}

impl<'a> ObjectStream<'a> {
    pub(crate) fn new(db: &'a ObjectDatabase, target: Arc<dyn Backend>, kind: ObjectKind, size: u64) -> OdbResult<Self> {
        let sink = match target.write_stream(kind, size)? {
            Some(writer) => Sink::Native(writer),
            None => Sink::Buffered(alloc_buffer(size)?),
        };
        Ok(Self {
            db,
            target,
            sink,
            hasher: ObjectHasher::for_object(db.format(), kind, size),
            kind,
            declared: size,
            written: 0,
        })
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn declared_size(&self) -> u64 {
        self.declared
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Store the object and return its identifier.
    pub fn finish(self) -> OdbResult<Oid> {
        let Self {
            db,
            target,
            sink,
            hasher,
            kind,
            declared,
            written,
        } = self;
        if written != declared {
            return Err(OdbError::LengthMismatch { declared, written });
        }
        let oid = hasher.finalize();
        if db.contains(&oid)? {
            debug!(%oid, "streamed object already stored");
            return Ok(oid);
        }
        let stored = match sink {
            Sink::Native(writer) => writer.finish()?,
            Sink::Buffered(data) => target.write(kind, &data)?,
        };
        if stored != oid {
            return Err(OdbError::Corrupt(format!(
                "{} stored {oid} as {stored}",
                target.name()
            )));
        }
        Ok(oid)
    }
}

impl io::Write for ObjectStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.declared {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("object declared as {} bytes", self.declared),
            ));
        }
        let n = match &mut self.sink {
            Sink::Native(writer) => writer.write(buf)?,
            Sink::Buffered(data) => {
                data.extend_from_slice(buf);
                buf.len()
            }
        };
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Native(writer) => writer.flush(),
            Sink::Buffered(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for ObjectStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("target", &self.target.name())
            .field("kind", &self.kind)
            .field("declared", &self.declared)
            .field("written", &self.written)
            .finish()
    }
}
