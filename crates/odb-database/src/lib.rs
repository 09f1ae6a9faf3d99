//! Content-addressed object database.
//!
//! [`ObjectDatabase`] fronts a prioritized list of [`Backend`]s: by default
//! the loose objects and the packs of one `objects/` directory, plus the
//! object directories named in its `info/alternates` file. Small
//! non-blob objects are kept in a bounded [`ObjectCache`].
//!
//! ```no_run
//! use odb_database::{ObjectDatabase, ObjectKind, OdbConfig};
//!
//! # fn main() -> odb_database::OdbResult<()> {
//! let db = ObjectDatabase::open(".git/objects", OdbConfig::default())?;
//! let id = db.write(ObjectKind::Blob, b"hello\n")?;
//! assert_eq!(db.read(&id)?.data, b"hello\n");
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod stream;

pub use cache::{CacheConfig, CacheStats, ObjectCache};
pub use config::OdbConfig;
pub use database::ObjectDatabase;
pub use error::{OdbError, OdbResult};
pub use stream::ObjectStream;

pub use odb_store::{
    Backend, LooseBackend, MemoryBackend, ObjectReader, ObjectWriter, LOOSE_PRIORITY, PACKED_PRIORITY,
};
pub use odb_types::{ObjectFormat, ObjectHeader, ObjectKind, Oid, OidPrefix, RawObject};
