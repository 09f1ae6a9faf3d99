//! Object storage backends.
//!
//! This crate defines the [`Backend`] trait through which the database
//! queries every object source, the shared [`StoreError`] taxonomy, and the
//! two simple backends:
//!
//! - [`LooseBackend`] -- one zlib-compressed file per object, written
//!   atomically via temp file and rename
//! - [`MemoryBackend`] -- map-based store for tests and embedding
//!
//! Backends may also stream: [`ObjectReader`] reads an object's content
//! incrementally and [`ObjectWriter`] accepts it in pieces. The loose
//! backend does both natively.
//!
//! The pack backend lives in `odb-pack`.
//!
//! # Design Rules
//!
//! 1. Objects are immutable once written (content addressing guarantees this).
//! 2. Write-then-rename: content lands under its final name only when complete.
//! 3. A miss is `Ok(None)`; damaged data is an error and is never reported as a miss.
//! 4. Sizes read from disk are untrusted and allocated fallibly.

pub mod error;
pub mod loose;
pub mod memory;
pub mod traits;

pub use error::{alloc_buffer, StoreError, StoreResult};
pub use loose::{LooseBackend, LooseConfig, LooseWriter};
pub use memory::MemoryBackend;
pub use traits::{Backend, ObjectReader, ObjectWriter, LOOSE_PRIORITY, PACKED_PRIORITY};
