//! Pack file storage for the object database.
//!
//! Reads git-format packs: zlib-compressed entries, optionally stored as
//! deltas against other entries, located through a sorted `.idx` index.
//!
//! # Architecture
//!
//! - **Pack index** (`.idx`, v1 and v2): fan-out table plus sorted
//!   identifiers, searched by interpolation
//! - **WindowManager**: maps packs in fixed-size windows under one global
//!   budget, evicting the least recently used unpinned window
//! - **Delta codec** and **resolution**: rebuild objects from delta chains
//! - **PackBackend**: the [`odb_store::Backend`] over every pack in a directory
//! - **PackWriter**: builds packs and indexes (fixtures, tooling)

pub mod backend;
pub mod delta;
pub mod entry;
pub mod error;
pub mod file;
pub mod index;
pub mod resolve;
pub mod varint;
pub mod window;
pub mod writer;

pub use backend::PackBackend;
pub use entry::{EntryHeader, EntryKind};
pub use error::{DeltaError, PackError, PackResult};
pub use file::PackFile;
pub use index::{interpolation_pick, PackIndex};
pub use resolve::{materialize, read_header, PackConfig};
pub use window::{PackId, WindowConfig, WindowHandle, WindowManager, WindowStats};
pub use writer::{encode_index, IndexEntry, IndexVersion, PackBytes, PackWriter};
