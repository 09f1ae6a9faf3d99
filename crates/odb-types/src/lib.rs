//! Foundation types for the object database.
//!
//! Every other crate in the workspace depends on `odb-types`.
//!
//! # Key Types
//!
//! - [`Oid`] -- content hash of an object (SHA-1 or SHA-256)
//! - [`OidPrefix`] -- abbreviated identifier used for prefix lookups
//! - [`ObjectFormat`] -- hash algorithm selector
//! - [`ObjectKind`] -- commit, tree, blob, or tag
//! - [`RawObject`] -- a materialized object owned by the caller
//! - [`ObjectHeader`] -- type and size without the contents

pub mod error;
pub mod object;
pub mod oid;

pub use error::TypeError;
pub use object::{ObjectHeader, ObjectKind, RawObject};
pub use oid::{ObjectFormat, Oid, OidPrefix};
