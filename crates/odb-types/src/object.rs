use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// The kind of a stored object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// Snapshot metadata pointing at a tree and its parents.
    Commit,
    /// Directory listing.
    Tree,
    /// Raw file content.
    Blob,
    /// Annotated tag.
    Tag,
}

impl ObjectKind {
    /// Canonical lowercase name used in loose object headers.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "tree" => Ok(Self::Tree),
            "blob" => Ok(Self::Blob),
            "tag" => Ok(Self::Tag),
            other => Err(TypeError::UnknownKind(other.to_string())),
        }
    }
}

/// Type and size of an object, without its contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
    pub kind: ObjectKind,
    pub size: u64,
}

/// A fully materialized object: kind tag + owned data + cached size.
///
/// `RawObject` is what every backend hands back. It is owned exclusively by
/// the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawObject {
    /// The type of this object.
    pub kind: ObjectKind,
    /// The decompressed object bytes.
    pub data: Vec<u8>,
    /// The size of `data` in bytes.
    pub size: u64,
}

impl RawObject {
    /// Create a raw object from kind and data.
    pub fn new(kind: ObjectKind, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self { kind, data, size }
    }

    /// The header describing this object.
    pub fn header(&self) -> ObjectHeader {
        ObjectHeader {
            kind: self.kind,
            size: self.size,
        }
    }

    /// Canonical loose header bytes: `"<type> <size>\0"`.
    pub fn canonical_header(kind: ObjectKind, size: u64) -> Vec<u8> {
        let mut hdr = format!("{} {}", kind.as_str(), size).into_bytes();
        hdr.push(0);
        hdr
    }
}
