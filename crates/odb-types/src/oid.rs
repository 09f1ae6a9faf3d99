use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Hash algorithm that determines the object identifier length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectFormat {
    /// SHA-1 object IDs (20 bytes).
    #[default]
    Sha1,
    /// SHA-256 object IDs (32 bytes).
    Sha256,
}

impl ObjectFormat {
    /// Raw byte length of an OID in this format.
    pub const fn oid_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Hex string length of an OID in this format.
    pub const fn hex_len(self) -> usize {
        self.oid_len() * 2
    }

    /// Infer the format from a raw OID length.
    pub fn from_oid_len(len: usize) -> Option<Self> {
        match len {
            20 => Some(Self::Sha1),
            32 => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// Content-addressed object identifier.
///
/// An `Oid` is the hash of an object's canonical encoding
/// (`"<type> <size>\0" + data`). SHA-1 identifiers occupy the first 20 bytes
/// of the backing array and the remainder stays zero. Comparison, ordering
/// and hashing all use the live slice only.
#[derive(Clone, Copy)]
pub struct Oid {
    format: ObjectFormat,
    bytes: [u8; 32],
}

impl Oid {
    /// Build an `Oid` from a raw hash slice (20 or 32 bytes).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let format = ObjectFormat::from_oid_len(bytes.len()).ok_or(TypeError::InvalidLength {
            expected: 20,
            actual: bytes.len(),
        })?;
        let mut arr = [0u8; 32];
        arr[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { format, bytes: arr })
    }

    /// Build a SHA-1 `Oid` from a pre-computed hash.
    pub fn sha1(hash: [u8; 20]) -> Self {
        let mut arr = [0u8; 32];
        arr[..20].copy_from_slice(&hash);
        Self {
            format: ObjectFormat::Sha1,
            bytes: arr,
        }
    }

    /// Build a SHA-256 `Oid` from a pre-computed hash.
    pub fn sha256(hash: [u8; 32]) -> Self {
        Self {
            format: ObjectFormat::Sha256,
            bytes: hash,
        }
    }

    /// The all-zero identifier for the given format. Represents "no object".
    pub const fn null(format: ObjectFormat) -> Self {
        Self {
            format,
            bytes: [0u8; 32],
        }
    }

    /// Returns `true` if every byte is zero.
    pub fn is_null(&self) -> bool {
        self.bytes == [0u8; 32]
    }

    /// The hash algorithm this identifier belongs to.
    pub fn format(&self) -> ObjectFormat {
        self.format
    }

    /// The raw hash bytes (20 or 32 of them).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.format.oid_len()]
    }

    /// First byte, used for fan-out bucketing.
    pub fn first_byte(&self) -> u8 {
        self.bytes[0]
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Short hex representation (first 7 characters).
    pub fn short_hex(&self) -> String {
        let mut s = hex::encode(&self.bytes[..4]);
        s.truncate(7);
        s
    }

    /// Parse from a full-length hex string (40 or 64 characters).
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Loose object path components: two hex chars of directory, the rest as
    /// the file name.
    pub fn loose_path_parts(&self) -> (String, String) {
        let hex = self.to_hex();
        let (dir, file) = hex.split_at(2);
        (dir.to_string(), file.to_string())
    }
}

impl PartialEq for Oid {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Oid {}

impl Hash for Oid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl PartialOrd for Oid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Oid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.short_hex())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A leading run of hex digits ("nibbles") of an object identifier.
///
/// Prefixes are used for abbreviated lookups. A prefix whose length equals
/// the format's full hex length identifies exactly one object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OidPrefix {
    bytes: [u8; 32],
    nibbles: usize,
}

impl OidPrefix {
    /// Parse a hex prefix of 1 to 64 characters.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.is_empty() || s.len() > 64 {
            return Err(TypeError::InvalidPrefixLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        for (i, c) in s.bytes().enumerate() {
            let v = match c {
                b'0'..=b'9' => c - b'0',
                b'a'..=b'f' => c - b'a' + 10,
                b'A'..=b'F' => c - b'A' + 10,
                _ => return Err(TypeError::InvalidHex(s.to_string())),
            };
            if i % 2 == 0 {
                bytes[i / 2] = v << 4;
            } else {
                bytes[i / 2] |= v;
            }
        }
        Ok(Self {
            bytes,
            nibbles: s.len(),
        })
    }

    /// Build a prefix from raw bytes, keeping only the first `nibbles` digits.
    pub fn from_bytes(raw: &[u8], nibbles: usize) -> Result<Self, TypeError> {
        if nibbles == 0 || nibbles > 64 || nibbles > raw.len() * 2 {
            return Err(TypeError::InvalidPrefixLength(nibbles));
        }
        let mut bytes = [0u8; 32];
        let whole = nibbles / 2;
        bytes[..whole].copy_from_slice(&raw[..whole]);
        if nibbles % 2 == 1 {
            bytes[whole] = raw[whole] & 0xf0;
        }
        Ok(Self { bytes, nibbles })
    }

    /// A prefix covering the whole identifier.
    pub fn from_oid(oid: &Oid) -> Self {
        let mut bytes = [0u8; 32];
        let raw = oid.as_bytes();
        bytes[..raw.len()].copy_from_slice(raw);
        Self {
            bytes,
            nibbles: raw.len() * 2,
        }
    }

    /// Number of hex digits in the prefix.
    pub fn nibbles(&self) -> usize {
        self.nibbles
    }

    /// Returns `true` if this prefix spans a full identifier of `format`.
    pub fn is_full(&self, format: ObjectFormat) -> bool {
        self.nibbles >= format.hex_len()
    }

    /// Prefix bytes padded with zeros; the smallest key the prefix admits.
    pub fn padded(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Convert a full-length prefix into an `Oid`.
    pub fn to_oid(&self, format: ObjectFormat) -> Option<Oid> {
        if !self.is_full(format) {
            return None;
        }
        Oid::from_slice(&self.bytes[..format.oid_len()]).ok()
    }

    /// Inclusive range of first bytes that identifiers matching this prefix
    /// can start with.
    pub fn first_byte_range(&self) -> (u8, u8) {
        if self.nibbles >= 2 {
            (self.bytes[0], self.bytes[0])
        } else {
            (self.bytes[0], self.bytes[0] | 0x0f)
        }
    }

    /// Does `candidate` (raw hash bytes) start with this prefix?
    pub fn matches_bytes(&self, candidate: &[u8]) -> bool {
        let whole = self.nibbles / 2;
        if candidate.len() * 2 < self.nibbles {
            return false;
        }
        if candidate[..whole] != self.bytes[..whole] {
            return false;
        }
        self.nibbles % 2 == 0 || (candidate[whole] & 0xf0) == self.bytes[whole]
    }

    /// Does `oid` start with this prefix?
    pub fn matches(&self, oid: &Oid) -> bool {
        self.matches_bytes(oid.as_bytes())
    }

    /// Hex representation of the prefix digits.
    pub fn to_hex(&self) -> String {
        let mut s = hex::encode(&self.bytes[..self.nibbles.div_ceil(2)]);
        s.truncate(self.nibbles);
        s
    }
}

impl fmt::Debug for OidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OidPrefix({})", self.to_hex())
    }
}

impl fmt::Display for OidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Oid> for OidPrefix {
    fn from(oid: Oid) -> Self {
        Self::from_oid(&oid)
    }
}
