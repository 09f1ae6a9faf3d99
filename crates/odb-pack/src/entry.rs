//! Pack entry headers: the type tag and inflated size in front of each entry.

use odb_types::ObjectKind;

/// Type tag of a pack entry (bits 4-6 of its first header byte).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Commit,
    Tree,
    Blob,
    Tag,
    /// Delta against the entry a given distance earlier in the same pack.
    OfsDelta,
    /// Delta against the object with a given identifier.
    RefDelta,
}

impl EntryKind {
    /// Parse the 3-bit type field. Types 0 and 5 are invalid.
    pub fn from_type_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            6 => Some(Self::OfsDelta),
            7 => Some(Self::RefDelta),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
            Self::OfsDelta => 6,
            Self::RefDelta => 7,
        }
    }

    /// The object kind for whole-object entries; `None` for deltas.
    pub fn object_kind(self) -> Option<ObjectKind> {
        match self {
            Self::Commit => Some(ObjectKind::Commit),
            Self::Tree => Some(ObjectKind::Tree),
            Self::Blob => Some(ObjectKind::Blob),
            Self::Tag => Some(ObjectKind::Tag),
            Self::OfsDelta | Self::RefDelta => None,
        }
    }

    pub fn is_delta(self) -> bool {
        matches!(self, Self::OfsDelta | Self::RefDelta)
    }
}

impl From<ObjectKind> for EntryKind {
    fn from(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Commit => Self::Commit,
            ObjectKind::Tree => Self::Tree,
            ObjectKind::Blob => Self::Blob,
            ObjectKind::Tag => Self::Tag,
        }
    }
}

/// Decoded entry header: type, inflated size, and header length in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    /// Inflated size of the entry's payload (the delta itself for deltas).
    pub size: u64,
    pub len: usize,
}

/// Why an entry header could not be decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderError {
    Truncated,
    Overflow,
    InvalidType(u8),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => f.write_str("truncated entry header"),
            Self::Overflow => f.write_str("entry size overflows 64 bits"),
            Self::InvalidType(t) => write!(f, "invalid entry type {t}"),
        }
    }
}

impl EntryHeader {
    /// Decode the header at the start of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, HeaderError> {
        let mut c = *data.first().ok_or(HeaderError::Truncated)?;
        let type_bits = (c >> 4) & 0x07;
        let kind = EntryKind::from_type_bits(type_bits).ok_or(HeaderError::InvalidType(type_bits))?;

        let mut size = u64::from(c & 0x0f);
        let mut shift = 4u32;
        let mut len = 1;
        while c & 0x80 != 0 {
            c = *data.get(len).ok_or(HeaderError::Truncated)?;
            len += 1;
            let bits = u64::from(c & 0x7f);
            if shift >= 64 || bits >> (64 - shift) != 0 {
                return Err(HeaderError::Overflow);
            }
            size |= bits << shift;
            shift += 7;
        }
        Ok(Self { kind, size, len })
    }

    /// Append the header for an entry of `kind` with payload `size`.
    pub fn encode(buf: &mut Vec<u8>, kind: EntryKind, mut size: u64) {
        let mut c = (kind.type_bits() << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size > 0 {
            buf.push(c | 0x80);
            c = (size & 0x7f) as u8;
            size >>= 7;
        }
        buf.push(c);
    }
}
