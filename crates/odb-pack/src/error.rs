use odb_store::StoreError;
use odb_types::Oid;
use thiserror::Error;

/// Reasons a delta instruction stream is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("truncated delta header")]
    TruncatedHeader,

    #[error("delta expects a {expected}-byte base, got {actual}")]
    BaseLengthMismatch { expected: u64, actual: u64 },

    #[error("reserved opcode 0 at delta offset {0}")]
    ReservedOpcode(usize),

    #[error("truncated instruction at delta offset {0}")]
    TruncatedInstruction(usize),

    #[error("copy of {len} bytes at base offset {offset} exceeds base length {base_len}")]
    CopyOutOfBounds { offset: u64, len: u64, base_len: u64 },

    #[error("delta produces more than the declared {0} bytes")]
    ResultOverflow(u64),

    #[error("delta produced {actual} bytes, expected {expected}")]
    ResultLengthMismatch { expected: u64, actual: u64 },

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(u64),
}

#[derive(Debug, Error)]
pub enum PackError {
    #[error("invalid {what} signature")]
    InvalidSignature { what: &'static str },

    #[error("unsupported {what} version: {version}")]
    UnsupportedVersion { what: &'static str, version: u32 },

    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("corrupt pack entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    #[error("bad delta at offset {offset}: {source}")]
    Delta {
        offset: u64,
        #[source]
        source: DeltaError,
    },

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("CRC32 mismatch for entry at offset {offset}: index has {expected:08x}, data has {actual:08x}")]
    CrcMismatch { offset: u64, expected: u32, actual: u32 },

    #[error("decompression failed at offset {offset}: {reason}")]
    DecompressionFailed { offset: u64, reason: String },

    #[error("delta chain starting at offset {offset} exceeds {limit} links")]
    DeltaChainTooDeep { offset: u64, limit: usize },

    #[error("delta base {base} for entry at offset {offset} is not in the pack")]
    BaseNotFound { offset: u64, base: Oid },

    #[error("ambiguous object prefix: {0}")]
    Ambiguous(String),

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackError {
    /// Returns `true` when the error means the pack or index data is damaged.
    pub fn is_corrupt(&self) -> bool {
        !matches!(self, Self::Ambiguous(_) | Self::OutOfMemory(_) | Self::Io(_))
    }

    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptEntry {
            offset,
            reason: reason.into(),
        }
    }

    /// Attach the pack offset of the delta entry that failed to apply.
    pub(crate) fn delta(offset: u64, source: DeltaError) -> Self {
        match source {
            DeltaError::OutOfMemory(n) => Self::OutOfMemory(n),
            source => Self::Delta { offset, source },
        }
    }
}

impl From<StoreError> for PackError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OutOfMemory(n) => Self::OutOfMemory(n),
            StoreError::Io(e) => Self::Io(e),
            StoreError::Ambiguous(p) => Self::Ambiguous(p),
            other => Self::CorruptEntry {
                offset: 0,
                reason: other.to_string(),
            },
        }
    }
}

impl From<PackError> for StoreError {
    fn from(err: PackError) -> Self {
        match err {
            PackError::Io(e) => StoreError::Io(e),
            PackError::Ambiguous(p) => StoreError::Ambiguous(p),
            PackError::OutOfMemory(n) => StoreError::OutOfMemory(n),
            other => StoreError::Corrupt(other.to_string()),
        }
    }
}

pub type PackResult<T> = Result<T, PackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_survives_conversion() {
        let err = PackError::corrupt(12, "bad type");
        assert!(err.is_corrupt());
        let store: StoreError = err.into();
        assert!(store.is_corrupt());
        assert!(store.to_string().contains("offset 12"));
    }

    #[test]
    fn io_and_oom_are_not_corrupt() {
        let io = PackError::Io(std::io::Error::other("disk gone"));
        assert!(!io.is_corrupt());
        assert!(matches!(StoreError::from(io), StoreError::Io(_)));
        let oom = PackError::delta(300, DeltaError::OutOfMemory(1 << 40));
        assert!(matches!(oom, PackError::OutOfMemory(_)));
        assert!(matches!(StoreError::from(oom), StoreError::OutOfMemory(_)));
    }

    #[test]
    fn delta_errors_keep_their_entry_offset() {
        let err = PackError::delta(4242, DeltaError::TruncatedHeader);
        assert!(matches!(err, PackError::Delta { offset: 4242, .. }));
        assert!(err.is_corrupt());
        assert!(StoreError::from(err).to_string().contains("offset 4242"));
    }

    #[test]
    fn ambiguity_is_preserved() {
        let err: StoreError = PackError::Ambiguous("01".into()).into();
        assert!(matches!(err, StoreError::Ambiguous(p) if p == "01"));
    }
}
