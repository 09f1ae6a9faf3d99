use odb_pack::PackError;
use odb_store::StoreError;
use odb_types::{ObjectFormat, Oid, TypeError};
use thiserror::Error;

/// Errors surfaced by [`ObjectDatabase`](crate::ObjectDatabase).
///
/// Backend errors are flattened into this taxonomy so callers can match on
/// `NotFound` / `Ambiguous` / `Corrupt` without knowing which backend spoke.
#[derive(Debug, Error)]
pub enum OdbError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("ambiguous object prefix: {0}")]
    Ambiguous(String),

    #[error("corrupt object database: {0}")]
    Corrupt(String),

    #[error("object {id} hashes to {computed}")]
    HashMismatch { id: Oid, computed: Oid },

    #[error("backend stores {actual:?} objects, database uses {expected:?}")]
    FormatMismatch {
        expected: ObjectFormat,
        actual: ObjectFormat,
    },

    #[error("object declared as {declared} bytes but {written} were written")]
    LengthMismatch { declared: u64, written: u64 },

    #[error("no writable backend registered")]
    ReadOnly,

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl OdbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::HashMismatch { .. })
    }
}

impl From<StoreError> for OdbError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Ambiguous(p) => Self::Ambiguous(p),
            StoreError::Corrupt(reason) => Self::Corrupt(reason),
            StoreError::HashMismatch { id, computed } => Self::HashMismatch { id, computed },
            StoreError::Io(e) => Self::Io(e),
            StoreError::OutOfMemory(n) => Self::OutOfMemory(n),
            StoreError::LengthMismatch { declared, written } => Self::LengthMismatch { declared, written },
            StoreError::ReadOnly => Self::ReadOnly,
            StoreError::Type(e) => Self::Type(e),
        }
    }
}

impl From<PackError> for OdbError {
    fn from(err: PackError) -> Self {
        StoreError::from(err).into()
    }
}

pub type OdbResult<T> = Result<T, OdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_flatten() {
        let err: OdbError = StoreError::Ambiguous("abcd".into()).into();
        assert!(matches!(err, OdbError::Ambiguous(p) if p == "abcd"));
        let err: OdbError = StoreError::Corrupt("bad header".into()).into();
        assert!(err.is_corrupt());
    }

    #[test]
    fn pack_corruption_stays_corrupt() {
        let err: OdbError = PackError::ChecksumMismatch("trailer".into()).into();
        assert!(err.is_corrupt());
        let err: OdbError = PackError::OutOfMemory(1 << 40).into();
        assert!(matches!(err, OdbError::OutOfMemory(_)));
    }

    #[test]
    fn not_found_is_not_corrupt() {
        let err = OdbError::NotFound("1234".into());
        assert!(err.is_not_found());
        assert!(!err.is_corrupt());
    }
}
