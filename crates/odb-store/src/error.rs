use odb_types::{Oid, TypeError};

/// Errors from backend operations.
///
/// A missing object is not an error: reads return `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A prefix matched more than one distinct object.
    #[error("ambiguous object prefix: {0}")]
    Ambiguous(String),

    /// Stored data is malformed (bad header, truncated stream, bad size).
    #[error("corrupt object data: {0}")]
    Corrupt(String),

    /// Stored content does not hash to the identifier it was found under.
    #[error("hash mismatch for {id}: content hashes to {computed}")]
    HashMismatch { id: Oid, computed: Oid },

    /// I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An allocation sized from on-disk metadata could not be satisfied.
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(u64),

    /// A streamed write received a different number of bytes than declared.
    #[error("object declared as {declared} bytes but {written} were written")]
    LengthMismatch { declared: u64, written: u64 },

    /// The backend does not accept writes.
    #[error("backend is read-only")]
    ReadOnly,

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl StoreError {
    /// Returns `true` for errors that indicate damaged on-disk data.
    ///
    /// Corrupt data is a hard failure: callers must not fall through to the
    /// next backend as if the object were simply missing.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::HashMismatch { .. })
    }
}

/// Result alias for backend operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Allocate a buffer for `size` bytes declared by untrusted metadata.
pub fn alloc_buffer(size: u64) -> StoreResult<Vec<u8>> {
    let len = usize::try_from(size).map_err(|_| StoreError::OutOfMemory(size))?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| StoreError::OutOfMemory(size))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_classification() {
        assert!(StoreError::Corrupt("x".into()).is_corrupt());
        let id = Oid::null(Default::default());
        assert!(StoreError::HashMismatch { id, computed: id }.is_corrupt());
        assert!(!StoreError::ReadOnly.is_corrupt());
        assert!(!StoreError::Ambiguous("ab".into()).is_corrupt());
    }

    #[test]
    fn absurd_allocation_is_out_of_memory() {
        let err = alloc_buffer(u64::MAX).unwrap_err();
        assert!(matches!(err, StoreError::OutOfMemory(u64::MAX)));
    }

    #[test]
    fn small_allocation_has_capacity() {
        let buf = alloc_buffer(128).unwrap();
        assert!(buf.capacity() >= 128);
        assert!(buf.is_empty());
    }
}
