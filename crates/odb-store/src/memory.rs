use std::collections::BTreeMap;

use odb_crypto::ObjectHasher;
use odb_types::{ObjectFormat, ObjectKind, Oid, OidPrefix, RawObject};
use parking_lot::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::traits::Backend;

/// In-memory, map-based backend.
///
/// Intended for tests and embedding. Objects are cloned on read and write.
pub struct MemoryBackend {
    format: ObjectFormat,
    objects: RwLock<BTreeMap<Oid, RawObject>>,
}

impl MemoryBackend {
    pub fn new(format: ObjectFormat) -> Self {
        Self {
            format,
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects.read().values().map(|obj| obj.size).sum()
    }

    pub fn clear(&self) {
        self.objects.write().clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(ObjectFormat::default())
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn format(&self) -> ObjectFormat {
        self.format
    }

    fn read(&self, oid: &Oid) -> StoreResult<Option<RawObject>> {
        Ok(self.objects.read().get(oid).cloned())
    }

    fn exists(&self, oid: &Oid) -> StoreResult<bool> {
        Ok(self.objects.read().contains_key(oid))
    }

    fn lookup_prefix(&self, prefix: &OidPrefix) -> StoreResult<Option<Oid>> {
        let map = self.objects.read();
        let mut matches = map.keys().filter(|oid| prefix.matches(oid));
        let first = matches.next().copied();
        if matches.next().is_some() {
            return Err(StoreError::Ambiguous(prefix.to_hex()));
        }
        Ok(first)
    }

    fn write(&self, kind: ObjectKind, data: &[u8]) -> StoreResult<Oid> {
        let oid = ObjectHasher::hash_object(self.format, kind, data);
        self.objects
            .write()
            .entry(oid)
            .or_insert_with(|| RawObject::new(kind, data.to_vec()));
        Ok(oid)
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn for_each(&self, f: &mut dyn FnMut(&Oid) -> StoreResult<()>) -> StoreResult<()> {
        let oids: Vec<Oid> = self.objects.read().keys().copied().collect();
        for oid in &oids {
            f(oid)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("format", &self.format)
            .field("object_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read() {
        let store = MemoryBackend::default();
        let oid = store.write(ObjectKind::Blob, b"hello\n").unwrap();
        assert_eq!(oid.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
        let obj = store.read(&oid).unwrap().unwrap();
        assert_eq!(obj.data, b"hello\n");
        assert_eq!(store.read_header(&oid).unwrap().unwrap().size, 6);
    }

    #[test]
    fn same_content_is_stored_once() {
        let store = MemoryBackend::default();
        let a = store.write(ObjectKind::Blob, b"dup").unwrap();
        let b = store.write(ObjectKind::Blob, b"dup").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 3);
    }

    #[test]
    fn missing_object() {
        let store = MemoryBackend::default();
        let oid = Oid::sha1([9; 20]);
        assert!(store.read(&oid).unwrap().is_none());
        assert!(!store.exists(&oid).unwrap());
    }

    #[test]
    fn prefix_lookup() {
        let store = MemoryBackend::default();
        let oid = store.write(ObjectKind::Tag, b"v1").unwrap();
        let prefix = OidPrefix::from_hex(&oid.to_hex()[..6]).unwrap();
        assert_eq!(store.lookup_prefix(&prefix).unwrap(), Some(oid));
        let (found, obj) = store.read_prefix(&prefix).unwrap().unwrap();
        assert_eq!(found, oid);
        assert_eq!(obj.kind, ObjectKind::Tag);
    }

    #[test]
    fn short_prefix_over_many_objects_is_ambiguous() {
        let store = MemoryBackend::default();
        for i in 0..64 {
            store.write(ObjectKind::Blob, format!("{i}").as_bytes()).unwrap();
        }
        // 64 objects over 16 first nibbles must collide somewhere.
        let ambiguous = (0..16u8).any(|n| {
            let prefix = OidPrefix::from_bytes(&[n << 4], 1).unwrap();
            matches!(store.lookup_prefix(&prefix), Err(StoreError::Ambiguous(_)))
        });
        assert!(ambiguous);
    }

    #[test]
    fn for_each_is_sorted() {
        let store = MemoryBackend::default();
        for i in 0..10 {
            store.write(ObjectKind::Blob, &[i]).unwrap();
        }
        let mut seen = Vec::new();
        store
            .for_each(&mut |oid| {
                seen.push(*oid);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn clear_empties() {
        let store = MemoryBackend::default();
        store.write(ObjectKind::Blob, b"x").unwrap();
        store.clear();
        assert!(store.is_empty());
    }
}
