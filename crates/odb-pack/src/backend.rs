//! Object lookup across every pack in an `objects/pack` directory.
//!
//! The pack list and the "last found" hint share the backend's own mutex,
//! separate from the window manager's lock. Object data is read only after
//! that mutex is released; the window lock is taken under it only when a
//! rescan drops a pack, and never the other way round.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use odb_store::{Backend, StoreResult};
use odb_types::{ObjectFormat, ObjectHeader, Oid, OidPrefix, RawObject};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{PackError, PackResult};
use crate::file::PackFile;
use crate::resolve::{self, PackConfig};
use crate::window::WindowManager;

/// The packs currently known to a [`PackBackend`].
struct PackSet {
    /// Newest first.
    packs: Vec<Arc<PackFile>>,
    /// Pack that answered the most recent successful lookup.
    last_found: Option<Arc<PackFile>>,
    /// Modification time of the pack directory at the last scan.
    dir_mtime: Option<SystemTime>,
}

/// Where an object lives.
struct Located {
    pack: Arc<PackFile>,
    pos: usize,
    offset: u64,
}

/// Backend serving objects from every `pack-*.pack` / `.idx` pair in one
/// directory.
///
/// Lookups try the pack that answered last before scanning the rest. On a
/// miss the directory is rescanned if its modification time has moved.
pub struct PackBackend {
    pack_dir: PathBuf,
    format: ObjectFormat,
    config: PackConfig,
    windows: Arc<WindowManager>,
    state: Mutex<PackSet>,
}

impl PackBackend {
    /// Open the packs in `pack_dir`. A missing directory is an empty backend.
    pub fn new(
        pack_dir: impl Into<PathBuf>,
        format: ObjectFormat,
        config: PackConfig,
        windows: Arc<WindowManager>,
    ) -> PackResult<Self> {
        let backend = Self {
            pack_dir: pack_dir.into(),
            format,
            config,
            windows,
            state: Mutex::new(PackSet {
                packs: Vec::new(),
                last_found: None,
                dir_mtime: None,
            }),
        };
        backend.scan(&mut backend.state.lock())?;
        Ok(backend)
    }

    pub fn pack_dir(&self) -> &Path {
        &self.pack_dir
    }

    pub fn windows(&self) -> &Arc<WindowManager> {
        &self.windows
    }

    pub fn pack_count(&self) -> usize {
        self.state.lock().packs.len()
    }

    /// Snapshot of the open packs, newest first.
    pub fn packs(&self) -> Vec<Arc<PackFile>> {
        self.state.lock().packs.clone()
    }

    fn dir_mtime(&self) -> Option<SystemTime> {
        fs::metadata(&self.pack_dir).and_then(|m| m.modified()).ok()
    }

    fn scan(&self, set: &mut PackSet) -> PackResult<()> {
        let mtime = self.dir_mtime();
        let entries = match fs::read_dir(&self.pack_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                set.packs.clear();
                set.last_found = None;
                set.dir_mtime = None;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut idx_paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "idx") {
                idx_paths.push(path);
            }
        }
        idx_paths.sort();

        let mut packs = Vec::with_capacity(idx_paths.len());
        for idx in idx_paths {
            let pack_path = idx.with_extension("pack");
            let meta = match fs::metadata(&pack_path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(index = %idx.display(), "skipping index without a pack file");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let known = set.packs.iter().find(|p| {
                p.path() == pack_path && p.size() == meta.len() && p.mtime() == meta.modified().ok()
            });
            if let Some(pack) = known {
                packs.push(Arc::clone(pack));
                continue;
            }

            match PackFile::open(&idx, self.format, Arc::clone(&self.windows)) {
                Ok(pack) => {
                    debug!(path = %pack_path.display(), objects = pack.index().len(), "found pack");
                    packs.push(Arc::new(pack));
                }
                Err(PackError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(index = %idx.display(), "pack disappeared during scan");
                }
                Err(e) => return Err(e),
            }
        }

        packs.sort_by(|a, b| b.mtime().cmp(&a.mtime()).then_with(|| a.path().cmp(b.path())));
        if let Some(hint) = &set.last_found {
            if !packs.iter().any(|p| Arc::ptr_eq(p, hint)) {
                set.last_found = None;
            }
        }
        debug!(dir = %self.pack_dir.display(), packs = packs.len(), "scanned pack directory");
        set.packs = packs;
        set.dir_mtime = mtime;
        Ok(())
    }

    /// Rescan if the directory changed since the last scan. Returns whether
    /// a scan happened.
    fn rescan_if_stale(&self, set: &mut PackSet) -> PackResult<bool> {
        if self.dir_mtime() == set.dir_mtime {
            return Ok(false);
        }
        self.scan(set)?;
        Ok(true)
    }

    fn find_in(set: &mut PackSet, oid: &Oid) -> PackResult<Option<Located>> {
        if let Some(hint) = &set.last_found {
            if let Some(pos) = hint.index().find(oid) {
                let offset = hint.index().offset_at(pos)?;
                return Ok(Some(Located {
                    pack: Arc::clone(hint),
                    pos,
                    offset,
                }));
            }
        }
        for pack in &set.packs {
            if set.last_found.as_ref().is_some_and(|h| Arc::ptr_eq(h, pack)) {
                continue;
            }
            if let Some(pos) = pack.index().find(oid) {
                let offset = pack.index().offset_at(pos)?;
                set.last_found = Some(Arc::clone(pack));
                return Ok(Some(Located {
                    pack: Arc::clone(pack),
                    pos,
                    offset,
                }));
            }
        }
        Ok(None)
    }

    fn locate(&self, oid: &Oid) -> PackResult<Option<Located>> {
        let mut set = self.state.lock();
        if let Some(found) = Self::find_in(&mut set, oid)? {
            return Ok(Some(found));
        }
        if self.rescan_if_stale(&mut set)? {
            return Self::find_in(&mut set, oid);
        }
        Ok(None)
    }

    fn prefix_in(packs: &[Arc<PackFile>], prefix: &OidPrefix) -> PackResult<Option<Oid>> {
        let mut found: Option<Oid> = None;
        for pack in packs {
            let Some((oid, _)) = pack.index().lookup_prefix(prefix)? else {
                continue;
            };
            match found {
                Some(prev) if prev != oid => return Err(PackError::Ambiguous(prefix.to_hex())),
                _ => found = Some(oid),
            }
        }
        Ok(found)
    }

    fn find_prefix(&self, prefix: &OidPrefix) -> PackResult<Option<Oid>> {
        let mut set = self.state.lock();
        if let Some(oid) = Self::prefix_in(&set.packs, prefix)? {
            return Ok(Some(oid));
        }
        if self.rescan_if_stale(&mut set)? {
            return Self::prefix_in(&set.packs, prefix);
        }
        Ok(None)
    }
}

impl Backend for PackBackend {
    fn name(&self) -> &str {
        "pack"
    }

    fn format(&self) -> ObjectFormat {
        self.format
    }

    fn read(&self, oid: &Oid) -> StoreResult<Option<RawObject>> {
        let Some(found) = self.locate(oid)? else {
            return Ok(None);
        };
        let crc = if self.config.verify_crc {
            found.pack.index().crc_at(found.pos)
        } else {
            None
        };
        let obj = resolve::materialize_checked(&found.pack, found.offset, &self.config, crc)?;
        Ok(Some(obj))
    }

    fn read_header(&self, oid: &Oid) -> StoreResult<Option<ObjectHeader>> {
        let Some(found) = self.locate(oid)? else {
            return Ok(None);
        };
        Ok(Some(resolve::read_header(&found.pack, found.offset, &self.config)?))
    }

    fn exists(&self, oid: &Oid) -> StoreResult<bool> {
        Ok(self.locate(oid)?.is_some())
    }

    fn lookup_prefix(&self, prefix: &OidPrefix) -> StoreResult<Option<Oid>> {
        if let Some(oid) = prefix.to_oid(self.format) {
            return Ok(self.exists(&oid)?.then_some(oid));
        }
        Ok(self.find_prefix(prefix)?)
    }

    fn refresh(&self) -> StoreResult<()> {
        let mut set = self.state.lock();
        self.scan(&mut set)?;
        Ok(())
    }

    /// Visits identifiers in index order, pack by pack. An object stored in
    /// several packs is visited once per pack.
    fn for_each(&self, f: &mut dyn FnMut(&Oid) -> StoreResult<()>) -> StoreResult<()> {
        for pack in self.packs() {
            for oid in pack.index().iter() {
                f(&oid)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackBackend")
            .field("pack_dir", &self.pack_dir)
            .field("format", &self.format)
            .field("packs", &self.pack_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowConfig;
    use crate::writer::{IndexVersion, PackWriter};
    use odb_crypto::ObjectHasher;
    use odb_store::StoreError;
    use odb_types::ObjectKind;
    use std::collections::HashMap;
    use std::time::Duration;

    const SHA1: ObjectFormat = ObjectFormat::Sha1;

    fn backend(dir: &Path) -> PackBackend {
        backend_with(dir, PackConfig::default())
    }

    fn backend_with(dir: &Path, config: PackConfig) -> PackBackend {
        let windows = Arc::new(WindowManager::new(&WindowConfig {
            window_size: 256,
            mapped_limit: 4096,
        }));
        PackBackend::new(dir, SHA1, config, windows).unwrap()
    }

    fn write_blobs(dir: &Path, blobs: &[&[u8]]) -> (PathBuf, Vec<Oid>) {
        let mut w = PackWriter::new(SHA1);
        let oids = blobs
            .iter()
            .map(|b| w.add_object(ObjectKind::Blob, b).unwrap().0)
            .collect();
        (w.write_to(dir, IndexVersion::V2).unwrap(), oids)
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    /// Two distinct blob contents whose identifiers share a first nibble.
    fn colliding_blobs() -> (Vec<u8>, Vec<u8>) {
        let mut seen: HashMap<char, Vec<u8>> = HashMap::new();
        for i in 0.. {
            let data = format!("blob {i}").into_bytes();
            let oid = ObjectHasher::hash_object(SHA1, ObjectKind::Blob, &data);
            let nibble = oid.to_hex().chars().next().unwrap();
            if let Some(prev) = seen.insert(nibble, data.clone()) {
                return (prev, data);
            }
        }
        unreachable!()
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(&dir.path().join("pack"));
        assert_eq!(b.pack_count(), 0);
        assert!(b.read(&Oid::sha1([1; 20])).unwrap().is_none());
    }

    #[test]
    fn reads_whole_and_delta_objects() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let base = b"line one\nline two\nline three\n".repeat(10);
        let mut target = base.clone();
        target.extend_from_slice(b"line four\n");
        let (base_oid, base_at) = w.add_object(ObjectKind::Blob, &base).unwrap();
        let (delta_oid, _) = w.add_ofs_delta_of(base_at, &base, ObjectKind::Blob, &target).unwrap();
        w.write_to(dir.path(), IndexVersion::V2).unwrap();

        let b = backend(dir.path());
        assert_eq!(b.read(&base_oid).unwrap().unwrap().data, base);
        let obj = b.read(&delta_oid).unwrap().unwrap();
        assert_eq!(obj.data, target);
        assert!(ObjectHasher::verify(obj.kind, &obj.data, &delta_oid));
        assert_eq!(
            b.read_header(&delta_oid).unwrap(),
            Some(ObjectHeader {
                kind: ObjectKind::Blob,
                size: target.len() as u64
            })
        );
        assert!(b.exists(&base_oid).unwrap());
        assert!(!b.exists(&Oid::sha1([0; 20])).unwrap());
    }

    #[test]
    fn objects_spread_over_packs() {
        let dir = tempfile::tempdir().unwrap();
        let (_, a) = write_blobs(dir.path(), &[b"first pack"]);
        let (_, b_oids) = write_blobs(dir.path(), &[b"second pack", b"more"]);
        let b = backend(dir.path());
        assert_eq!(b.pack_count(), 2);
        for oid in a.iter().chain(&b_oids) {
            assert!(b.read(oid).unwrap().is_some());
        }
        let mut count = 0;
        b.for_each(&mut |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn newest_pack_first() {
        let dir = tempfile::tempdir().unwrap();
        let (old_idx, _) = write_blobs(dir.path(), &[b"old"]);
        let (new_idx, _) = write_blobs(dir.path(), &[b"new"]);
        set_mtime(&old_idx.with_extension("pack"), 1_000);
        set_mtime(&new_idx.with_extension("pack"), 2_000);
        let b = backend(dir.path());
        let packs = b.packs();
        assert_eq!(packs[0].path(), new_idx.with_extension("pack"));
        assert_eq!(packs[1].path(), old_idx.with_extension("pack"));
    }

    #[test]
    fn refresh_picks_up_new_packs() {
        let dir = tempfile::tempdir().unwrap();
        let (_, first) = write_blobs(dir.path(), &[b"one"]);
        let b = backend(dir.path());
        let before = b.packs();

        let (_, second) = write_blobs(dir.path(), &[b"two"]);
        b.refresh().unwrap();
        assert!(b.read(&second[0]).unwrap().is_some());
        assert!(b.read(&first[0]).unwrap().is_some());
        assert!(b.packs().iter().any(|p| Arc::ptr_eq(p, &before[0])), "unchanged packs are kept");
    }

    #[test]
    fn removed_pack_drops_hint_and_windows() {
        let dir = tempfile::tempdir().unwrap();
        let (gone_idx, gone) = write_blobs(dir.path(), &[b"soon removed"]);
        let (_, kept) = write_blobs(dir.path(), &[b"stays"]);
        let b = backend(dir.path());
        assert!(b.read(&gone[0]).unwrap().is_some());
        assert!(b.windows().stats().mapped > 0);

        fs::remove_file(gone_idx.with_extension("pack")).unwrap();
        fs::remove_file(&gone_idx).unwrap();
        b.refresh().unwrap();
        assert_eq!(b.pack_count(), 1);
        assert_eq!(b.windows().stats().mapped, 0, "the hinted pack was released");
        assert!(b.read(&gone[0]).unwrap().is_none());
        assert!(b.read(&kept[0]).unwrap().is_some());
    }

    #[test]
    fn miss_rescans_changed_directory() {
        let dir = tempfile::tempdir().unwrap();
        let pack_dir = dir.path().join("pack");
        let b = backend(&pack_dir);
        let (_, oids) = write_blobs(&pack_dir, &[b"late arrival"]);
        assert!(b.exists(&oids[0]).unwrap());
        assert_eq!(b.pack_count(), 1);
    }

    #[test]
    fn index_without_pack_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (idx, _) = write_blobs(dir.path(), &[b"orphan"]);
        fs::remove_file(idx.with_extension("pack")).unwrap();
        let (_, kept) = write_blobs(dir.path(), &[b"kept"]);
        let b = backend(dir.path());
        assert_eq!(b.pack_count(), 1);
        assert!(b.exists(&kept[0]).unwrap());
    }

    #[test]
    fn corrupt_index_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let (idx, _) = write_blobs(dir.path(), &[b"soon broken"]);
        let mut raw = fs::read(&idx).unwrap();
        raw.truncate(raw.len() - 7);
        fs::write(&idx, raw).unwrap();
        let windows = Arc::new(WindowManager::default());
        let err = PackBackend::new(dir.path(), SHA1, PackConfig::default(), windows).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn prefix_ambiguity_across_packs() {
        let dir = tempfile::tempdir().unwrap();
        let (x, y) = colliding_blobs();
        let (_, xs) = write_blobs(dir.path(), &[&x]);
        let (_, ys) = write_blobs(dir.path(), &[&y]);
        let b = backend(dir.path());

        let short = OidPrefix::from_hex(&xs[0].to_hex()[..1]).unwrap();
        assert!(matches!(b.lookup_prefix(&short), Err(StoreError::Ambiguous(_))));

        let long = OidPrefix::from_hex(&ys[0].to_hex()[..12]).unwrap();
        assert_eq!(b.lookup_prefix(&long).unwrap(), Some(ys[0]));
        let (oid, obj) = b.read_prefix(&long).unwrap().unwrap();
        assert_eq!(oid, ys[0]);
        assert_eq!(obj.data, y);

        let full = OidPrefix::from_oid(&xs[0]);
        assert_eq!(b.lookup_prefix(&full).unwrap(), Some(xs[0]));
    }

    #[test]
    fn same_object_in_two_packs_is_not_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let (_, a) = write_blobs(dir.path(), &[b"duplicated"]);
        write_blobs(dir.path(), &[b"duplicated", b"other"]);
        let b = backend(dir.path());
        let prefix = OidPrefix::from_hex(&a[0].to_hex()[..6]).unwrap();
        assert_eq!(b.lookup_prefix(&prefix).unwrap(), Some(a[0]));
    }

    #[test]
    fn crc_verification_on_healthy_pack() {
        let dir = tempfile::tempdir().unwrap();
        let (_, oids) = write_blobs(dir.path(), &[b"crc checked"]);
        let b = backend_with(
            dir.path(),
            PackConfig {
                verify_crc: true,
                ..PackConfig::default()
            },
        );
        assert_eq!(b.read(&oids[0]).unwrap().unwrap().data, b"crc checked");
    }

    #[test]
    fn corrupt_entry_is_not_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(SHA1);
        let oid = Oid::sha1([7; 20]);
        w.add_raw(oid, &[0x35, 0x78, 0x9c, 0x00]);
        w.write_to(dir.path(), IndexVersion::V2).unwrap();
        let b = backend(dir.path());
        assert!(b.read(&oid).unwrap_err().is_corrupt());
    }

    #[test]
    fn sha256_packs() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(ObjectFormat::Sha256);
        let (oid, _) = w.add_object(ObjectKind::Commit, b"tree 0\n").unwrap();
        w.write_to(dir.path(), IndexVersion::V2).unwrap();
        let windows = Arc::new(WindowManager::default());
        let b = PackBackend::new(dir.path(), ObjectFormat::Sha256, PackConfig::default(), windows).unwrap();
        let obj = b.read(&oid).unwrap().unwrap();
        assert_eq!(obj.kind, ObjectKind::Commit);
        assert_eq!(obj.data, b"tree 0\n");
    }

    #[test]
    fn concurrent_reads() {
        let dir = tempfile::tempdir().unwrap();
        let blobs: Vec<Vec<u8>> = (0..40).map(|i| format!("object {i} ").repeat(50).into_bytes()).collect();
        let refs: Vec<&[u8]> = blobs.iter().map(Vec::as_slice).collect();
        let (_, oids) = write_blobs(dir.path(), &refs);
        let b = Arc::new(backend(dir.path()));

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let b = Arc::clone(&b);
                let oids = oids.clone();
                let blobs = blobs.clone();
                std::thread::spawn(move || {
                    for i in 0..oids.len() {
                        let k = (i * 7 + t) % oids.len();
                        assert_eq!(b.read(&oids[k]).unwrap().unwrap().data, blobs[k]);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(b.windows().stats().peak_open_windows >= 1);
    }
}
