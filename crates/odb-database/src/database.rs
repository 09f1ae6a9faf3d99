use std::fs::{self, File};
use std::io::{self, BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use odb_crypto::ObjectHasher;
use odb_pack::{PackBackend, WindowManager, WindowStats};
use odb_store::{Backend, LooseBackend, ObjectReader, StoreResult, LOOSE_PRIORITY, PACKED_PRIORITY};
use odb_types::{ObjectFormat, ObjectHeader, ObjectKind, Oid, OidPrefix, RawObject};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cache::{CacheStats, ObjectCache};
use crate::config::OdbConfig;
use crate::error::{OdbError, OdbResult};
use crate::stream::ObjectStream;

const ALTERNATES_FILE: &str = "info/alternates";

#[derive(Clone)]
struct Registered {
    backend: Arc<dyn Backend>,
    priority: i32,
    is_alternate: bool,
    /// Canonical object directory this backend was loaded from, if any.
    dir: Option<PathBuf>,
}

/// The object database: an ordered set of backends queried as one store.
///
/// Reads go to backends in descending priority, primaries before
/// alternates, and the first hit wins. A backend reporting corruption stops
/// the query; it is never treated as a miss. When every backend misses,
/// all of them are refreshed and the query is retried once.
///
/// Objects read in full are offered to the [`ObjectCache`], which later
/// reads, header reads and existence checks consult first.
pub struct ObjectDatabase {
    config: OdbConfig,
    windows: Arc<WindowManager>,
    cache: ObjectCache,
    backends: RwLock<Vec<Registered>>,
}

impl ObjectDatabase {
    /// An empty database. Add backends with [`add_backend`](Self::add_backend).
    pub fn new(config: OdbConfig) -> Self {
        let windows = Arc::new(WindowManager::new(&config.window));
        let cache = ObjectCache::new(config.cache.clone());
        Self {
            config,
            windows,
            cache,
            backends: RwLock::new(Vec::new()),
        }
    }

    /// Open the object directory `objects_dir` with its loose objects, its
    /// packs and every alternate it lists.
    pub fn open(objects_dir: impl AsRef<Path>, config: OdbConfig) -> OdbResult<Self> {
        let objects_dir = objects_dir.as_ref();
        if !objects_dir.is_dir() {
            return Err(OdbError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("object directory {} does not exist", objects_dir.display()),
            )));
        }
        let db = Self::new(config);
        db.add_default_backends(objects_dir, false, 0)?;
        Ok(db)
    }

    pub fn config(&self) -> &OdbConfig {
        &self.config
    }

    pub fn format(&self) -> ObjectFormat {
        self.config.object_format
    }

    /// Mapping statistics for every pack opened through this database.
    pub fn window_stats(&self) -> WindowStats {
        self.windows.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.read().len()
    }

    /// Names of the registered backends in query order.
    pub fn backend_names(&self) -> Vec<String> {
        self.backends
            .read()
            .iter()
            .map(|r| r.backend.name().to_string())
            .collect()
    }

    /// Register a primary backend. Higher priorities are queried first.
    pub fn add_backend(&self, backend: Arc<dyn Backend>, priority: i32) -> OdbResult<()> {
        self.register(backend, priority, false, None)
    }

    /// Register a backend that is only read from, after all primaries.
    pub fn add_alternate(&self, backend: Arc<dyn Backend>, priority: i32) -> OdbResult<()> {
        self.register(backend, priority, true, None)
    }

    /// Add the loose and pack backends of another object directory as
    /// alternates.
    pub fn add_disk_alternate(&self, objects_dir: impl AsRef<Path>) -> OdbResult<()> {
        self.add_default_backends(objects_dir.as_ref(), true, 0)
    }

    fn register(
        &self,
        backend: Arc<dyn Backend>,
        priority: i32,
        is_alternate: bool,
        dir: Option<PathBuf>,
    ) -> OdbResult<()> {
        if backend.format() != self.format() {
            return Err(OdbError::FormatMismatch {
                expected: self.format(),
                actual: backend.format(),
            });
        }
        debug!(backend = backend.name(), priority, is_alternate, "registered backend");
        let mut backends = self.backends.write();
        backends.push(Registered {
            backend,
            priority,
            is_alternate,
            dir,
        });
        backends.sort_by(|a, b| {
            a.is_alternate
                .cmp(&b.is_alternate)
                .then(b.priority.cmp(&a.priority))
        });
        Ok(())
    }

    fn add_default_backends(&self, objects_dir: &Path, as_alternate: bool, depth: usize) -> OdbResult<()> {
        let canonical = match fs::canonicalize(objects_dir) {
            Ok(path) => path,
            Err(e) if as_alternate => {
                warn!(dir = %objects_dir.display(), error = %e, "skipping unreadable alternate");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let loaded = self
            .backends
            .read()
            .iter()
            .any(|r| r.dir.as_deref() == Some(canonical.as_path()));
        if loaded {
            debug!(dir = %canonical.display(), "object directory already loaded");
            return Ok(());
        }

        let format = self.format();
        let loose = LooseBackend::new(objects_dir, format, self.config.loose.clone());
        let packs = PackBackend::new(
            objects_dir.join("pack"),
            format,
            self.config.pack.clone(),
            Arc::clone(&self.windows),
        )?;
        self.register(Arc::new(loose), LOOSE_PRIORITY, as_alternate, Some(canonical.clone()))?;
        self.register(Arc::new(packs), PACKED_PRIORITY, as_alternate, Some(canonical))?;

        self.load_alternates(objects_dir, depth)
    }

    fn load_alternates(&self, objects_dir: &Path, depth: usize) -> OdbResult<()> {
        if depth > self.config.alternates_max_depth {
            return Ok(());
        }
        let text = match fs::read_to_string(objects_dir.join(ALTERNATES_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let alternate = if line.starts_with('.') {
                if depth > 0 {
                    warn!(entry = line, "ignoring relative alternate of an alternate");
                    continue;
                }
                objects_dir.join(line)
            } else {
                PathBuf::from(line)
            };
            self.add_default_backends(&alternate, true, depth + 1)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Registered> {
        self.backends.read().clone()
    }

    /// Ask each backend in order; the first `Some` wins.
    fn first_hit<T>(&self, query: &mut impl FnMut(&dyn Backend) -> StoreResult<Option<T>>) -> OdbResult<Option<T>> {
        for reg in self.snapshot() {
            if let Some(found) = query(reg.backend.as_ref())? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// [`first_hit`](Self::first_hit), refreshing every backend and retrying
    /// once on a miss.
    fn first_hit_refreshing<T>(
        &self,
        mut query: impl FnMut(&dyn Backend) -> StoreResult<Option<T>>,
    ) -> OdbResult<Option<T>> {
        if let Some(found) = self.first_hit(&mut query)? {
            return Ok(Some(found));
        }
        self.refresh()?;
        self.first_hit(&mut query)
    }

    fn check_hash(&self, oid: &Oid, obj: &RawObject) -> OdbResult<()> {
        if !self.config.verify_hashes {
            return Ok(());
        }
        let computed = ObjectHasher::hash_object(oid.format(), obj.kind, &obj.data);
        if computed != *oid {
            return Err(OdbError::HashMismatch { id: *oid, computed });
        }
        Ok(())
    }

    /// Read and fully materialize an object.
    pub fn read(&self, oid: &Oid) -> OdbResult<RawObject> {
        if oid.is_null() {
            return Err(OdbError::NotFound(oid.to_hex()));
        }
        if let Some(obj) = self.cache.get(oid) {
            return Ok(obj);
        }
        let obj = self
            .first_hit_refreshing(|b| b.read(oid))?
            .ok_or_else(|| OdbError::NotFound(oid.to_hex()))?;
        self.check_hash(oid, &obj)?;
        self.cache.insert(*oid, &obj);
        Ok(obj)
    }

    /// Open a reader over an object's content without materializing it
    /// where the backend can stream. With `verify_hashes` the final read
    /// fails if the content does not match `oid`.
    pub fn read_stream(&self, oid: &Oid) -> OdbResult<ObjectReader> {
        if oid.is_null() {
            return Err(OdbError::NotFound(oid.to_hex()));
        }
        if let Some(obj) = self.cache.get(oid) {
            return Ok(ObjectReader::new(obj.header(), Cursor::new(obj.data)));
        }
        let reader = self
            .first_hit_refreshing(|b| b.read_stream(oid))?
            .ok_or_else(|| OdbError::NotFound(oid.to_hex()))?;
        Ok(if self.config.verify_hashes {
            reader.verified(*oid)
        } else {
            reader
        })
    }

    /// Type and size of an object, without materializing it where the
    /// backend can avoid it.
    pub fn read_header(&self, oid: &Oid) -> OdbResult<ObjectHeader> {
        if oid.is_null() {
            return Err(OdbError::NotFound(oid.to_hex()));
        }
        if let Some(header) = self.cache.header(oid) {
            return Ok(header);
        }
        self.first_hit_refreshing(|b| b.read_header(oid))?
            .ok_or_else(|| OdbError::NotFound(oid.to_hex()))
    }

    pub fn exists(&self, oid: &Oid) -> OdbResult<bool> {
        if oid.is_null() {
            return Ok(false);
        }
        if self.cache.contains(oid) {
            return Ok(true);
        }
        let found = self.first_hit_refreshing(|b| Ok(b.exists(oid)?.then_some(())))?;
        Ok(found.is_some())
    }

    /// [`exists`](Self::exists) without the refresh-and-retry on a miss.
    pub(crate) fn contains(&self, oid: &Oid) -> OdbResult<bool> {
        if oid.is_null() {
            return Ok(false);
        }
        if self.cache.contains(oid) {
            return Ok(true);
        }
        let found = self.first_hit(&mut |b: &dyn Backend| Ok(b.exists(oid)?.then_some(())))?;
        Ok(found.is_some())
    }

    /// One pass of prefix resolution over every backend. Distinct matches
    /// from different backends are ambiguous even if each backend alone
    /// found only one.
    fn prefix_pass(&self, prefix: &OidPrefix) -> OdbResult<Option<Oid>> {
        let mut found: Option<Oid> = None;
        for reg in self.snapshot() {
            let Some(oid) = reg.backend.lookup_prefix(prefix)? else {
                continue;
            };
            match found {
                Some(prev) if prev != oid => {
                    return Err(OdbError::Ambiguous(format!(
                        "{} matches {} and {}",
                        prefix.to_hex(),
                        prev,
                        oid
                    )));
                }
                _ => found = Some(oid),
            }
        }
        Ok(found)
    }

    /// Resolve an abbreviated identifier to the unique object it names.
    ///
    /// Prefixes shorter than `min_prefix_len` hex digits are rejected as
    /// ambiguous without consulting any backend.
    pub fn lookup_prefix(&self, prefix: &OidPrefix) -> OdbResult<Oid> {
        if prefix.nibbles() < self.config.min_prefix_len {
            return Err(OdbError::Ambiguous(format!(
                "{} is shorter than {} hex digits",
                prefix.to_hex(),
                self.config.min_prefix_len
            )));
        }
        if let Some(oid) = prefix.to_oid(self.format()) {
            return if self.exists(&oid)? {
                Ok(oid)
            } else {
                Err(OdbError::NotFound(oid.to_hex()))
            };
        }

        let found = match self.prefix_pass(prefix)? {
            Some(oid) => Some(oid),
            None => {
                self.refresh()?;
                self.prefix_pass(prefix)?
            }
        };
        found.ok_or_else(|| OdbError::NotFound(prefix.to_hex()))
    }

    /// Resolve a prefix and read the object it names.
    pub fn read_prefix(&self, prefix: &OidPrefix) -> OdbResult<(Oid, RawObject)> {
        let oid = self.lookup_prefix(prefix)?;
        let obj = self.read(&oid)?;
        Ok((oid, obj))
    }

    /// Identifier `data` would be stored under.
    pub fn hash(&self, kind: ObjectKind, data: &[u8]) -> Oid {
        ObjectHasher::hash_object(self.format(), kind, data)
    }

    /// Identifier the file at `path` would be stored under as an object of
    /// `kind`. The file's size is taken when it is opened; a file that
    /// shrinks while being read is an error.
    pub fn hash_file(&self, path: impl AsRef<Path>, kind: ObjectKind) -> OdbResult<Oid> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(ObjectHasher::hash_reader(self.format(), kind, size, BufReader::new(file))?)
    }

    fn write_target(&self) -> OdbResult<Arc<dyn Backend>> {
        self.snapshot()
            .into_iter()
            .find(|r| !r.is_alternate && r.backend.is_writable())
            .map(|r| r.backend)
            .ok_or(OdbError::ReadOnly)
    }

    /// Store an object in the first writable primary backend.
    ///
    /// Nothing is written if any backend, alternates included, already
    /// holds the object. That check does not refresh backends.
    pub fn write(&self, kind: ObjectKind, data: &[u8]) -> OdbResult<Oid> {
        let oid = self.hash(kind, data);
        if self.contains(&oid)? {
            debug!(%oid, "object already stored");
            return Ok(oid);
        }

        let target = self.write_target()?;
        let written = target.write(kind, data)?;
        if written != oid {
            return Err(OdbError::Corrupt(format!(
                "{} stored {oid} as {written}",
                target.name()
            )));
        }
        Ok(oid)
    }

    /// Start writing an object of `kind` whose content is exactly `size`
    /// bytes, for content too large to hold in memory at once.
    pub fn write_stream(&self, kind: ObjectKind, size: u64) -> OdbResult<ObjectStream<'_>> {
        let target = self.write_target()?;
        ObjectStream::new(self, target, kind, size)
    }

    /// Visit the identifiers held by every backend. An object present in
    /// several backends is visited more than once.
    pub fn for_each(&self, f: &mut dyn FnMut(&Oid) -> StoreResult<()>) -> OdbResult<()> {
        for reg in self.snapshot() {
            reg.backend.for_each(f)?;
        }
        Ok(())
    }

    /// Re-scan every backend's on-disk state.
    pub fn refresh(&self) -> OdbResult<()> {
        for reg in self.snapshot() {
            reg.backend.refresh()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObjectDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDatabase")
            .field("format", &self.format())
            .field("backends", &self.backend_names())
            .finish()
    }
}
