//! Sliding-window memory mapping of pack files.
//!
//! Packs can be far larger than the address space we are willing to spend
//! on them, so they are mapped in fixed-size windows on demand. All windows
//! across all packs share one mapped-bytes budget; when a new mapping would
//! exceed it, the least recently used unpinned window anywhere is unmapped
//! first. The budget is soft: if every window is pinned, the new mapping is
//! made anyway.
//!
//! A [`WindowHandle`] pins its window until dropped. The handle owns a
//! reference to the mapping itself, so its bytes stay valid even if the
//! pack is unregistered while the handle is alive.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PackError, PackResult};

/// Windows smaller than twice the longest hash could not guarantee a full
/// hash of readable bytes past every offset they serve.
pub const MIN_WINDOW_SIZE: u64 = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Length of each mapping in bytes.
    pub window_size: u64,
    /// Soft budget for the total bytes mapped across all packs.
    pub mapped_limit: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self {
                window_size: 1 << 30,
                mapped_limit: 8 << 30,
            }
        } else {
            Self {
                window_size: 32 << 20,
                mapped_limit: 256 << 20,
            }
        }
    }
}

/// Counters describing the manager's mapping activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub mapped: u64,
    pub peak_mapped: u64,
    pub open_windows: usize,
    pub peak_open_windows: usize,
    pub mmap_calls: u64,
    pub open_files: usize,
}

/// Registration handle for one pack file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PackId(usize);

/// A pinned view of one window.
pub struct WindowHandle {
    map: Arc<Mmap>,
    offset: u64,
    pins: Arc<AtomicUsize>,
}

impl WindowHandle {
    /// Pack offset of the first mapped byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Pack offset one past the last mapped byte.
    pub fn end(&self) -> u64 {
        self.offset + self.map.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    /// Mapped bytes from pack offset `offset` to the end of the window.
    pub fn slice_from(&self, offset: u64) -> &[u8] {
        let Some(start) = offset.checked_sub(self.offset) else {
            return &[];
        };
        usize::try_from(start)
            .ok()
            .and_then(|start| self.map.get(start..))
            .unwrap_or(&[])
    }
}

impl Drop for WindowHandle {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowHandle")
            .field("offset", &self.offset)
            .field("len", &self.map.len())
            .finish()
    }
}

struct Window {
    pack: usize,
    offset: u64,
    len: u64,
    map: Arc<Mmap>,
    pins: Arc<AtomicUsize>,
    last_used: u64,
}

impl Window {
    /// Does this window hold `offset` plus `slack` readable bytes after it?
    fn covers(&self, offset: u64, slack: u64) -> bool {
        self.offset <= offset && offset + slack <= self.offset + self.len
    }

    fn pin(&self) -> WindowHandle {
        self.pins.fetch_add(1, Ordering::AcqRel);
        WindowHandle {
            map: Arc::clone(&self.map),
            offset: self.offset,
            pins: Arc::clone(&self.pins),
        }
    }
}

struct FileSlot {
    path: PathBuf,
    size: u64,
    hash_len: u64,
    /// Distinguishes registrations that reuse the same slot.
    generation: u64,
    file: Option<Arc<File>>,
    windows: Vec<usize>,
}

/// A window of an unregistered pack that a handle still pins. Its bytes
/// stay counted until the last handle goes.
struct Orphan {
    len: u64,
    pins: Arc<AtomicUsize>,
}

#[derive(Default)]
struct Inner {
    files: Vec<Option<FileSlot>>,
    free_files: Vec<usize>,
    windows: Vec<Option<Window>>,
    free_windows: Vec<usize>,
    orphans: Vec<Orphan>,
    tick: u64,
    generations: u64,
    stats: WindowStats,
}

fn not_registered() -> PackError {
    PackError::Io(io::Error::new(io::ErrorKind::NotFound, "pack is not registered"))
}

impl Inner {
    fn slot(&self, pack: usize) -> PackResult<&FileSlot> {
        self.files.get(pack).and_then(Option::as_ref).ok_or_else(not_registered)
    }

    /// Pin an existing window of `pack` holding `offset` plus `slack` bytes.
    fn pin_covering(&mut self, pack: usize, offset: u64, slack: u64, tick: u64) -> Option<WindowHandle> {
        let slot = self.files.get(pack)?.as_ref()?;
        let hit = slot
            .windows
            .iter()
            .copied()
            .find(|&w| self.windows[w].as_ref().is_some_and(|win| win.covers(offset, slack)))?;
        let win = self.windows[hit].as_mut()?;
        win.last_used = tick;
        Some(win.pin())
    }

    /// Unmap the least recently used unpinned window. Returns `false` if
    /// every window is pinned.
    fn evict_lru(&mut self) -> bool {
        let victim = self
            .windows
            .iter()
            .enumerate()
            .filter_map(|(i, w)| w.as_ref().map(|w| (i, w)))
            .filter(|(_, w)| w.pins.load(Ordering::Acquire) == 0)
            .min_by_key(|(_, w)| w.last_used)
            .map(|(i, _)| i);
        match victim {
            Some(i) => {
                if let Some(win) = self.detach_window(i) {
                    self.forget(win.len);
                }
                true
            }
            None => false,
        }
    }

    /// Take window `i` out of the arena and its pack's list, closing the
    /// pack file once its last window is gone. Stats are left to the caller.
    fn detach_window(&mut self, i: usize) -> Option<Window> {
        let win = self.windows.get_mut(i)?.take()?;
        self.free_windows.push(i);
        debug!(offset = win.offset, len = win.len, "unmapped pack window");

        if let Some(slot) = self.files.get_mut(win.pack).and_then(Option::as_mut) {
            slot.windows.retain(|&w| w != i);
            if slot.windows.is_empty() && slot.file.take().is_some() {
                self.stats.open_files -= 1;
                debug!(path = %slot.path.display(), "closed pack file");
            }
        }
        Some(win)
    }

    fn forget(&mut self, len: u64) {
        self.stats.mapped -= len;
        self.stats.open_windows -= 1;
    }

    /// Stop counting orphaned windows whose handles have all been dropped.
    fn sweep_orphans(&mut self) {
        let mut released = Vec::new();
        self.orphans.retain(|o| {
            let live = o.pins.load(Ordering::Acquire) > 0;
            if !live {
                released.push(o.len);
            }
            live
        });
        for len in released {
            self.forget(len);
        }
    }

    fn insert(&mut self, window: Window) -> usize {
        match self.free_windows.pop() {
            Some(i) => {
                self.windows[i] = Some(window);
                i
            }
            None => {
                self.windows.push(Some(window));
                self.windows.len() - 1
            }
        }
    }
}

/// Open a registered pack file and confirm it still has its registered size.
fn open_checked(path: &Path, size: u64) -> PackResult<File> {
    let file = File::open(path)?;
    let actual = file.metadata()?.len();
    if actual != size {
        return Err(PackError::corrupt(
            0,
            format!("{} changed size from {size} to {actual} bytes", path.display()),
        ));
    }
    Ok(file)
}

fn map_window(file: &File, offset: u64, len: u64) -> PackResult<Mmap> {
    let len = usize::try_from(len).map_err(|_| PackError::OutOfMemory(len))?;
    // SAFETY: pack files are immutable once written; the size was checked
    // against the registration when the file was opened.
    let map = unsafe { MmapOptions::new().offset(offset).len(len).map(file)? };
    Ok(map)
}

/// Owner of every pack mapping in the process (or database).
///
/// Files are opened and mapped outside the bookkeeping lock, so a slow
/// filesystem only stalls the reader that needs the new window.
pub struct WindowManager {
    window_size: u64,
    mapped_limit: u64,
    inner: Mutex<Inner>,
}

impl WindowManager {
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            window_size: config.window_size.max(MIN_WINDOW_SIZE),
            mapped_limit: config.mapped_limit,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    pub fn mapped_limit(&self) -> u64 {
        self.mapped_limit
    }

    /// Register a pack file of `size` bytes whose trailing `hash_len` bytes
    /// are its checksum. The file is opened lazily.
    pub fn register(&self, path: &Path, size: u64, hash_len: usize) -> PackId {
        let mut inner = self.inner.lock();
        inner.generations += 1;
        let slot = FileSlot {
            path: path.to_path_buf(),
            size,
            hash_len: hash_len as u64,
            generation: inner.generations,
            file: None,
            windows: Vec::new(),
        };
        let id = match inner.free_files.pop() {
            Some(i) => {
                inner.files[i] = Some(slot);
                i
            }
            None => {
                inner.files.push(Some(slot));
                inner.files.len() - 1
            }
        };
        PackId(id)
    }

    /// Drop a pack's windows and file handle. Outstanding handles keep their
    /// own mappings alive, and stay counted in the stats, until dropped.
    pub fn unregister(&self, id: PackId) {
        let mut inner = self.inner.lock();
        let windows = match inner.files.get(id.0).and_then(Option::as_ref) {
            Some(slot) => slot.windows.clone(),
            None => return,
        };
        for w in windows {
            let Some(win) = inner.detach_window(w) else {
                continue;
            };
            if win.pins.load(Ordering::Acquire) > 0 {
                inner.orphans.push(Orphan {
                    len: win.len,
                    pins: win.pins,
                });
            } else {
                inner.forget(win.len);
            }
        }
        if let Some(slot) = inner.files[id.0].take() {
            if slot.file.is_some() {
                inner.stats.open_files -= 1;
            }
            inner.free_files.push(id.0);
        }
    }

    /// Pin a window of pack `id` that covers `offset` and at least one hash
    /// length of bytes after it, mapping a new one if necessary.
    ///
    /// Offsets inside the trailing checksum are rejected.
    pub fn acquire(&self, id: PackId, offset: u64) -> PackResult<WindowHandle> {
        let (path, size, hash_len, generation, file, win_offset, len) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.tick += 1;
            let tick = inner.tick;

            let slot = inner.slot(id.0)?;
            let (size, hash_len) = (slot.size, slot.hash_len);
            if offset >= size.saturating_sub(hash_len) {
                return Err(PackError::corrupt(offset, "offset past the end of pack data"));
            }
            if let Some(handle) = inner.pin_covering(id.0, offset, hash_len, tick) {
                return Ok(handle);
            }

            let align = self.window_size / 2;
            let win_offset = offset / align * align;
            let len = self.window_size.min(size - win_offset);
            let slot = inner.slot(id.0)?;
            (slot.path.clone(), size, hash_len, slot.generation, slot.file.clone(), win_offset, len)
        };

        let file = match file {
            Some(file) => file,
            None => Arc::new(open_checked(&path, size)?),
        };
        let map = Arc::new(map_window(&file, win_offset, len)?);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.stats.mmap_calls += 1;
        inner.tick += 1;
        let tick = inner.tick;
        match inner.files.get(id.0).and_then(Option::as_ref) {
            Some(slot) if slot.generation == generation => {}
            _ => return Err(not_registered()),
        }
        // Another reader may have mapped a covering window meanwhile.
        if let Some(handle) = inner.pin_covering(id.0, offset, hash_len, tick) {
            return Ok(handle);
        }

        inner.sweep_orphans();
        while inner.stats.mapped + len > self.mapped_limit && inner.evict_lru() {}

        debug!(pack = id.0, offset = win_offset, len, "mapped pack window");
        let window = Window {
            pack: id.0,
            offset: win_offset,
            len,
            map,
            pins: Arc::new(AtomicUsize::new(0)),
            last_used: tick,
        };
        let handle = window.pin();
        let i = inner.insert(window);
        if let Some(slot) = inner.files[id.0].as_mut() {
            slot.windows.push(i);
            if slot.file.is_none() {
                slot.file = Some(file);
                inner.stats.open_files += 1;
            }
        }

        let stats = &mut inner.stats;
        stats.mapped += len;
        stats.open_windows += 1;
        stats.peak_mapped = stats.peak_mapped.max(stats.mapped);
        stats.peak_open_windows = stats.peak_open_windows.max(stats.open_windows);
        Ok(handle)
    }

    /// Unpin a window. Equivalent to dropping the handle.
    pub fn release(&self, handle: WindowHandle) {
        drop(handle);
    }

    pub fn stats(&self) -> WindowStats {
        let mut inner = self.inner.lock();
        inner.sweep_orphans();
        inner.stats
    }
}

impl Default for WindowManager {
    fn default() -> Self {
        Self::new(&WindowConfig::default())
    }
}

impl std::fmt::Debug for WindowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowManager")
            .field("window_size", &self.window_size)
            .field("mapped_limit", &self.mapped_limit)
            .field("stats", &self.stats())
            .finish()
    }
}
