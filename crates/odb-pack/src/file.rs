//! One `.pack` file and its `.idx`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use odb_types::ObjectFormat;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{PackError, PackResult};
use crate::index::PackIndex;
use crate::window::{PackId, WindowHandle, WindowManager};

pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
pub const PACK_HEADER_LEN: u64 = 12;

/// A pack file paired with its index.
///
/// The index is loaded when the pack is opened. The pack itself is only
/// validated and registered with the window manager on first access.
pub struct PackFile {
    pack_path: PathBuf,
    index: PackIndex,
    size: u64,
    mtime: Option<SystemTime>,
    format: ObjectFormat,
    windows: Arc<WindowManager>,
    id: Mutex<Option<PackId>>,
}

impl PackFile {
    /// Open the pack whose index lives at `idx_path`. The pack file must sit
    /// next to it with a `.pack` extension.
    pub fn open(idx_path: &Path, format: ObjectFormat, windows: Arc<WindowManager>) -> PackResult<Self> {
        let pack_path = idx_path.with_extension("pack");
        let meta = std::fs::metadata(&pack_path)?;
        let index = PackIndex::open(idx_path, format)?;
        Ok(Self {
            pack_path,
            index,
            size: meta.len(),
            mtime: meta.modified().ok(),
            format,
            windows,
            id: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.pack_path
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    pub fn format(&self) -> ObjectFormat {
        self.format
    }

    pub fn hash_len(&self) -> usize {
        self.format.oid_len()
    }

    /// Offset of the trailing checksum; entries live in `[12, data_end)`.
    pub fn data_end(&self) -> u64 {
        self.size.saturating_sub(self.hash_len() as u64)
    }

    /// Check the header and trailer against the index, then register the
    /// pack with the window manager. Runs once.
    fn pack_id(&self) -> PackResult<PackId> {
        let mut id = self.id.lock();
        if let Some(id) = *id {
            return Ok(id);
        }
        self.validate()?;
        let registered = self.windows.register(&self.pack_path, self.size, self.hash_len());
        debug!(path = %self.pack_path.display(), objects = self.index.len(), "opened pack");
        *id = Some(registered);
        Ok(registered)
    }

    fn validate(&self) -> PackResult<()> {
        let hash_len = self.hash_len() as u64;
        if self.size < PACK_HEADER_LEN + hash_len {
            return Err(PackError::corrupt(0, format!("pack of {} bytes is too small", self.size)));
        }

        let mut file = File::open(&self.pack_path)?;
        let actual = file.metadata()?.len();
        if actual != self.size {
            return Err(PackError::corrupt(
                0,
                format!("pack changed size from {} to {actual} bytes", self.size),
            ));
        }

        let mut header = [0u8; PACK_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if &header[..4] != PACK_SIGNATURE {
            return Err(PackError::InvalidSignature { what: "pack" });
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(PackError::UnsupportedVersion { what: "pack", version });
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        if count as usize != self.index.len() {
            return Err(PackError::corrupt(
                0,
                format!("pack holds {count} objects but its index lists {}", self.index.len()),
            ));
        }

        let mut trailer = vec![0u8; hash_len as usize];
        file.seek(SeekFrom::Start(self.size - hash_len))?;
        file.read_exact(&mut trailer)?;
        if trailer != self.index.pack_checksum() {
            warn!(path = %self.pack_path.display(), "pack trailer does not match its index");
            return Err(PackError::ChecksumMismatch(format!(
                "{} trailer differs from the checksum in its index",
                self.pack_path.display()
            )));
        }
        Ok(())
    }

    /// Pin the window covering `offset`.
    pub fn window(&self, offset: u64) -> PackResult<WindowHandle> {
        let id = self.pack_id()?;
        self.windows.acquire(id, offset)
    }

    /// Copy bytes starting at `offset` into `buf`, crossing windows as
    /// needed. Stops at the trailer; returns the number of bytes copied.
    pub fn read_at(&self, mut offset: u64, buf: &mut [u8]) -> PackResult<usize> {
        let end = self.data_end();
        let mut filled = 0;
        while filled < buf.len() && offset < end {
            let window = self.window(offset)?;
            let avail = window.slice_from(offset);
            let avail = &avail[..avail.len().min((end - offset) as usize)];
            let n = avail.len().min(buf.len() - filled);
            if n == 0 {
                break;
            }
            buf[filled..filled + n].copy_from_slice(&avail[..n]);
            filled += n;
            offset += n as u64;
        }
        Ok(filled)
    }

    /// Recompute the pack's trailer by streaming every data byte.
    pub fn verify_checksum(&self) -> PackResult<()> {
        self.pack_id()?;
        let mut hasher = odb_crypto::ObjectHasher::new(self.format);
        let mut offset = 0;
        let end = self.data_end();
        while offset < end {
            let window = self.window(offset)?;
            let avail = window.slice_from(offset);
            let take = avail.len().min((end - offset) as usize);
            hasher.update(&avail[..take]);
            offset += take as u64;
        }
        if hasher.finalize().as_bytes() != self.index.pack_checksum() {
            return Err(PackError::ChecksumMismatch(format!(
                "{} content does not match its trailer",
                self.pack_path.display()
            )));
        }
        Ok(())
    }
}

impl Drop for PackFile {
    fn drop(&mut self) {
        if let Some(id) = self.id.get_mut().take() {
            self.windows.unregister(id);
        }
    }
}

impl std::fmt::Debug for PackFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackFile")
            .field("path", &self.pack_path)
            .field("size", &self.size)
            .field("objects", &self.index.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowConfig;
    use crate::writer::{IndexVersion, PackWriter};
    use odb_types::ObjectKind;

    fn small_windows() -> Arc<WindowManager> {
        Arc::new(WindowManager::new(&WindowConfig {
            window_size: 128,
            mapped_limit: 512,
        }))
    }

    fn write_pack(dir: &Path, blobs: &[&[u8]]) -> PathBuf {
        let mut w = PackWriter::new(ObjectFormat::Sha1);
        for blob in blobs {
            w.add_object(ObjectKind::Blob, blob).unwrap();
        }
        w.write_to(dir, IndexVersion::V2).unwrap()
    }

    #[test]
    fn opens_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let idx = write_pack(dir.path(), &[b"one", b"two"]);
        let windows = small_windows();
        let pack = PackFile::open(&idx, ObjectFormat::Sha1, Arc::clone(&windows)).unwrap();
        assert_eq!(pack.index().len(), 2);
        assert_eq!(windows.stats().mmap_calls, 0);

        let w = pack.window(PACK_HEADER_LEN).unwrap();
        assert!(w.offset() <= PACK_HEADER_LEN);
        assert_eq!(windows.stats().open_files, 1);
        drop(w);
        drop(pack);
        assert_eq!(windows.stats().open_files, 0);
    }

    #[test]
    fn read_at_crosses_windows_and_stops_at_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let big: Vec<u8> = (0..2000u32).map(|i| (i * 7 % 256) as u8).collect();
        let idx = write_pack(dir.path(), &[&big]);
        let raw = std::fs::read(idx.with_extension("pack")).unwrap();
        let pack = PackFile::open(&idx, ObjectFormat::Sha1, small_windows()).unwrap();

        let mut buf = vec![0u8; raw.len()];
        let n = pack.read_at(0, &mut buf).unwrap();
        assert_eq!(n, raw.len() - 20);
        assert_eq!(&buf[..n], &raw[..n]);
        pack.verify_checksum().unwrap();
    }

    #[test]
    fn missing_pack_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let idx = write_pack(dir.path(), &[b"x"]);
        std::fs::remove_file(idx.with_extension("pack")).unwrap();
        match PackFile::open(&idx, ObjectFormat::Sha1, small_windows()) {
            Err(PackError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn corrupt_pack(edit: impl FnOnce(&mut Vec<u8>)) -> PackError {
        let dir = tempfile::tempdir().unwrap();
        let idx = write_pack(dir.path(), &[b"payload"]);
        let path = idx.with_extension("pack");
        let mut raw = std::fs::read(&path).unwrap();
        edit(&mut raw);
        std::fs::write(&path, raw).unwrap();
        let pack = PackFile::open(&idx, ObjectFormat::Sha1, small_windows()).unwrap();
        pack.window(PACK_HEADER_LEN).unwrap_err()
    }

    #[test]
    fn bad_signature() {
        let err = corrupt_pack(|raw| raw[0] = b'J');
        assert!(matches!(err, PackError::InvalidSignature { .. }));
    }

    #[test]
    fn bad_version() {
        let err = corrupt_pack(|raw| raw[7] = 4);
        assert!(matches!(err, PackError::UnsupportedVersion { version: 4, .. }));
    }

    #[test]
    fn count_mismatch() {
        let err = corrupt_pack(|raw| raw[11] = 9);
        assert!(err.is_corrupt());
    }

    #[test]
    fn trailer_mismatch() {
        let err = corrupt_pack(|raw| {
            let last = raw.len() - 1;
            raw[last] ^= 0xff;
        });
        assert!(matches!(err, PackError::ChecksumMismatch(_)));
    }

    #[test]
    fn flipped_data_fails_full_verification() {
        let dir = tempfile::tempdir().unwrap();
        let idx = write_pack(dir.path(), &[b"payload bytes"]);
        let path = idx.with_extension("pack");
        let mut raw = std::fs::read(&path).unwrap();
        raw[14] ^= 0x01;
        std::fs::write(&path, raw).unwrap();
        let pack = PackFile::open(&idx, ObjectFormat::Sha1, small_windows()).unwrap();
        assert!(matches!(pack.verify_checksum(), Err(PackError::ChecksumMismatch(_))));
    }
}
