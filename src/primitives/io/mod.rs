#![forbid(unsafe_code)]

//! File and blob I/O backends.
//!
//! [`FileIo`] is the positional interface the operation log is written
//! through; [`BlobStore`] holds whole named blobs (checkpoints, backup
//! images, staged data loads). Each comes in a disk and an in-memory flavour.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::types::{Result, TesseraError};

/// Positioned file I/O.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file if needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
    /// Replaces the whole contents with `contents`. A crash leaves either
    /// the old or the new contents, never a mix.
    fn replace(&self, contents: &[u8]) -> Result<()>;
}

/// [`FileIo`] over a regular file.
///
/// Clones share the handle; [`FileIo::replace`] swaps it for the renamed
/// file in every clone.
#[derive(Clone, Debug)]
pub struct StdFileIo {
    path: Arc<PathBuf>,
    file: Arc<RwLock<File>>,
}

impl StdFileIo {
    /// Opens `path` read-write, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self::from_parts(path, file))
    }

    /// Opens an existing file read-only; writes will fail.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        Ok(Self::from_parts(path, file))
    }

    fn from_parts(path: PathBuf, file: File) -> Self {
        Self {
            path: Arc::new(path),
            file: Arc::new(RwLock::new(file)),
        }
    }

    /// Path the file was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sibling_tmp(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TesseraError::InvalidOwned(format!("no file name in {}", path.display())))?;
    Ok(path.with_file_name(format!(".{name}.tmp")))
}

/// Writes `data` to a temp file next to `path`, syncs it and renames it
/// over `path`.
fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = sibling_tmp(path)?;
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        write_all_at(&file, 0, data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    #[cfg(unix)]
    {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn pread(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(dst, off)
}

#[cfg(unix)]
fn pwrite(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(src, off)
}

#[cfg(windows)]
fn pread(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(dst, off)
}

#[cfg(windows)]
fn pwrite(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(src, off)
}

fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> Result<()> {
    while !src.is_empty() {
        let written = pwrite(file, src, off)?;
        if written == 0 {
            return Err(io::Error::new(ErrorKind::WriteZero, "write_at wrote zero bytes").into());
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        let file = self.file.read();
        while !dst.is_empty() {
            let read = pread(&file, dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF").into());
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        write_all_at(&self.file.read(), off, src)
    }

    fn sync_all(&self) -> Result<()> {
        self.file.read().sync_all()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.read().metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file.read().set_len(len)?;
        Ok(())
    }

    fn replace(&self, contents: &[u8]) -> Result<()> {
        let mut file = self.file.write();
        write_atomically(&self.path, contents)?;
        *file = OpenOptions::new().read(true).write(true).open(self.path.as_ref())?;
        trace!(path = %self.path.display(), bytes = contents.len(), "file.replace");
        Ok(())
    }
}

/// [`FileIo`] kept entirely in memory; clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct MemFileIo {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current contents out.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let start = usize::try_from(off).map_err(|_| TesseraError::Invalid("offset overflow"))?;
        let end = start + dst.len();
        if end > data.len() {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "read past end of buffer").into());
        }
        dst.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = usize::try_from(off).map_err(|_| TesseraError::Invalid("offset overflow"))?;
        let end = start + src.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| TesseraError::Invalid("length overflow"))?;
        self.data.lock().resize(len, 0);
        Ok(())
    }

    fn replace(&self, contents: &[u8]) -> Result<()> {
        *self.data.lock() = contents.to_vec();
        Ok(())
    }
}

/// Store of whole, atomically replaced, named blobs.
pub trait BlobStore: Send + Sync + 'static {
    /// Atomically replaces the blob called `name`.
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;
    /// Reads the blob, or `None` if it does not exist.
    fn get(&self, name: &str) -> Result<Option<Bytes>>;
    /// Deletes the blob; returns whether it existed.
    fn remove(&self, name: &str) -> Result<bool>;
    /// Names of all blobs starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    /// Total bytes held.
    fn size_bytes(&self) -> Result<u64>;
}

/// [`BlobStore`] backed by one file per blob inside a directory.
#[derive(Clone, Debug)]
pub struct DirBlobStore {
    dir: PathBuf,
}

impl DirBlobStore {
    /// Opens (creating if needed) the blob directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(TesseraError::InvalidOwned(format!("invalid blob name {name:?}")));
        }
        Ok(self.dir.join(name))
    }
}

impl BlobStore for DirBlobStore {
    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        write_atomically(&self.path_for(name)?, data)?;
        trace!(name, bytes = data.len(), "blob.put");
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(name)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') && name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn size_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}

/// [`BlobStore`] held in memory; clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, Bytes>>>,
}

impl MemBlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemBlobStore {
    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .insert(name.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.blobs.lock().get(name).cloned())
    }

    fn remove(&self, name: &str) -> Result<bool> {
        Ok(self.blobs.lock().remove(name).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .lock()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn size_bytes(&self) -> Result<u64> {
        Ok(self.blobs.lock().values().map(|b| b.len() as u64).sum())
    }
}
