use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ArenaError, Result};

/// Read-only memory-mapped view of a whole file.
///
/// Owns the file handle and the mapping. [`close`](Self::close) (or drop)
/// unmaps the view and closes the file; afterwards the handle is empty and
/// closing it again does nothing.
pub struct MappedFile {
    file: Option<File>,
    mmap: Option<memmap2::Mmap>,
    len: usize,
    path: PathBuf,
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MappedFile {
    /// Open `path` and map it read-only.
    ///
    /// Missing and zero-length files are errors. Resources acquired before a
    /// failing step are dropped before the error is returned.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ArenaError::open(path, e))?;
        let len = file.metadata().map_err(|e| ArenaError::io(path, e))?.len();
        if len == 0 {
            return Err(ArenaError::EmptyFile(path.to_path_buf()));
        }
        let len = usize::try_from(len).map_err(|_| {
            ArenaError::io(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "file is larger than the address space",
                ),
            )
        })?;

        let mmap = unsafe { memmap2::MmapOptions::new().len(len).map(&file) }
            .map_err(|e| ArenaError::io(path, e))?;
        debug!(path = %path.display(), len, "mapped file read-only");

        Ok(Self {
            file: Some(file),
            mmap: Some(mmap),
            len,
            path: path.to_path_buf(),
        })
    }

    /// Raw bytes of the mapped file; empty once closed.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// File length in bytes; zero once closed.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.mmap.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmap the view and close the file. No-op on a closed handle.
    pub fn close(&mut self) {
        // Unmap before closing the file it was created from.
        let was_open = self.mmap.take().is_some();
        self.file.take();
        if was_open {
            debug!(path = %self.path.display(), len = self.len, "unmapped file");
        }
        self.len = 0;
        self.path = PathBuf::new();
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        self.close();
    }
}
