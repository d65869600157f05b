//! Whole-file read and write helpers.
//!
//! The arena-backed counterpart of [`read_entire_file`] is
//! [`crate::BumpArena::push_file`].

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{ArenaError, Result};

/// Read the whole file at `path` into a new heap buffer.
///
/// Fails for missing or empty files, and when fewer bytes arrive than the
/// file's length promised. A partially filled buffer is never returned.
pub fn read_entire_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| ArenaError::open(path, e))?;
    let len = file.metadata().map_err(|e| ArenaError::io(path, e))?.len();
    if len == 0 {
        return Err(ArenaError::EmptyFile(path.to_path_buf()));
    }
    let len = usize::try_from(len).map_err(|_| {
        ArenaError::io(
            path,
            io::Error::new(io::ErrorKind::OutOfMemory, "file does not fit in memory"),
        )
    })?;

    let mut buffer = vec![0u8; len];
    let actual = read_full(&mut file, &mut buffer).map_err(|e| ArenaError::io(path, e))?;
    if actual != len {
        return Err(ArenaError::ShortRead {
            path: path.to_path_buf(),
            expected: len,
            actual,
        });
    }

    debug!(path = %path.display(), len, "read file");
    Ok(buffer)
}

/// Create or truncate the file at `path` and write all of `bytes` to it.
pub fn flush_to_file(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let mut file = File::create(path).map_err(|e| ArenaError::io(path, e))?;
    write_full(&mut file, bytes, path)?;
    file.flush().map_err(|e| ArenaError::io(path, e))?;

    debug!(path = %path.display(), len = bytes.len(), "flushed buffer to file");
    Ok(())
}

/// Fill `buf` from `reader`, stopping early only at end of input.
/// Returns the number of bytes read.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub(crate) fn write_full<W: Write + ?Sized>(writer: &mut W, bytes: &[u8], path: &Path) -> Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        match writer.write(&bytes[written..]) {
            Ok(0) => {
                return Err(ArenaError::ShortWrite {
                    path: path.to_path_buf(),
                    expected: bytes.len(),
                    actual: written,
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ArenaError::io(path, e)),
        }
    }
    Ok(())
}
