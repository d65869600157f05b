use std::fs::File;
use std::io::Read;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{ArenaError, Result};
use crate::fileio::read_full;
use crate::vm::{round_up, OsVirtualMemory, VirtualMemory, COMMIT_GRANULARITY};

/// A region handed out by [`BumpArena`], expressed as an offset from the
/// arena base plus a length.
///
/// The handle is only meaningful for the arena that produced it and only while
/// the arena has not been popped or reset past `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaSlice {
    offset: usize,
    len: usize,
}

impl ArenaSlice {
    #[inline]
    pub fn offset(self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Offset one past the last byte of the region.
    #[inline]
    pub fn end(self) -> usize {
        self.offset + self.len
    }
}

/// Point-in-time bookkeeping of an arena.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaStats {
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
    pub used_bytes: usize,
    pub valid: bool,
}

/// Bump allocator over one contiguous reservation of virtual address space.
///
/// - Init reserves address space only; nothing is committed.
/// - Pushes advance a cursor and commit whole [`COMMIT_GRANULARITY`] units
///   once the cursor passes the committed high-water mark.
/// - Pops and resets rewind the cursor and zero every byte they pass over.
///   Committed pages are kept for reuse.
/// - Destroy (or drop) releases the reservation.
pub struct BumpArena<V: VirtualMemory = OsVirtualMemory> {
    backend: V,
    base: Option<NonNull<u8>>,
    cursor: usize,
    committed: usize,
    reserved: usize,
    free_unused_on_reset: bool,
}

// The arena exclusively owns its reservation; moving it to another thread
// moves that ownership. It is not Sync.
unsafe impl<V: VirtualMemory + Send> Send for BumpArena<V> {}

impl<V: VirtualMemory> std::fmt::Debug for BumpArena<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BumpArena")
            .field("base", &self.base)
            .field("cursor", &self.cursor)
            .field("committed", &self.committed)
            .field("reserved", &self.reserved)
            .finish()
    }
}

impl BumpArena<OsVirtualMemory> {
    /// Reserve `reserved_size` bytes (rounded up to the commit granularity)
    /// from the operating system.
    pub fn new(reserved_size: usize) -> Result<Self> {
        Self::with_backend(OsVirtualMemory, reserved_size)
    }
}

impl<V: VirtualMemory> BumpArena<V> {
    pub fn with_backend(backend: V, reserved_size: usize) -> Result<Self> {
        let invalid = |msg: &str| ArenaError::ReservationFailed {
            size: reserved_size,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.to_string()),
        };
        if reserved_size == 0 {
            return Err(invalid("reservation size must be non-zero"));
        }
        let reserved = round_up(reserved_size, COMMIT_GRANULARITY)
            .ok_or_else(|| invalid("reservation size overflows the address space"))?;

        let base = backend
            .reserve(reserved)
            .map_err(|source| ArenaError::ReservationFailed {
                size: reserved,
                source,
            })?;
        debug!(reserved, base = ?base, "reserved arena address space");

        Ok(Self {
            backend,
            base: Some(base),
            cursor: 0,
            committed: 0,
            reserved,
            free_unused_on_reset: false,
        })
    }

    /// Hand committed-but-unused pages back to the OS after every [`reset`](Self::reset).
    pub fn set_free_unused_on_reset(&mut self, enabled: bool) {
        self.free_unused_on_reset = enabled;
    }

    #[inline]
    pub fn push(&mut self, size: usize) -> Result<ArenaSlice> {
        self.push_aligned(size, 1)
    }

    /// Reserve `size` bytes starting at the next address that is a multiple of
    /// `alignment`. On any failure the arena is left exactly as it was.
    pub fn push_aligned(&mut self, size: usize, alignment: usize) -> Result<ArenaSlice> {
        if !alignment.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment(alignment));
        }
        let base = self.base.ok_or(ArenaError::Destroyed)?;
        let out_of_memory = ArenaError::OutOfMemory {
            requested: size,
            remaining: self.remaining(),
        };

        // Rounding is done on the absolute address, not on the offset.
        let base_addr = base.as_ptr() as usize;
        let offset = match round_up(base_addr + self.cursor, alignment) {
            Some(addr) => addr - base_addr,
            None => return Err(out_of_memory),
        };
        let end = match offset.checked_add(size) {
            Some(end) if end <= self.reserved => end,
            _ => return Err(out_of_memory),
        };

        if end > self.committed {
            self.commit_through(base, end)?;
        }
        self.cursor = end;
        trace!(offset, size, alignment, "arena push");

        Ok(ArenaSlice { offset, len: size })
    }

    fn commit_through(&mut self, base: NonNull<u8>, end: usize) -> Result<()> {
        // `reserved` is a multiple of the granularity, so this never leaves the reservation.
        let target = round_up(end, COMMIT_GRANULARITY)
            .unwrap_or(self.reserved)
            .min(self.reserved);
        let size = target - self.committed;

        let result = unsafe {
            let addr = NonNull::new_unchecked(base.as_ptr().add(self.committed));
            self.backend.commit(addr, size)
        };
        result.map_err(|source| ArenaError::CommitFailed {
            offset: self.committed,
            size,
            source,
        })?;

        debug!(from = self.committed, to = target, "committed arena pages");
        self.committed = target;
        Ok(())
    }

    /// Push `bytes` followed by a terminating zero byte. The returned slice
    /// covers the terminator.
    pub fn push_string(&mut self, bytes: impl AsRef<[u8]>) -> Result<ArenaSlice> {
        let bytes = bytes.as_ref();
        let total = bytes.len().checked_add(1).ok_or(ArenaError::OutOfMemory {
            requested: usize::MAX,
            remaining: self.remaining(),
        })?;

        let slice = self.push(total)?;
        let dst = self.bytes_mut(slice);
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()] = 0;
        Ok(slice)
    }

    /// Push the full contents of the file at `path`.
    ///
    /// Empty or unreadable files fail without allocating. A short read pops
    /// the region again before the error is returned.
    pub fn push_file(&mut self, path: impl AsRef<Path>) -> Result<ArenaSlice> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| ArenaError::open(path, e))?;
        let len = file.metadata().map_err(|e| ArenaError::io(path, e))?.len();
        if len == 0 {
            return Err(ArenaError::EmptyFile(path.to_path_buf()));
        }
        let len = usize::try_from(len).map_err(|_| ArenaError::OutOfMemory {
            requested: usize::MAX,
            remaining: self.remaining(),
        })?;

        self.push_from_reader(&mut file, len, path)
    }

    pub(crate) fn push_from_reader<R: Read>(
        &mut self,
        reader: &mut R,
        len: usize,
        path: &Path,
    ) -> Result<ArenaSlice> {
        let mark = self.cursor;
        let slice = self.push(len)?;

        match read_full(reader, self.bytes_mut(slice)) {
            Ok(actual) if actual == len => {
                debug!(path = %path.display(), len, offset = slice.offset, "loaded file into arena");
                Ok(slice)
            }
            Ok(actual) => {
                self.pop_to(mark);
                Err(ArenaError::ShortRead {
                    path: path.to_path_buf(),
                    expected: len,
                    actual,
                })
            }
            Err(source) => {
                self.pop_to(mark);
                Err(ArenaError::io(path, source))
            }
        }
    }

    /// Rewind the cursor to the start of `slice`, zeroing everything after it.
    ///
    /// # Panics
    /// If `slice` starts beyond the current cursor.
    #[inline]
    pub fn pop(&mut self, slice: ArenaSlice) {
        self.pop_to(slice.offset);
    }

    /// Rewind the cursor to `offset`, zeroing `[offset, cursor)`.
    ///
    /// # Panics
    /// If `offset` is past the current cursor; that means the caller popped
    /// out of LIFO order or used a handle from another arena.
    pub fn pop_to(&mut self, offset: usize) {
        assert!(
            offset <= self.cursor,
            "pop offset {} outside live range 0..={}",
            offset,
            self.cursor
        );
        if let Some(base) = self.base {
            unsafe {
                std::ptr::write_bytes(base.as_ptr().add(offset), 0, self.cursor - offset);
            }
        }
        trace!(from = self.cursor, to = offset, "arena pop");
        self.cursor = offset;
    }

    /// Zero every live byte and rewind the cursor to the base.
    pub fn reset(&mut self) {
        self.pop_to(0);
        if self.free_unused_on_reset {
            self.free_unused();
        }
    }

    /// Let the OS reclaim committed pages above the cursor. Bookkeeping is
    /// unchanged and the pages stay usable; whether anything is reclaimed is
    /// up to the backend.
    pub fn free_unused(&mut self) {
        let Some(base) = self.base else {
            return;
        };
        let start = round_up(self.cursor, COMMIT_GRANULARITY).unwrap_or(self.committed);
        if start >= self.committed {
            return;
        }

        let size = self.committed - start;
        let result = unsafe {
            let addr = NonNull::new_unchecked(base.as_ptr().add(start));
            self.backend.discard(addr, size)
        };
        match result {
            Ok(()) => trace!(offset = start, size, "discarded unused arena pages"),
            Err(e) => warn!(offset = start, size, error = %e, "failed to discard unused arena pages"),
        }
    }

    /// Release the reservation. Every handle from this arena becomes invalid
    /// and later pushes fail with [`ArenaError::Destroyed`].
    pub fn destroy(&mut self) {
        if let Some(base) = self.base.take() {
            unsafe { self.backend.release(base, self.reserved) };
            debug!(reserved = self.reserved, committed = self.committed, "released arena");
        }
        self.cursor = 0;
        self.committed = 0;
        self.reserved = 0;
    }

    /// Start a scope that pops back to the current cursor when dropped.
    pub fn scope(&mut self) -> ArenaScope<'_, V> {
        let mark = self.cursor;
        ArenaScope { arena: self, mark }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.base.is_some()
    }

    /// Absolute address of the reservation, or `None` once destroyed.
    #[inline]
    pub fn base_addr(&self) -> Option<usize> {
        self.base.map(|b| b.as_ptr() as usize)
    }

    /// Absolute address of `slice`, or `None` once destroyed.
    pub fn address_of(&self, slice: ArenaSlice) -> Option<usize> {
        self.base_addr().map(|b| b + slice.offset)
    }

    /// Bytes in use, i.e. the cursor's offset from the base.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.committed
    }

    #[inline]
    pub fn reserved_size(&self) -> usize {
        self.reserved
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.reserved - self.cursor
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            reserved_bytes: self.reserved,
            committed_bytes: self.committed,
            used_bytes: self.cursor,
            valid: self.is_valid(),
        }
    }

    /// View of a live region, or `None` if it is not below the cursor.
    pub fn get(&self, slice: ArenaSlice) -> Option<&[u8]> {
        let base = self.base?;
        if slice.end() > self.cursor {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(base.as_ptr().add(slice.offset), slice.len) })
    }

    pub fn get_mut(&mut self, slice: ArenaSlice) -> Option<&mut [u8]> {
        let base = self.base?;
        if slice.end() > self.cursor {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(base.as_ptr().add(slice.offset), slice.len) })
    }

    /// # Panics
    /// If `slice` is not live in this arena.
    pub fn bytes(&self, slice: ArenaSlice) -> &[u8] {
        self.get(slice).expect("arena slice is not live")
    }

    /// # Panics
    /// If `slice` is not live in this arena.
    pub fn bytes_mut(&mut self, slice: ArenaSlice) -> &mut [u8] {
        self.get_mut(slice).expect("arena slice is not live")
    }

    /// All live bytes, `[base, cursor)`.
    pub fn live_bytes(&self) -> &[u8] {
        self.get(ArenaSlice {
            offset: 0,
            len: self.cursor,
        })
        .unwrap_or(&[])
    }

    /// Committed bytes above the cursor, `[cursor, committed)`. These always read as zero.
    pub fn spare_committed(&self) -> &[u8] {
        match self.base {
            Some(base) => unsafe {
                std::slice::from_raw_parts(base.as_ptr().add(self.cursor), self.committed - self.cursor)
            },
            None => &[],
        }
    }
}

impl<V: VirtualMemory> Drop for BumpArena<V> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Guard returned by [`BumpArena::scope`]. Everything pushed through it is
/// popped (and zeroed) when the guard drops.
pub struct ArenaScope<'a, V: VirtualMemory = OsVirtualMemory> {
    arena: &'a mut BumpArena<V>,
    mark: usize,
}

impl<'a, V: VirtualMemory> ArenaScope<'a, V> {
    /// Cursor offset the scope rewinds to.
    pub fn mark(&self) -> usize {
        self.mark
    }
}

impl<'a, V: VirtualMemory> Deref for ArenaScope<'a, V> {
    type Target = BumpArena<V>;

    fn deref(&self) -> &Self::Target {
        self.arena
    }
}

impl<'a, V: VirtualMemory> DerefMut for ArenaScope<'a, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.arena
    }
}

impl<'a, V: VirtualMemory> Drop for ArenaScope<'a, V> {
    fn drop(&mut self) {
        // The scope body may already have popped below the mark or destroyed the arena.
        if self.mark <= self.arena.cursor {
            self.arena.pop_to(self.mark);
        }
    }
}
