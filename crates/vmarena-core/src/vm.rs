//! Virtual memory backend: reserve address space, commit pages on demand,
//! release the whole range in one call.
//!
//! Each target platform gets exactly one implementation of [`VirtualMemory`],
//! selected at build time:
//! - unix: `mmap(PROT_NONE)` to reserve, `mprotect` to commit, `munmap` to release
//! - windows: `VirtualAlloc(MEM_RESERVE)`, `VirtualAlloc(MEM_COMMIT)`, `VirtualFree(MEM_RELEASE)`

use std::io;
use std::ptr::NonNull;

use tracing::warn;

/// Unit in which the arena commits memory. Matches the Windows allocation
/// granularity and is a multiple of the page size on every supported target.
pub const COMMIT_GRANULARITY: usize = 64 * 1024;

/// Round `value` up to the next multiple of `power`, which must be a power of two.
/// Returns `None` on overflow.
#[inline]
pub fn round_up(value: usize, power: usize) -> Option<usize> {
    debug_assert!(power.is_power_of_two());
    let mask = power - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Address-space primitives consumed by [`crate::BumpArena`].
///
/// Implementations report failures as `io::Error`; the arena attaches the
/// offsets and sizes involved.
pub trait VirtualMemory {
    /// Reserve `size` bytes of address space with no physical backing.
    fn reserve(&self, size: usize) -> io::Result<NonNull<u8>>;

    /// Back `[addr, addr + size)` with zeroed, read/write memory.
    ///
    /// # Safety
    /// The range must lie inside a live reservation returned by `reserve` on
    /// this backend, and both `addr` and `size` must be page aligned.
    unsafe fn commit(&self, addr: NonNull<u8>, size: usize) -> io::Result<()>;

    /// Release the whole reservation starting at `base`.
    ///
    /// # Safety
    /// `base` and `size` must describe a reservation returned by `reserve` that
    /// has not been released yet. Every pointer into it becomes dangling.
    unsafe fn release(&self, base: NonNull<u8>, size: usize);

    /// Hint that committed pages in the range hold nothing of interest. The
    /// range stays committed and must read as zero afterwards; a backend that
    /// cannot guarantee that leaves the pages alone.
    ///
    /// # Safety
    /// Same range requirements as [`VirtualMemory::commit`], and the range must
    /// already be committed.
    unsafe fn discard(&self, addr: NonNull<u8>, size: usize) -> io::Result<()>;
}

/// The host operating system's virtual memory API.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsVirtualMemory;

#[cfg(unix)]
impl VirtualMemory for OsVirtualMemory {
    fn reserve(&self, size: usize) -> io::Result<NonNull<u8>> {
        #[cfg(target_os = "linux")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "mmap returned null"))
    }

    unsafe fn commit(&self, addr: NonNull<u8>, size: usize) -> io::Result<()> {
        // Anonymous private pages are zero-filled on first touch.
        let rc = libc::mprotect(
            addr.as_ptr().cast::<libc::c_void>(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) {
        if libc::munmap(base.as_ptr().cast::<libc::c_void>(), size) != 0 {
            let err = io::Error::last_os_error();
            debug_assert!(false, "munmap failed: {err}");
            warn!(base = ?base, size, error = %err, "failed to release reservation");
        }
    }

    unsafe fn discard(&self, addr: NonNull<u8>, size: usize) -> io::Result<()> {
        // MADV_DONTNEED on a private anonymous mapping refaults as zero pages.
        let rc = libc::madvise(
            addr.as_ptr().cast::<libc::c_void>(),
            size,
            libc::MADV_DONTNEED,
        );
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(windows)]
impl VirtualMemory for OsVirtualMemory {
    fn reserve(&self, size: usize) -> io::Result<NonNull<u8>> {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_RESERVE, PAGE_READWRITE};

        let ptr = unsafe { VirtualAlloc(std::ptr::null(), size, MEM_RESERVE, PAGE_READWRITE) };
        NonNull::new(ptr.cast::<u8>()).ok_or_else(io::Error::last_os_error)
    }

    unsafe fn commit(&self, addr: NonNull<u8>, size: usize) -> io::Result<()> {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, PAGE_READWRITE};

        let ptr = VirtualAlloc(
            addr.as_ptr().cast::<core::ffi::c_void>(),
            size,
            MEM_COMMIT,
            PAGE_READWRITE,
        );
        if ptr.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn release(&self, base: NonNull<u8>, _size: usize) {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

        // Size must be zero with MEM_RELEASE.
        if VirtualFree(base.as_ptr().cast::<core::ffi::c_void>(), 0, MEM_RELEASE) == 0 {
            let err = io::Error::last_os_error();
            debug_assert!(false, "VirtualFree failed: {err}");
            warn!(base = ?base, error = %err, "failed to release reservation");
        }
    }

    unsafe fn discard(&self, _addr: NonNull<u8>, _size: usize) -> io::Result<()> {
        // MEM_RESET leaves page contents undefined, so reset pages would not
        // read back as zero.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_to_power_of_two() {
        assert_eq!(round_up(0, 16), Some(0));
        assert_eq!(round_up(1, 16), Some(16));
        assert_eq!(round_up(16, 16), Some(16));
        assert_eq!(round_up(17, 16), Some(32));
        assert_eq!(round_up(10, 1), Some(10));
        assert_eq!(round_up(1, COMMIT_GRANULARITY), Some(COMMIT_GRANULARITY));
        assert_eq!(round_up(usize::MAX, 2), None);
    }

    #[test]
    fn reserve_commit_release() {
        let vm = OsVirtualMemory;
        let size = 4 * COMMIT_GRANULARITY;
        let base = vm.reserve(size).unwrap();
        assert_eq!(base.as_ptr() as usize % 4096, 0);

        unsafe {
            vm.commit(base, COMMIT_GRANULARITY).unwrap();
            let bytes = std::slice::from_raw_parts_mut(base.as_ptr(), COMMIT_GRANULARITY);
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[0] = 7;
            bytes[COMMIT_GRANULARITY - 1] = 9;
            assert_eq!(bytes[0], 7);

            bytes.fill(0);
            vm.discard(base, COMMIT_GRANULARITY).unwrap();
            let bytes = std::slice::from_raw_parts(base.as_ptr(), COMMIT_GRANULARITY);
            assert!(bytes.iter().all(|&b| b == 0));

            vm.release(base, size);
        }
    }

    #[cfg(all(unix, debug_assertions))]
    #[test]
    #[should_panic(expected = "munmap failed")]
    fn release_failure_is_reported() {
        let vm = OsVirtualMemory;
        let base = vm.reserve(COMMIT_GRANULARITY).unwrap();
        // munmap rejects an address that is not page aligned.
        let misaligned = unsafe { NonNull::new_unchecked(base.as_ptr().add(1)) };
        unsafe { vm.release(misaligned, COMMIT_GRANULARITY) };
    }
}
