use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    AcquireFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    /// The configured `memory_limit` would be exceeded.
    BudgetExhausted { requested: usize, limit: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::AcquireFailed(e) => write!(f, "VM acquire failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::BudgetExhausted { requested, limit } => write!(
                f,
                "memory budget exhausted: {requested} more bytes would exceed limit {limit}"
            ),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::AcquireFailed(e) | VmError::ReleaseFailed(e) => Some(e),
            VmError::BudgetExhausted { .. } => None,
        }
    }
}

/// Narrow interface to the OS memory source.
///
/// The allocator only ever asks for readable/writable anonymous memory and
/// gives it back whole; it never decommits or remaps parts of a range.
pub(crate) trait VmOps {
    /// Map `size` bytes of zero-filled read/write memory.
    /// The result is at least page-aligned.
    unsafe fn acquire(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Unmap a range previously returned by [`acquire`](VmOps::acquire)
    /// with the same `size`.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn acquire(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::AcquireFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::AcquireFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use std::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed implementation for loom, Miri and non-unix hosts.
//
// Loom needs the synchronization logic, not real page faults; Miri cannot
// execute mmap. Both get page-aligned, zeroed heap memory instead.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn acquire(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::AcquireFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size acquire",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::AcquireFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::AcquireFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `acquire`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_write_release() {
        let size = PlatformVmOps::page_size() * 4;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::acquire(size).expect("acquire failed");
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0), "fresh memory must be zeroed");
            slice[0] = 42;
            slice[size - 1] = 7;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 7);
            PlatformVmOps::release(ptr, size).expect("release failed");
        }
    }

    #[test]
    fn test_acquire_zero_size_fails() {
        // Safety: Test code.
        let res = unsafe { PlatformVmOps::acquire(0) };
        assert!(res.is_err());
    }

    #[test]
    fn test_acquire_is_page_aligned() {
        let page = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::acquire(page * 3).unwrap();
            assert_eq!(ptr.as_ptr() as usize % page, 0);
            PlatformVmOps::release(ptr, page * 3).unwrap();
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let page = PlatformVmOps::page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 4096);
    }

    #[test]
    fn test_multiple_acquisitions_disjoint() {
        let size = 64 * 1024;
        // Safety: Test code.
        unsafe {
            let a = PlatformVmOps::acquire(size).unwrap();
            let b = PlatformVmOps::acquire(size).unwrap();
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            assert!(lo.as_ptr() as usize + size <= hi.as_ptr() as usize);
            PlatformVmOps::release(a, size).unwrap();
            PlatformVmOps::release(b, size).unwrap();
        }
    }

    #[test]
    fn test_budget_error_display() {
        let e = VmError::BudgetExhausted {
            requested: 10,
            limit: 5,
        };
        let msg = e.to_string();
        assert!(msg.contains("10") && msg.contains('5'));
        assert!(std::error::Error::source(&e).is_none());
    }
}
