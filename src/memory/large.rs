//! Large objects: one OS mapping per object.
//!
//! ```text
//!   base                      ptr (aligned, >= BLOCK_SIZE)
//!   | slack ... | LargeObjectHeader | user bytes ...        | base + len
//! ```
//!
//! Because a large object pointer is always `BLOCK_SIZE`-aligned and a block
//! object never is (the header occupies the start of every block), the
//! pointer alone tells the two paths apart.

use super::block::{BLOCK_SIZE, MALLOC_UNIQUE_ID};
use super::supply::BlockSupply;
use super::vm::VmError;
use std::ptr::NonNull;

#[repr(C)]
struct LargeObjectHeader {
    /// Start and length of the whole mapping.
    base: usize,
    len: usize,
    /// Bytes the caller asked for.
    object_size: usize,
    unique_id: u64,
}

const LARGE_HEADER_SIZE: usize = std::mem::size_of::<LargeObjectHeader>();

#[inline]
pub(crate) fn is_large_object(ptr: NonNull<u8>) -> bool {
    (ptr.as_ptr() as usize).is_multiple_of(BLOCK_SIZE)
}

#[inline]
fn header_of(ptr: NonNull<u8>) -> *mut LargeObjectHeader {
    (ptr.as_ptr() as usize - LARGE_HEADER_SIZE) as *mut LargeObjectHeader
}

/// Map a new large object. `alignment` must be a power of two no smaller
/// than `BLOCK_SIZE`. Returns `None` in the error position when the request
/// overflows.
pub(crate) fn allocate_large(
    supply: &BlockSupply,
    size: usize,
    alignment: usize,
) -> Result<Option<NonNull<u8>>, VmError> {
    debug_assert!(alignment.is_power_of_two() && alignment >= BLOCK_SIZE);
    let Some(len) = size
        .checked_add(alignment)
        .and_then(|n| n.checked_add(LARGE_HEADER_SIZE))
    else {
        return Ok(None);
    };
    let base = match supply.map(len) {
        Ok(base) => base.as_ptr() as usize,
        Err(e) => {
            #[cfg(debug_assertions)]
            if matches!(e, VmError::BudgetExhausted { .. }) {
                eprintln!("[memory] large object of {size} bytes exceeds the memory budget");
            }
            return Err(e);
        }
    };
    let aligned = (base + LARGE_HEADER_SIZE + alignment - 1) & !(alignment - 1);
    debug_assert!(aligned + size <= base + len);
    // Safety: `aligned` is inside a fresh mapping of `len` bytes.
    let ptr = unsafe { NonNull::new_unchecked(aligned as *mut u8) };
    // Safety: the header slot lies between `base` and `aligned`.
    unsafe {
        header_of(ptr).write(LargeObjectHeader {
            base,
            len,
            object_size: size,
            unique_id: MALLOC_UNIQUE_ID,
        });
    }
    supply.counters.large_mapped.add(len);
    Ok(Some(ptr))
}

/// # Safety
/// `ptr` must be a live large object from this supply.
pub(crate) unsafe fn free_large(supply: &BlockSupply, ptr: NonNull<u8>) {
    let header = header_of(ptr);
    // Safety: upheld by caller.
    let (base, len) = unsafe {
        debug_assert_eq!((*header).unique_id, MALLOC_UNIQUE_ID, "not a large object");
        (*header).unique_id = 0;
        ((*header).base, (*header).len)
    };
    // Safety: `base`/`len` describe the mapping made in `allocate_large`.
    let res = unsafe { supply.unmap(NonNull::new_unchecked(base as *mut u8), len) };
    debug_assert!(res.is_ok(), "large object release failed");
    supply.counters.large_mapped.sub(len);
}

/// Bytes available from `ptr` to the end of its mapping.
///
/// # Safety
/// `ptr` must be a live large object.
pub(crate) unsafe fn large_capacity(ptr: NonNull<u8>) -> usize {
    let header = header_of(ptr);
    // Safety: upheld by caller.
    let (base, len, object_size) = unsafe { ((*header).base, (*header).len, (*header).object_size) };
    let capacity = base + len - ptr.as_ptr() as usize;
    debug_assert!(capacity >= object_size);
    capacity
}

/// Bytes last requested for the object at `ptr`.
///
/// # Safety
/// `ptr` must be a live large object.
pub(crate) unsafe fn large_object_size(ptr: NonNull<u8>) -> usize {
    // Safety: upheld by caller.
    unsafe { (*header_of(ptr)).object_size }
}

/// Record a new requested size after an in-place reallocation.
///
/// # Safety
/// `ptr` must be a live large object and `size` within its capacity.
pub(crate) unsafe fn set_large_object_size(ptr: NonNull<u8>, size: usize) {
    // Safety: upheld by caller.
    unsafe { (*header_of(ptr)).object_size = size };
}

/// # Safety
/// The `LARGE_HEADER_SIZE` bytes before `ptr` must be readable.
pub(crate) unsafe fn large_unique_id(ptr: NonNull<u8>) -> u64 {
    // Safety: upheld by caller.
    unsafe { (*header_of(ptr)).unique_id }
}
