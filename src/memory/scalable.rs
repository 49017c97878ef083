use super::arena::ThreadArena;
use super::bin::Bin;
use super::block::{BLOCK_SIZE, BlockRef, MALLOC_UNIQUE_ID};
use super::bootstrap::BootstrapAllocator;
use super::large::{is_large_object, large_unique_id};
use super::size_class::NUM_BINS;
use super::stats::MemoryStats;
use super::supply::BlockSupply;
use super::vm::VmError;
use crate::sync::atomic::{AtomicU64, Ordering};
use std::fmt;
use std::ptr::NonNull;

pub(crate) const OS_REQUEST_SIZE: usize = 1024 * 1024;
pub(crate) const BLOCKS_PER_CHUNK: usize = 16;

/// Configuration for `ScalableAllocator`. All fields have sensible defaults.
/// Set at init time via `ScalableAllocator::new()`.
#[derive(Clone, Debug)]
pub struct ScalableAllocatorConfig {
    /// Bytes requested from the OS per block region. Must be a non-zero
    /// multiple of the 16 KiB block size. Default: 1 MiB.
    pub os_request_size: usize,

    /// Blocks per chunk in the free-block pool. A region is pushed as
    /// chunks and blocks are carved from a chunk one at a time, so this
    /// bounds how many blocks one pool pop can reach. Default: 16.
    pub blocks_per_chunk: usize,

    /// Upper bound on bytes mapped from the OS (block regions and large
    /// objects together). Allocations that would exceed it fail with
    /// `AllocError::OutOfMemory`. Default: `None` (unbounded).
    pub memory_limit: Option<usize>,
}

impl Default for ScalableAllocatorConfig {
    fn default() -> Self {
        Self {
            os_request_size: OS_REQUEST_SIZE,
            blocks_per_chunk: BLOCKS_PER_CHUNK,
            memory_limit: None,
        }
    }
}

#[derive(Debug)]
pub enum AllocError {
    /// No memory could be found for a request of `size` bytes.
    OutOfMemory { size: usize },
    /// Alignment is not a power of two.
    InvalidAlignment(usize),
    /// A size computation overflowed `usize`.
    SizeOverflow,
    InvalidConfig(&'static str),
    Vm(VmError),
}

impl AllocError {
    /// C error code for this failure: `EINVAL` for rejected arguments,
    /// `ENOMEM` otherwise.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            AllocError::InvalidAlignment(_) | AllocError::InvalidConfig(_) => libc::EINVAL,
            _ => libc::ENOMEM,
        }
    }

    /// Budget exhaustion is reported as plain out-of-memory; real OS
    /// failures keep their cause.
    pub(crate) fn from_vm(size: usize, e: VmError) -> Self {
        match e {
            VmError::BudgetExhausted { .. } => AllocError::OutOfMemory { size },
            e => AllocError::Vm(e),
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { size } => write!(f, "out of memory allocating {size} bytes"),
            AllocError::InvalidAlignment(align) => {
                write!(f, "alignment {align} is not a power of two")
            }
            AllocError::SizeOverflow => write!(f, "allocation size overflows usize"),
            AllocError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            AllocError::Vm(e) => write!(f, "virtual memory error: {e}"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::Vm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VmError> for AllocError {
    fn from(e: VmError) -> Self {
        AllocError::Vm(e)
    }
}

/// Process-wide allocator context.
///
/// Owns every OS mapping made on its behalf; dropping it releases them all,
/// so every [`ThreadArena`] borrows it and must be gone first.
pub struct ScalableAllocator {
    supply: BlockSupply,
    bootstrap: BootstrapAllocator,
    next_arena_id: AtomicU64,
}

impl ScalableAllocator {
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if `os_request_size` is not a
    /// non-zero multiple of the block size or `blocks_per_chunk` is zero.
    pub fn new(config: ScalableAllocatorConfig) -> Result<Self, AllocError> {
        if config.os_request_size == 0 || !config.os_request_size.is_multiple_of(BLOCK_SIZE) {
            return Err(AllocError::InvalidConfig(
                "os_request_size must be a non-zero multiple of the block size",
            ));
        }
        if config.blocks_per_chunk == 0 {
            return Err(AllocError::InvalidConfig("blocks_per_chunk must be at least 1"));
        }
        Ok(Self {
            supply: BlockSupply::new(
                config.os_request_size,
                config.blocks_per_chunk,
                config.memory_limit,
            ),
            bootstrap: BootstrapAllocator::new(std::mem::size_of::<[Bin; NUM_BINS]>()),
            next_arena_id: AtomicU64::new(1),
        })
    }

    /// Create the calling thread's arena. Dropping it (or calling
    /// [`ThreadArena::exit`]) hands its blocks back.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if the bin array cannot be allocated.
    pub fn thread_arena(&self) -> Result<ThreadArena<'_>, AllocError> {
        ThreadArena::new(self)
    }

    /// Whether `ptr` carries the tag this allocator writes into every block
    /// and large object header. The tag is shared by all instances in the
    /// process.
    ///
    /// # Safety
    /// The memory the check reads must be mapped: the start of the 16 KiB
    /// aligned region containing `ptr` for small pointers, or the 32 bytes
    /// before `ptr` for 16 KiB aligned ones.
    pub unsafe fn is_owned_by_this_allocator(&self, ptr: NonNull<u8>) -> bool {
        let id = if is_large_object(ptr) {
            // Safety: upheld by caller.
            unsafe { large_unique_id(ptr) }
        } else {
            // Safety: upheld by caller.
            unsafe { BlockRef::containing(ptr) }.unique_id()
        };
        id == MALLOC_UNIQUE_ID
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.supply.counters.snapshot()
    }

    /// Bytes currently mapped from the OS, as counted against `memory_limit`.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.supply.mapped_bytes()
    }

    pub(crate) fn supply(&self) -> &BlockSupply {
        &self.supply
    }

    pub(crate) fn bootstrap(&self) -> &BootstrapAllocator {
        &self.bootstrap
    }

    /// Arena ids start at 1; 0 marks unowned blocks. Ids are 64-bit so the
    /// counter never wraps onto the id of a live arena, temporary arenas
    /// included.
    pub(crate) fn next_arena_id(&self) -> u64 {
        self.next_arena_id.fetch_add(1, Ordering::Relaxed)
    }
}
