//! Process-wide allocator with one arena per thread.
//!
//! The instance is created lazily on first use behind a double-checked
//! lock. Each thread's arena lives in a `thread_local!` slot whose
//! destructor is the thread-exit hook. When the slot is unusable (the thread
//! is already tearing its TLS down, or the allocator re-entered itself) a
//! temporary arena serves the call and hands its blocks back at once.

use super::arena::ThreadArena;
use super::scalable::{AllocError, ScalableAllocator, ScalableAllocatorConfig};
use super::stats::MemoryStats;
use crate::sync::cell::{Cell, UnsafeCell};
use crate::sync::{Mutex, OnceLock, lock};
use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};

/// Natural alignment of every block object.
const MIN_ALIGN: usize = 8;

static GLOBAL_SCALABLE_INSTANCE: OnceLock<ScalableAllocator> = OnceLock::new();
static GLOBAL_INIT_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    static GLOBAL_THREAD_ARENA: ArenaSlot = const { ArenaSlot::new() };
}

/// Per-thread slot owning the thread's arena.
///
/// # Safety
///
/// `arena` is wrapped in `UnsafeCell` because it is only ever accessed by the
/// owning thread (via TLS), and `busy` keeps a nested call from aliasing it.
struct ArenaSlot {
    arena: UnsafeCell<Option<ThreadArena<'static>>>,
    busy: Cell<bool>,
}

impl ArenaSlot {
    const fn new() -> Self {
        Self {
            arena: UnsafeCell::new(None),
            busy: Cell::new(false),
        }
    }

    /// Run `f` on this thread's arena, creating it on first use. Returns
    /// `None` if the slot is already in use further up the stack.
    fn with<R>(
        &self,
        allocator: &'static ScalableAllocator,
        f: &impl Fn(&ThreadArena<'static>) -> R,
    ) -> Option<Result<R, AllocError>> {
        if self.busy.replace(true) {
            return None;
        }
        // Safety: single-threaded TLS access; `busy` excludes re-entry.
        let slot = unsafe { &mut *self.arena.get() };
        let result = match slot {
            Some(arena) => Ok(f(arena)),
            None => allocator.thread_arena().map(|arena| f(slot.insert(arena))),
        };
        self.busy.set(false);
        Some(result)
    }
}

pub struct GlobalScalableAllocator;

impl GlobalScalableAllocator {
    /// Initialize the global allocator with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if the allocator is already
    /// initialized or the configuration is rejected.
    pub fn init(config: ScalableAllocatorConfig) -> Result<(), AllocError> {
        let _guard = lock(&GLOBAL_INIT_LOCK);
        if GLOBAL_SCALABLE_INSTANCE.get().is_some() {
            return Err(AllocError::InvalidConfig("global allocator already initialized"));
        }
        let allocator = ScalableAllocator::new(config)?;
        GLOBAL_SCALABLE_INSTANCE
            .set(allocator)
            .map_err(|_| AllocError::InvalidConfig("global allocator already initialized"))
    }

    /// The global instance, created with the default configuration if
    /// [`init`](Self::init) was not called first.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if creating the instance fails.
    pub fn get() -> Result<&'static ScalableAllocator, AllocError> {
        if let Some(allocator) = GLOBAL_SCALABLE_INSTANCE.get() {
            return Ok(allocator);
        }
        let _guard = lock(&GLOBAL_INIT_LOCK);
        if let Some(allocator) = GLOBAL_SCALABLE_INSTANCE.get() {
            return Ok(allocator);
        }
        let allocator = ScalableAllocator::new(ScalableAllocatorConfig::default())?;
        Ok(GLOBAL_SCALABLE_INSTANCE.get_or_init(|| allocator))
    }

    fn with_arena<R>(f: impl Fn(&ThreadArena<'static>) -> R) -> Result<R, AllocError> {
        let allocator = Self::get()?;
        match GLOBAL_THREAD_ARENA.try_with(|slot| slot.with(allocator, &f)) {
            Ok(Some(result)) => result,
            _ => {
                let arena = allocator.thread_arena()?;
                Ok(f(&arena))
            }
        }
    }

    /// # Errors
    ///
    /// See [`ThreadArena::allocate`].
    pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::with_arena(|arena| arena.allocate(size))?
    }

    /// # Errors
    ///
    /// See [`ThreadArena::allocate_zeroed`].
    pub fn allocate_zeroed(count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::with_arena(|arena| arena.allocate_zeroed(count, size))?
    }

    /// # Errors
    ///
    /// See [`ThreadArena::allocate_aligned`].
    pub fn allocate_aligned(size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        Self::with_arena(|arena| arena.allocate_aligned(size, alignment))?
    }

    /// # Errors
    ///
    /// See [`ThreadArena::posix_memalign`].
    pub fn posix_memalign(alignment: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::with_arena(|arena| arena.posix_memalign(alignment, size))?
    }

    /// # Safety
    /// See [`ThreadArena::free`].
    pub unsafe fn free(ptr: Option<NonNull<u8>>) {
        if ptr.is_none() {
            return;
        }
        // Safety: upheld by caller. An error here means the instance could
        // not be created, in which case `ptr` cannot be ours either.
        let _ = Self::with_arena(|arena| unsafe { arena.free(ptr) });
    }

    /// # Errors
    ///
    /// See [`ThreadArena::reallocate`].
    ///
    /// # Safety
    /// See [`ThreadArena::reallocate`].
    pub unsafe fn reallocate(
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        // Safety: upheld by caller.
        Self::with_arena(|arena| unsafe { arena.reallocate(ptr, size) })?
    }

    /// # Errors
    ///
    /// See [`ThreadArena::reallocate_aligned`].
    ///
    /// # Safety
    /// See [`ThreadArena::reallocate_aligned`].
    pub unsafe fn reallocate_aligned(
        ptr: Option<NonNull<u8>>,
        size: usize,
        alignment: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        // Safety: upheld by caller.
        Self::with_arena(|arena| unsafe { arena.reallocate_aligned(ptr, size, alignment) })?
    }

    /// # Safety
    /// See [`ThreadArena::usable_size`].
    pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
        // Safety: upheld by caller.
        Self::with_arena(|arena| unsafe { arena.usable_size(ptr) }).unwrap_or(0)
    }

    /// # Safety
    /// See [`ThreadArena::safer_free`].
    pub unsafe fn safer_free(ptr: Option<NonNull<u8>>, fallback: impl FnOnce(NonNull<u8>)) {
        let Some(p) = ptr else {
            return;
        };
        match Self::get() {
            // Safety: upheld by caller.
            Ok(allocator) if unsafe { allocator.is_owned_by_this_allocator(p) } => {
                // Safety: upheld by caller.
                unsafe { Self::free(ptr) };
            }
            _ => fallback(p),
        }
    }

    /// # Errors
    ///
    /// See [`ThreadArena::safer_reallocate`].
    ///
    /// # Safety
    /// See [`ThreadArena::safer_reallocate`].
    pub unsafe fn safer_reallocate(
        ptr: Option<NonNull<u8>>,
        size: usize,
        fallback: impl FnOnce(NonNull<u8>, usize) -> Option<NonNull<u8>>,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(p) = ptr else {
            return Self::allocate(size).map(Some);
        };
        // Safety: upheld by caller.
        if unsafe { Self::get()?.is_owned_by_this_allocator(p) } {
            // Safety: upheld by caller.
            unsafe { Self::reallocate(ptr, size) }
        } else {
            Ok(fallback(p, size))
        }
    }

    /// Hand the calling thread's blocks back now instead of at thread exit.
    pub fn on_thread_exit() {
        let _ = GLOBAL_THREAD_ARENA.try_with(|slot| {
            if !slot.busy.get() {
                // Safety: single-threaded TLS access, not re-entered.
                drop(unsafe { &mut *slot.arena.get() }.take());
            }
        });
    }

    /// # Errors
    ///
    /// Returns `AllocError` if creating the instance fails.
    pub fn stats() -> Result<MemoryStats, AllocError> {
        Ok(Self::get()?.stats())
    }
}

// Safety: Implementation follows GlobalAlloc contract.
unsafe impl GlobalAlloc for GlobalScalableAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let res = if layout.align() <= MIN_ALIGN {
            GlobalScalableAllocator::allocate(layout.size())
        } else {
            GlobalScalableAllocator::allocate_aligned(layout.size(), layout.align())
        };
        res.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Safety: `ptr` was returned by `alloc` on this allocator.
        unsafe { GlobalScalableAllocator::free(NonNull::new(ptr)) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            return GlobalScalableAllocator::allocate_zeroed(1, layout.size())
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        // Safety: forwarded contract.
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            // Safety: `ptr` has room for `layout.size()` bytes.
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old = NonNull::new(ptr);
        // Safety: `ptr` was returned by `alloc` with `layout`.
        let res = unsafe {
            if layout.align() <= MIN_ALIGN {
                GlobalScalableAllocator::reallocate(old, new_size)
            } else {
                GlobalScalableAllocator::reallocate_aligned(old, new_size, layout.align())
            }
        };
        match res {
            Ok(Some(p)) => p.as_ptr(),
            _ => ptr::null_mut(),
        }
    }
}
