// Synchronization primitive shim.
//
// Under `cfg(loom)` the atomics, Mutex and cells come from `loom` so the
// public-free protocol can be model checked. Otherwise they come from `std`.
//
// Every module routes its sync primitives through here. A direct
// `use std::sync::atomic::*` in allocator code is invisible to loom's
// scheduler and silently weakens the model.
#![allow(unused_imports, unused_macros)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering, fence};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering, fence};

    // loom has no double-width atomics. The LifoPool top word is therefore
    // never explored by the model; its nodes' links still are.
    pub(crate) use portable_atomic::AtomicU128;
}

// ---------------------------------------------------------------------------
// sync (Mutex, Arc, OnceLock)
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex, MutexGuard};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex, MutexGuard};

// Only the process-wide wrapper uses it, and that wrapper is not modelled.
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in the allocator is a handful of pointer stores,
/// so a poisoned lock never guards half-updated state.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// cell
//
// loom's cells are access-tracked and hand out wrappers rather than raw
// pointers; `Cell<T: Copy>` behaves the same under both.
// ---------------------------------------------------------------------------
pub(crate) mod cell {
    #[cfg(loom)]
    pub(crate) use loom::cell::{Cell, UnsafeCell};

    #[cfg(not(loom))]
    pub(crate) use std::cell::{Cell, UnsafeCell};
}

// ---------------------------------------------------------------------------
// hint
// ---------------------------------------------------------------------------
pub(crate) mod hint {
    #[cfg(loom)]
    pub(crate) use loom::hint::spin_loop;

    #[cfg(not(loom))]
    pub(crate) use std::hint::spin_loop;
}

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{JoinHandle, spawn, yield_now};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{JoinHandle, spawn, yield_now};
}

// ---------------------------------------------------------------------------
// Barrier. Only std tests use it; loom tests keep thread counts at 2–3 and
// rely on the model for interleavings instead.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) mod barrier {
    pub(crate) use std::sync::Barrier;
}
