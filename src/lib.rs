#[cfg(not(target_pointer_width = "64"))]
compile_error!("scalable-alloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: implementation details stay pub(crate)
pub mod memory;

// allocator/arenas
pub use memory::arena::ThreadArena;
#[cfg(not(loom))]
pub use memory::global::GlobalScalableAllocator;
pub use memory::scalable::{ScalableAllocator, ScalableAllocatorConfig};
pub use memory::size_class::MIN_LARGE_OBJECT_SIZE;

// stats
pub use memory::stats::MemoryStats;

// errors
pub use memory::scalable::AllocError;
pub use memory::vm::VmError;
