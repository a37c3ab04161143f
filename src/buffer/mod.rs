pub mod alloc;
pub mod manager;

pub use alloc::{AllocError, BufferAllocator, HeapAllocator, MappedAllocator, PlaneMemory};
pub use manager::{AllocMode, Buffer, BufferManager, PoolConfig, PoolType, META_PLANE_SIZE};
