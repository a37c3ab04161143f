//! Backing-memory allocation for buffer pools
//!
//! The hardware allocator (ION / DMA heaps) sits behind the [`BufferAllocator`]
//! trait so the pool logic is independent of where plane memory comes from.
//! Heap and memory-mapped allocators cover the in-process cases; reserved
//! hardware memory is modelled by allocators that can fail transiently.

use bytes::BytesMut;
use memmap2::MmapMut;

/// One plane of backing memory for a buffer slot.
pub enum PlaneMemory {
    Heap(BytesMut),
    Mapped(MmapMut),
}

impl PlaneMemory {
    pub fn len(&self) -> usize {
        match self {
            PlaneMemory::Heap(b) => b.len(),
            PlaneMemory::Mapped(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PlaneMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaneMemory::Heap(b) => write!(f, "PlaneMemory::Heap({} bytes)", b.len()),
            PlaneMemory::Mapped(m) => write!(f, "PlaneMemory::Mapped({} bytes)", m.len()),
        }
    }
}

/// Why a plane allocation failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AllocError {
    /// Reserved/contiguous memory is momentarily unavailable. Worth retrying:
    /// availability is contended across camera instances.
    #[error("backing memory transiently unavailable")]
    Transient,
    /// Permanent failure; retrying will not help.
    #[error("allocation failed: {0}")]
    Fatal(String),
}

/// Source of backing memory for one pool.
pub trait BufferAllocator: Send + Sync {
    fn alloc_plane(&self, size: usize) -> Result<PlaneMemory, AllocError>;
}

/// Plain heap allocation, zero-initialized.
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn alloc_plane(&self, size: usize) -> Result<PlaneMemory, AllocError> {
        Ok(PlaneMemory::Heap(BytesMut::zeroed(size)))
    }
}

/// Anonymous memory mapping, for pools that hand planes to mmap-consuming
/// collaborators.
pub struct MappedAllocator;

impl BufferAllocator for MappedAllocator {
    fn alloc_plane(&self, size: usize) -> Result<PlaneMemory, AllocError> {
        MmapMut::map_anon(size)
            .map(PlaneMemory::Mapped)
            .map_err(|e| AllocError::Fatal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_plane_is_zeroed_and_sized() {
        let plane = HeapAllocator.alloc_plane(4096).unwrap();
        assert_eq!(plane.len(), 4096);
        match plane {
            PlaneMemory::Heap(b) => assert!(b.iter().all(|&x| x == 0)),
            _ => panic!("expected heap plane"),
        }
    }

    #[test]
    fn mapped_plane_has_requested_size() {
        let plane = MappedAllocator.alloc_plane(8192).unwrap();
        assert_eq!(plane.len(), 8192);
    }
}
