use crate::engine::memory::{Backend, MemoryType};
use crate::error::{HbmError, HbmResult};
use crate::kernel::dma_heap::DmaHeap;
use std::os::fd::{BorrowedFd, OwnedFd};

const HEAP_MEMORY_TYPES: &[MemoryType] = &[MemoryType::MAPPABLE.union(MemoryType::CACHED)];

/// Allocates from a dma-heap such as `/dev/dma_heap/system`.
///
/// Heap memory is cached but not coherent: CPU access is bracketed by `DMA_BUF_IOCTL_SYNC`.
#[derive(Debug, Clone)]
pub struct DmaHeapBackend {
    heap: DmaHeap,
}

impl DmaHeapBackend {
    /// Opens the heap by name or absolute path.
    pub fn open(name: &str) -> HbmResult<Self> {
        let heap = DmaHeap::open(name).map_err(|e| {
            HbmError::Backend(format!("failed to open dma-heap {name:?}: {e}"))
        })?;
        log::info!("using dma-heap {}", heap.path().display());
        Ok(Self { heap })
    }
}

impl Backend for DmaHeapBackend {
    fn name(&self) -> &'static str {
        "dma-heap"
    }

    fn memory_types(&self) -> &[MemoryType] {
        HEAP_MEMORY_TYPES
    }

    fn allocate(&self, size: u64, mt: MemoryType) -> HbmResult<OwnedFd> {
        if !HEAP_MEMORY_TYPES.contains(&mt) {
            return Err(HbmError::unsupported(format!("dma-heap has no type {mt:?}")));
        }
        // heaps round up to pages; the BO only ever uses `size` bytes
        let fd = self.heap.alloc(size)?;
        log::debug!("allocated {size} bytes from {}", self.heap.path().display());
        Ok(fd)
    }

    fn dma_buf_memory_types(&self, _dmabuf: BorrowedFd<'_>) -> HbmResult<Vec<MemoryType>> {
        // a foreign dma-buf may be coherent or not; treat it as the least capable type
        Ok(HEAP_MEMORY_TYPES.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_heap_is_a_backend_error() {
        let err = DmaHeapBackend::open("/nonexistent/hbm-heap").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Backend);
    }
}
