//! The memory binder: produces the memory a BO is bound to, by allocation or by import.

use crate::engine::memory::{Backend, Memory, MemoryType};
use crate::engine::types::Layout;
use crate::error::{HbmError, HbmResult};
use crate::kernel::dma_buf::DmaBuf;
use std::os::fd::{AsFd, OwnedFd};

/// Allocates `layout.size` bytes of memory type `mt`.
pub fn allocate(backend: &dyn Backend, layout: &Layout, mt: MemoryType) -> HbmResult<Memory> {
    let fd = backend.allocate(layout.size, mt)?;
    Ok(Memory::allocated(fd, layout.size, mt))
}

/// Imports `fd` as memory type `mt`.  The fd is consumed even on failure.
pub fn import(
    backend: &dyn Backend,
    layout: &Layout,
    mt: MemoryType,
    fd: OwnedFd,
) -> HbmResult<Memory> {
    let dmabuf = DmaBuf::new(fd);

    let size = dmabuf.size()?;
    if size < layout.size {
        return Err(HbmError::invalid(format!(
            "dma-buf of {size} bytes is smaller than the layout size {}",
            layout.size
        )));
    }

    let compatible = backend.dma_buf_memory_types(dmabuf.as_fd())?;
    if !compatible.contains(&mt) {
        return Err(HbmError::unsupported(format!(
            "dma-buf cannot be bound as {mt:?}"
        )));
    }

    log::debug!("imported a dma-buf of {size} bytes as {mt:?}");
    Ok(Memory::imported(dmabuf, layout.size, mt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::Origin;
    use crate::engine::memory::system::SystemBackend;
    use crate::error::ErrorKind;
    use crate::kernel::memfd;

    const MT: MemoryType = MemoryType::MAPPABLE.union(MemoryType::COHERENT);

    #[test]
    fn allocation_uses_the_layout_size() {
        let backend = SystemBackend::new();
        let mem = allocate(&backend, &Layout::new().size(8192), MT).unwrap();
        assert_eq!(mem.size(), 8192);
        assert_eq!(mem.memory_type(), MT);
        assert_eq!(mem.origin(), Origin::Allocated);
    }

    #[test]
    fn import_checks_the_size() {
        let backend = SystemBackend::new();
        let layout = Layout::new().size(8192);

        let small = memfd::create("hbm-small", 4096).unwrap();
        let err = import(&backend, &layout, MT, small).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Contract);

        let big = memfd::create("hbm-big", 16384).unwrap();
        let mem = import(&backend, &layout, MT, big).unwrap();
        assert_eq!(mem.size(), 8192);
        assert_eq!(mem.origin(), Origin::Imported);
    }

    #[test]
    fn import_checks_the_memory_type() {
        let backend = SystemBackend::new();
        let fd = memfd::create("hbm-import", 4096).unwrap();
        let err = import(&backend, &Layout::new().size(4096), MemoryType::LOCAL, fd).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capability);
    }
}
