pub mod heap;
pub mod system;

use crate::engine::copy::{self, CopyJob};
use crate::engine::types::{Flags, Usage};
use crate::error::{HbmError, HbmResult};
use crate::kernel::dma_buf::{DmaBuf, Mapping};
use crate::kernel::ioctl::{
    DMA_BUF_SYNC_END, DMA_BUF_SYNC_READ, DMA_BUF_SYNC_START, DMA_BUF_SYNC_WRITE,
};
use crate::kernel::sync_file::SyncFile;
use std::fmt;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

bitflags::bitflags! {
    /// Placement and caching properties of a memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryType: u32 {
        /// The memory is local to the device.
        const LOCAL = 1 << 0;
        /// The memory is mappable.
        const MAPPABLE = 1 << 1;
        /// The memory is coherent.
        const COHERENT = 1 << 2;
        /// The memory is cached.
        const CACHED = 1 << 3;
    }
}

/// An allocator backend.
///
/// A backend reserves memory, tells which memory types an external dma-buf can be bound as, and
/// executes copies.  It never sees BOs, only memories and validated copy jobs.
pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Memory types the backend can allocate, in preference order.
    fn memory_types(&self) -> &[MemoryType];

    fn supports_protected(&self) -> bool {
        false
    }

    /// Allocates exactly `size` bytes of memory of type `mt`.
    fn allocate(&self, size: u64, mt: MemoryType) -> HbmResult<OwnedFd>;

    /// Memory types an imported dma-buf can be bound as.
    fn dma_buf_memory_types(&self, _dmabuf: BorrowedFd<'_>) -> HbmResult<Vec<MemoryType>> {
        Ok(self.memory_types().to_vec())
    }

    /// Whether [`Backend::copy`] can return before the copy completes.
    ///
    /// Fences returned by a backend without async copies are waited on before the copy returns.
    fn supports_async_copy(&self) -> bool {
        false
    }

    /// Executes or enqueues a validated copy once `wait` (if any) signals.
    ///
    /// Returns `Some(fence)` when the copy is still in flight; the fence signals on completion.
    /// The default runs the copy on the CPU and returns `None`.
    fn copy(&self, job: &CopyJob<'_>, wait: Option<SyncFile>) -> HbmResult<Option<SyncFile>> {
        copy::cpu_copy(job, wait)?;
        Ok(None)
    }
}

/// Computes the memory types a BO may be bound to, in backend preference order.
#[must_use]
pub fn compatible_memory_types(
    candidates: &[MemoryType],
    flags: Flags,
    usage: Usage,
    needs_local: bool,
) -> Vec<MemoryType> {
    candidates
        .iter()
        .copied()
        .filter(|mt| {
            if flags.contains(Flags::MAP) && !mt.contains(MemoryType::MAPPABLE) {
                return false;
            }
            if flags.contains(Flags::PROTECTED) && mt.contains(MemoryType::MAPPABLE) {
                return false;
            }
            if needs_local && !mt.contains(MemoryType::LOCAL) {
                return false;
            }
            // display engines do not snoop CPU caches
            if usage.contains(Usage::GPU_SCANOUT_HACK)
                && mt.contains(MemoryType::CACHED)
                && !mt.contains(MemoryType::COHERENT)
            {
                return false;
            }
            true
        })
        .collect()
}

/// How a memory came to be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Allocated,
    Imported,
}

/// A memory bound to a BO.
///
/// The memory owns its dma-buf fd.  Dropping it closes the fd, which frees allocated memory and
/// drops this process's reference to imported memory.
#[derive(Debug)]
pub struct Memory {
    dmabuf: DmaBuf,
    size: u64,
    mt: MemoryType,
    origin: Origin,
    mapping: Option<Mapping>,
}

impl Memory {
    pub(crate) fn allocated(fd: OwnedFd, size: u64, mt: MemoryType) -> Self {
        Self {
            dmabuf: DmaBuf::new(fd),
            size,
            mt,
            origin: Origin::Allocated,
            mapping: None,
        }
    }

    pub(crate) fn imported(dmabuf: DmaBuf, size: u64, mt: MemoryType) -> Self {
        Self {
            dmabuf,
            size,
            mt,
            origin: Origin::Imported,
            mapping: None,
        }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn memory_type(&self) -> MemoryType {
        self.mt
    }

    #[must_use]
    pub const fn origin(&self) -> Origin {
        self.origin
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Creates a mapping of the whole memory, independent of the BO mapping.
    pub(crate) fn map_transient(&self, writable: bool) -> HbmResult<Mapping> {
        let len = self.map_len()?;
        Ok(self.dmabuf.map(len, writable)?)
    }

    pub(crate) fn map(&mut self) -> HbmResult<*mut u8> {
        if let Some(mapping) = &self.mapping {
            return Ok(mapping.as_ptr());
        }
        let mapping = self.map_transient(true)?;
        let ptr = mapping.as_ptr();
        self.mapping = Some(mapping);
        Ok(ptr)
    }

    pub(crate) fn unmap(&mut self) {
        self.mapping = None;
    }

    pub(crate) fn flush(&self) -> HbmResult<()> {
        if self.mt.contains(MemoryType::COHERENT) {
            return Ok(());
        }
        self.dmabuf.sync(DMA_BUF_SYNC_END | DMA_BUF_SYNC_WRITE)?;
        Ok(())
    }

    pub(crate) fn invalidate(&self) -> HbmResult<()> {
        if self.mt.contains(MemoryType::COHERENT) {
            return Ok(());
        }
        self.dmabuf.sync(DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ)?;
        Ok(())
    }

    /// Brackets CPU access to the memory.  Cache maintenance for the access ends when the
    /// returned guard is dropped.
    pub(crate) fn begin_cpu_access(&self, write: bool) -> HbmResult<CpuAccess<'_>> {
        let rw = if write {
            DMA_BUF_SYNC_WRITE
        } else {
            DMA_BUF_SYNC_READ
        };
        let coherent = self.mt.contains(MemoryType::COHERENT);
        if !coherent {
            self.dmabuf.sync(DMA_BUF_SYNC_START | rw)?;
        }
        Ok(CpuAccess {
            memory: self,
            flags: if coherent { 0 } else { DMA_BUF_SYNC_END | rw },
        })
    }

    pub(crate) fn export(&self, name: Option<&str>) -> HbmResult<OwnedFd> {
        if let Some(name) = name
            && let Err(e) = self.dmabuf.set_name(name)
        {
            log::warn!("failed to name dma-buf {name:?}: {e}");
        }
        Ok(self.dmabuf.try_clone_fd()?)
    }

    fn map_len(&self) -> HbmResult<NonZeroUsize> {
        let len = usize::try_from(self.size)
            .map_err(|_| HbmError::unsupported("memory is larger than the address space"))?;
        NonZeroUsize::new(len).ok_or_else(|| HbmError::invalid("cannot map an empty memory"))
    }
}

/// An open CPU access window of a [`Memory`].
pub(crate) struct CpuAccess<'a> {
    memory: &'a Memory,
    flags: u64,
}

impl Drop for CpuAccess<'_> {
    fn drop(&mut self) {
        if self.flags == 0 {
            return;
        }
        if let Err(e) = self.memory.dmabuf.sync(self.flags) {
            log::warn!("failed to end CPU access: {e}");
        }
    }
}

impl AsFd for Memory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.dmabuf.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CACHED: MemoryType = MemoryType::MAPPABLE
        .union(MemoryType::COHERENT)
        .union(MemoryType::CACHED);
    const WC: MemoryType = MemoryType::MAPPABLE.union(MemoryType::COHERENT);
    const VRAM: MemoryType = MemoryType::LOCAL;
    const NONCOHERENT: MemoryType = MemoryType::MAPPABLE.union(MemoryType::CACHED);

    #[test]
    fn map_flag_requires_mappable() {
        let mts = compatible_memory_types(&[VRAM, CACHED, WC], Flags::MAP, Usage::GPU_TRANSFER, false);
        assert_eq!(mts, vec![CACHED, WC]);
    }

    #[test]
    fn protected_excludes_mappable() {
        let mts = compatible_memory_types(&[CACHED, VRAM], Flags::PROTECTED, Usage::GPU_SAMPLED, false);
        assert_eq!(mts, vec![VRAM]);
    }

    #[test]
    fn tiling_can_require_local_memory() {
        let mts = compatible_memory_types(&[CACHED, VRAM], Flags::empty(), Usage::GPU_SAMPLED, true);
        assert_eq!(mts, vec![VRAM]);
    }

    #[test]
    fn scanout_avoids_non_coherent_cached_memory() {
        let mts = compatible_memory_types(
            &[NONCOHERENT, CACHED],
            Flags::empty(),
            Usage::GPU_SCANOUT_HACK,
            false,
        );
        assert_eq!(mts, vec![CACHED]);
    }

    #[test]
    fn preference_order_is_kept() {
        let mts = compatible_memory_types(&[WC, CACHED], Flags::empty(), Usage::GPU_TRANSFER, false);
        assert_eq!(mts, vec![WC, CACHED]);
    }
}
