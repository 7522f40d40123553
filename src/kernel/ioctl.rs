use crate::utils::{iow, iowr};

// ===============================================================================================
// dma-buf
// ===============================================================================================

pub const DMA_BUF_BASE: u32 = b'b' as u32;

pub const DMA_BUF_SYNC_READ: u64 = 1 << 0;
pub const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
pub const DMA_BUF_SYNC_START: u64 = 0 << 2;
pub const DMA_BUF_SYNC_END: u64 = 1 << 2;

/// Longest name accepted by `DMA_BUF_SET_NAME`, including the terminator.
pub const DMA_BUF_NAME_LEN: usize = 32;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DmaBufSync {
    pub flags: u64,
}

pub const DMA_BUF_IOCTL_SYNC: u32 = iow::<DmaBufSync>(DMA_BUF_BASE, 0);
pub const DMA_BUF_SET_NAME: u32 = iow::<u64>(DMA_BUF_BASE, 1);

// ===============================================================================================
// dma-heap
// ===============================================================================================

pub const DMA_HEAP_IOC_MAGIC: u32 = b'H' as u32;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DmaHeapAllocationData {
    pub len: u64,
    pub fd: u32,
    pub fd_flags: u32,
    pub heap_flags: u64,
}

const _: () = assert!(std::mem::size_of::<DmaHeapAllocationData>() == 24);

pub const DMA_HEAP_IOCTL_ALLOC: u32 = iowr::<DmaHeapAllocationData>(DMA_HEAP_IOC_MAGIC, 0);

/// Issues an ioctl on `fd`.
///
/// # Safety
/// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
pub unsafe fn ioctl<T>(fd: std::os::fd::RawFd, cmd: u32, arg: *mut T) -> std::io::Result<()> {
    loop {
        let ret = unsafe { libc::ioctl(fd, cmd as _, arg) };
        if ret >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if !matches!(err.raw_os_error(), Some(libc::EINTR | libc::EAGAIN)) {
            return Err(err);
        }
    }
}
