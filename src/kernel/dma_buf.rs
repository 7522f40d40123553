use crate::kernel::ioctl::{
    self, DMA_BUF_IOCTL_SYNC, DMA_BUF_NAME_LEN, DMA_BUF_SET_NAME, DmaBufSync,
};
use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

/// A CPU mapping of a dma-buf (or any mmap-able fd).
///
/// The mapping is removed when this value is dropped.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: NonZeroUsize,
}

// The mapping is plain shared memory; synchronization of the contents is the caller's business.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Maps `len` bytes of `fd` starting at offset 0.
    pub fn new(fd: BorrowedFd<'_>, len: NonZeroUsize, writable: bool) -> io::Result<Self> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };

        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len.get(),
                prot,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(ret.cast::<u8>()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "mmap returned a null address")
        })?;

        Ok(Self { ptr, len })
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len.get()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len.get()) };
        if ret != 0 {
            log::warn!(
                "munmap of {} bytes at {:p} failed: {}",
                self.len,
                self.ptr,
                io::Error::last_os_error()
            );
        }
    }
}

/// Returns the size of the memory behind a dma-buf (or memfd) by seeking to its end.
///
/// The file position is reset to 0 afterwards.
pub fn fd_size(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let raw = fd.as_raw_fd();
    let end = unsafe { libc::lseek(raw, 0, libc::SEEK_END) };
    if end < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::lseek(raw, 0, libc::SEEK_SET) } < 0 {
        return Err(io::Error::last_os_error());
    }

    u64::try_from(end).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative size"))
}

/// An owned dma-buf file descriptor.
///
/// Memory allocated by the system backend is a memfd rather than a real dma-buf; every operation
/// here works on both, except the dma-buf specific ioctls which report `ENOTTY` on a memfd.
#[derive(Debug)]
pub struct DmaBuf {
    fd: OwnedFd,
}

impl DmaBuf {
    #[must_use]
    pub const fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Returns the size of the underlying memory in bytes.
    pub fn size(&self) -> io::Result<u64> {
        fd_size(self.fd.as_fd())
    }

    /// Duplicates the fd.  The new fd refers to the same memory.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    /// Sets the debug name shown in `/proc/<pid>/fdinfo` and debugfs.
    pub fn set_name(&self, name: &str) -> io::Result<()> {
        let mut name = name.as_bytes().to_vec();
        name.truncate(DMA_BUF_NAME_LEN - 1);
        let name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains a NUL"))?;

        unsafe {
            ioctl::ioctl(
                self.fd.as_raw_fd(),
                DMA_BUF_SET_NAME,
                name.as_ptr().cast_mut(),
            )
        }
    }

    /// Brackets CPU access for cache maintenance.  `flags` is a combination of `DMA_BUF_SYNC_*`.
    pub fn sync(&self, flags: u64) -> io::Result<()> {
        let mut args = DmaBufSync { flags };
        unsafe { ioctl::ioctl(self.fd.as_raw_fd(), DMA_BUF_IOCTL_SYNC, &raw mut args) }
    }

    pub fn map(&self, len: NonZeroUsize, writable: bool) -> io::Result<Mapping> {
        Mapping::new(self.fd.as_fd(), len, writable)
    }
}

impl AsFd for DmaBuf {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for DmaBuf {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<OwnedFd> for DmaBuf {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memfd;

    #[test]
    fn size_reports_memfd_length() {
        let fd = memfd::create("hbm-test", 8192).unwrap();
        let buf = DmaBuf::new(fd);
        assert_eq!(buf.size().unwrap(), 8192);
        // the second query must not be affected by the file offset
        assert_eq!(buf.size().unwrap(), 8192);
    }

    #[test]
    fn clones_share_memory() {
        let buf = DmaBuf::new(memfd::create("hbm-test", 4096).unwrap());
        let other = DmaBuf::new(buf.try_clone_fd().unwrap());
        let len = NonZeroUsize::new(4096).unwrap();

        let a = buf.map(len, true).unwrap();
        let b = other.map(len, false).unwrap();
        unsafe {
            a.as_ptr().add(100).write(0x5a);
            assert_eq!(b.as_ptr().add(100).read(), 0x5a);
        }
    }

    #[test]
    fn dma_buf_ioctls_fail_on_memfd() {
        let buf = DmaBuf::new(memfd::create("hbm-test", 4096).unwrap());
        assert!(buf.set_name("scanout").is_err());
        assert!(buf.sync(crate::kernel::ioctl::DMA_BUF_SYNC_START).is_err());
    }
}
