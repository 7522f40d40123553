use crate::kernel::ioctl::{self, DMA_HEAP_IOCTL_ALLOC, DmaHeapAllocationData};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DMA_HEAP_DIR: &str = "/dev/dma_heap";

/// A handle to a dma-heap character device (`/dev/dma_heap/<name>`).
///
/// The file is wrapped in an `Arc`, so the handle is cheap to clone and share.
#[derive(Clone, Debug)]
pub struct DmaHeap {
    file: Arc<File>,
    path: PathBuf,
}

impl DmaHeap {
    /// Opens a heap by name (`system`, `linux,cma`, ...) or by absolute path.
    ///
    /// # Errors
    /// Returns an error if the heap node cannot be opened (heap not present, permissions).
    pub fn open(name: &str) -> io::Result<Self> {
        let path = if name.starts_with('/') {
            PathBuf::from(name)
        } else {
            Path::new(DMA_HEAP_DIR).join(name)
        };

        let file = OpenOptions::new().read(true).open(&path)?;

        Ok(Self {
            file: Arc::new(file),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates `len` bytes and returns the new dma-buf.
    pub fn alloc(&self, len: u64) -> io::Result<OwnedFd> {
        #[allow(clippy::cast_sign_loss)]
        let mut args = DmaHeapAllocationData {
            len,
            fd: 0,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };

        unsafe {
            ioctl::ioctl(self.file.as_raw_fd(), DMA_HEAP_IOCTL_ALLOC, &raw mut args)?;
        }

        #[allow(clippy::cast_possible_wrap)]
        let raw = args.fd as RawFd;
        // SAFETY: the kernel installed a new fd for us
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }
}
