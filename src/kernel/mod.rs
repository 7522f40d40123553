//! Thin wrappers over the kernel interfaces HBM relies on: dma-buf, dma-heap, memfd, sync files,
//! and DRM device lookup in sysfs.

pub mod dma_buf;
pub mod dma_heap;
pub mod ioctl;
pub mod memfd;
pub mod sync_file;
pub mod sysfs;
