//! The copy engine: validation of copy requests, fence plumbing, and the CPU executor used by the
//! memfd and dma-heap backends.

use crate::engine::bo::Bo;
use crate::engine::device::DeviceShared;
use crate::engine::formats::{self, Format};
use crate::engine::memory::Memory;
use crate::engine::types::{CopyBuffer, CopyBufferImage, Extent, Flags, Layout};
use crate::error::{HbmError, HbmResult};
use crate::kernel::sync_file::SyncFile;
use std::ptr;
use std::sync::Arc;

/// Whether the caller wants an out-fence for a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceRequest {
    /// The copy must be complete when the call returns.
    None,
    /// The copy may still be in flight when the call returns.
    Requested,
}

/// How a successful copy completes.
#[derive(Debug)]
pub enum CopyFence {
    /// No fence was requested; the copy is complete.
    NotRequested,
    /// A fence was requested but the backend copied synchronously; the copy is complete.
    Synchronous,
    /// The copy completes when the sync file signals.
    Pending(SyncFile),
}

impl CopyFence {
    #[must_use]
    pub fn into_sync_file(self) -> Option<SyncFile> {
        match self {
            Self::Pending(fence) => Some(fence),
            Self::NotRequested | Self::Synchronous => None,
        }
    }
}

/// The image side of a buffer-image copy.
#[derive(Debug, Clone, Copy)]
pub struct ImageRef<'a> {
    pub memory: &'a Memory,
    pub layout: &'a Layout,
    pub format: Format,
}

/// A validated copy handed to a backend.
#[derive(Debug, Clone, Copy)]
pub enum CopyJob<'a> {
    Buffer {
        dst: &'a Memory,
        src: &'a Memory,
        region: CopyBuffer,
    },
    BufferToImage {
        dst: ImageRef<'a>,
        src: &'a Memory,
        region: CopyBufferImage,
    },
    ImageToBuffer {
        dst: &'a Memory,
        src: ImageRef<'a>,
        region: CopyBufferImage,
    },
}

impl CopyJob<'_> {
    /// Returns the `(src, dst)` memories.
    #[must_use]
    pub const fn memories(&self) -> (&Memory, &Memory) {
        match self {
            Self::Buffer { dst, src, .. } => (*src, *dst),
            Self::BufferToImage { dst, src, .. } => (*src, dst.memory),
            Self::ImageToBuffer { dst, src, .. } => (src.memory, *dst),
        }
    }
}

/// One contiguous run of bytes to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    src: u64,
    dst: u64,
    len: u64,
}

/// A contiguous run of a buffer-image copy, seen from the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    image: u64,
    buffer: u64,
    len: u64,
}

fn overflow() -> HbmError {
    HbmError::invalid("copy region overflows")
}

fn image_spans(image: &ImageRef<'_>, region: &CopyBufferImage) -> HbmResult<Vec<Span>> {
    let info = formats::modifier_info(image.layout.modifier).ok_or_else(|| {
        HbmError::unsupported(format!("unknown modifier {}", image.layout.modifier))
    })?;
    if info.compressed {
        return Err(HbmError::unsupported(format!(
            "CPU copies of {} images",
            image.layout.modifier
        )));
    }
    let bpp = formats::block_size(image.format, region.plane)
        .map(u64::from)
        .ok_or_else(|| HbmError::invalid(format!("no plane {}", region.plane)))?;

    let plane = region.plane as usize;
    let base = image.layout.offsets[plane];
    let stride = image.layout.strides[plane];
    let x0 = u64::from(region.x) * bpp;
    let row_len = u64::from(region.width) * bpp;
    let x_end = x0 + row_len;

    let mut spans = Vec::new();
    for row in 0..u64::from(region.height) {
        let y = u64::from(region.y) + row;
        let buffer = region
            .stride
            .checked_mul(row)
            .and_then(|off| off.checked_add(region.offset))
            .ok_or_else(overflow)?;

        match info.tile {
            None => spans.push(Span {
                image: base + y * stride + x0,
                buffer,
                len: row_len,
            }),
            Some(tile) => {
                // split the row at tile column boundaries
                let tw = u64::from(tile.width);
                let mut x = x0;
                while x < x_end {
                    let len = (tw - x % tw).min(x_end - x);
                    spans.push(Span {
                        image: base + tile.offset(stride, x, y),
                        buffer: buffer + (x - x0),
                        len,
                    });
                    x += len;
                }
            }
        }
    }
    Ok(spans)
}

fn plan(job: &CopyJob<'_>) -> HbmResult<Vec<Segment>> {
    let segments = match job {
        CopyJob::Buffer { region, .. } => vec![Segment {
            src: region.src_offset,
            dst: region.dst_offset,
            len: region.size,
        }],
        CopyJob::BufferToImage { dst, region, .. } => image_spans(dst, region)?
            .into_iter()
            .map(|s| Segment {
                src: s.buffer,
                dst: s.image,
                len: s.len,
            })
            .collect(),
        CopyJob::ImageToBuffer { src, region, .. } => image_spans(src, region)?
            .into_iter()
            .map(|s| Segment {
                src: s.image,
                dst: s.buffer,
                len: s.len,
            })
            .collect(),
    };
    Ok(segments)
}

fn check_segment(seg: &Segment, src_size: u64, dst_size: u64) -> HbmResult<()> {
    let src_end = seg.src.checked_add(seg.len).ok_or_else(overflow)?;
    let dst_end = seg.dst.checked_add(seg.len).ok_or_else(overflow)?;
    if src_end > src_size || dst_end > dst_size {
        return Err(HbmError::invalid(format!(
            "copy of {} bytes from {} to {} is out of bounds",
            seg.len, seg.src, seg.dst
        )));
    }
    Ok(())
}

/// Runs a copy on the CPU once `wait` signals.
///
/// Every byte range is checked before the first byte is written, so a failed copy leaves the
/// destination untouched.
#[allow(clippy::cast_possible_truncation)]
pub fn cpu_copy(job: &CopyJob<'_>, wait: Option<SyncFile>) -> HbmResult<()> {
    let (src, dst) = job.memories();
    let segments = plan(job)?;
    for seg in &segments {
        check_segment(seg, src.size(), dst.size())?;
    }

    if let Some(fence) = wait {
        fence.wait(None)?;
    }

    let _src_access = src.begin_cpu_access(false)?;
    let _dst_access = dst.begin_cpu_access(true)?;
    let src_map = src.map_transient(false)?;
    let dst_map = dst.map_transient(true)?;

    for seg in &segments {
        // SAFETY: every segment lies inside both mappings
        unsafe {
            ptr::copy(
                src_map.as_ptr().add(seg.src as usize),
                dst_map.as_ptr().add(seg.dst as usize),
                seg.len as usize,
            );
        }
    }
    Ok(())
}

// ============================================================================
// BO copy entry points
// ============================================================================

fn check_pair(dst: &Bo, src: &Bo) -> HbmResult<Arc<DeviceShared>> {
    if !dst.description().flags.contains(Flags::COPY) || !src.description().flags.contains(Flags::COPY)
    {
        return Err(HbmError::invalid("both BOs of a copy need the COPY flag"));
    }
    let device = dst.device()?;
    src.device()?;
    if !dst.same_device(src) {
        return Err(HbmError::invalid("BOs of a copy belong to different devices"));
    }
    Ok(device)
}

fn submit(
    device: &DeviceShared,
    job: &CopyJob<'_>,
    wait: Option<SyncFile>,
    request: FenceRequest,
) -> HbmResult<CopyFence> {
    let backend = device.backend();
    let mut fence = backend.copy(job, wait)?;
    if !backend.supports_async_copy() {
        if let Some(pending) = fence.take() {
            pending.wait(None)?;
        }
    }
    let fence = match (request, fence) {
        (FenceRequest::Requested, Some(fence)) => CopyFence::Pending(fence),
        (FenceRequest::Requested, None) => CopyFence::Synchronous,
        (FenceRequest::None, Some(fence)) => {
            fence.wait(None)?;
            CopyFence::NotRequested
        }
        (FenceRequest::None, None) => CopyFence::NotRequested,
    };
    Ok(fence)
}

fn buffer_size(bo: &Bo) -> u64 {
    bo.layout().size
}

/// Checks the rectangle against the image plane and the buffer range against the buffer.
fn check_buffer_image_region(image: &Bo, buffer: &Bo, region: &CopyBufferImage) -> HbmResult<()> {
    let Extent::Image { width, height } = *image.extent() else {
        return Err(HbmError::invalid("buffer-image copy without an image"));
    };
    let format = image.description().format;
    let fmt = formats::format_info(format)
        .ok_or_else(|| HbmError::unsupported(format!("unknown format {format}")))?;
    let plane = fmt
        .planes()
        .get(region.plane as usize)
        .ok_or_else(|| HbmError::invalid(format!("{format} has no plane {}", region.plane)))?;

    if region.width == 0 || region.height == 0 {
        return Err(HbmError::invalid("empty copy rectangle"));
    }
    let (plane_w, plane_h) = plane.extent(width, height);
    let x_end = region.x.checked_add(region.width).ok_or_else(overflow)?;
    let y_end = region.y.checked_add(region.height).ok_or_else(overflow)?;
    if x_end > plane_w || y_end > plane_h {
        return Err(HbmError::invalid(format!(
            "copy rectangle {}x{}+{}+{} exceeds plane extent {plane_w}x{plane_h}",
            region.width, region.height, region.x, region.y
        )));
    }

    let row_len = u64::from(region.width) * u64::from(plane.block_size);
    if region.stride < row_len {
        return Err(HbmError::invalid(format!(
            "buffer stride {} is smaller than a row of {row_len} bytes",
            region.stride
        )));
    }
    let end = region
        .stride
        .checked_mul(u64::from(region.height) - 1)
        .and_then(|v| v.checked_add(region.offset))
        .and_then(|v| v.checked_add(row_len))
        .ok_or_else(overflow)?;
    if end > buffer_size(buffer) {
        return Err(HbmError::invalid(format!(
            "buffer range ends at {end}, past {}",
            buffer_size(buffer)
        )));
    }
    Ok(())
}

impl Bo {
    /// Copies bytes between two buffers, from `src` into `self`.
    ///
    /// `wait` gates the start of the copy and is consumed whether or not the copy is accepted.
    /// Overlapping ranges of the same BO are rejected.
    pub fn copy_buffer(
        &self,
        src: &Self,
        region: &CopyBuffer,
        wait: Option<SyncFile>,
        request: FenceRequest,
    ) -> HbmResult<CopyFence> {
        let device = check_pair(self, src)?;
        if !self.is_buffer() || !src.is_buffer() {
            return Err(HbmError::invalid("buffer copies need two buffers"));
        }
        let dst_mem = self.bound_memory("copy to")?;
        let src_mem = src.bound_memory("copy from")?;

        if region.size == 0 {
            return Err(HbmError::invalid("empty buffer copy"));
        }
        let src_end = region.src_offset.checked_add(region.size).ok_or_else(overflow)?;
        let dst_end = region.dst_offset.checked_add(region.size).ok_or_else(overflow)?;
        if src_end > buffer_size(src) || dst_end > buffer_size(self) {
            return Err(HbmError::invalid(format!(
                "copy of {} bytes from {} to {} is out of bounds",
                region.size, region.src_offset, region.dst_offset
            )));
        }
        if ptr::eq(self, src) && region.src_offset < dst_end && region.dst_offset < src_end {
            return Err(HbmError::invalid("overlapping copy within one BO"));
        }

        let job = CopyJob::Buffer {
            dst: dst_mem,
            src: src_mem,
            region: *region,
        };
        log::debug!(
            "copy {} bytes: {}@{} -> {}@{}",
            region.size,
            src.debug_name(),
            region.src_offset,
            self.debug_name(),
            region.dst_offset
        );
        submit(&device, &job, wait, request)
    }

    /// Copies between a buffer and an image, from `src` into `self`.  Exactly one of the two
    /// BOs must be an image.
    pub fn copy_buffer_image(
        &self,
        src: &Self,
        region: &CopyBufferImage,
        wait: Option<SyncFile>,
        request: FenceRequest,
    ) -> HbmResult<CopyFence> {
        let device = check_pair(self, src)?;
        if self.is_buffer() == src.is_buffer() {
            return Err(HbmError::invalid(
                "buffer-image copies need one buffer and one image",
            ));
        }
        let dst_mem = self.bound_memory("copy to")?;
        let src_mem = src.bound_memory("copy from")?;

        let job = if self.is_buffer() {
            check_buffer_image_region(src, self, region)?;
            CopyJob::ImageToBuffer {
                dst: dst_mem,
                src: ImageRef {
                    memory: src_mem,
                    layout: src.layout(),
                    format: src.description().format,
                },
                region: *region,
            }
        } else {
            check_buffer_image_region(self, src, region)?;
            CopyJob::BufferToImage {
                dst: ImageRef {
                    memory: dst_mem,
                    layout: self.layout(),
                    format: self.description().format,
                },
                src: src_mem,
                region: *region,
            }
        };
        log::debug!(
            "copy {}x{} texels of plane {}: {} -> {}",
            region.width,
            region.height,
            region.plane,
            src.debug_name(),
            self.debug_name()
        );
        submit(&device, &job, wait, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::formats::Modifier;
    use crate::engine::memory::MemoryType;
    use crate::kernel::memfd;

    fn memory(size: u64) -> Memory {
        let fd = memfd::create("hbm-copy-test", size).unwrap();
        Memory::allocated(fd, size, MemoryType::MAPPABLE | MemoryType::COHERENT)
    }

    fn fill(mem: &Memory, f: impl Fn(usize) -> u8) {
        let map = mem.map_transient(true).unwrap();
        for i in 0..map.len() {
            unsafe { *map.as_ptr().add(i) = f(i) };
        }
    }

    fn read(mem: &Memory) -> Vec<u8> {
        let map = mem.map_transient(false).unwrap();
        unsafe { std::slice::from_raw_parts(map.as_ptr(), map.len()).to_vec() }
    }

    #[test]
    fn buffer_copy_moves_bytes() {
        let src = memory(4096);
        let dst = memory(4096);
        fill(&src, |i| (i % 251) as u8);

        let job = CopyJob::Buffer {
            dst: &dst,
            src: &src,
            region: CopyBuffer {
                src_offset: 100,
                dst_offset: 8,
                size: 64,
            },
        };
        cpu_copy(&job, None).unwrap();

        let out = read(&dst);
        assert_eq!(out[7], 0);
        for i in 0..64 {
            assert_eq!(out[8 + i], ((100 + i) % 251) as u8);
        }
        assert_eq!(out[72], 0);
    }

    #[test]
    fn out_of_bounds_copy_writes_nothing() {
        let src = memory(4096);
        let dst = memory(4096);
        fill(&src, |_| 0xaa);

        let job = CopyJob::Buffer {
            dst: &dst,
            src: &src,
            region: CopyBuffer {
                src_offset: 0,
                dst_offset: 4000,
                size: 200,
            },
        };
        assert!(cpu_copy(&job, None).is_err());
        assert!(read(&dst).iter().all(|&b| b == 0));
    }

    #[test]
    fn linear_image_rows_use_the_plane_stride() {
        let layout = Layout::new()
            .size(64 * 4)
            .modifier(Modifier::LINEAR)
            .plane_count(1)
            .plane(0, 0, 64);
        let image = memory(layout.size);
        let buffer = memory(4096);
        fill(&buffer, |i| i as u8);

        let region = CopyBufferImage {
            offset: 0,
            stride: 16,
            plane: 0,
            x: 2,
            y: 1,
            width: 3,
            height: 2,
        };
        let job = CopyJob::BufferToImage {
            dst: ImageRef {
                memory: &image,
                layout: &layout,
                format: Format::ARGB8888,
            },
            src: &buffer,
            region,
        };
        cpu_copy(&job, None).unwrap();

        let out = read(&image);
        // row 1 starts at 64, texel 2 at byte 8
        assert_eq!(&out[72..84], &(0u8..12).collect::<Vec<_>>()[..]);
        assert_eq!(&out[136..148], &(16u8..28).collect::<Vec<_>>()[..]);
        assert_eq!(out[84], 0);
    }

    #[test]
    fn tiled_rows_are_split_at_tile_columns() {
        // X tiles are 512 bytes wide; two tiles per row
        let layout = Layout::new()
            .size(2 * 4096)
            .modifier(Modifier::I915_X_TILED)
            .plane_count(1)
            .plane(0, 0, 1024);
        let image = memory(layout.size);
        let buffer = memory(4096);
        fill(&buffer, |i| (i % 200) as u8 + 1);

        let region = CopyBufferImage {
            offset: 0,
            stride: 16,
            plane: 0,
            x: 508,
            y: 1,
            width: 8,
            height: 1,
        };
        let src = ImageRef {
            memory: &image,
            layout: &layout,
            format: Format::R8,
        };
        let job = CopyJob::BufferToImage {
            dst: src,
            src: &buffer,
            region,
        };
        cpu_copy(&job, None).unwrap();

        let out = read(&image);
        // bytes 508..512 of row 1 live in tile 0, bytes 512..516 in tile 1
        assert_eq!(&out[512 + 508..512 + 512], &[1, 2, 3, 4]);
        assert_eq!(&out[4096 + 512..4096 + 516], &[5, 6, 7, 8]);

        // and back again
        let back = memory(16);
        let job = CopyJob::ImageToBuffer {
            dst: &back,
            src,
            region,
        };
        cpu_copy(&job, None).unwrap();
        assert_eq!(&read(&back)[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn compressed_images_are_not_cpu_copyable() {
        let layout = Layout::new()
            .size(8192)
            .modifier(Modifier::I915_Y_TILED_CCS)
            .plane_count(2)
            .plane(0, 0, 128)
            .plane(1, 4096, 128);
        let image = memory(layout.size);
        let buffer = memory(4096);
        let job = CopyJob::ImageToBuffer {
            dst: &buffer,
            src: ImageRef {
                memory: &image,
                layout: &layout,
                format: Format::R8,
            },
            region: CopyBufferImage {
                stride: 16,
                width: 4,
                height: 4,
                ..Default::default()
            },
        };
        let err = cpu_copy(&job, None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Capability);
    }

    #[test]
    fn signaled_in_fence_is_waited_on() {
        use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

        let raw = unsafe { libc::eventfd(1, libc::EFD_CLOEXEC) };
        assert!(raw >= 0);
        let fence = SyncFile::new(unsafe { OwnedFd::from_raw_fd(raw) });
        assert!(fence.as_raw_fd() >= 0);

        let src = memory(4096);
        let dst = memory(4096);
        fill(&src, |_| 7);
        let job = CopyJob::Buffer {
            dst: &dst,
            src: &src,
            region: CopyBuffer {
                src_offset: 0,
                dst_offset: 0,
                size: 4096,
            },
        };
        cpu_copy(&job, Some(fence)).unwrap();
        assert!(read(&dst).iter().all(|&b| b == 7));
    }
}
