//! The `hbm_*` C interface.
//!
//! Devices and BOs cross the boundary as boxed opaque pointers.  Failures are reported with the
//! sentinels of each function (`NULL`, `-1`, `false`, `0`) and logged at error level.  File
//! descriptors documented as transferred are owned by the callee from the moment of the call,
//! whatever the outcome.

#![allow(
    non_camel_case_types,
    clippy::missing_safety_doc,
    clippy::not_unsafe_ptr_arg_deref
)]

use crate::engine::bo::Bo;
use crate::engine::copy::{CopyFence, FenceRequest};
use crate::engine::device::Device;
use crate::engine::formats::{Format, Modifier};
use crate::engine::memory::MemoryType;
use crate::engine::types::{
    Constraint, CopyBuffer, CopyBufferImage, Description, Extent, Flags, Layout, MAX_PLANES, Usage,
};
use crate::error::HbmResult;
use crate::kernel::sync_file::SyncFile;
use crate::logging::{self, LogLevel};
use std::ffi::{CStr, CString, c_char, c_void};
use std::os::fd::{BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::ptr;

// ============================================================================
// C types
// ============================================================================

pub type hbm_log_callback = extern "C" fn(lv: LogLevel, msg: *const c_char, cb_data: *mut c_void);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct hbm_description {
    pub flags: u32,
    pub format: u32,
    pub modifier: u64,
    pub usage: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct hbm_extent_buffer {
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct hbm_extent_image {
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union hbm_extent {
    pub buffer: hbm_extent_buffer,
    pub image: hbm_extent_image,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct hbm_constraint {
    pub offset_align: u64,
    pub stride_align: u64,
    pub size_align: u64,
    pub modifiers: *const u64,
    pub modifier_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct hbm_layout {
    pub size: u64,
    pub modifier: u64,
    pub plane_count: u32,
    pub offsets: [u64; MAX_PLANES],
    pub strides: [u64; MAX_PLANES],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct hbm_copy_buffer {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct hbm_copy_buffer_image {
    pub offset: u64,
    pub stride: u64,
    pub plane: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

// ============================================================================
// Conversions
// ============================================================================

impl From<&hbm_description> for Description {
    fn from(desc: &hbm_description) -> Self {
        Self {
            flags: Flags::from_bits_retain(desc.flags),
            format: Format(desc.format),
            modifier: Modifier(desc.modifier),
            usage: Usage::from_bits_retain(desc.usage),
        }
    }
}

impl From<&Layout> for hbm_layout {
    fn from(layout: &Layout) -> Self {
        Self {
            size: layout.size,
            modifier: layout.modifier.0,
            plane_count: layout.plane_count,
            offsets: layout.offsets,
            strides: layout.strides,
        }
    }
}

impl From<&hbm_layout> for Layout {
    fn from(layout: &hbm_layout) -> Self {
        Self {
            size: layout.size,
            modifier: Modifier(layout.modifier),
            plane_count: layout.plane_count,
            offsets: layout.offsets,
            strides: layout.strides,
        }
    }
}

impl From<&hbm_copy_buffer> for CopyBuffer {
    fn from(copy: &hbm_copy_buffer) -> Self {
        Self {
            src_offset: copy.src_offset,
            dst_offset: copy.dst_offset,
            size: copy.size,
        }
    }
}

impl From<&hbm_copy_buffer_image> for CopyBufferImage {
    fn from(copy: &hbm_copy_buffer_image) -> Self {
        Self {
            offset: copy.offset,
            stride: copy.stride,
            plane: copy.plane,
            x: copy.x,
            y: copy.y,
            width: copy.width,
            height: copy.height,
        }
    }
}

/// Reads the union member selected by the buffer/image classification of `desc`.
unsafe fn extent_of(desc: &Description, extent: &hbm_extent) -> Extent {
    unsafe {
        if desc.is_buffer() {
            Extent::Buffer {
                size: extent.buffer.size,
            }
        } else {
            Extent::Image {
                width: extent.image.width,
                height: extent.image.height,
            }
        }
    }
}

unsafe fn constraint_of(con: &hbm_constraint) -> Constraint {
    let mut out = Constraint::default()
        .offset_align(con.offset_align)
        .stride_align(con.stride_align)
        .size_align(con.size_align);
    if !con.modifiers.is_null() {
        let mods = unsafe { std::slice::from_raw_parts(con.modifiers, con.modifier_count as usize) };
        out = out.modifiers(mods.iter().copied().map(Modifier).collect());
    }
    out
}

/// Takes ownership of a non-negative fd.
unsafe fn take_fd(fd: i32) -> Option<OwnedFd> {
    (fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(fd) })
}

fn report<T>(op: &str, res: HbmResult<T>) -> Option<T> {
    match res {
        Ok(val) => Some(val),
        Err(e) => {
            log::error!("{op} failed: {e}");
            None
        }
    }
}

/// Copies up to `max` items into `out`, or returns the item count when `max` is 0.
unsafe fn fill_out<T: Copy>(items: &[T], max: u32, out: *mut T) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let count = items.len().min(u32::MAX as usize) as u32;
    if max == 0 || out.is_null() {
        return count;
    }
    let n = count.min(max);
    unsafe { ptr::copy_nonoverlapping(items.as_ptr(), out, n as usize) };
    n
}

// ============================================================================
// Logging
// ============================================================================

struct CallbackData(*mut c_void);

// The C caller promises the callback data may be used from any thread.
unsafe impl Send for CallbackData {}
unsafe impl Sync for CallbackData {}

impl CallbackData {
    const fn get(&self) -> *mut c_void {
        self.0
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_log_init(
    log_lv_max: u32,
    log_cb: Option<hbm_log_callback>,
    cb_data: *mut c_void,
) {
    let callback = log_cb.map(|cb| {
        let data = CallbackData(cb_data);
        Box::new(move |level: LogLevel, msg: &str| {
            let msg = CString::new(msg.replace('\0', " ")).unwrap_or_default();
            cb(level, msg.as_ptr(), data.get());
        }) as logging::LogCallback
    });
    logging::log_init(LogLevel::from_raw(log_lv_max), callback);
}

// ============================================================================
// Devices
// ============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_device_create(dev: libc::dev_t, debug: bool) -> *mut Device {
    let dev_id = (dev != 0).then_some(dev);
    report("device creation", Device::create(dev_id, debug))
        .map_or(ptr::null_mut(), |dev| Box::into_raw(Box::new(dev)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_device_destroy(dev: *mut Device) {
    if !dev.is_null() {
        drop(unsafe { Box::from_raw(dev) });
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_device_get_plane_count(
    dev: *mut Device,
    fmt: u32,
    modifier: u64,
) -> u32 {
    let Some(dev) = (unsafe { dev.as_ref() }) else {
        return 0;
    };
    dev.plane_count(Format(fmt), Modifier(modifier))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_device_get_modifiers(
    dev: *mut Device,
    desc: *const hbm_description,
    mod_max: u32,
    out_mods: *mut u64,
) -> u32 {
    let (Some(dev), Some(desc)) = (unsafe { dev.as_ref() }, unsafe { desc.as_ref() }) else {
        return 0;
    };
    let mods: Vec<u64> = dev
        .modifiers(&Description::from(desc))
        .into_iter()
        .map(|m| m.0)
        .collect();
    unsafe { fill_out(&mods, mod_max, out_mods) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_device_has_modifier(
    dev: *mut Device,
    desc: *const hbm_description,
    modifier: u64,
) -> bool {
    let (Some(dev), Some(desc)) = (unsafe { dev.as_ref() }, unsafe { desc.as_ref() }) else {
        return false;
    };
    dev.has_modifier(&Description::from(desc), Modifier(modifier))
}

// ============================================================================
// BO creation
// ============================================================================

fn into_handle(bo: Option<Bo>) -> *mut Bo {
    bo.map_or(ptr::null_mut(), |bo| Box::into_raw(Box::new(bo)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_create_with_constraint(
    dev: *mut Device,
    desc: *const hbm_description,
    extent: *const hbm_extent,
    con: *const hbm_constraint,
) -> *mut Bo {
    let (Some(dev), Some(desc), Some(extent)) =
        (unsafe { dev.as_ref() }, unsafe { desc.as_ref() }, unsafe { extent.as_ref() })
    else {
        return ptr::null_mut();
    };
    let desc = Description::from(desc);
    let extent = unsafe { extent_of(&desc, extent) };
    let con = unsafe { con.as_ref() }.map(|con| unsafe { constraint_of(con) });

    into_handle(report("BO creation", dev.create_bo(&desc, &extent, con.as_ref())))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_create_with_layout(
    dev: *mut Device,
    desc: *const hbm_description,
    extent: *const hbm_extent,
    layout: *const hbm_layout,
    dmabuf: i32,
) -> *mut Bo {
    let (Some(dev), Some(desc), Some(extent), Some(layout)) = (
        unsafe { dev.as_ref() },
        unsafe { desc.as_ref() },
        unsafe { extent.as_ref() },
        unsafe { layout.as_ref() },
    ) else {
        return ptr::null_mut();
    };
    let desc = Description::from(desc);
    let extent = unsafe { extent_of(&desc, extent) };
    let layout = Layout::from(layout);
    // borrowed, never transferred
    let dmabuf = (dmabuf >= 0).then(|| unsafe { BorrowedFd::borrow_raw(dmabuf) });

    into_handle(report(
        "BO creation",
        dev.create_bo_with_layout(&desc, &extent, &layout, dmabuf),
    ))
}

// ============================================================================
// BO lifecycle
// ============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_destroy(bo: *mut Bo) {
    if !bo.is_null() {
        drop(unsafe { Box::from_raw(bo) });
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_layout(bo: *mut Bo, out_layout: *mut hbm_layout) {
    let (Some(bo), Some(out)) = (unsafe { bo.as_ref() }, unsafe { out_layout.as_mut() }) else {
        return;
    };
    *out = hbm_layout::from(bo.layout());
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_memory_types(bo: *mut Bo, mt_max: u32, out_mts: *mut u32) -> u32 {
    let Some(bo) = (unsafe { bo.as_ref() }) else {
        return 0;
    };
    let mts: Vec<u32> = bo.memory_types().iter().map(|mt| mt.bits()).collect();
    unsafe { fill_out(&mts, mt_max, out_mts) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_bind_memory(bo: *mut Bo, mt: u32, dmabuf: i32) -> bool {
    // owned from here on, even if the call fails
    let dmabuf = unsafe { take_fd(dmabuf) };
    let Some(bo) = (unsafe { bo.as_mut() }) else {
        return false;
    };
    let Some(mt) = MemoryType::from_bits(mt) else {
        log::error!("memory binding failed: unknown memory type bits 0x{mt:x}");
        return false;
    };
    report("memory binding", bo.bind_memory(mt, dmabuf)).is_some()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_export_dma_buf(bo: *mut Bo, name: *const c_char) -> i32 {
    let Some(bo) = (unsafe { bo.as_ref() }) else {
        return -1;
    };
    let name = (!name.is_null())
        .then(|| unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned());
    report("dma-buf export", bo.export_dma_buf(name.as_deref())).map_or(-1, IntoRawFd::into_raw_fd)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_map(bo: *mut Bo) -> *mut c_void {
    let Some(bo) = (unsafe { bo.as_mut() }) else {
        return ptr::null_mut();
    };
    report("mapping", bo.map()).map_or(ptr::null_mut(), |ptr| ptr.cast())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_unmap(bo: *mut Bo) {
    if let Some(bo) = unsafe { bo.as_mut() } {
        report("unmapping", bo.unmap());
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_flush(bo: *mut Bo) {
    if let Some(bo) = unsafe { bo.as_ref() } {
        report("flush", bo.flush());
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_invalidate(bo: *mut Bo) {
    if let Some(bo) = unsafe { bo.as_ref() } {
        report("invalidate", bo.invalidate());
    }
}

// ============================================================================
// Copies
// ============================================================================

/// Writes the out-fence of a finished copy: a sync file, or -1 when the copy is complete.
unsafe fn write_fence(fence: CopyFence, out_sync_fd: *mut i32) {
    let fd = fence
        .into_sync_file()
        .map_or(-1, |fence| fence.into_fd().into_raw_fd());
    if let Some(out) = unsafe { out_sync_fd.as_mut() } {
        *out = fd;
    }
}

fn fence_request(out_sync_fd: *mut i32) -> FenceRequest {
    if out_sync_fd.is_null() {
        FenceRequest::None
    } else {
        FenceRequest::Requested
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_copy_buffer(
    bo: *mut Bo,
    src: *mut Bo,
    copy: *const hbm_copy_buffer,
    in_sync_fd: i32,
    out_sync_fd: *mut i32,
) -> bool {
    let wait = unsafe { take_fd(in_sync_fd) }.map(SyncFile::new);
    let (Some(dst), Some(src), Some(copy)) =
        (unsafe { bo.as_ref() }, unsafe { src.as_ref() }, unsafe { copy.as_ref() })
    else {
        return false;
    };
    let request = fence_request(out_sync_fd);

    match report(
        "buffer copy",
        dst.copy_buffer(src, &CopyBuffer::from(copy), wait, request),
    ) {
        Some(fence) => {
            unsafe { write_fence(fence, out_sync_fd) };
            true
        }
        None => false,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hbm_bo_copy_buffer_image(
    bo: *mut Bo,
    src: *mut Bo,
    copy: *const hbm_copy_buffer_image,
    in_sync_fd: i32,
    out_sync_fd: *mut i32,
) -> bool {
    let wait = unsafe { take_fd(in_sync_fd) }.map(SyncFile::new);
    let (Some(dst), Some(src), Some(copy)) =
        (unsafe { bo.as_ref() }, unsafe { src.as_ref() }, unsafe { copy.as_ref() })
    else {
        return false;
    };
    let request = fence_request(out_sync_fd);

    match report(
        "buffer-image copy",
        dst.copy_buffer_image(src, &CopyBufferImage::from(copy), wait, request),
    ) {
        Some(fence) => {
            unsafe { write_fence(fence, out_sync_fd) };
            true
        }
        None => false,
    }
}
