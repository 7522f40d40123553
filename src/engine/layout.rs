//! The layout calculator: turns a description, an extent, and a constraint into a physical
//! layout, and validates layouts supplied by callers.

use crate::engine::caps::Capabilities;
use crate::engine::formats::{self, FormatInfo, Modifier, ModifierInfo};
use crate::engine::types::{Constraint, Description, Extent, Flags, Layout, MAX_PLANES};
use crate::error::{HbmError, HbmResult};
use crate::utils::{align_up, lcm};

/// Width granule of compression metadata rows.
const AUX_STRIDE_ALIGN: u64 = 128;
/// Row granule of compression metadata.
const AUX_ROW_ALIGN: u64 = 32;
/// Main surface bytes covered by one aux byte, horizontally and vertically.
const AUX_X_DIV: u64 = 32;
const AUX_Y_DIV: u64 = 8;

fn overflow() -> HbmError {
    HbmError::unsupported("layout size overflows")
}

/// Picks the modifier of an image.
///
/// An explicit modifier must be supported and allowed.  Otherwise the first modifier in device
/// preference order that the constraint allows wins.  Compressed modifiers count as unsupported
/// when the description forbids compression.
pub fn select_modifier(
    caps: &Capabilities,
    desc: &Description,
    con: Option<&Constraint>,
) -> HbmResult<Modifier> {
    if !desc.is_auto_modifier() {
        let modifier = desc.modifier;
        if !caps.supports_modifier(desc, modifier) {
            return Err(HbmError::invalid(format!(
                "modifier {modifier} is not supported for {}",
                desc.format
            )));
        }
        if !Constraint::allows(con, modifier) {
            return Err(HbmError::invalid(format!(
                "modifier {modifier} is not allowed by the constraint"
            )));
        }
        return Ok(modifier);
    }

    caps.modifiers(desc)
        .find(|&m| Constraint::allows(con, m))
        .ok_or_else(|| {
            HbmError::unsupported(format!(
                "no modifier of {} satisfies the usage and constraint",
                desc.format
            ))
        })
}

/// Geometry of one memory plane before caller alignments are applied.
#[derive(Debug, Clone, Copy)]
struct PlaneGeometry {
    /// Bytes one row of the plane needs.
    min_stride: u64,
    /// Rows the plane occupies, including tile padding.
    rows: u64,
    /// Strides must be a multiple of this.
    stride_granule: u64,
    /// Offsets must be a multiple of this.
    offset_granule: u64,
}

fn color_plane_geometry(
    fmt: &FormatInfo,
    modifier: &ModifierInfo,
    plane: usize,
    width: u32,
    height: u32,
) -> PlaneGeometry {
    let info = fmt.planes()[plane];
    let (w, h) = info.extent(width, height);
    let row_bytes = u64::from(w) * u64::from(info.block_size);

    match modifier.tile {
        Some(tile) => PlaneGeometry {
            min_stride: row_bytes,
            rows: u64::from(h).next_multiple_of(u64::from(tile.height)),
            stride_granule: u64::from(tile.width),
            offset_granule: tile.size(),
        },
        None => PlaneGeometry {
            min_stride: row_bytes,
            rows: u64::from(h),
            stride_granule: 1,
            offset_granule: 1,
        },
    }
}

fn aux_plane_geometry(main_stride: u64, height: u32) -> PlaneGeometry {
    PlaneGeometry {
        min_stride: main_stride.div_ceil(AUX_X_DIV),
        rows: u64::from(height)
            .div_ceil(AUX_Y_DIV)
            .next_multiple_of(AUX_ROW_ALIGN),
        stride_granule: AUX_STRIDE_ALIGN,
        offset_granule: 1,
    }
}

/// Returns the geometry of memory plane `plane`, given the strides already chosen for the
/// planes before it.
fn plane_geometry(
    fmt: &FormatInfo,
    modifier: &ModifierInfo,
    plane: usize,
    strides: &[u64],
    width: u32,
    height: u32,
) -> PlaneGeometry {
    let color_planes = fmt.planes().len();
    if plane < color_planes {
        color_plane_geometry(fmt, modifier, plane, width, height)
    } else {
        // aux planes only exist for single-plane formats
        aux_plane_geometry(strides[plane - color_planes], height)
    }
}

fn image_infos(
    desc: &Description,
    modifier: Modifier,
) -> HbmResult<(&'static FormatInfo, &'static ModifierInfo)> {
    let fmt = formats::format_info(desc.format)
        .ok_or_else(|| HbmError::unsupported(format!("unknown format {}", desc.format)))?;
    let m = formats::modifier_info(modifier)
        .ok_or_else(|| HbmError::unsupported(format!("unknown modifier {modifier}")))?;
    Ok((fmt, m))
}

fn check_extent(caps: &Capabilities, desc: &Description, extent: &Extent) -> HbmResult<()> {
    match *extent {
        Extent::Buffer { size } => {
            if !desc.is_buffer() {
                return Err(HbmError::invalid("image description with a buffer extent"));
            }
            if size == 0 {
                return Err(HbmError::invalid("buffer size is 0"));
            }
            if size > caps.max_buffer_size {
                return Err(HbmError::unsupported(format!(
                    "buffer size {size} exceeds {}",
                    caps.max_buffer_size
                )));
            }
        }
        Extent::Image { width, height } => {
            if desc.is_buffer() {
                return Err(HbmError::invalid("buffer description with an image extent"));
            }
            if width == 0 || height == 0 {
                return Err(HbmError::invalid(format!("image extent {width}x{height}")));
            }
            if width > caps.max_extent || height > caps.max_extent {
                return Err(HbmError::unsupported(format!(
                    "image extent {width}x{height} exceeds {}",
                    caps.max_extent
                )));
            }
        }
    }
    Ok(())
}

/// Computes the layout of a new BO.
pub fn compute(
    caps: &Capabilities,
    desc: &Description,
    extent: &Extent,
    con: Option<&Constraint>,
) -> HbmResult<Layout> {
    check_extent(caps, desc, extent)?;
    let (offset_align, stride_align, size_align) = Constraint::unpack(con);

    let (width, height) = match *extent {
        Extent::Buffer { size } => {
            let size = align_up(size, size_align).ok_or_else(overflow)?;
            return Ok(Layout::new().size(size));
        }
        Extent::Image { width, height } => (width, height),
    };

    let modifier = select_modifier(caps, desc, con)?;
    let (fmt, m) = image_infos(desc, modifier)?;
    let plane_count = caps.plane_count(desc.format, modifier);
    if plane_count == 0 || plane_count as usize > MAX_PLANES {
        return Err(HbmError::unsupported(format!(
            "{}/{modifier} has no usable plane layout",
            desc.format
        )));
    }

    let mut layout = Layout::new().modifier(modifier).plane_count(plane_count);
    let mut end = 0u64;
    for plane in 0..plane_count as usize {
        let geom = plane_geometry(fmt, m, plane, &layout.strides, width, height);

        let stride_granule = lcm(geom.stride_granule, stride_align).ok_or_else(overflow)?;
        let stride = align_up(geom.min_stride, stride_granule).ok_or_else(overflow)?;
        let offset_granule = lcm(geom.offset_granule, offset_align).ok_or_else(overflow)?;
        let offset = align_up(end, offset_granule).ok_or_else(overflow)?;
        let plane_size = stride.checked_mul(geom.rows).ok_or_else(overflow)?;

        layout = layout.plane(plane, offset, stride);
        end = offset.checked_add(plane_size).ok_or_else(overflow)?;
    }

    let size = align_up(end, size_align).ok_or_else(overflow)?;
    Ok(layout.size(size))
}

/// Validates a layout supplied by the caller for `desc` and `extent`.
pub fn validate(
    caps: &Capabilities,
    desc: &Description,
    extent: &Extent,
    layout: &Layout,
) -> HbmResult<()> {
    check_extent(caps, desc, extent)?;

    let (width, height) = match *extent {
        Extent::Buffer { size } => {
            if layout.plane_count != 0 || !layout.modifier.is_invalid() {
                return Err(HbmError::invalid("buffer layout must have no planes and no modifier"));
            }
            if layout.size < size {
                return Err(HbmError::invalid(format!(
                    "layout size {} is smaller than the buffer size {size}",
                    layout.size
                )));
            }
            return Ok(());
        }
        Extent::Image { width, height } => (width, height),
    };

    let modifier = layout.modifier;
    if modifier.is_invalid() {
        return Err(HbmError::invalid("image layout without a modifier"));
    }
    if !desc.is_auto_modifier() && desc.modifier != modifier {
        return Err(HbmError::invalid("layout modifier differs from the description"));
    }
    if desc.flags.contains(Flags::NO_COMPRESSION) && caps.is_compressed(modifier) {
        return Err(HbmError::invalid("compressed layout for a no-compression BO"));
    }
    if !caps.supports_modifier(desc, modifier) {
        return Err(HbmError::unsupported(format!(
            "modifier {modifier} is not supported for {}",
            desc.format
        )));
    }

    let expected = caps.plane_count(desc.format, modifier);
    if layout.plane_count != expected {
        return Err(HbmError::invalid(format!(
            "layout has {} planes but {}/{modifier} needs {expected}",
            layout.plane_count, desc.format
        )));
    }

    let (fmt, m) = image_infos(desc, modifier)?;
    let mut end = 0u64;
    for plane in 0..layout.plane_count as usize {
        let geom = plane_geometry(fmt, m, plane, &layout.strides, width, height);
        let offset = layout.offsets[plane];
        let stride = layout.strides[plane];

        if stride < geom.min_stride || stride % geom.stride_granule != 0 {
            return Err(HbmError::invalid(format!(
                "plane {plane} stride {stride} is invalid (needs >= {} in units of {})",
                geom.min_stride, geom.stride_granule
            )));
        }
        if offset < end || offset % geom.offset_granule != 0 {
            return Err(HbmError::invalid(format!(
                "plane {plane} offset {offset} overlaps or is misaligned"
            )));
        }

        let plane_size = stride.checked_mul(geom.rows).ok_or_else(overflow)?;
        end = offset.checked_add(plane_size).ok_or_else(overflow)?;
        if end > layout.size {
            return Err(HbmError::invalid(format!(
                "plane {plane} ends at {end}, past the layout size {}",
                layout.size
            )));
        }
    }

    Ok(())
}

/// Re-checks a computed layout against the constraint it was computed for.
pub fn check_invariants(layout: &Layout, con: Option<&Constraint>) -> HbmResult<()> {
    let (offset_align, stride_align, size_align) = Constraint::unpack(con);

    if layout.size == 0 || layout.size % size_align != 0 {
        return Err(HbmError::Backend(format!("bad layout size {}", layout.size)));
    }
    let planes = layout.plane_count as usize;
    if planes > MAX_PLANES {
        return Err(HbmError::Backend(format!("bad plane count {planes}")));
    }
    for plane in 0..planes {
        if layout.offsets[plane] % offset_align != 0 || layout.strides[plane] % stride_align != 0 {
            return Err(HbmError::Backend(format!("plane {plane} breaks the constraint")));
        }
        if plane > 0 && layout.offsets[plane] <= layout.offsets[plane - 1] {
            return Err(HbmError::Backend(format!("plane {plane} is out of order")));
        }
    }
    Ok(())
}
