//! DRM formats and format modifiers, and the per-plane geometry derived from them.

use std::fmt;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// A DRM fourcc format.  [`Format::INVALID`] denotes a buffer rather than an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Format(pub u32);

impl Format {
    pub const INVALID: Self = Self(0);
    pub const R8: Self = Self(fourcc(b"R8  "));
    pub const GR88: Self = Self(fourcc(b"GR88"));
    pub const RGB565: Self = Self(fourcc(b"RG16"));
    pub const XRGB8888: Self = Self(fourcc(b"XR24"));
    pub const ARGB8888: Self = Self(fourcc(b"AR24"));
    pub const XBGR8888: Self = Self(fourcc(b"XB24"));
    pub const ABGR8888: Self = Self(fourcc(b"AB24"));
    pub const ABGR2101010: Self = Self(fourcc(b"AB30"));
    pub const ABGR16161616F: Self = Self(fourcc(b"AB4H"));
    pub const NV12: Self = Self(fourcc(b"NV12"));
    pub const P010: Self = Self(fourcc(b"P010"));
    pub const YUV420: Self = Self(fourcc(b"YU12"));
    pub const YVU420: Self = Self(fourcc(b"YV12"));

    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            return f.write_str("INVALID");
        }
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            write!(f, "{}", String::from_utf8_lossy(&bytes).trim_end())
        } else {
            write!(f, "0x{:08x}", self.0)
        }
    }
}

/// A DRM format modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Modifier(pub u64);

const VENDOR_INTEL: u64 = 0x01;

const fn mod_code(vendor: u64, val: u64) -> Modifier {
    Modifier((vendor << 56) | (val & 0x00ff_ffff_ffff_ffff))
}

impl Modifier {
    /// Selects automatic negotiation in a description, and marks buffers in a layout.
    pub const INVALID: Self = Self(0x00ff_ffff_ffff_ffff);
    pub const LINEAR: Self = Self(0);
    pub const I915_X_TILED: Self = mod_code(VENDOR_INTEL, 1);
    pub const I915_Y_TILED: Self = mod_code(VENDOR_INTEL, 2);
    pub const I915_Y_TILED_CCS: Self = mod_code(VENDOR_INTEL, 4);

    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }
}

impl Default for Modifier {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INVALID => f.write_str("INVALID"),
            Self::LINEAR => f.write_str("LINEAR"),
            Self::I915_X_TILED => f.write_str("I915_X_TILED"),
            Self::I915_Y_TILED => f.write_str("I915_Y_TILED"),
            Self::I915_Y_TILED_CCS => f.write_str("I915_Y_TILED_CCS"),
            Self(v) => write!(f, "0x{v:016x}"),
        }
    }
}

/// Geometry of one color plane of a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Bytes per texel.
    pub block_size: u32,
    pub hsub: u32,
    pub vsub: u32,
}

impl PlaneInfo {
    const fn new(block_size: u32, hsub: u32, vsub: u32) -> Self {
        Self {
            block_size,
            hsub,
            vsub,
        }
    }

    /// Extent of this plane for an image of `width` x `height` texels.
    #[must_use]
    pub const fn extent(&self, width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(self.hsub), height.div_ceil(self.vsub))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FormatInfo {
    pub format: Format,
    planes: &'static [PlaneInfo],
}

impl FormatInfo {
    #[must_use]
    pub const fn planes(&self) -> &'static [PlaneInfo] {
        self.planes
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn plane_count(&self) -> u32 {
        self.planes.len() as u32
    }
}

const PACKED_1: &[PlaneInfo] = &[PlaneInfo::new(1, 1, 1)];
const PACKED_2: &[PlaneInfo] = &[PlaneInfo::new(2, 1, 1)];
const PACKED_4: &[PlaneInfo] = &[PlaneInfo::new(4, 1, 1)];
const PACKED_8: &[PlaneInfo] = &[PlaneInfo::new(8, 1, 1)];
const NV12_PLANES: &[PlaneInfo] = &[PlaneInfo::new(1, 1, 1), PlaneInfo::new(2, 2, 2)];
const P010_PLANES: &[PlaneInfo] = &[PlaneInfo::new(2, 1, 1), PlaneInfo::new(4, 2, 2)];
const YUV420_PLANES: &[PlaneInfo] = &[
    PlaneInfo::new(1, 1, 1),
    PlaneInfo::new(1, 2, 2),
    PlaneInfo::new(1, 2, 2),
];

#[rustfmt::skip]
const FORMAT_TABLE: &[FormatInfo] = &[
    FormatInfo { format: Format::R8,            planes: PACKED_1 },
    FormatInfo { format: Format::GR88,          planes: PACKED_2 },
    FormatInfo { format: Format::RGB565,        planes: PACKED_2 },
    FormatInfo { format: Format::XRGB8888,      planes: PACKED_4 },
    FormatInfo { format: Format::ARGB8888,      planes: PACKED_4 },
    FormatInfo { format: Format::XBGR8888,      planes: PACKED_4 },
    FormatInfo { format: Format::ABGR8888,      planes: PACKED_4 },
    FormatInfo { format: Format::ABGR2101010,   planes: PACKED_4 },
    FormatInfo { format: Format::ABGR16161616F, planes: PACKED_8 },
    FormatInfo { format: Format::NV12,          planes: NV12_PLANES },
    FormatInfo { format: Format::P010,          planes: P010_PLANES },
    FormatInfo { format: Format::YUV420,        planes: YUV420_PLANES },
    FormatInfo { format: Format::YVU420,        planes: YUV420_PLANES },
];

/// Every format HBM knows how to lay out.
pub fn known_formats() -> impl Iterator<Item = Format> {
    FORMAT_TABLE.iter().map(|info| info.format)
}

#[must_use]
pub fn format_info(format: Format) -> Option<&'static FormatInfo> {
    FORMAT_TABLE.iter().find(|info| info.format == format)
}

/// A tile of `width` bytes by `height` rows, stored contiguously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub width: u32,
    pub height: u32,
}

impl Tile {
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Byte offset of (`x` bytes, `y` rows) inside a tiled plane with row stride `stride`.
    ///
    /// `stride` is the byte length of one row of texels and is a multiple of the tile width, so
    /// one row of tiles spans `stride * height` bytes.
    #[must_use]
    pub const fn offset(&self, stride: u64, x: u64, y: u64) -> u64 {
        let tw = self.width as u64;
        let th = self.height as u64;
        (y / th) * stride * th + (x / tw) * self.size() + (y % th) * tw + (x % tw)
    }
}

/// Static properties of a modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifierInfo {
    pub modifier: Modifier,
    pub tile: Option<Tile>,
    pub compressed: bool,
    /// Memory planes added per color plane (compression metadata).
    pub aux_planes: u32,
}

const X_TILE: Tile = Tile {
    width: 512,
    height: 8,
};
const Y_TILE: Tile = Tile {
    width: 128,
    height: 32,
};

#[rustfmt::skip]
const MODIFIER_TABLE: &[ModifierInfo] = &[
    ModifierInfo { modifier: Modifier::LINEAR,           tile: None,         compressed: false, aux_planes: 0 },
    ModifierInfo { modifier: Modifier::I915_X_TILED,     tile: Some(X_TILE), compressed: false, aux_planes: 0 },
    ModifierInfo { modifier: Modifier::I915_Y_TILED,     tile: Some(Y_TILE), compressed: false, aux_planes: 0 },
    ModifierInfo { modifier: Modifier::I915_Y_TILED_CCS, tile: Some(Y_TILE), compressed: true,  aux_planes: 1 },
];

#[must_use]
pub fn modifier_info(modifier: Modifier) -> Option<&'static ModifierInfo> {
    MODIFIER_TABLE.iter().find(|info| info.modifier == modifier)
}

/// Memory plane count of `format` laid out with `modifier`, or `None` if the pair is invalid.
///
/// Compression metadata planes are only defined for single-plane formats.
#[must_use]
pub fn memory_plane_count(format: Format, modifier: Modifier) -> Option<u32> {
    let fmt = format_info(format)?;
    let m = modifier_info(modifier)?;
    if m.aux_planes > 0 && fmt.plane_count() != 1 {
        return None;
    }
    Some(fmt.plane_count() * (1 + m.aux_planes))
}

/// Bytes per texel of a color plane.
#[must_use]
pub fn block_size(format: Format, plane: u32) -> Option<u32> {
    format_info(format)?
        .planes()
        .get(plane as usize)
        .map(|p| p.block_size)
}
