use crate::engine::formats::{Format, Modifier};

bitflags::bitflags! {
    /// Properties a BO must have.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// The BO can be exported/imported.
        const EXTERNAL = 1 << 0;
        /// The BO can be mapped.
        const MAP = 1 << 1;
        /// The BO can be copied to or copied from.
        const COPY = 1 << 2;
        /// The BO must be on a protected heap.
        const PROTECTED = 1 << 3;
        /// The BO must not be compressed.
        const NO_COMPRESSION = 1 << 4;
    }
}

bitflags::bitflags! {
    /// How the GPU will use a BO.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Usage: u64 {
        const GPU_TRANSFER = 1 << 0;
        const GPU_UNIFORM = 1 << 1;
        const GPU_STORAGE = 1 << 2;
        const GPU_SAMPLED = 1 << 3;
        const GPU_COLOR = 1 << 4;
        /// Only meaningful when modifiers are unavailable.
        const GPU_SCANOUT_HACK = 1 << 5;
    }
}

impl Usage {
    /// Usage bits that make sense for a linear buffer.
    pub const BUFFER_MASK: Self = Self::GPU_TRANSFER
        .union(Self::GPU_UNIFORM)
        .union(Self::GPU_STORAGE);

    /// Usage bits that make sense for an image.
    pub const IMAGE_MASK: Self = Self::GPU_TRANSFER
        .union(Self::GPU_STORAGE)
        .union(Self::GPU_SAMPLED)
        .union(Self::GPU_COLOR)
        .union(Self::GPU_SCANOUT_HACK);
}

/// The abstract description of a BO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Description {
    pub flags: Flags,
    /// [`Format::INVALID`] makes the BO a buffer; anything else makes it an image.
    pub format: Format,
    /// [`Modifier::INVALID`] lets HBM pick the modifier.
    pub modifier: Modifier,
    pub usage: Usage,
}

impl Description {
    #[must_use]
    pub const fn buffer(flags: Flags, usage: Usage) -> Self {
        Self {
            flags,
            format: Format::INVALID,
            modifier: Modifier::INVALID,
            usage,
        }
    }

    #[must_use]
    pub const fn image(flags: Flags, format: Format, usage: Usage) -> Self {
        Self {
            flags,
            format,
            modifier: Modifier::INVALID,
            usage,
        }
    }

    #[must_use]
    pub const fn with_modifier(mut self, modifier: Modifier) -> Self {
        self.modifier = modifier;
        self
    }

    #[must_use]
    pub const fn is_buffer(&self) -> bool {
        self.format.is_invalid()
    }

    #[must_use]
    pub const fn is_auto_modifier(&self) -> bool {
        self.modifier.is_invalid()
    }
}

/// The extent of a BO.  The variant must match the buffer/image classification of its
/// description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    Buffer { size: u64 },
    Image { width: u32, height: u32 },
}

/// Additional requirements the computed layout must follow.
///
/// A zero alignment is treated as 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub offset_align: u64,
    pub stride_align: u64,
    pub size_align: u64,
    /// Allowed modifiers.  `None` allows any modifier.
    pub modifiers: Option<Vec<Modifier>>,
}

impl Default for Constraint {
    fn default() -> Self {
        Self {
            offset_align: 1,
            stride_align: 1,
            size_align: 1,
            modifiers: None,
        }
    }
}

impl Constraint {
    #[must_use]
    pub const fn offset_align(mut self, align: u64) -> Self {
        self.offset_align = align;
        self
    }

    #[must_use]
    pub const fn stride_align(mut self, align: u64) -> Self {
        self.stride_align = align;
        self
    }

    #[must_use]
    pub const fn size_align(mut self, align: u64) -> Self {
        self.size_align = align;
        self
    }

    #[must_use]
    pub fn modifiers(mut self, modifiers: Vec<Modifier>) -> Self {
        self.modifiers = Some(modifiers);
        self
    }

    /// Returns the effective `(offset, stride, size)` alignments of an optional constraint.
    #[must_use]
    pub fn unpack(con: Option<&Self>) -> (u64, u64, u64) {
        con.map_or((1, 1, 1), |con| {
            (
                con.offset_align.max(1),
                con.stride_align.max(1),
                con.size_align.max(1),
            )
        })
    }

    #[must_use]
    pub fn allows(con: Option<&Self>, modifier: Modifier) -> bool {
        con.and_then(|con| con.modifiers.as_ref())
            .is_none_or(|mods| mods.contains(&modifier))
    }
}

pub const MAX_PLANES: usize = 4;

/// The physical layout of a BO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: u64,
    /// [`Modifier::INVALID`] for buffers.
    pub modifier: Modifier,
    /// 0 for buffers.
    pub plane_count: u32,
    pub offsets: [u64; MAX_PLANES],
    pub strides: [u64; MAX_PLANES],
}

impl Default for Layout {
    fn default() -> Self {
        Self::new()
    }
}

impl Layout {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            size: 0,
            modifier: Modifier::INVALID,
            plane_count: 0,
            offsets: [0; MAX_PLANES],
            strides: [0; MAX_PLANES],
        }
    }

    #[must_use]
    pub const fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub const fn modifier(mut self, modifier: Modifier) -> Self {
        self.modifier = modifier;
        self
    }

    #[must_use]
    pub const fn plane_count(mut self, plane_count: u32) -> Self {
        self.plane_count = plane_count;
        self
    }

    #[must_use]
    pub const fn plane(mut self, plane: usize, offset: u64, stride: u64) -> Self {
        self.offsets[plane] = offset;
        self.strides[plane] = stride;
        self
    }

    #[must_use]
    pub const fn is_buffer(&self) -> bool {
        self.plane_count == 0
    }
}

/// Describes a buffer-buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyBuffer {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Describes a buffer-image copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyBufferImage {
    /// Starting offset of the buffer in bytes.
    pub offset: u64,
    /// Row stride of the buffer in bytes.
    pub stride: u64,
    /// Format plane of the image.
    pub plane: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}
