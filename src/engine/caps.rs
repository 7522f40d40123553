//! The capability oracle: which modifiers a device supports for which formats and usages.

use crate::engine::formats::{self, Format, Modifier};
use crate::engine::types::{Description, Flags, Usage};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_MAX_EXTENT: u32 = 16384;
pub const DEFAULT_MAX_BUFFER_SIZE: u64 = 1 << 40;

/// A family of devices sharing one capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Only linear images.
    Linear,
    /// Intel GPUs: CCS, Y-tiled, X-tiled, and linear images.
    Intel,
}

impl DeviceProfile {
    /// Picks the profile for a kernel driver name.
    #[must_use]
    pub fn from_driver(driver: &str) -> Self {
        match driver {
            "i915" | "xe" => Self::Intel,
            _ => Self::Linear,
        }
    }
}

impl FromStr for DeviceProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "intel" => Ok(Self::Intel),
            other => Err(format!("unknown device profile {other:?}")),
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => f.write_str("linear"),
            Self::Intel => f.write_str("intel"),
        }
    }
}

/// Device support for one modifier of one format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifierCaps {
    pub modifier: Modifier,
    /// Image usages this modifier can serve.
    pub usage: Usage,
    /// The tiling can only live in device-local memory.
    pub local_only: bool,
}

impl ModifierCaps {
    #[must_use]
    pub const fn new(modifier: Modifier, usage: Usage) -> Self {
        Self {
            modifier,
            usage,
            local_only: false,
        }
    }

    #[must_use]
    pub const fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }
}

/// The capability table of a device.
///
/// Modifiers of each format are kept in preference order: most compact for the device first.
#[derive(Debug, Clone)]
pub struct Capabilities {
    formats: Vec<(Format, Vec<ModifierCaps>)>,
    pub max_extent: u32,
    pub max_buffer_size: u64,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new()
    }
}

const SINGLE_PLANE_FORMATS: &[Format] = &[
    Format::R8,
    Format::GR88,
    Format::RGB565,
    Format::XRGB8888,
    Format::ARGB8888,
    Format::XBGR8888,
    Format::ABGR8888,
    Format::ABGR2101010,
    Format::ABGR16161616F,
];

impl Capabilities {
    /// An empty table: no image support at all.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            formats: Vec::new(),
            max_extent: DEFAULT_MAX_EXTENT,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    /// Adds `modifiers` for `format`, appended after any already present.
    ///
    /// Pairs HBM cannot lay out are dropped with a warning.
    #[must_use]
    pub fn with_format(mut self, format: Format, modifiers: &[ModifierCaps]) -> Self {
        let valid: Vec<ModifierCaps> = modifiers
            .iter()
            .copied()
            .filter(|caps| {
                let ok = formats::memory_plane_count(format, caps.modifier).is_some();
                if !ok {
                    log::warn!("ignoring unsupported pair {format}/{}", caps.modifier);
                }
                ok
            })
            .collect();

        if let Some((_, list)) = self.formats.iter_mut().find(|(f, _)| *f == format) {
            list.extend(valid);
        } else if !valid.is_empty() {
            self.formats.push((format, valid));
        }
        self
    }

    #[must_use]
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Linear => Self::linear_profile(),
            DeviceProfile::Intel => Self::intel_profile(),
        }
    }

    fn linear_profile() -> Self {
        let linear = [ModifierCaps::new(Modifier::LINEAR, Usage::IMAGE_MASK)];
        formats::known_formats().fold(Self::new(), |caps, format| caps.with_format(format, &linear))
    }

    fn intel_profile() -> Self {
        let tiled_usage = Usage::GPU_TRANSFER
            .union(Usage::GPU_STORAGE)
            .union(Usage::GPU_SAMPLED)
            .union(Usage::GPU_COLOR);
        let ccs_usage = Usage::GPU_TRANSFER
            .union(Usage::GPU_SAMPLED)
            .union(Usage::GPU_COLOR);
        let rgb = [
            ModifierCaps::new(Modifier::I915_Y_TILED_CCS, ccs_usage),
            ModifierCaps::new(Modifier::I915_Y_TILED, tiled_usage),
            ModifierCaps::new(Modifier::I915_X_TILED, Usage::IMAGE_MASK),
            ModifierCaps::new(Modifier::LINEAR, Usage::IMAGE_MASK),
        ];

        let video_usage = Usage::GPU_TRANSFER.union(Usage::GPU_SAMPLED);
        let semi_planar = [
            ModifierCaps::new(Modifier::I915_Y_TILED, video_usage),
            ModifierCaps::new(
                Modifier::LINEAR,
                video_usage
                    .union(Usage::GPU_STORAGE)
                    .union(Usage::GPU_SCANOUT_HACK),
            ),
        ];
        let planar = [ModifierCaps::new(Modifier::LINEAR, video_usage)];

        let caps = SINGLE_PLANE_FORMATS
            .iter()
            .fold(Self::new(), |caps, &format| caps.with_format(format, &rgb));
        caps.with_format(Format::NV12, &semi_planar)
            .with_format(Format::P010, &semi_planar)
            .with_format(Format::YUV420, &planar)
            .with_format(Format::YVU420, &planar)
    }

    fn format_caps(&self, format: Format) -> &[ModifierCaps] {
        self.formats
            .iter()
            .find(|(f, _)| *f == format)
            .map_or(&[], |(_, list)| list.as_slice())
    }

    fn modifier_caps(&self, format: Format, modifier: Modifier) -> Option<&ModifierCaps> {
        self.format_caps(format)
            .iter()
            .find(|caps| caps.modifier == modifier)
    }

    /// Formats with at least one supported modifier.
    pub fn formats(&self) -> impl Iterator<Item = Format> + '_ {
        self.formats.iter().map(|(f, _)| *f)
    }

    /// Memory plane count of a supported format/modifier pair, or 0 if unsupported.
    #[must_use]
    pub fn plane_count(&self, format: Format, modifier: Modifier) -> u32 {
        if self.modifier_caps(format, modifier).is_none() {
            return 0;
        }
        formats::memory_plane_count(format, modifier).unwrap_or(0)
    }

    /// Supported modifiers for a description, in preference order.
    ///
    /// Buffers never have modifiers.  The modifier of the description itself is ignored, and
    /// compressed modifiers are left out when the description forbids compression.
    pub fn modifiers<'a>(&'a self, desc: &'a Description) -> impl Iterator<Item = Modifier> + 'a {
        let list = if desc.is_buffer() || desc.usage.is_empty() {
            &[][..]
        } else {
            self.format_caps(desc.format)
        };
        let no_compression = desc.flags.contains(Flags::NO_COMPRESSION);
        list.iter()
            .filter(move |caps| caps.usage.contains(desc.usage))
            .map(|caps| caps.modifier)
            .filter(move |&m| !(no_compression && self.is_compressed(m)))
    }

    /// Size-query enumeration: with an empty `out` returns the number of supported modifiers,
    /// otherwise fills `out` and returns how many were written.
    pub fn enumerate_modifiers(&self, desc: &Description, out: &mut [Modifier]) -> usize {
        if out.is_empty() {
            return self.modifiers(desc).count();
        }
        let mut written = 0;
        for (slot, modifier) in out.iter_mut().zip(self.modifiers(desc)) {
            *slot = modifier;
            written += 1;
        }
        written
    }

    #[must_use]
    pub fn supports_modifier(&self, desc: &Description, modifier: Modifier) -> bool {
        self.modifiers(desc).any(|m| m == modifier)
    }

    #[must_use]
    pub fn is_compressed(&self, modifier: Modifier) -> bool {
        formats::modifier_info(modifier).is_some_and(|info| info.compressed)
    }

    /// Whether an image with this format and modifier must be placed in device-local memory.
    #[must_use]
    pub fn needs_local(&self, format: Format, modifier: Modifier) -> bool {
        self.modifier_caps(format, modifier)
            .is_some_and(|caps| caps.local_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(format: Format, usage: Usage) -> Description {
        Description::image(Flags::empty(), format, usage)
    }

    #[test]
    fn buffers_have_no_modifiers() {
        let caps = Capabilities::for_profile(DeviceProfile::Intel);
        let desc = Description::buffer(Flags::MAP, Usage::GPU_TRANSFER);
        assert_eq!(caps.enumerate_modifiers(&desc, &mut []), 0);
        assert!(!caps.supports_modifier(&desc, Modifier::LINEAR));
    }

    #[test]
    fn intel_prefers_compressed_tiling() {
        let caps = Capabilities::for_profile(DeviceProfile::Intel);
        let desc = image(Format::ARGB8888, Usage::GPU_SAMPLED);
        let mods: Vec<_> = caps.modifiers(&desc).collect();
        assert_eq!(
            mods,
            vec![
                Modifier::I915_Y_TILED_CCS,
                Modifier::I915_Y_TILED,
                Modifier::I915_X_TILED,
                Modifier::LINEAR
            ]
        );
    }

    #[test]
    fn usage_filters_modifiers() {
        let caps = Capabilities::for_profile(DeviceProfile::Intel);
        let storage: Vec<_> = caps
            .modifiers(&image(Format::ARGB8888, Usage::GPU_STORAGE))
            .collect();
        assert!(!storage.contains(&Modifier::I915_Y_TILED_CCS));

        let scanout: Vec<_> = caps
            .modifiers(&image(Format::XRGB8888, Usage::GPU_SCANOUT_HACK))
            .collect();
        assert_eq!(scanout, vec![Modifier::I915_X_TILED, Modifier::LINEAR]);

        // uniform is meaningless for images
        assert_eq!(
            caps.modifiers(&image(Format::R8, Usage::GPU_UNIFORM)).count(),
            0
        );
    }

    #[test]
    fn size_query_is_stable() {
        let caps = Capabilities::for_profile(DeviceProfile::Intel);
        let desc = image(Format::XBGR8888, Usage::GPU_COLOR);
        let count = caps.enumerate_modifiers(&desc, &mut []);
        assert_eq!(count, 4);

        let mut out = vec![Modifier::INVALID; count];
        assert_eq!(caps.enumerate_modifiers(&desc, &mut out), count);
        assert_eq!(caps.enumerate_modifiers(&desc, &mut []), count);
        for m in &out {
            assert!(caps.supports_modifier(&desc, *m));
        }

        let mut short = [Modifier::INVALID; 2];
        assert_eq!(caps.enumerate_modifiers(&desc, &mut short), 2);
        assert_eq!(short, [Modifier::I915_Y_TILED_CCS, Modifier::I915_Y_TILED]);
    }

    #[test]
    fn plane_counts() {
        let caps = Capabilities::for_profile(DeviceProfile::Intel);
        assert_eq!(caps.plane_count(Format::ARGB8888, Modifier::I915_Y_TILED_CCS), 2);
        assert_eq!(caps.plane_count(Format::NV12, Modifier::I915_Y_TILED), 2);
        assert_eq!(caps.plane_count(Format::YUV420, Modifier::I915_Y_TILED), 0);
        assert_eq!(caps.plane_count(Format::INVALID, Modifier::LINEAR), 0);

        let linear = Capabilities::for_profile(DeviceProfile::Linear);
        assert_eq!(linear.plane_count(Format::ARGB8888, Modifier::I915_X_TILED), 0);
        assert_eq!(linear.plane_count(Format::YUV420, Modifier::LINEAR), 3);
    }

    #[test]
    fn invalid_pairs_are_dropped() {
        let caps = Capabilities::new().with_format(
            Format::NV12,
            &[
                ModifierCaps::new(Modifier::I915_Y_TILED_CCS, Usage::IMAGE_MASK),
                ModifierCaps::new(Modifier::LINEAR, Usage::IMAGE_MASK),
            ],
        );
        let mods: Vec<_> = caps
            .modifiers(&image(Format::NV12, Usage::GPU_SAMPLED))
            .collect();
        assert_eq!(mods, vec![Modifier::LINEAR]);
    }

    #[test]
    fn no_compression_hides_compressed_modifiers() {
        let caps = Capabilities::for_profile(DeviceProfile::Intel);
        let desc = Description::image(Flags::NO_COMPRESSION, Format::XRGB8888, Usage::GPU_SAMPLED);
        let mods: Vec<_> = caps.modifiers(&desc).collect();
        assert_eq!(
            mods,
            vec![Modifier::I915_Y_TILED, Modifier::I915_X_TILED, Modifier::LINEAR]
        );
        assert!(!caps.supports_modifier(&desc, Modifier::I915_Y_TILED_CCS));
        assert_eq!(caps.enumerate_modifiers(&desc, &mut []), 3);
    }

    #[test]
    fn profile_from_driver_and_string() {
        assert_eq!(DeviceProfile::from_driver("i915"), DeviceProfile::Intel);
        assert_eq!(DeviceProfile::from_driver("xe"), DeviceProfile::Intel);
        assert_eq!(DeviceProfile::from_driver("amdgpu"), DeviceProfile::Linear);
        assert_eq!("Intel".parse::<DeviceProfile>(), Ok(DeviceProfile::Intel));
        assert!("vivante".parse::<DeviceProfile>().is_err());
    }

    #[test]
    fn compression_and_locality() {
        let caps = Capabilities::new().with_format(
            Format::R8,
            &[ModifierCaps::new(Modifier::I915_Y_TILED, Usage::IMAGE_MASK).local_only()],
        );
        assert!(caps.is_compressed(Modifier::I915_Y_TILED_CCS));
        assert!(!caps.is_compressed(Modifier::LINEAR));
        assert!(caps.needs_local(Format::R8, Modifier::I915_Y_TILED));
        assert!(!caps.needs_local(Format::R8, Modifier::LINEAR));
    }
}
