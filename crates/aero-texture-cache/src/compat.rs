//! Compatibility predicates between texture descriptions.
//!
//! Two textures are never compared by raw equality: what matters is whether one can be used as,
//! viewed as, or copied into the other.

use bitflags::bitflags;

use crate::backend::{Capabilities, CapabilityFlags};
use crate::format::{Format, FormatClass, FormatInfo};
use crate::info::{Target, TextureInfo};
use crate::size::{
    align_up, block_linear_aligned_size, div_round_up, linear_aligned_size, mip_gob_block_sizes,
    Size, STRIDE_ALIGNMENT,
};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct TextureSearchFlags: u32 {
        const FOR_SAMPLER = 1 << 0;
        const FOR_COPY = 1 << 1;
        const DEPTH_ALIAS = 1 << 2;
        const WITH_UPSCALE = 1 << 3;
        const NO_CREATE = 1 << 4;
        const DISCARD_DATA = 1 << 5;
        /// Match only on the exact parameters, ignoring aligned-size leniency.
        const STRICT = 1 << 6;
    }
}

/// How well an existing texture matches a request for the same address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TextureMatchQuality {
    NoMatch,
    FormatAlias,
    Perfect,
}

/// How an overlapping texture relates to another texture's layout.
///
/// Ordered from least to most compatible so results can be combined with `min`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TextureViewCompatibility {
    Incompatible,
    LayoutIncompatible,
    CopyOnly,
    FormatAlias,
    Full,
}

impl TextureViewCompatibility {
    pub fn propagate(self, other: Self) -> Self {
        self.min(other)
    }
}

/// The format the host stores a texture as.
pub fn to_host_compatible_format(info: &TextureInfo, caps: &Capabilities) -> FormatInfo {
    let format = info.format_info.format;

    if !caps.supports(CapabilityFlags::ASTC_COMPRESSION) {
        if format.is_astc_unorm() {
            return Format::R8G8B8A8Unorm.info();
        } else if format.is_astc_srgb() {
            return Format::R8G8B8A8Srgb.info();
        }
    }

    if !host_supports_bc_format(format, info.target, caps) {
        match format {
            Format::Bc1RgbaSrgb | Format::Bc2Srgb | Format::Bc3Srgb | Format::Bc7Srgb => {
                return Format::R8G8B8A8Srgb.info()
            }
            Format::Bc1RgbaUnorm | Format::Bc2Unorm | Format::Bc3Unorm | Format::Bc7Unorm => {
                return Format::R8G8B8A8Unorm.info()
            }
            Format::Bc4Unorm => return Format::R8Unorm.info(),
            Format::Bc4Snorm => return Format::R8Snorm.info(),
            Format::Bc5Unorm => return Format::R8G8Unorm.info(),
            Format::Bc5Snorm => return Format::R8G8Snorm.info(),
            Format::Bc6HSfloat | Format::Bc6HUfloat => return Format::R16G16B16A16Float.info(),
            _ => {}
        }
    }

    if !caps.supports(CapabilityFlags::ETC2_COMPRESSION) {
        match format {
            Format::Etc2RgbaSrgb | Format::Etc2RgbPtaSrgb | Format::Etc2RgbSrgb => {
                return Format::R8G8B8A8Srgb.info()
            }
            Format::Etc2RgbaUnorm | Format::Etc2RgbPtaUnorm | Format::Etc2RgbUnorm => {
                return Format::R8G8B8A8Unorm.info()
            }
            _ => {}
        }
    }

    if !caps.supports(CapabilityFlags::R4G4_FORMAT) && format == Format::R4G4Unorm {
        return if caps.supports(CapabilityFlags::R4G4B4A4_FORMAT) {
            Format::R4G4B4A4Unorm.info()
        } else {
            Format::R8G8B8A8Unorm.info()
        };
    }

    if format == Format::R4G4B4A4Unorm {
        if !caps.supports(CapabilityFlags::R4G4B4A4_FORMAT) {
            return Format::R8G8B8A8Unorm.info();
        }
    } else if !caps.supports(CapabilityFlags::FIVE_BIT_COMPONENT_FORMAT) && format.is_16bit_packed()
    {
        return if format.is_bgr() {
            Format::B8G8R8A8Unorm.info()
        } else {
            Format::R8G8B8A8Unorm.info()
        };
    }

    info.format_info
}

pub fn is_format_host_incompatible(info: &TextureInfo, caps: &Capabilities) -> bool {
    to_host_compatible_format(info, caps).format != info.format_info.format
}

pub fn host_supports_bc_format(format: Format, target: Target, caps: &Capabilities) -> bool {
    let not_3d_or_supported = target != Target::Texture3D
        || caps.supports(CapabilityFlags::THREE_D_TEXTURE_COMPRESSION);

    match format {
        Format::Bc1RgbaSrgb
        | Format::Bc1RgbaUnorm
        | Format::Bc2Srgb
        | Format::Bc2Unorm
        | Format::Bc3Srgb
        | Format::Bc3Unorm => caps.supports(CapabilityFlags::BC123_COMPRESSION) && not_3d_or_supported,
        Format::Bc4Unorm | Format::Bc4Snorm | Format::Bc5Unorm | Format::Bc5Snorm => {
            caps.supports(CapabilityFlags::BC45_COMPRESSION) && not_3d_or_supported
        }
        Format::Bc6HSfloat | Format::Bc6HUfloat | Format::Bc7Srgb | Format::Bc7Unorm => {
            caps.supports(CapabilityFlags::BC67_COMPRESSION) && not_3d_or_supported
        }
        _ => true,
    }
}

/// Whether host data can be written back to guest memory.
///
/// Converted formats cannot be re-encoded, and the host does not expose multisample data.
pub fn can_texture_flush(info: &TextureInfo, caps: &Capabilities) -> bool {
    !is_format_host_incompatible(info, caps) && !info.target.is_multisample()
}

pub fn format_matches(
    lhs: &TextureInfo,
    rhs: &TextureInfo,
    for_sampler: bool,
    depth_alias: bool,
) -> TextureMatchQuality {
    let lhs_format = lhs.format_info.format;
    let rhs_format = rhs.format_info.format;

    // D32F and R32F share a representation; R32F is how depth textures get sampled.
    if is_valid_depth_as_color_alias(lhs_format, rhs_format) && (for_sampler || depth_alias) {
        return TextureMatchQuality::FormatAlias;
    }

    if depth_alias {
        // The 2D engine has no depth formats and uses equivalent color formats instead.
        let alias = matches!(
            (lhs_format, rhs_format),
            (Format::S8Uint, Format::R8Unorm)
                | (Format::D24UnormS8Uint, Format::B8G8R8A8Unorm)
                | (Format::S8UintD24Unorm, Format::B8G8R8A8Unorm)
                | (Format::X8UintD24Unorm, Format::B8G8R8A8Unorm)
                | (Format::D32FloatS8Uint, Format::R32G32Float)
        );
        if alias {
            return TextureMatchQuality::FormatAlias;
        }
    }

    if lhs_format == rhs_format {
        TextureMatchQuality::Perfect
    } else {
        TextureMatchQuality::NoMatch
    }
}

/// Linear textures compare by stride, block-linear ones by GOB block sizes.
pub fn layout_matches(lhs: &TextureInfo, rhs: &TextureInfo) -> bool {
    if lhs.is_linear != rhs.is_linear {
        return false;
    }

    if rhs.is_linear {
        lhs.stride == rhs.stride
    } else {
        lhs.gob_blocks_in_y == rhs.gob_blocks_in_y && lhs.gob_blocks_in_z == rhs.gob_blocks_in_z
    }
}

fn aligned_stride(stride: u32, level: u32) -> u32 {
    align_up((stride >> level).max(1) as u64, STRIDE_ALIGNMENT as u64) as u32
}

pub fn copy_size_matches(lhs: &TextureInfo, rhs: &TextureInfo, lhs_level: u32, rhs_level: u32) -> bool {
    let size = aligned_size(lhs, lhs_level);
    let other = aligned_size(rhs, rhs_level);

    if size.width == other.width && size.height == other.height {
        true
    } else if lhs.is_linear && rhs.is_linear {
        aligned_stride(lhs.stride, lhs_level) == rhs.stride
    } else {
        false
    }
}

pub fn view_size_matches(
    lhs: &TextureInfo,
    rhs: &TextureInfo,
    exact: bool,
    level: u32,
) -> TextureViewCompatibility {
    let lhs_aligned = aligned_size(lhs, level);
    let rhs_aligned = aligned_size(rhs, 0);
    let lhs_size = size_in_blocks(lhs, level);
    let rhs_size = size_in_blocks(rhs, 0);

    let mut aligned_width_matches = lhs_aligned.width == rhs_aligned.width;

    let lhs_bpp = lhs.format_info.bytes_per_pixel;
    let rhs_bpp = rhs.format_info.bytes_per_pixel;
    if lhs_bpp != rhs_bpp && is_incompatible_format_aliasing_allowed(&lhs.format_info, &rhs.format_info) {
        // The wider format may need padding when one width is not a multiple of the other.
        let alignment = lhs_bpp.max(rhs_bpp) as u64;
        let lhs_stride = align_up((lhs_size.width * lhs_bpp) as u64, alignment);
        let rhs_stride = align_up((rhs_size.width * rhs_bpp) as u64, alignment);
        aligned_width_matches = lhs_stride == rhs_stride;
    }

    // A copy may cover a subset of 3D slices.
    let result = if rhs.target == Target::Texture3D && lhs_size.depth != rhs_size.depth {
        TextureViewCompatibility::CopyOnly
    } else {
        TextureViewCompatibility::Full
    };

    // Widths may be aligned differently by different users of the same texture; heights must match.
    if aligned_width_matches && lhs_size.height == rhs_size.height {
        if (exact && lhs_size.width != rhs_size.width) || lhs_size.width < rhs_size.width {
            TextureViewCompatibility::CopyOnly
        } else {
            result
        }
    } else if lhs.is_linear && rhs.is_linear && lhs_size.height == rhs_size.height {
        if aligned_stride(lhs.stride, level) == rhs.stride {
            TextureViewCompatibility::CopyOnly
        } else {
            TextureViewCompatibility::LayoutIncompatible
        }
    } else if lhs.target.is_multisample() != rhs.target.is_multisample()
        && aligned_width_matches
        && lhs_aligned.height == rhs_aligned.height
    {
        TextureViewCompatibility::CopyOnly
    } else {
        TextureViewCompatibility::LayoutIncompatible
    }
}

pub fn view_sub_images_in_bounds(
    parent: &TextureInfo,
    child: &TextureInfo,
    layer: u32,
    level: u32,
) -> TextureViewCompatibility {
    if level + child.levels <= parent.levels && layer + child.slices() <= parent.slices() {
        TextureViewCompatibility::Full
    } else {
        TextureViewCompatibility::LayoutIncompatible
    }
}

pub fn size_matches(lhs: &TextureInfo, rhs: &TextureInfo, exact: bool) -> bool {
    if lhs.layers() != rhs.layers() {
        return false;
    }

    let lhs_size = size_in_blocks(lhs, 0);
    let rhs_size = size_in_blocks(rhs, 0);

    if exact || lhs.is_linear || rhs.is_linear {
        lhs_size == rhs_size
    } else {
        let lhs_aligned = aligned_size(lhs, 0);
        let rhs_aligned = aligned_size(rhs, 0);
        lhs_aligned.width == rhs_aligned.width
            && lhs_size.width >= rhs_size.width
            && lhs_size.height == rhs_size.height
            && lhs_size.depth == rhs_size.depth
    }
}

pub fn aligned_size(info: &TextureInfo, level: u32) -> Size {
    let width = (info.width >> level).max(1);
    let height = (info.height >> level).max(1);
    let depth = (info.depth() >> level).max(1);
    let format = &info.format_info;

    if info.is_linear {
        linear_aligned_size(
            width,
            height,
            format.block_width,
            format.block_height,
            format.bytes_per_pixel,
        )
    } else {
        block_linear_aligned_size(
            width,
            height,
            depth,
            format.block_width,
            format.block_height,
            format.bytes_per_pixel,
            info.gob_blocks_in_y,
            info.gob_blocks_in_z,
            info.gob_blocks_in_tile_x,
        )
    }
}

pub fn size_in_blocks(info: &TextureInfo, level: u32) -> Size {
    Size::new(
        div_round_up((info.width >> level).max(1), info.format_info.block_width),
        div_round_up((info.height >> level).max(1), info.format_info.block_height),
        (info.depth() >> level).max(1),
    )
}

/// Whether level `level` of `lhs` is laid out like level 0 of `rhs`.
pub fn view_layout_compatible(lhs: &TextureInfo, rhs: &TextureInfo, level: u32) -> bool {
    if lhs.is_linear != rhs.is_linear {
        return false;
    }

    if rhs.is_linear {
        aligned_stride(lhs.stride, level) == rhs.stride
    } else {
        let (gob_y, gob_z) = mip_gob_block_sizes(
            (lhs.height >> level).max(1),
            (lhs.depth() >> level).max(1),
            lhs.format_info.block_height,
            lhs.gob_blocks_in_y,
            lhs.gob_blocks_in_z,
        );
        gob_y == rhs.gob_blocks_in_y && gob_z == rhs.gob_blocks_in_z
    }
}

/// Whether level `lhs_level` of `lhs` is laid out like level `rhs_level` of `rhs`.
pub fn view_layout_compatible_levels(
    lhs: &TextureInfo,
    rhs: &TextureInfo,
    lhs_level: u32,
    rhs_level: u32,
) -> bool {
    if lhs.is_linear != rhs.is_linear {
        return false;
    }

    if rhs.is_linear {
        aligned_stride(lhs.stride, lhs_level) == aligned_stride(rhs.stride, rhs_level)
    } else {
        let lhs_blocks = mip_gob_block_sizes(
            (lhs.height >> lhs_level).max(1),
            (lhs.depth() >> lhs_level).max(1),
            lhs.format_info.block_height,
            lhs.gob_blocks_in_y,
            lhs.gob_blocks_in_z,
        );
        let rhs_blocks = mip_gob_block_sizes(
            (rhs.height >> rhs_level).max(1),
            (rhs.depth() >> rhs_level).max(1),
            rhs.format_info.block_height,
            rhs.gob_blocks_in_y,
            rhs.gob_blocks_in_z,
        );
        lhs_blocks == rhs_blocks
    }
}

pub fn view_format_compatible(
    lhs: &TextureInfo,
    rhs: &TextureInfo,
    caps: &Capabilities,
    flags: TextureSearchFlags,
) -> TextureViewCompatibility {
    let lhs_format = &lhs.format_info;
    let rhs_format = &rhs.format_info;

    if lhs_format.format.is_depth_or_stencil() || rhs_format.format.is_depth_or_stencil() {
        let quality = format_matches(
            lhs,
            rhs,
            flags.contains(TextureSearchFlags::FOR_SAMPLER),
            flags.contains(TextureSearchFlags::DEPTH_ALIAS),
        );

        return match quality {
            TextureMatchQuality::Perfect => TextureViewCompatibility::Full,
            TextureMatchQuality::FormatAlias => TextureViewCompatibility::FormatAlias,
            TextureMatchQuality::NoMatch
                if is_valid_color_as_depth_alias(lhs_format.format, rhs_format.format)
                    || is_valid_depth_as_color_alias(lhs_format.format, rhs_format.format) =>
            {
                TextureViewCompatibility::CopyOnly
            }
            TextureMatchQuality::NoMatch => TextureViewCompatibility::Incompatible,
        };
    }

    if is_format_host_incompatible(lhs, caps) || is_format_host_incompatible(rhs, caps) {
        return if lhs_format.format == rhs_format.format {
            TextureViewCompatibility::Full
        } else {
            TextureViewCompatibility::Incompatible
        };
    }

    if lhs_format.is_compressed() && rhs_format.is_compressed() {
        if FormatClass::of(lhs_format.format) == FormatClass::of(rhs_format.format) {
            TextureViewCompatibility::Full
        } else {
            TextureViewCompatibility::Incompatible
        }
    } else if lhs_format.bytes_per_pixel == rhs_format.bytes_per_pixel {
        if lhs_format.is_compressed() == rhs_format.is_compressed() {
            TextureViewCompatibility::Full
        } else {
            TextureViewCompatibility::CopyOnly
        }
    } else if is_incompatible_format_aliasing_allowed(lhs_format, rhs_format) {
        TextureViewCompatibility::CopyOnly
    } else {
        TextureViewCompatibility::Incompatible
    }
}

fn is_valid_color_as_depth_alias(lhs: Format, rhs: Format) -> bool {
    matches!(
        (lhs, rhs),
        (Format::R32Float, Format::D32Float) | (Format::R16Unorm, Format::D16Unorm)
    )
}

fn is_valid_depth_as_color_alias(lhs: Format, rhs: Format) -> bool {
    matches!(
        (lhs, rhs),
        (Format::D32Float, Format::R32Float) | (Format::D16Unorm, Format::R16Unorm)
    )
}

/// Different bytes-per-pixel aliasing that guests are known to rely on. Width times bpp must
/// still agree for the textures to be copy compatible.
fn is_incompatible_format_aliasing_allowed(lhs: &FormatInfo, rhs: &FormatInfo) -> bool {
    let (narrow, wide) = if rhs.bytes_per_pixel < lhs.bytes_per_pixel {
        (rhs.format, lhs.format)
    } else {
        (lhs.format, rhs.format)
    };

    matches!(
        (narrow, wide),
        (Format::R8G8B8A8Unorm, Format::R32G32B32A32Float)
            | (Format::R8Unorm, Format::R8G8B8A8Unorm)
            | (Format::R8Unorm, Format::R32Uint)
    )
}

pub fn view_target_compatible(
    lhs: &TextureInfo,
    rhs: &TextureInfo,
    caps: &Capabilities,
) -> TextureViewCompatibility {
    use Target::*;

    let cube_view = if caps.supports(CapabilityFlags::CUBEMAP_VIEW) {
        TextureViewCompatibility::Full
    } else {
        TextureViewCompatibility::CopyOnly
    };

    let result = match lhs.target {
        Texture1D | Texture1DArray => matches!(rhs.target, Texture1D | Texture1DArray),
        Texture2D => matches!(rhs.target, Texture2D | Texture2DArray),
        Texture2DArray => {
            if matches!(rhs.target, Cubemap | CubemapArray) {
                return cube_view;
            }
            matches!(rhs.target, Texture2D | Texture2DArray)
        }
        Cubemap | CubemapArray => {
            if matches!(rhs.target, Texture2D | Texture2DArray) {
                return cube_view;
            }
            matches!(rhs.target, Cubemap | CubemapArray)
        }
        Texture2DMultisample | Texture2DMultisampleArray => {
            if matches!(rhs.target, Texture2D | Texture2DArray) {
                return TextureViewCompatibility::CopyOnly;
            }
            matches!(rhs.target, Texture2DMultisample | Texture2DMultisampleArray)
        }
        Texture3D => {
            if rhs.target == Texture2D {
                return TextureViewCompatibility::CopyOnly;
            }
            rhs.target == Texture3D
        }
        TextureBuffer => false,
    };

    if result {
        TextureViewCompatibility::Full
    } else {
        TextureViewCompatibility::Incompatible
    }
}

pub fn sampler_params_matches(lhs: &TextureInfo, rhs: &TextureInfo) -> bool {
    lhs.depth_stencil_mode == rhs.depth_stencil_mode && lhs.swizzle == rhs.swizzle
}

pub fn target_and_samples_compatible(lhs: &TextureInfo, rhs: &TextureInfo) -> bool {
    lhs.target == rhs.target
        && lhs.samples_in_x == rhs.samples_in_x
        && lhs.samples_in_y == rhs.samples_in_y
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn info(width: u32, height: u32, format: Format) -> TextureInfo {
        TextureInfo {
            width,
            height,
            gob_blocks_in_y: 16,
            format_info: format.info(),
            ..TextureInfo::default()
        }
    }

    #[test]
    fn compatibility_combines_to_the_weaker_result() {
        use TextureViewCompatibility::*;
        assert_eq!(Full.propagate(CopyOnly), CopyOnly);
        assert_eq!(LayoutIncompatible.propagate(FormatAlias), LayoutIncompatible);
        assert!(Incompatible < LayoutIncompatible);
    }

    #[test]
    fn depth_as_color_aliases_only_for_samplers() {
        let depth = info(64, 64, Format::D32Float);
        let color = info(64, 64, Format::R32Float);
        let caps = Capabilities::default();

        assert_eq!(
            view_format_compatible(&depth, &color, &caps, TextureSearchFlags::FOR_SAMPLER),
            TextureViewCompatibility::FormatAlias
        );
        assert_eq!(
            view_format_compatible(&depth, &color, &caps, TextureSearchFlags::empty()),
            TextureViewCompatibility::CopyOnly
        );
        assert_eq!(
            view_format_compatible(&color, &info(64, 64, Format::D16Unorm), &caps, TextureSearchFlags::empty()),
            TextureViewCompatibility::Incompatible
        );
    }

    #[test]
    fn equal_bpp_color_formats_share_storage() {
        let caps = Capabilities::default();
        assert_eq!(
            view_format_compatible(
                &info(8, 8, Format::R8G8B8A8Unorm),
                &info(8, 8, Format::R32Float),
                &caps,
                TextureSearchFlags::empty()
            ),
            TextureViewCompatibility::Full
        );
        assert_eq!(
            view_format_compatible(
                &info(8, 8, Format::R8Unorm),
                &info(8, 8, Format::R8G8B8A8Unorm),
                &caps,
                TextureSearchFlags::empty()
            ),
            TextureViewCompatibility::CopyOnly
        );
    }

    #[test]
    fn host_substitution_follows_capabilities() {
        let mut caps = Capabilities::default();
        caps.flags.remove(CapabilityFlags::ASTC_COMPRESSION | CapabilityFlags::FIVE_BIT_COMPONENT_FORMAT);

        let astc = info(16, 16, Format::Astc4x4Srgb);
        assert_eq!(to_host_compatible_format(&astc, &caps).format, Format::R8G8B8A8Srgb);
        assert!(!can_texture_flush(&astc, &caps));

        let packed = info(16, 16, Format::B5G6R5Unorm);
        assert_eq!(to_host_compatible_format(&packed, &caps).format, Format::B8G8R8A8Unorm);

        let plain = info(16, 16, Format::R8G8B8A8Unorm);
        assert!(!is_format_host_incompatible(&plain, &caps));
    }

    #[test]
    fn narrower_texture_is_copy_only() {
        let wide = info(256, 64, Format::R8G8B8A8Unorm);
        let narrow = info(250, 64, Format::R8G8B8A8Unorm);
        assert_eq!(view_size_matches(&wide, &narrow, false, 0), TextureViewCompatibility::Full);
        assert_eq!(view_size_matches(&narrow, &wide, false, 0), TextureViewCompatibility::CopyOnly);
        assert_eq!(
            view_size_matches(&wide, &info(256, 32, Format::R8G8B8A8Unorm), false, 0),
            TextureViewCompatibility::LayoutIncompatible
        );
    }

    #[test]
    fn cube_views_depend_on_host_support() {
        let array = TextureInfo {
            depth_or_layers: 6,
            target: Target::Texture2DArray,
            ..info(32, 32, Format::R8G8B8A8Unorm)
        };
        let cube = TextureInfo {
            target: Target::Cubemap,
            ..info(32, 32, Format::R8G8B8A8Unorm)
        };
        let mut caps = Capabilities::default();
        assert_eq!(view_target_compatible(&array, &cube, &caps), TextureViewCompatibility::Full);
        caps.flags.remove(CapabilityFlags::CUBEMAP_VIEW);
        assert_eq!(view_target_compatible(&array, &cube, &caps), TextureViewCompatibility::CopyOnly);
    }

    #[test]
    fn mip_level_layout_uses_shrunk_gob_blocks() {
        let parent = TextureInfo {
            levels: 4,
            ..info(256, 256, Format::R8G8B8A8Unorm)
        };
        let level2 = TextureInfo {
            gob_blocks_in_y: 8,
            ..info(64, 64, Format::R8G8B8A8Unorm)
        };
        assert!(view_layout_compatible(&parent, &level2, 2));
        assert!(!view_layout_compatible(&parent, &level2, 0));
    }
}
