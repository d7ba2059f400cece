//! Conversion between guest memory layouts and the tightly packed layout host uploads use.
//!
//! Host data for a whole texture is level-major: every layer of level 0, then every layer of
//! level 1, and so on. A 3D level is a single "layer" holding all of its depth slices.

use crate::info::{Target, TextureInfo};
use crate::size::{div_round_up, BlockLinearLevel, SizeInfo};

/// How one mip level of a texture is laid out in guest memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceLayout {
    BlockLinear(BlockLinearLevel),
    Linear {
        stride: u32,
        row_bytes: u32,
        height: u32,
    },
    Raw {
        len: u32,
    },
}

impl SurfaceLayout {
    pub fn for_level(info: &TextureInfo, level: u32) -> Self {
        let format = &info.format_info;
        if info.target == Target::TextureBuffer {
            SurfaceLayout::Raw {
                len: info.width * format.bytes_per_pixel,
            }
        } else if info.is_linear {
            SurfaceLayout::Linear {
                stride: info.stride,
                row_bytes: div_round_up(info.width, format.block_width) * format.bytes_per_pixel,
                height: div_round_up(info.height, format.block_height),
            }
        } else {
            SurfaceLayout::BlockLinear(info.block_linear_params().level(level))
        }
    }

    /// Tightly packed size of `depth` planes.
    pub fn packed_size(&self, depth: u32) -> usize {
        match *self {
            SurfaceLayout::BlockLinear(level) => {
                (level.width * level.bytes_per_pixel) as usize * level.height as usize * depth as usize
            }
            SurfaceLayout::Linear {
                row_bytes, height, ..
            } => row_bytes as usize * height as usize,
            SurfaceLayout::Raw { len } => len as usize,
        }
    }

    /// Converts `depth` planes starting at the beginning of `guest` to packed rows.
    ///
    /// Bytes past the end of `guest` read as zero.
    pub fn deswizzle(&self, depth: u32, guest: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; self.packed_size(depth)];
        match *self {
            SurfaceLayout::BlockLinear(level) => {
                let bpp = level.bytes_per_pixel as usize;
                let mut dst = 0;
                for z in 0..depth {
                    for y in 0..level.height {
                        for x in 0..level.width {
                            let src = level.offset_of(x * level.bytes_per_pixel, y, z) as usize;
                            if let Some(texel) = guest.get(src..src + bpp) {
                                out[dst..dst + bpp].copy_from_slice(texel);
                            }
                            dst += bpp;
                        }
                    }
                }
            }
            SurfaceLayout::Linear {
                stride,
                row_bytes,
                height,
            } => {
                let row_bytes = row_bytes as usize;
                for y in 0..height as usize {
                    let src = y * stride as usize;
                    let available = guest.len().saturating_sub(src).min(row_bytes);
                    if available > 0 {
                        out[y * row_bytes..y * row_bytes + available]
                            .copy_from_slice(&guest[src..src + available]);
                    }
                }
            }
            SurfaceLayout::Raw { len } => {
                let n = guest.len().min(len as usize);
                out[..n].copy_from_slice(&guest[..n]);
            }
        }
        out
    }

    /// Writes packed rows back into guest layout. `guest` must already hold the surrounding bytes
    /// so padding between rows and GOBs is preserved.
    pub fn swizzle(&self, depth: u32, packed: &[u8], guest: &mut [u8]) {
        match *self {
            SurfaceLayout::BlockLinear(level) => {
                let bpp = level.bytes_per_pixel as usize;
                let mut src = 0;
                for z in 0..depth {
                    for y in 0..level.height {
                        for x in 0..level.width {
                            let dst = level.offset_of(x * level.bytes_per_pixel, y, z) as usize;
                            if let (Some(out), Some(texel)) =
                                (guest.get_mut(dst..dst + bpp), packed.get(src..src + bpp))
                            {
                                out.copy_from_slice(texel);
                            }
                            src += bpp;
                        }
                    }
                }
            }
            SurfaceLayout::Linear {
                stride,
                row_bytes,
                height,
            } => {
                let row_bytes = row_bytes as usize;
                for y in 0..height as usize {
                    let dst = y * stride as usize;
                    let Some(row) = packed.get(y * row_bytes..(y + 1) * row_bytes) else {
                        break;
                    };
                    let available = guest.len().saturating_sub(dst).min(row_bytes);
                    guest[dst..dst + available].copy_from_slice(&row[..available]);
                }
            }
            SurfaceLayout::Raw { len } => {
                let n = guest.len().min(packed.len()).min(len as usize);
                guest[..n].copy_from_slice(&packed[..n]);
            }
        }
    }
}

fn slice_offset(size: &SizeInfo, layer: u32, level: u32) -> usize {
    if size.is_3d() {
        size.mip_offset(level) as usize
    } else {
        size.all_offsets()
            .get((layer * size.levels() + level) as usize)
            .copied()
            .unwrap_or(size.total_size) as usize
    }
}

fn layers_for(info: &TextureInfo, size: &SizeInfo) -> u32 {
    if size.is_3d() {
        1
    } else {
        info.layers()
    }
}

fn depth_for(info: &TextureInfo, size: &SizeInfo, level: u32) -> u32 {
    if size.is_3d() {
        (info.depth() >> level).max(1)
    } else {
        1
    }
}

/// Decodes a whole texture from its guest bytes (starting at the texture's first byte).
pub fn decode_texture(info: &TextureInfo, size: &SizeInfo, guest: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for level in 0..size.levels() {
        let layout = SurfaceLayout::for_level(info, level);
        let depth = depth_for(info, size, level);
        for layer in 0..layers_for(info, size) {
            let offset = slice_offset(size, layer, level);
            out.extend_from_slice(&layout.deswizzle(depth, guest.get(offset..).unwrap_or(&[])));
        }
    }
    out
}

/// Decodes one slice whose guest bytes start at the beginning of `guest`.
///
/// For 3D textures `single` selects one depth plane instead of the whole level.
pub fn decode_slice(info: &TextureInfo, level: u32, single: bool, guest: &[u8]) -> Vec<u8> {
    let layout = SurfaceLayout::for_level(info, level);
    let depth = if info.target == Target::Texture3D && !single {
        (info.depth() >> level).max(1)
    } else {
        1
    };
    layout.deswizzle(depth, guest)
}

/// Encodes packed host data for a whole texture into `guest`, which holds the texture's current
/// guest bytes.
pub fn encode_texture(info: &TextureInfo, size: &SizeInfo, packed: &[u8], guest: &mut [u8]) {
    let mut src = 0;
    for level in 0..size.levels() {
        let layout = SurfaceLayout::for_level(info, level);
        let depth = depth_for(info, size, level);
        let len = layout.packed_size(depth);
        for layer in 0..layers_for(info, size) {
            let offset = slice_offset(size, layer, level);
            let Some(chunk) = packed.get(src..src + len) else {
                return;
            };
            if let Some(dst) = guest.get_mut(offset..) {
                layout.swizzle(depth, chunk, dst);
            }
            src += len;
        }
    }
}

/// Encodes one slice into `guest`, whose first byte is the slice's first byte.
pub fn encode_slice(info: &TextureInfo, level: u32, single: bool, packed: &[u8], guest: &mut [u8]) {
    let layout = SurfaceLayout::for_level(info, level);
    let depth = if info.target == Target::Texture3D && !single {
        (info.depth() >> level).max(1)
    } else {
        1
    };
    layout.swizzle(depth, packed, guest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn tiled(width: u32, height: u32, levels: u32, layers: u32, format: Format) -> TextureInfo {
        TextureInfo {
            width,
            height,
            depth_or_layers: layers,
            levels,
            target: if layers > 1 {
                Target::Texture2DArray
            } else {
                Target::Texture2D
            },
            gob_blocks_in_y: 4,
            format_info: format.info(),
            ..TextureInfo::default()
        }
    }

    #[test]
    fn first_gob_row_is_contiguous_for_16_bytes() {
        let info = tiled(16, 8, 1, 1, Format::R8Unorm);
        let size = info.calculate_size_info(0);
        let mut guest = vec![0u8; size.total_size as usize];
        for (i, b) in guest.iter_mut().enumerate() {
            *b = i as u8;
        }
        let packed = decode_texture(&info, &size, &guest);
        assert_eq!(&packed[..16], &guest[..16]);
        // Second row starts at byte 16 of the GOB, third row at byte 64.
        assert_eq!(&packed[16..32], &guest[16..32]);
        assert_eq!(&packed[32..48], &guest[64..80]);
    }

    #[test]
    fn linear_rows_skip_pitch_padding() {
        let info = TextureInfo {
            width: 3,
            height: 2,
            stride: 32,
            is_linear: true,
            format_info: Format::R8G8B8A8Unorm.info(),
            ..TextureInfo::default()
        };
        let size = info.calculate_size_info(0);
        let mut guest = vec![0xAAu8; size.total_size as usize];
        guest[32..44].copy_from_slice(&[1; 12]);
        let packed = decode_texture(&info, &size, &guest);
        assert_eq!(packed.len(), 24);
        assert_eq!(&packed[12..], &[1; 12]);

        let mut written = vec![0u8; size.total_size as usize];
        encode_texture(&info, &size, &packed, &mut written);
        assert_eq!(&written[12..32], &[0; 20]);
        assert_eq!(&written[32..44], &[1; 12]);
    }

    proptest! {
        #[test]
        fn host_data_survives_a_trip_through_guest_layout(
            width in 1u32..80,
            height in 1u32..40,
            levels in 1u32..4,
            layers in 1u32..3,
            seed in any::<u8>(),
        ) {
            let info = tiled(width, height, levels, layers, Format::R16Float);
            let size = info.calculate_size_info(0);
            let host_len: usize = (0..levels)
                .map(|l| SurfaceLayout::for_level(&info, l).packed_size(1) * layers as usize)
                .sum();
            let packed: Vec<u8> = (0..host_len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect();

            let mut guest = vec![0u8; size.total_size as usize];
            encode_texture(&info, &size, &packed, &mut guest);
            prop_assert_eq!(decode_texture(&info, &size, &guest), packed);
        }
    }
}
