//! Guest memory footprint of textures.
//!
//! Block-linear textures are stored as 64x8 byte GOBs (groups of bytes) arranged into blocks of
//! `gob_blocks_in_y * gob_blocks_in_z` GOBs. Blocks shrink as mip levels get smaller. For array
//! textures every layer holds a full mip chain; 3D textures store each level's depth slices
//! together, level after level.

pub const GOB_STRIDE: u32 = 64;
pub const GOB_HEIGHT: u32 = 8;
pub const GOB_SIZE: u64 = (GOB_STRIDE * GOB_HEIGHT) as u64;

/// Row pitch alignment of linear textures.
pub const STRIDE_ALIGNMENT: u32 = 32;
/// Row pitch alignment the copy engine uses for linear textures derived from block-linear ones.
pub const GOB_ALIGNMENT: u32 = 64;

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    match value.checked_add(alignment - 1) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

pub(crate) fn div_round_up(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor.max(1))
}

/// Dimensions in blocks (or pixels for uncompressed formats).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }
}

/// GOB block dimensions after shrinking for a mip level of the given height/depth.
pub fn mip_gob_block_sizes(
    height: u32,
    depth: u32,
    block_height: u32,
    mut gob_blocks_in_y: u32,
    mut gob_blocks_in_z: u32,
) -> (u32, u32) {
    let height = div_round_up(height, block_height);

    while height <= (gob_blocks_in_y >> 1) * GOB_HEIGHT && gob_blocks_in_y != 1 {
        gob_blocks_in_y >>= 1;
    }

    while depth <= (gob_blocks_in_z >> 1) && gob_blocks_in_z != 1 {
        gob_blocks_in_z >>= 1;
    }

    (gob_blocks_in_y, gob_blocks_in_z)
}

/// Layout of a single block-linear mip level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLinearLevel {
    /// Width in blocks.
    pub width: u32,
    /// Height in blocks.
    pub height: u32,
    pub depth: u32,
    pub bytes_per_pixel: u32,
    pub width_in_gobs: u32,
    pub gob_blocks_in_y: u32,
    pub gob_blocks_in_z: u32,
}

impl BlockLinearLevel {
    pub fn block_size(&self) -> u64 {
        GOB_SIZE * self.gob_blocks_in_y as u64 * self.gob_blocks_in_z as u64
    }

    pub fn blocks_in_y(&self) -> u32 {
        div_round_up(div_round_up(self.height, GOB_HEIGHT), self.gob_blocks_in_y)
    }

    pub fn blocks_in_z(&self) -> u32 {
        div_round_up(self.depth, self.gob_blocks_in_z)
    }

    /// Size of one row of blocks through every GOB row, covering `gob_blocks_in_z` depth slices.
    pub fn slice_size(&self) -> u64 {
        self.blocks_in_y() as u64 * self.width_in_gobs as u64 * self.block_size()
    }

    pub fn size(&self) -> u64 {
        self.blocks_in_z() as u64 * self.slice_size()
    }

    /// Byte offset of `(x_bytes, y, z)` relative to the start of the level.
    pub fn offset_of(&self, x_bytes: u32, y: u32, z: u32) -> u64 {
        let bx = (x_bytes / GOB_STRIDE) as u64;
        let by = (y / (GOB_HEIGHT * self.gob_blocks_in_y)) as u64;
        let bz = (z / self.gob_blocks_in_z) as u64;

        let block_index =
            (bz * self.blocks_in_y() as u64 + by) * self.width_in_gobs as u64 + bx;
        let gob_in_block = ((z % self.gob_blocks_in_z) * self.gob_blocks_in_y
            + (y / GOB_HEIGHT) % self.gob_blocks_in_y) as u64;

        block_index * self.block_size() + gob_in_block * GOB_SIZE + gob_offset(x_bytes, y)
    }
}

/// Offset of a byte inside a 512 byte GOB.
fn gob_offset(x: u32, y: u32) -> u64 {
    let x = x % GOB_STRIDE;
    let y = y % GOB_HEIGHT;
    ((x / 32) * 256 + (y / 2) * 64 + ((x % 32) / 16) * 32 + (y % 2) * 16 + (x % 16)) as u64
}

/// Parameters of a block-linear texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLinearParams {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub levels: u32,
    pub layers: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub bytes_per_pixel: u32,
    pub gob_blocks_in_y: u32,
    pub gob_blocks_in_z: u32,
    pub gob_blocks_in_tile_x: u32,
}

impl BlockLinearParams {
    pub fn is_3d(&self) -> bool {
        self.depth > 1 || self.gob_blocks_in_z > 1
    }

    pub fn level(&self, level: u32) -> BlockLinearLevel {
        let w = div_round_up((self.width >> level).max(1), self.block_width);
        let h = div_round_up((self.height >> level).max(1), self.block_height);
        let d = (self.depth >> level).max(1);

        let (gob_y, gob_z) = mip_gob_block_sizes(
            (self.height >> level).max(1),
            d,
            self.block_height,
            self.gob_blocks_in_y,
            self.gob_blocks_in_z,
        );

        let gob_width = (GOB_STRIDE / self.bytes_per_pixel) * self.gob_blocks_in_tile_x;
        let gob_height = self.gob_blocks_in_y * GOB_HEIGHT;

        let mut width_in_gobs = div_round_up(w * self.bytes_per_pixel, GOB_STRIDE);
        let alignment = if d < self.gob_blocks_in_z || w <= gob_width || h <= gob_height {
            1
        } else {
            self.gob_blocks_in_tile_x
        };
        width_in_gobs = align_up(width_in_gobs as u64, alignment.max(1) as u64) as u32;

        BlockLinearLevel {
            width: w,
            height: h,
            depth: d,
            bytes_per_pixel: self.bytes_per_pixel,
            width_in_gobs,
            gob_blocks_in_y: gob_y,
            gob_blocks_in_z: gob_z,
        }
    }

    fn align_layer_size(&self, size: u64) -> u64 {
        let (gob_y, gob_z) = mip_gob_block_sizes(
            self.height,
            self.depth,
            self.block_height,
            self.gob_blocks_in_y,
            self.gob_blocks_in_z,
        );

        let alignment = if self.gob_blocks_in_tile_x < 2 {
            gob_y as u64 * gob_z as u64 * GOB_SIZE
        } else {
            self.gob_blocks_in_tile_x as u64 * gob_y as u64 * gob_z as u64 * GOB_SIZE
        };

        align_up(size, alignment)
    }
}

/// Byte layout of a texture in guest memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeInfo {
    mip_offsets: Vec<u64>,
    all_offsets: Vec<u64>,
    slice_sizes: Vec<u64>,
    level_sizes: Vec<u64>,
    depth: u32,
    levels: u32,
    is_3d: bool,
    pub layer_size: u64,
    pub total_size: u64,
}

impl SizeInfo {
    /// A single-slice, single-level texture of `size` bytes (linear and buffer textures).
    pub fn single(size: u64) -> Self {
        Self {
            mip_offsets: vec![0],
            all_offsets: vec![0],
            slice_sizes: vec![size],
            level_sizes: vec![size],
            depth: 1,
            levels: 1,
            is_3d: false,
            layer_size: size,
            total_size: size,
        }
    }

    pub fn linear(stride: u32, height: u32, block_height: u32) -> Self {
        Self::single(stride as u64 * div_round_up(height, block_height) as u64)
    }

    /// `gpu_layer_size`, when non-zero, is the layer stride the guest programmed explicitly.
    pub fn block_linear(params: &BlockLinearParams, gpu_layer_size: u64) -> Self {
        let is_3d = params.is_3d();
        let levels = params.levels.max(1);
        let layers = params.layers.max(1);

        let mut mip_offsets = Vec::with_capacity(levels as usize);
        let mut slice_sizes = Vec::with_capacity(levels as usize);
        let mut level_sizes = Vec::with_capacity(levels as usize);
        let mut all_offsets = Vec::new();

        let mut layer_size = 0u64;

        for level in 0..levels {
            let layout = params.level(level);

            if is_3d {
                let plane = layout.gob_blocks_in_y as u64 * GOB_SIZE;
                let row = layout.blocks_in_y() as u64 * layout.width_in_gobs as u64 * plane;
                let mask = params.gob_blocks_in_z.max(1) - 1;
                for z in 0..layout.depth {
                    let z_low = (z & mask) as u64;
                    let z_high = (z & !mask) as u64;
                    all_offsets.push(layer_size + z_low * plane + z_high * row);
                }
            }

            mip_offsets.push(layer_size);
            slice_sizes.push(layout.slice_size());
            level_sizes.push(layout.size());
            layer_size += layout.size();
        }

        layer_size = params.align_layer_size(layer_size);
        if layers > 1 && gpu_layer_size > layer_size {
            layer_size = gpu_layer_size;
        }

        if !is_3d {
            for layer in 0..layers as u64 {
                for &mip in &mip_offsets {
                    all_offsets.push(layer * layer_size + mip);
                }
            }
        }

        Self {
            mip_offsets,
            all_offsets,
            slice_sizes,
            level_sizes,
            depth: params.depth.max(1),
            levels,
            is_3d,
            layer_size,
            total_size: layer_size * layers as u64,
        }
    }

    pub fn is_3d(&self) -> bool {
        self.is_3d
    }

    pub fn levels(&self) -> u32 {
        self.levels
    }

    /// Offset of every slice: `layer * levels + level` for arrays, level-major depth slices for 3D.
    pub fn all_offsets(&self) -> &[u64] {
        &self.all_offsets
    }

    pub fn slice_sizes(&self) -> &[u64] {
        &self.slice_sizes
    }

    pub fn level_sizes(&self) -> &[u64] {
        &self.level_sizes
    }

    pub fn mip_offset(&self, level: u32) -> u64 {
        self.mip_offsets.get(level as usize).copied().unwrap_or(0)
    }

    /// Finds the `(layer, level)` that starts exactly at `offset`.
    pub fn find_view(&self, offset: u64) -> Option<(u32, u32)> {
        let index = self.all_offsets.iter().position(|&o| o == offset)? as u32;

        if self.is_3d {
            let mut layer = index;
            let mut level = 0;
            let mut level_depth = self.depth;
            while layer >= level_depth {
                layer -= level_depth;
                level += 1;
                level_depth = (level_depth >> 1).max(1);
            }
            Some((layer, level))
        } else {
            Some((index / self.levels, index % self.levels))
        }
    }

    /// Every `(offset, size)` region occupied by a level of a layer.
    pub fn all_regions(&self) -> Vec<(u64, u64)> {
        if self.is_3d {
            self.mip_offsets
                .iter()
                .copied()
                .zip(self.level_sizes.iter().copied())
                .collect()
        } else {
            let layers = self.all_offsets.len() as u64 / self.levels as u64;
            let mut regions = Vec::with_capacity(self.all_offsets.len());
            for layer in 0..layers {
                for (level, &mip) in self.mip_offsets.iter().enumerate() {
                    regions.push((layer * self.layer_size + mip, self.level_sizes[level]));
                }
            }
            regions
        }
    }
}

/// Size of a block-linear texture with its width and height rounded up to whole GOB blocks.
#[allow(clippy::too_many_arguments)]
pub fn block_linear_aligned_size(
    width: u32,
    height: u32,
    depth: u32,
    block_width: u32,
    block_height: u32,
    bytes_per_pixel: u32,
    gob_blocks_in_y: u32,
    gob_blocks_in_z: u32,
    gob_blocks_in_tile_x: u32,
) -> Size {
    let width = div_round_up(width, block_width);
    let height = div_round_up(height, block_height);

    let gob_width = (GOB_STRIDE / bytes_per_pixel) * gob_blocks_in_tile_x;
    let gob_height = gob_blocks_in_y * GOB_HEIGHT;

    let alignment = if depth < gob_blocks_in_z || width <= gob_width || height <= gob_height {
        GOB_STRIDE / bytes_per_pixel
    } else {
        gob_width
    };

    Size::new(
        align_up(width as u64, alignment.max(1) as u64) as u32,
        align_up(height as u64, gob_height as u64) as u32,
        align_up(depth as u64, gob_blocks_in_z.max(1) as u64) as u32,
    )
}

pub fn linear_aligned_size(
    width: u32,
    height: u32,
    block_width: u32,
    block_height: u32,
    bytes_per_pixel: u32,
) -> Size {
    let width = div_round_up(width, block_width);
    let height = div_round_up(height, block_height);
    let aligned = align_up((width * bytes_per_pixel) as u64, STRIDE_ALIGNMENT as u64) as u32;
    Size::new(aligned / bytes_per_pixel, height, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params_2d(width: u32, height: u32, levels: u32, layers: u32, bpp: u32) -> BlockLinearParams {
        BlockLinearParams {
            width,
            height,
            depth: 1,
            levels,
            layers,
            block_width: 1,
            block_height: 1,
            bytes_per_pixel: bpp,
            gob_blocks_in_y: 16,
            gob_blocks_in_z: 1,
            gob_blocks_in_tile_x: 1,
        }
    }

    #[test]
    fn single_level_2d_matches_pixel_count_when_aligned() {
        let info = SizeInfo::block_linear(&params_2d(256, 256, 1, 1, 4), 0);
        assert_eq!(info.total_size, 256 * 256 * 4);
        assert_eq!(info.all_offsets(), &[0]);
        assert_eq!(info.find_view(0), Some((0, 0)));
    }

    #[test]
    fn array_offsets_are_layer_major() {
        let info = SizeInfo::block_linear(&params_2d(64, 64, 3, 2, 4), 0);
        let offsets = info.all_offsets();
        assert_eq!(offsets.len(), 6);
        assert_eq!(offsets[3], info.layer_size);
        assert_eq!(info.find_view(offsets[4]), Some((1, 1)));
        assert_eq!(info.find_view(offsets[2] + 1), None);
        assert_eq!(info.total_size, info.layer_size * 2);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn mip_blocks_shrink_with_level_height() {
        assert_eq!(mip_gob_block_sizes(16, 1, 1, 16, 1), (2, 1));
        assert_eq!(mip_gob_block_sizes(256, 1, 1, 16, 1), (16, 1));
        assert_eq!(mip_gob_block_sizes(1, 4, 1, 16, 8), (1, 4));
    }

    #[test]
    fn three_d_slices_are_level_major() {
        let params = BlockLinearParams {
            depth: 4,
            ..params_2d(32, 32, 2, 1, 4)
        };
        let info = SizeInfo::block_linear(&params, 0);
        assert!(info.is_3d());
        assert_eq!(info.all_offsets().len(), 4 + 2);
        assert_eq!(info.find_view(info.all_offsets()[5]), Some((1, 1)));
        assert_eq!(info.all_regions().len(), 2);
    }

    #[test]
    fn gob_offsets_cover_every_byte_once() {
        let mut seen = vec![false; GOB_SIZE as usize];
        for y in 0..GOB_HEIGHT {
            for x in 0..GOB_STRIDE {
                let offset = gob_offset(x, y) as usize;
                assert!(!seen[offset]);
                seen[offset] = true;
            }
        }
    }

    #[test]
    fn linear_aligned_width_rounds_to_stride_alignment() {
        assert_eq!(linear_aligned_size(10, 3, 1, 1, 4), Size::new(16, 3, 1));
        assert_eq!(SizeInfo::linear(128, 3, 1).total_size, 384);
    }
}
