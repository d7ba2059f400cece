use crate::format::FormatInfo;
use crate::size::{BlockLinearParams, SizeInfo};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Target {
    Texture1D,
    #[default]
    Texture2D,
    Texture3D,
    Texture1DArray,
    Texture2DArray,
    Cubemap,
    CubemapArray,
    Texture2DMultisample,
    Texture2DMultisampleArray,
    TextureBuffer,
}

impl Target {
    pub fn is_multisample(self) -> bool {
        matches!(
            self,
            Target::Texture2DMultisample | Target::Texture2DMultisampleArray
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SwizzleComponent {
    Zero,
    One,
    Red,
    Green,
    Blue,
    Alpha,
}

impl SwizzleComponent {
    pub const IDENTITY: [SwizzleComponent; 4] = [
        SwizzleComponent::Red,
        SwizzleComponent::Green,
        SwizzleComponent::Blue,
        SwizzleComponent::Alpha,
    ];
}

/// Which aspect of a combined depth-stencil texture is sampled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DepthStencilMode {
    #[default]
    Depth,
    Stencil,
}

/// Immutable description of a guest texture.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureInfo {
    pub gpu_address: u64,
    pub width: u32,
    pub height: u32,
    pub depth_or_layers: u32,
    pub levels: u32,
    pub samples_in_x: u32,
    pub samples_in_y: u32,
    /// Row pitch in bytes; only meaningful for linear textures.
    pub stride: u32,
    pub is_linear: bool,
    pub gob_blocks_in_y: u32,
    pub gob_blocks_in_z: u32,
    pub gob_blocks_in_tile_x: u32,
    pub target: Target,
    pub format_info: FormatInfo,
    pub depth_stencil_mode: DepthStencilMode,
    pub swizzle: [SwizzleComponent; 4],
}

impl Default for TextureInfo {
    fn default() -> Self {
        Self {
            gpu_address: 0,
            width: 1,
            height: 1,
            depth_or_layers: 1,
            levels: 1,
            samples_in_x: 1,
            samples_in_y: 1,
            stride: 0,
            is_linear: false,
            gob_blocks_in_y: 1,
            gob_blocks_in_z: 1,
            gob_blocks_in_tile_x: 1,
            target: Target::Texture2D,
            format_info: FormatInfo::default(),
            depth_stencil_mode: DepthStencilMode::Depth,
            swizzle: SwizzleComponent::IDENTITY,
        }
    }
}

impl TextureInfo {
    pub fn samples(&self) -> u32 {
        self.samples_in_x * self.samples_in_y
    }

    /// Depth of 3D textures, `1` for everything else.
    pub fn depth(&self) -> u32 {
        if self.target == Target::Texture3D {
            self.depth_or_layers
        } else {
            1
        }
    }

    pub fn layers(&self) -> u32 {
        match self.target {
            Target::Texture1DArray | Target::Texture2DArray | Target::Texture2DMultisampleArray => {
                self.depth_or_layers
            }
            Target::CubemapArray => self.depth_or_layers * 6,
            Target::Cubemap => 6,
            _ => 1,
        }
    }

    /// Depth for 3D textures, layer count for everything else.
    pub fn slices(&self) -> u32 {
        if self.target == Target::Texture3D {
            self.depth_or_layers
        } else {
            self.layers()
        }
    }

    pub fn block_linear_params(&self) -> BlockLinearParams {
        BlockLinearParams {
            width: self.width,
            height: self.height,
            depth: self.depth(),
            levels: self.levels,
            layers: self.layers(),
            block_width: self.format_info.block_width,
            block_height: self.format_info.block_height,
            bytes_per_pixel: self.format_info.bytes_per_pixel,
            gob_blocks_in_y: self.gob_blocks_in_y,
            gob_blocks_in_z: self.gob_blocks_in_z,
            gob_blocks_in_tile_x: self.gob_blocks_in_tile_x,
        }
    }

    pub fn calculate_size_info(&self, layer_size: u64) -> SizeInfo {
        if self.target == Target::TextureBuffer {
            SizeInfo::single(self.width as u64 * self.format_info.bytes_per_pixel as u64)
        } else if self.is_linear {
            SizeInfo::linear(self.stride, self.height, self.format_info.block_height)
        } else {
            SizeInfo::block_linear(&self.block_linear_params(), layer_size)
        }
    }
}

/// Everything a host backend needs to allocate a texture.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureCreateInfo {
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, layer count otherwise.
    pub depth: u32,
    pub levels: u32,
    pub samples: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub bytes_per_pixel: u32,
    pub format: crate::format::Format,
    pub depth_stencil_mode: DepthStencilMode,
    pub target: Target,
    pub swizzle: [SwizzleComponent; 4],
}

impl TextureCreateInfo {
    pub fn layers(&self) -> u32 {
        if self.target == Target::Texture3D {
            1
        } else {
            self.depth
        }
    }

    pub fn depth_at(&self, level: u32) -> u32 {
        if self.target == Target::Texture3D {
            (self.depth >> level).max(1)
        } else {
            1
        }
    }

    /// Tightly packed size of one `(layer, level)` slice.
    pub fn slice_size(&self, level: u32) -> usize {
        let width = (self.width >> level).max(1).div_ceil(self.block_width) as usize;
        let height = (self.height >> level).max(1).div_ceil(self.block_height) as usize;
        width
            * height
            * self.depth_at(level) as usize
            * self.bytes_per_pixel as usize
            * self.samples.max(1) as usize
    }

    /// Packed size of the whole texture, level-major.
    pub fn total_size(&self) -> usize {
        (0..self.levels)
            .map(|level| self.slice_size(level) * self.layers() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;

    #[test]
    fn layer_counts_follow_target() {
        let mut info = TextureInfo {
            depth_or_layers: 2,
            target: Target::CubemapArray,
            ..TextureInfo::default()
        };
        assert_eq!(info.layers(), 12);
        assert_eq!(info.slices(), 12);

        info.target = Target::Texture3D;
        assert_eq!(info.layers(), 1);
        assert_eq!(info.depth(), 2);
        assert_eq!(info.slices(), 2);

        info.target = Target::Cubemap;
        assert_eq!(info.slices(), 6);
    }

    #[test]
    fn buffer_textures_are_one_flat_slice() {
        let info = TextureInfo {
            width: 100,
            target: Target::TextureBuffer,
            format_info: Format::R32Float.info(),
            ..TextureInfo::default()
        };
        let size = info.calculate_size_info(0);
        assert_eq!(size.total_size, 400);
        assert_eq!(size.all_offsets(), &[0]);
    }
}
