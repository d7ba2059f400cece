//! Guest texture (TIC) and sampler (TSC) descriptor layouts.
//!
//! Both are 32 bytes, eight little-endian words, read straight out of the descriptor tables with
//! `bytemuck`. Only the fields the cache interprets are decoded.

use bytemuck::{Pod, Zeroable};

use crate::format::{Format, FormatInfo};
use crate::info::{SwizzleComponent, Target};

/// Size of one descriptor in a pool, for both kinds.
pub const DESCRIPTOR_SIZE: u64 = 32;

/// Anisotropy values selected by the 3-bit sampler field.
const MAX_ANISOTROPY_LUT: [f32; 8] = [1.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 16.0];

#[inline]
fn bits(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1 << width) - 1)
}

#[inline]
fn set_bits(word: &mut u32, shift: u32, width: u32, value: u32) {
    let mask = ((1 << width) - 1) << shift;
    *word = (*word & !mask) | ((value << shift) & mask);
}

/// Memory layout of a guest texture, as the guest stores it in a descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureDescriptorType {
    Buffer,
    Pitch,
    BlockLinear,
}

/// Multisample mode of a texture descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextureMsaaMode {
    #[default]
    Ms1x1,
    Ms2x1,
    Ms2x2,
    Ms4x2,
    Ms4x4,
}

impl TextureMsaaMode {
    fn from_code(code: u32) -> Self {
        match code {
            2 => TextureMsaaMode::Ms2x2,
            4 => TextureMsaaMode::Ms4x2,
            5 => TextureMsaaMode::Ms2x1,
            6 => TextureMsaaMode::Ms4x4,
            _ => TextureMsaaMode::Ms1x1,
        }
    }

    fn code(self) -> u32 {
        match self {
            TextureMsaaMode::Ms1x1 => 0,
            TextureMsaaMode::Ms2x2 => 2,
            TextureMsaaMode::Ms4x2 => 4,
            TextureMsaaMode::Ms2x1 => 5,
            TextureMsaaMode::Ms4x4 => 6,
        }
    }

    pub fn samples_in_x(self) -> u32 {
        match self {
            TextureMsaaMode::Ms1x1 => 1,
            TextureMsaaMode::Ms2x1 | TextureMsaaMode::Ms2x2 => 2,
            TextureMsaaMode::Ms4x2 | TextureMsaaMode::Ms4x4 => 4,
        }
    }

    pub fn samples_in_y(self) -> u32 {
        match self {
            TextureMsaaMode::Ms1x1 | TextureMsaaMode::Ms2x1 => 1,
            TextureMsaaMode::Ms2x2 | TextureMsaaMode::Ms4x2 => 2,
            TextureMsaaMode::Ms4x4 => 4,
        }
    }
}

/// Target as encoded in a texture descriptor. Multisampling is a separate field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorTarget {
    Texture1D,
    Texture2D,
    Texture3D,
    Cubemap,
    Texture1DArray,
    Texture2DArray,
    Texture1DBuffer,
    Texture2DNoMipmap,
    CubemapArray,
}

impl DescriptorTarget {
    const ALL: [DescriptorTarget; 9] = [
        DescriptorTarget::Texture1D,
        DescriptorTarget::Texture2D,
        DescriptorTarget::Texture3D,
        DescriptorTarget::Cubemap,
        DescriptorTarget::Texture1DArray,
        DescriptorTarget::Texture2DArray,
        DescriptorTarget::Texture1DBuffer,
        DescriptorTarget::Texture2DNoMipmap,
        DescriptorTarget::CubemapArray,
    ];

    fn from_code(code: u32) -> Self {
        Self::ALL
            .get(code as usize)
            .copied()
            .unwrap_or(DescriptorTarget::Texture2D)
    }

    fn code(self) -> u32 {
        self as u32
    }

    /// The cache target, given whether the descriptor is multisampled.
    pub fn convert(self, multisample: bool) -> Target {
        match self {
            DescriptorTarget::Texture1D => Target::Texture1D,
            DescriptorTarget::Texture2D if multisample => Target::Texture2DMultisample,
            DescriptorTarget::Texture2D | DescriptorTarget::Texture2DNoMipmap => Target::Texture2D,
            DescriptorTarget::Texture3D => Target::Texture3D,
            DescriptorTarget::Cubemap => Target::Cubemap,
            DescriptorTarget::Texture1DArray => Target::Texture1DArray,
            DescriptorTarget::Texture2DArray if multisample => Target::Texture2DMultisampleArray,
            DescriptorTarget::Texture2DArray => Target::Texture2DArray,
            DescriptorTarget::Texture1DBuffer => Target::TextureBuffer,
            DescriptorTarget::CubemapArray => Target::CubemapArray,
        }
    }
}

fn swizzle_from_code(code: u32) -> SwizzleComponent {
    match code {
        2 => SwizzleComponent::Red,
        3 => SwizzleComponent::Green,
        4 => SwizzleComponent::Blue,
        5 => SwizzleComponent::Alpha,
        6 | 7 => SwizzleComponent::One,
        _ => SwizzleComponent::Zero,
    }
}

fn swizzle_code(component: SwizzleComponent) -> u32 {
    match component {
        SwizzleComponent::Zero => 0,
        SwizzleComponent::Red => 2,
        SwizzleComponent::Green => 3,
        SwizzleComponent::Blue => 4,
        SwizzleComponent::Alpha => 5,
        SwizzleComponent::One => 7,
    }
}

/// A texture descriptor.
///
/// Word layout:
/// - 0: format code `[0, 8)`, swizzle R/G/B/A at `19`, `22`, `25`, `28` (3 bits each)
/// - 1: GPU address bits `[0, 32)`
/// - 2: GPU address bits `[32, 48)` at `[0, 16)`, descriptor type at `[21, 24)`
/// - 3: pitch in 32 byte units `[0, 16)` (pitch) or GOB blocks in Y/Z/tile X as log2 at `3`,
///   `6`, `10` (block linear); level count minus one at `[28, 32)`
/// - 4: width minus one `[0, 16)`, sRGB at `22`, target at `[23, 27)`
/// - 5: height minus one `[0, 16)` (buffer width bits `[16, 32)` for buffers), depth or layers
///   minus one at `[16, 30)`
/// - 7: base level `[0, 4)`, max level (inclusive) `[4, 8)`, multisample mode `[8, 12)`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct TextureDescriptor {
    pub words: [u32; 8],
}

const _: () = assert!(core::mem::size_of::<TextureDescriptor>() == DESCRIPTOR_SIZE as usize);

impl TextureDescriptor {
    pub fn unpack_format_code(&self) -> u32 {
        bits(self.words[0], 0, 8)
    }

    pub fn unpack_srgb(&self) -> bool {
        bits(self.words[4], 22, 1) != 0
    }

    /// The guest format, or `None` for a code no format uses.
    pub fn unpack_format(&self) -> Option<FormatInfo> {
        let format = Format::from_code(self.unpack_format_code() as u8)?;
        let format = if self.unpack_srgb() {
            format.to_srgb().unwrap_or(format)
        } else {
            format
        };
        Some(format.info())
    }

    pub fn unpack_swizzle(&self) -> [SwizzleComponent; 4] {
        [19, 22, 25, 28].map(|shift| swizzle_from_code(bits(self.words[0], shift, 3)))
    }

    pub fn unpack_address(&self) -> u64 {
        self.words[1] as u64 | (bits(self.words[2], 0, 16) as u64) << 32
    }

    pub fn unpack_descriptor_type(&self) -> TextureDescriptorType {
        match bits(self.words[2], 21, 3) {
            0 => TextureDescriptorType::Buffer,
            1 => TextureDescriptorType::Pitch,
            _ => TextureDescriptorType::BlockLinear,
        }
    }

    pub fn unpack_stride(&self) -> u32 {
        bits(self.words[3], 0, 16) << 5
    }

    pub fn unpack_gob_blocks_in_y(&self) -> u32 {
        1 << bits(self.words[3], 3, 3)
    }

    pub fn unpack_gob_blocks_in_z(&self) -> u32 {
        1 << bits(self.words[3], 6, 3)
    }

    pub fn unpack_gob_blocks_in_tile_x(&self) -> u32 {
        1 << bits(self.words[3], 10, 3)
    }

    pub fn unpack_levels(&self) -> u32 {
        bits(self.words[3], 28, 4) + 1
    }

    pub fn unpack_width(&self) -> u32 {
        bits(self.words[4], 0, 16) + 1
    }

    pub fn unpack_buffer_texture_width(&self) -> u32 {
        (bits(self.words[4], 0, 16) | bits(self.words[5], 0, 16) << 16) + 1
    }

    pub fn unpack_height(&self) -> u32 {
        bits(self.words[5], 0, 16) + 1
    }

    pub fn unpack_depth(&self) -> u32 {
        bits(self.words[5], 16, 14) + 1
    }

    pub fn unpack_target(&self) -> DescriptorTarget {
        DescriptorTarget::from_code(bits(self.words[4], 23, 4))
    }

    pub fn unpack_base_level(&self) -> u32 {
        bits(self.words[7], 0, 4)
    }

    pub fn unpack_max_level_inclusive(&self) -> u32 {
        bits(self.words[7], 4, 4)
    }

    pub fn unpack_msaa_mode(&self) -> TextureMsaaMode {
        TextureMsaaMode::from_code(bits(self.words[7], 8, 4))
    }

    pub fn with_address(mut self, address: u64) -> Self {
        self.words[1] = address as u32;
        set_bits(&mut self.words[2], 0, 16, (address >> 32) as u32);
        self
    }

    pub fn with_format(mut self, format: Format, srgb: bool) -> Self {
        let format = if srgb {
            format.to_linear().unwrap_or(format)
        } else {
            format
        };
        set_bits(&mut self.words[0], 0, 8, format.code() as u32);
        set_bits(&mut self.words[4], 22, 1, srgb as u32);
        self
    }

    pub fn with_swizzle(mut self, swizzle: [SwizzleComponent; 4]) -> Self {
        for (shift, component) in [19, 22, 25, 28].into_iter().zip(swizzle) {
            set_bits(&mut self.words[0], shift, 3, swizzle_code(component));
        }
        self
    }

    pub fn with_target(mut self, target: DescriptorTarget) -> Self {
        set_bits(&mut self.words[4], 23, 4, target.code());
        self
    }

    /// Width, height and depth (or layers). For buffer targets `width` is the element count.
    pub fn with_size(mut self, width: u32, height: u32, depth_or_layers: u32) -> Self {
        let width = width.max(1) - 1;
        set_bits(&mut self.words[4], 0, 16, width);
        if self.unpack_target() == DescriptorTarget::Texture1DBuffer {
            set_bits(&mut self.words[5], 0, 16, width >> 16);
        } else {
            set_bits(&mut self.words[5], 0, 16, height.max(1) - 1);
        }
        set_bits(&mut self.words[5], 16, 14, depth_or_layers.max(1) - 1);
        self
    }

    /// Level count, with every level visible.
    pub fn with_levels(mut self, levels: u32) -> Self {
        let levels = levels.clamp(1, 16);
        set_bits(&mut self.words[3], 28, 4, levels - 1);
        self.with_level_range(0, levels - 1)
    }

    /// Restricts sampling to levels `base..=max`.
    pub fn with_level_range(mut self, base: u32, max: u32) -> Self {
        set_bits(&mut self.words[7], 0, 4, base);
        set_bits(&mut self.words[7], 4, 4, max);
        self
    }

    pub fn with_block_linear(mut self, gob_blocks_in_y: u32, gob_blocks_in_z: u32) -> Self {
        set_bits(&mut self.words[2], 21, 3, 2);
        set_bits(&mut self.words[3], 3, 3, gob_blocks_in_y.max(1).ilog2());
        set_bits(&mut self.words[3], 6, 3, gob_blocks_in_z.max(1).ilog2());
        set_bits(&mut self.words[3], 10, 3, 0);
        self
    }

    /// Pitch layout with a row pitch of `stride` bytes, rounded down to 32.
    pub fn with_pitch(mut self, stride: u32) -> Self {
        set_bits(&mut self.words[2], 21, 3, 1);
        set_bits(&mut self.words[3], 0, 16, stride >> 5);
        self
    }

    pub fn with_buffer(mut self) -> Self {
        set_bits(&mut self.words[2], 21, 3, 0);
        self
    }

    pub fn with_msaa_mode(mut self, mode: TextureMsaaMode) -> Self {
        set_bits(&mut self.words[7], 8, 4, mode.code());
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
    Clamp,
    MirrorClampToEdge,
    MirrorClampToBorder,
    MirrorClamp,
}

impl AddressMode {
    const ALL: [AddressMode; 8] = [
        AddressMode::Repeat,
        AddressMode::MirroredRepeat,
        AddressMode::ClampToEdge,
        AddressMode::ClampToBorder,
        AddressMode::Clamp,
        AddressMode::MirrorClampToEdge,
        AddressMode::MirrorClampToBorder,
        AddressMode::MirrorClamp,
    ];
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    #[default]
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    const ALL: [CompareOp; 8] = [
        CompareOp::Never,
        CompareOp::Less,
        CompareOp::Equal,
        CompareOp::LessOrEqual,
        CompareOp::Greater,
        CompareOp::NotEqual,
        CompareOp::GreaterOrEqual,
        CompareOp::Always,
    ];
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MipFilter {
    #[default]
    None,
    Nearest,
    Linear,
}

/// Host sampler parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SamplerCreateInfo {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: MipFilter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_p: AddressMode,
    pub compare: Option<CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub lod_bias: f32,
    pub max_anisotropy: f32,
    pub border_color: [f32; 4],
}

/// A sampler descriptor.
///
/// Word layout:
/// - 0: address mode U/V/P at `0`, `3`, `6` (3 bits each), depth compare at `9`, compare op at
///   `[10, 13)`, max anisotropy at `[20, 23)`
/// - 1: mag filter `[0, 3)`, min filter `[4, 6)`, mip filter `[6, 8)`, LOD bias (signed 5.8
///   fixed point) `[12, 25)`
/// - 2: min LOD `[0, 12)`, max LOD `[12, 24)` (unsigned 4.8 fixed point)
/// - 4..8: border color as `f32` bits
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct SamplerDescriptor {
    pub words: [u32; 8],
}

const _: () = assert!(core::mem::size_of::<SamplerDescriptor>() == DESCRIPTOR_SIZE as usize);

impl SamplerDescriptor {
    pub fn unpack_address_u(&self) -> AddressMode {
        AddressMode::ALL[bits(self.words[0], 0, 3) as usize]
    }

    pub fn unpack_address_v(&self) -> AddressMode {
        AddressMode::ALL[bits(self.words[0], 3, 3) as usize]
    }

    pub fn unpack_address_p(&self) -> AddressMode {
        AddressMode::ALL[bits(self.words[0], 6, 3) as usize]
    }

    pub fn unpack_compare(&self) -> Option<CompareOp> {
        (bits(self.words[0], 9, 1) != 0).then(|| CompareOp::ALL[bits(self.words[0], 10, 3) as usize])
    }

    pub fn unpack_max_anisotropy(&self) -> f32 {
        MAX_ANISOTROPY_LUT[bits(self.words[0], 20, 3) as usize]
    }

    pub fn unpack_mag_filter(&self) -> Filter {
        match bits(self.words[1], 0, 3) {
            2 => Filter::Linear,
            _ => Filter::Nearest,
        }
    }

    pub fn unpack_min_filter(&self) -> Filter {
        match bits(self.words[1], 4, 2) {
            2 => Filter::Linear,
            _ => Filter::Nearest,
        }
    }

    pub fn unpack_mip_filter(&self) -> MipFilter {
        match bits(self.words[1], 6, 2) {
            2 => MipFilter::Nearest,
            3 => MipFilter::Linear,
            _ => MipFilter::None,
        }
    }

    pub fn unpack_lod_bias(&self) -> f32 {
        // Sign-extend the 13 bit field.
        let raw = ((self.words[1] << 7) as i32) >> 19;
        raw as f32 / 256.0
    }

    pub fn unpack_min_lod(&self) -> f32 {
        bits(self.words[2], 0, 12) as f32 / 256.0
    }

    pub fn unpack_max_lod(&self) -> f32 {
        bits(self.words[2], 12, 12) as f32 / 256.0
    }

    pub fn unpack_border_color(&self) -> [f32; 4] {
        [
            f32::from_bits(self.words[4]),
            f32::from_bits(self.words[5]),
            f32::from_bits(self.words[6]),
            f32::from_bits(self.words[7]),
        ]
    }

    /// Whether a forced anisotropy level applies to this sampler: it is already anisotropic, or
    /// it filters trilinearly.
    pub fn accepts_forced_anisotropy(&self) -> bool {
        self.unpack_max_anisotropy() > 1.0
            || (self.unpack_min_filter() == Filter::Linear
                && self.unpack_mip_filter() == MipFilter::Linear)
    }

    /// Host parameters. `forced_anisotropy` overrides the guest's value where it applies; the
    /// result is clamped to `host_max_anisotropy`.
    pub fn create_info(
        &self,
        forced_anisotropy: Option<f32>,
        host_max_anisotropy: f32,
    ) -> SamplerCreateInfo {
        let requested = match forced_anisotropy {
            Some(forced) if self.accepts_forced_anisotropy() => forced,
            _ => self.unpack_max_anisotropy(),
        };
        SamplerCreateInfo {
            min_filter: self.unpack_min_filter(),
            mag_filter: self.unpack_mag_filter(),
            mip_filter: self.unpack_mip_filter(),
            address_u: self.unpack_address_u(),
            address_v: self.unpack_address_v(),
            address_p: self.unpack_address_p(),
            compare: self.unpack_compare(),
            min_lod: self.unpack_min_lod(),
            max_lod: self.unpack_max_lod(),
            lod_bias: self.unpack_lod_bias(),
            max_anisotropy: requested.clamp(1.0, host_max_anisotropy.max(1.0)),
            border_color: self.unpack_border_color(),
        }
    }

    pub fn with_address_modes(mut self, u: AddressMode, v: AddressMode, p: AddressMode) -> Self {
        set_bits(&mut self.words[0], 0, 3, u as u32);
        set_bits(&mut self.words[0], 3, 3, v as u32);
        set_bits(&mut self.words[0], 6, 3, p as u32);
        self
    }

    pub fn with_compare(mut self, compare: Option<CompareOp>) -> Self {
        set_bits(&mut self.words[0], 9, 1, compare.is_some() as u32);
        set_bits(&mut self.words[0], 10, 3, compare.map_or(0, |op| op as u32));
        self
    }

    /// Rounds down to the nearest anisotropy level the descriptor can encode.
    pub fn with_max_anisotropy(mut self, anisotropy: f32) -> Self {
        let code = MAX_ANISOTROPY_LUT
            .iter()
            .rposition(|&level| level <= anisotropy)
            .unwrap_or(0);
        set_bits(&mut self.words[0], 20, 3, code as u32);
        self
    }

    pub fn with_filters(mut self, min: Filter, mag: Filter, mip: MipFilter) -> Self {
        let filter_code = |f: Filter| match f {
            Filter::Nearest => 1,
            Filter::Linear => 2,
        };
        set_bits(&mut self.words[1], 0, 3, filter_code(mag));
        set_bits(&mut self.words[1], 4, 2, filter_code(min));
        let mip = match mip {
            MipFilter::None => 1,
            MipFilter::Nearest => 2,
            MipFilter::Linear => 3,
        };
        set_bits(&mut self.words[1], 6, 2, mip);
        self
    }

    pub fn with_lod(mut self, min_lod: f32, max_lod: f32, bias: f32) -> Self {
        let fixed = |v: f32| (v.clamp(0.0, 15.996) * 256.0) as u32;
        set_bits(&mut self.words[2], 0, 12, fixed(min_lod));
        set_bits(&mut self.words[2], 12, 12, fixed(max_lod));
        let bias = (bias.clamp(-16.0, 15.996) * 256.0) as i32 as u32;
        set_bits(&mut self.words[1], 12, 13, bias);
        self
    }

    pub fn with_border_color(mut self, color: [f32; 4]) -> Self {
        for (word, channel) in self.words[4..].iter_mut().zip(color) {
            *word = channel.to_bits();
        }
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn texture_descriptor_fields_pack_into_their_words() {
        let desc = TextureDescriptor::default()
            .with_target(DescriptorTarget::Texture2DArray)
            .with_address(0x12_3456_7000)
            .with_format(Format::R8G8B8A8Srgb, true)
            .with_size(640, 480, 6)
            .with_levels(5)
            .with_block_linear(16, 1)
            .with_msaa_mode(TextureMsaaMode::Ms4x2);

        assert_eq!(desc.unpack_address(), 0x12_3456_7000);
        assert_eq!(desc.unpack_format().map(|f| f.format), Some(Format::R8G8B8A8Srgb));
        assert_eq!(desc.unpack_width(), 640);
        assert_eq!(desc.unpack_height(), 480);
        assert_eq!(desc.unpack_depth(), 6);
        assert_eq!(desc.unpack_levels(), 5);
        assert_eq!(desc.unpack_max_level_inclusive(), 4);
        assert_eq!(desc.unpack_gob_blocks_in_y(), 16);
        assert_eq!(desc.unpack_descriptor_type(), TextureDescriptorType::BlockLinear);
        assert_eq!(desc.unpack_target().convert(true), Target::Texture2DMultisampleArray);
        assert_eq!(desc.unpack_msaa_mode().samples_in_x(), 4);
        assert_eq!(desc.unpack_msaa_mode().samples_in_y(), 2);
        assert_eq!(desc.unpack_swizzle(), [SwizzleComponent::Zero; 4]);
    }

    #[test]
    fn buffer_width_spans_two_words() {
        let desc = TextureDescriptor::default()
            .with_target(DescriptorTarget::Texture1DBuffer)
            .with_buffer()
            .with_size(0x1_2345, 1, 1);
        assert_eq!(desc.unpack_buffer_texture_width(), 0x1_2345);
        assert_eq!(desc.unpack_target().convert(false), Target::TextureBuffer);
    }

    #[test]
    fn unknown_format_codes_decode_to_none() {
        let mut desc = TextureDescriptor::default();
        desc.words[0] = 0xff;
        assert_eq!(desc.unpack_format(), None);
    }

    #[test]
    fn sampler_descriptor_decodes_host_parameters() {
        let desc = SamplerDescriptor::default()
            .with_address_modes(AddressMode::ClampToEdge, AddressMode::Repeat, AddressMode::MirrorClamp)
            .with_compare(Some(CompareOp::LessOrEqual))
            .with_filters(Filter::Linear, Filter::Nearest, MipFilter::Linear)
            .with_lod(0.5, 12.0, -1.25)
            .with_max_anisotropy(8.0)
            .with_border_color([0.0, 0.25, 0.5, 1.0]);

        let info = desc.create_info(None, 16.0);
        assert_eq!(
            info,
            SamplerCreateInfo {
                min_filter: Filter::Linear,
                mag_filter: Filter::Nearest,
                mip_filter: MipFilter::Linear,
                address_u: AddressMode::ClampToEdge,
                address_v: AddressMode::Repeat,
                address_p: AddressMode::MirrorClamp,
                compare: Some(CompareOp::LessOrEqual),
                min_lod: 0.5,
                max_lod: 12.0,
                lod_bias: -1.25,
                max_anisotropy: 8.0,
                border_color: [0.0, 0.25, 0.5, 1.0],
            }
        );
    }

    #[test]
    fn forced_anisotropy_only_applies_to_trilinear_or_anisotropic_samplers() {
        let point = SamplerDescriptor::default().with_filters(
            Filter::Nearest,
            Filter::Nearest,
            MipFilter::None,
        );
        let trilinear = SamplerDescriptor::default().with_filters(
            Filter::Linear,
            Filter::Linear,
            MipFilter::Linear,
        );

        assert_eq!(point.create_info(Some(16.0), 16.0).max_anisotropy, 1.0);
        assert_eq!(trilinear.create_info(Some(16.0), 8.0).max_anisotropy, 8.0);
    }
}
