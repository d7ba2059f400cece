//! Guest texture formats and their block layout.
//!
//! Only the properties the cache reasons about live here: block footprint, bytes per block and
//! component count. Everything else about a format is the host backend's business.

macro_rules! guest_formats {
    ($($name:ident = ($bw:expr, $bh:expr, $bpp:expr, $comps:expr)),+ $(,)?) => {
        /// Guest-visible texture format. The discriminant is the code stored in texture descriptors.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Format {
            $($name),+
        }

        impl Format {
            const ALL: &'static [Format] = &[$(Format::$name),+];

            /// Decodes a descriptor format code.
            pub fn from_code(code: u8) -> Option<Format> {
                Self::ALL.get(code as usize).copied()
            }

            pub fn code(self) -> u8 {
                self as u8
            }

            pub fn info(self) -> FormatInfo {
                match self {
                    $(Format::$name => FormatInfo::new(Format::$name, $bw, $bh, $bpp, $comps)),+
                }
            }
        }
    };
}

guest_formats! {
    R8Unorm = (1, 1, 1, 1),
    R8Snorm = (1, 1, 1, 1),
    R8Uint = (1, 1, 1, 1),
    R8G8Unorm = (1, 1, 2, 2),
    R8G8Snorm = (1, 1, 2, 2),
    R16Unorm = (1, 1, 2, 1),
    R16Float = (1, 1, 2, 1),
    R16Uint = (1, 1, 2, 1),
    R32Float = (1, 1, 4, 1),
    R32Uint = (1, 1, 4, 1),
    R16G16Float = (1, 1, 4, 2),
    R32G32Float = (1, 1, 8, 2),
    R8G8B8A8Unorm = (1, 1, 4, 4),
    R8G8B8A8Srgb = (1, 1, 4, 4),
    B8G8R8A8Unorm = (1, 1, 4, 4),
    B8G8R8A8Srgb = (1, 1, 4, 4),
    R10G10B10A2Unorm = (1, 1, 4, 4),
    R11G11B10Float = (1, 1, 4, 3),
    R16G16B16A16Float = (1, 1, 8, 4),
    R32G32B32A32Float = (1, 1, 16, 4),
    R32G32B32A32Uint = (1, 1, 16, 4),
    R4G4Unorm = (1, 1, 1, 2),
    R4G4B4A4Unorm = (1, 1, 2, 4),
    R5G6B5Unorm = (1, 1, 2, 3),
    B5G6R5Unorm = (1, 1, 2, 3),
    R5G5B5A1Unorm = (1, 1, 2, 4),
    B5G5R5A1Unorm = (1, 1, 2, 4),
    D16Unorm = (1, 1, 2, 1),
    D24UnormS8Uint = (1, 1, 4, 2),
    S8UintD24Unorm = (1, 1, 4, 2),
    X8UintD24Unorm = (1, 1, 4, 2),
    D32Float = (1, 1, 4, 1),
    D32FloatS8Uint = (1, 1, 8, 2),
    S8Uint = (1, 1, 1, 1),
    Bc1RgbaUnorm = (4, 4, 8, 4),
    Bc1RgbaSrgb = (4, 4, 8, 4),
    Bc2Unorm = (4, 4, 16, 4),
    Bc2Srgb = (4, 4, 16, 4),
    Bc3Unorm = (4, 4, 16, 4),
    Bc3Srgb = (4, 4, 16, 4),
    Bc4Unorm = (4, 4, 8, 1),
    Bc4Snorm = (4, 4, 8, 1),
    Bc5Unorm = (4, 4, 16, 2),
    Bc5Snorm = (4, 4, 16, 2),
    Bc6HSfloat = (4, 4, 16, 4),
    Bc6HUfloat = (4, 4, 16, 4),
    Bc7Unorm = (4, 4, 16, 4),
    Bc7Srgb = (4, 4, 16, 4),
    Etc2RgbUnorm = (4, 4, 8, 3),
    Etc2RgbSrgb = (4, 4, 8, 3),
    Etc2RgbPtaUnorm = (4, 4, 8, 4),
    Etc2RgbPtaSrgb = (4, 4, 8, 4),
    Etc2RgbaUnorm = (4, 4, 16, 4),
    Etc2RgbaSrgb = (4, 4, 16, 4),
    Astc4x4Unorm = (4, 4, 16, 4),
    Astc4x4Srgb = (4, 4, 16, 4),
    Astc5x5Unorm = (5, 5, 16, 4),
    Astc5x5Srgb = (5, 5, 16, 4),
    Astc6x6Unorm = (6, 6, 16, 4),
    Astc6x6Srgb = (6, 6, 16, 4),
    Astc8x8Unorm = (8, 8, 16, 4),
    Astc8x8Srgb = (8, 8, 16, 4),
    Astc10x10Unorm = (10, 10, 16, 4),
    Astc10x10Srgb = (10, 10, 16, 4),
    Astc12x12Unorm = (12, 12, 16, 4),
    Astc12x12Srgb = (12, 12, 16, 4),
}

impl Format {
    pub fn is_depth_or_stencil(self) -> bool {
        matches!(
            self,
            Format::D16Unorm
                | Format::D24UnormS8Uint
                | Format::S8UintD24Unorm
                | Format::X8UintD24Unorm
                | Format::D32Float
                | Format::D32FloatS8Uint
                | Format::S8Uint
        )
    }

    pub fn has_depth(self) -> bool {
        self.is_depth_or_stencil() && self != Format::S8Uint
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            Format::D24UnormS8Uint
                | Format::S8UintD24Unorm
                | Format::D32FloatS8Uint
                | Format::S8Uint
        )
    }

    pub fn is_bc(self) -> bool {
        matches!(
            self,
            Format::Bc1RgbaUnorm
                | Format::Bc1RgbaSrgb
                | Format::Bc2Unorm
                | Format::Bc2Srgb
                | Format::Bc3Unorm
                | Format::Bc3Srgb
                | Format::Bc4Unorm
                | Format::Bc4Snorm
                | Format::Bc5Unorm
                | Format::Bc5Snorm
                | Format::Bc6HSfloat
                | Format::Bc6HUfloat
                | Format::Bc7Unorm
                | Format::Bc7Srgb
        )
    }

    pub fn is_etc2(self) -> bool {
        matches!(
            self,
            Format::Etc2RgbUnorm
                | Format::Etc2RgbSrgb
                | Format::Etc2RgbPtaUnorm
                | Format::Etc2RgbPtaSrgb
                | Format::Etc2RgbaUnorm
                | Format::Etc2RgbaSrgb
        )
    }

    pub fn is_astc_unorm(self) -> bool {
        matches!(
            self,
            Format::Astc4x4Unorm
                | Format::Astc5x5Unorm
                | Format::Astc6x6Unorm
                | Format::Astc8x8Unorm
                | Format::Astc10x10Unorm
                | Format::Astc12x12Unorm
        )
    }

    pub fn is_astc_srgb(self) -> bool {
        matches!(
            self,
            Format::Astc4x4Srgb
                | Format::Astc5x5Srgb
                | Format::Astc6x6Srgb
                | Format::Astc8x8Srgb
                | Format::Astc10x10Srgb
                | Format::Astc12x12Srgb
        )
    }

    pub fn is_astc(self) -> bool {
        self.is_astc_unorm() || self.is_astc_srgb()
    }

    pub fn is_compressed(self) -> bool {
        self.is_bc() || self.is_etc2() || self.is_astc()
    }

    /// 16-bit formats with 4 or 5 bit components.
    pub fn is_16bit_packed(self) -> bool {
        matches!(
            self,
            Format::R4G4B4A4Unorm
                | Format::R5G6B5Unorm
                | Format::B5G6R5Unorm
                | Format::R5G5B5A1Unorm
                | Format::B5G5R5A1Unorm
        )
    }

    pub fn is_bgr(self) -> bool {
        matches!(
            self,
            Format::B8G8R8A8Unorm
                | Format::B8G8R8A8Srgb
                | Format::B5G6R5Unorm
                | Format::B5G5R5A1Unorm
        )
    }

    /// The sRGB variant of a format, if it has one.
    pub fn to_srgb(self) -> Option<Format> {
        Some(match self {
            Format::R8G8B8A8Unorm => Format::R8G8B8A8Srgb,
            Format::B8G8R8A8Unorm => Format::B8G8R8A8Srgb,
            Format::Bc1RgbaUnorm => Format::Bc1RgbaSrgb,
            Format::Bc2Unorm => Format::Bc2Srgb,
            Format::Bc3Unorm => Format::Bc3Srgb,
            Format::Bc7Unorm => Format::Bc7Srgb,
            Format::Etc2RgbUnorm => Format::Etc2RgbSrgb,
            Format::Etc2RgbPtaUnorm => Format::Etc2RgbPtaSrgb,
            Format::Etc2RgbaUnorm => Format::Etc2RgbaSrgb,
            Format::Astc4x4Unorm => Format::Astc4x4Srgb,
            Format::Astc5x5Unorm => Format::Astc5x5Srgb,
            Format::Astc6x6Unorm => Format::Astc6x6Srgb,
            Format::Astc8x8Unorm => Format::Astc8x8Srgb,
            Format::Astc10x10Unorm => Format::Astc10x10Srgb,
            Format::Astc12x12Unorm => Format::Astc12x12Srgb,
            _ => return None,
        })
    }

    /// The linear variant of an sRGB format, if it has one.
    pub fn to_linear(self) -> Option<Format> {
        Self::ALL
            .iter()
            .copied()
            .find(|format| format.to_srgb() == Some(self))
    }
}

/// Block footprint of a format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FormatInfo {
    pub format: Format,
    pub block_width: u32,
    pub block_height: u32,
    /// Bytes per pixel, or per block for compressed formats.
    pub bytes_per_pixel: u32,
    pub components: u32,
}

impl FormatInfo {
    pub const fn new(
        format: Format,
        block_width: u32,
        block_height: u32,
        bytes_per_pixel: u32,
        components: u32,
    ) -> Self {
        Self {
            format,
            block_width,
            block_height,
            bytes_per_pixel,
            components,
        }
    }

    /// Format used for descriptors that do not decode to a known format.
    pub const fn default_format() -> Self {
        Self::new(Format::R8G8B8A8Unorm, 1, 1, 4, 4)
    }

    pub fn is_compressed(&self) -> bool {
        self.format.is_compressed()
    }
}

impl Default for FormatInfo {
    fn default() -> Self {
        Self::default_format()
    }
}

/// Compressed formats that share a block encoding and can therefore view each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatClass {
    Unclassified,
    Bc1Rgba,
    Bc2,
    Bc3,
    Bc4,
    Bc5,
    Bc6,
    Bc7,
    Etc2Rgb,
    Etc2RgbPta,
    Etc2Rgba,
    Astc4x4,
    Astc5x5,
    Astc6x6,
    Astc8x8,
    Astc10x10,
    Astc12x12,
}

impl FormatClass {
    pub fn of(format: Format) -> Self {
        use Format::*;
        match format {
            Bc1RgbaUnorm | Bc1RgbaSrgb => Self::Bc1Rgba,
            Bc2Unorm | Bc2Srgb => Self::Bc2,
            Bc3Unorm | Bc3Srgb => Self::Bc3,
            Bc4Unorm | Bc4Snorm => Self::Bc4,
            Bc5Unorm | Bc5Snorm => Self::Bc5,
            Bc6HSfloat | Bc6HUfloat => Self::Bc6,
            Bc7Unorm | Bc7Srgb => Self::Bc7,
            Etc2RgbUnorm | Etc2RgbSrgb => Self::Etc2Rgb,
            Etc2RgbPtaUnorm | Etc2RgbPtaSrgb => Self::Etc2RgbPta,
            Etc2RgbaUnorm | Etc2RgbaSrgb => Self::Etc2Rgba,
            Astc4x4Unorm | Astc4x4Srgb => Self::Astc4x4,
            Astc5x5Unorm | Astc5x5Srgb => Self::Astc5x5,
            Astc6x6Unorm | Astc6x6Srgb => Self::Astc6x6,
            Astc8x8Unorm | Astc8x8Srgb => Self::Astc8x8,
            Astc10x10Unorm | Astc10x10Srgb => Self::Astc10x10,
            Astc12x12Unorm | Astc12x12Srgb => Self::Astc12x12,
            _ => Self::Unclassified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn codes_round_trip_through_the_descriptor_encoding() {
        for &format in Format::ALL {
            assert_eq!(Format::from_code(format.code()), Some(format));
        }
        assert_eq!(Format::from_code(u8::MAX), None);
    }

    #[test]
    fn srgb_and_linear_variants_pair_up() {
        assert_eq!(
            Format::R8G8B8A8Unorm.to_srgb(),
            Some(Format::R8G8B8A8Srgb)
        );
        assert_eq!(
            Format::Bc7Srgb.to_linear(),
            Some(Format::Bc7Unorm)
        );
        assert_eq!(Format::R32Float.to_srgb(), None);
        assert_eq!(Format::R32Float.to_linear(), None);
    }

    #[test]
    fn compressed_block_footprints() {
        let bc1 = Format::Bc1RgbaUnorm.info();
        assert_eq!((bc1.block_width, bc1.block_height, bc1.bytes_per_pixel), (4, 4, 8));
        let astc = Format::Astc10x10Srgb.info();
        assert_eq!((astc.block_width, astc.block_height), (10, 10));
        assert!(astc.is_compressed());
        assert_eq!(FormatClass::of(Format::Astc10x10Unorm), FormatClass::Astc10x10);
        assert_eq!(FormatClass::of(Format::R8Unorm), FormatClass::Unclassified);
    }

    #[test]
    fn depth_stencil_classification() {
        assert!(Format::D32Float.is_depth_or_stencil());
        assert!(!Format::D32Float.has_stencil());
        assert!(Format::S8Uint.has_stencil());
        assert!(!Format::S8Uint.has_depth());
        assert!(!Format::R32Float.is_depth_or_stencil());
    }
}
