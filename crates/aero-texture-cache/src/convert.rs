//! Guest-to-host data conversion for formats the host cannot store natively.

use tracing::warn;

use crate::format::Format;

/// Decoder for compressed formats the host cannot sample directly.
///
/// The cache substitutes an uncompressed host format for such textures and hands the guest
/// blocks to this hook on every upload.
pub trait FormatConverter: Send + Sync {
    /// Decodes `depth` planes of `width`x`height` pixels of `guest` data into `host` format.
    fn decode(
        &self,
        guest: Format,
        host: Format,
        width: u32,
        height: u32,
        depth: u32,
        data: &[u8],
    ) -> Option<Vec<u8>>;
}

fn expand5(v: u16) -> u8 {
    let v = (v & 0x1f) as u8;
    (v << 3) | (v >> 2)
}

fn expand6(v: u16) -> u8 {
    let v = (v & 0x3f) as u8;
    (v << 2) | (v >> 4)
}

fn expand4(v: u16) -> u8 {
    (v & 0xf) as u8 * 17
}

/// Expands one packed 16-bit texel into `[r, g, b, a]`.
fn unpack16(format: Format, v: u16) -> [u8; 4] {
    match format {
        Format::R5G6B5Unorm => [expand5(v), expand6(v >> 5), expand5(v >> 11), 0xff],
        Format::B5G6R5Unorm => [expand5(v >> 11), expand6(v >> 5), expand5(v), 0xff],
        Format::R5G5B5A1Unorm => [
            expand5(v),
            expand5(v >> 5),
            expand5(v >> 10),
            if v & 0x8000 != 0 { 0xff } else { 0 },
        ],
        Format::B5G5R5A1Unorm => [
            expand5(v >> 10),
            expand5(v >> 5),
            expand5(v),
            if v & 0x8000 != 0 { 0xff } else { 0 },
        ],
        Format::R4G4B4A4Unorm => [expand4(v), expand4(v >> 4), expand4(v >> 8), expand4(v >> 12)],
        _ => [0, 0, 0, 0xff],
    }
}

fn expand_packed16(guest: Format, bgra: bool, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for texel in data.chunks_exact(2) {
        let [r, g, b, a] = unpack16(guest, u16::from_le_bytes([texel[0], texel[1]]));
        if bgra {
            out.extend_from_slice(&[b, g, r, a]);
        } else {
            out.extend_from_slice(&[r, g, b, a]);
        }
    }
    out
}

/// Converts tightly packed guest texels of `guest` format into `host` format.
pub fn convert_to_host(
    guest: Format,
    host: Format,
    width: u32,
    height: u32,
    depth: u32,
    data: Vec<u8>,
    converter: Option<&dyn FormatConverter>,
) -> Vec<u8> {
    if guest == host {
        return data;
    }

    match (guest, host) {
        (Format::R4G4Unorm, Format::R4G4B4A4Unorm) => data
            .iter()
            .flat_map(|&b| (b as u16 | 0xf000).to_le_bytes())
            .collect(),
        (Format::R4G4Unorm, Format::R8G8B8A8Unorm) => data
            .iter()
            .flat_map(|&b| [expand4(b as u16), expand4((b >> 4) as u16), 0, 0xff])
            .collect(),
        (g, Format::R8G8B8A8Unorm) if g.is_16bit_packed() => expand_packed16(g, false, &data),
        (g, Format::B8G8R8A8Unorm) if g.is_16bit_packed() => expand_packed16(g, true, &data),
        _ => {
            if let Some(decoded) =
                converter.and_then(|c| c.decode(guest, host, width, height, depth, &data))
            {
                return decoded;
            }
            let host_info = host.info();
            let len = width.div_ceil(host_info.block_width) as usize
                * height.div_ceil(host_info.block_height) as usize
                * depth as usize
                * host_info.bytes_per_pixel as usize;
            warn!(?guest, ?host, "no converter for host-incompatible format, uploading zeroes");
            vec![0; len]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn b5g6r5_expands_to_full_range_bgra() {
        // Pure red: r5 = 31 in the top bits.
        let data = (0x1fu16 << 11).to_le_bytes().to_vec();
        let out = convert_to_host(Format::B5G6R5Unorm, Format::B8G8R8A8Unorm, 1, 1, 1, data, None);
        assert_eq!(out, vec![0, 0, 0xff, 0xff]);
    }

    #[test]
    fn r4g4b4a4_expands_each_nibble() {
        let data = 0x8f0fu16.to_le_bytes().to_vec();
        let out = convert_to_host(Format::R4G4B4A4Unorm, Format::R8G8B8A8Unorm, 1, 1, 1, data, None);
        assert_eq!(out, vec![0xff, 0, 0xff, 0x88]);
    }

    #[test]
    fn compressed_without_converter_uploads_zeroed_host_size() {
        let out = convert_to_host(
            Format::Astc8x8Unorm,
            Format::R8G8B8A8Unorm,
            16,
            8,
            1,
            vec![0xab; 32],
            None,
        );
        assert_eq!(out.len(), 16 * 8 * 4);
        assert!(out.iter().all(|&b| b == 0));
    }

    struct Fill;

    impl FormatConverter for Fill {
        fn decode(&self, _: Format, _: Format, w: u32, h: u32, d: u32, _: &[u8]) -> Option<Vec<u8>> {
            Some(vec![7; (w * h * d * 4) as usize])
        }
    }

    #[test]
    fn converter_hook_is_used_for_compressed_formats() {
        let out = convert_to_host(
            Format::Bc1RgbaUnorm,
            Format::R8G8B8A8Unorm,
            4,
            4,
            1,
            vec![0; 8],
            Some(&Fill),
        );
        assert_eq!(out, vec![7; 64]);
    }
}
