// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use ash::vk;

use crate::codec::VideoCodec;
use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChromaSubsampling {
    Monochrome,
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaSubsampling {
    pub fn as_vk(&self) -> vk::VideoChromaSubsamplingFlagsKHR {
        match self {
            ChromaSubsampling::Monochrome => vk::VideoChromaSubsamplingFlagsKHR::MONOCHROME,
            ChromaSubsampling::Yuv420 => vk::VideoChromaSubsamplingFlagsKHR::TYPE_420,
            ChromaSubsampling::Yuv422 => vk::VideoChromaSubsamplingFlagsKHR::TYPE_422,
            ChromaSubsampling::Yuv444 => vk::VideoChromaSubsamplingFlagsKHR::TYPE_444,
        }
    }

    /// The log2 subsampling factor of the chroma planes, horizontally and
    /// vertically.
    pub fn chroma_shift(&self) -> (u32, u32) {
        match self {
            ChromaSubsampling::Yuv420 => (1, 1),
            ChromaSubsampling::Yuv422 => (1, 0),
            ChromaSubsampling::Monochrome | ChromaSubsampling::Yuv444 => (0, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitDepth {
    Eight,
    Ten,
    Twelve,
}

impl BitDepth {
    pub fn as_vk(&self) -> vk::VideoComponentBitDepthFlagsKHR {
        match self {
            BitDepth::Eight => vk::VideoComponentBitDepthFlagsKHR::TYPE_8,
            BitDepth::Ten => vk::VideoComponentBitDepthFlagsKHR::TYPE_10,
            BitDepth::Twelve => vk::VideoComponentBitDepthFlagsKHR::TYPE_12,
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Ten => 10,
            BitDepth::Twelve => 12,
        }
    }
}

impl TryFrom<u8> for BitDepth {
    type Error = DecodeError;

    fn try_from(bits: u8) -> Result<Self, DecodeError> {
        match bits {
            8 => Ok(BitDepth::Eight),
            10 => Ok(BitDepth::Ten),
            12 => Ok(BitDepth::Twelve),
            _ => Err(DecodeError::UnsupportedFormat(format!(
                "bit depth {} not supported",
                bits
            ))),
        }
    }
}

/// The visible region of the coded picture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayArea {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl DisplayArea {
    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }
}

/// The color description signalled in the bitstream (ISO/IEC 23091-4 code
/// points).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSignal {
    pub full_range: bool,
    pub color_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

impl Default for VideoSignal {
    fn default() -> Self {
        // 2 means "unspecified".
        Self {
            full_range: false,
            color_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
        }
    }
}

/// The format of a sequence, as detected by the parser. Immutable until the
/// next sequence header changes it.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFormat {
    pub codec: VideoCodec,
    /// The codec-specific profile (`profile_idc` for H.264/H.265,
    /// `seq_profile` for AV1).
    pub codec_profile: u32,
    pub chroma_subsampling: ChromaSubsampling,
    pub luma_bit_depth: BitDepth,
    pub chroma_bit_depth: BitDepth,
    pub coded_width: u32,
    pub coded_height: u32,
    pub display_area: DisplayArea,
    /// The number of DPB slots the sequence requires.
    pub max_dpb_slots: u32,
    /// The minimum number of surfaces needed to decode the sequence.
    pub min_decode_surfaces: u32,
    pub film_grain: bool,
    pub progressive: bool,
    pub frame_rate: (u32, u32),
    pub signal: VideoSignal,
}

impl VideoFormat {
    pub fn coded_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.coded_width,
            height: self.coded_height,
        }
    }

    pub fn display_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.display_area.width(),
            height: self.display_area.height(),
        }
    }
}

/// The multi-planar format we expect a decoder to produce for a given bit
/// depth and subsampling. Used to prefer a format when a device returns
/// several.
pub fn expected_picture_format(
    subsampling: ChromaSubsampling,
    bit_depth: BitDepth,
) -> vk::Format {
    use ChromaSubsampling::*;

    match (subsampling, bit_depth) {
        (Monochrome, BitDepth::Eight) => vk::Format::R8_UNORM,
        (Monochrome, BitDepth::Ten) => vk::Format::R10X6_UNORM_PACK16,
        (Monochrome, BitDepth::Twelve) => vk::Format::R12X4_UNORM_PACK16,
        (Yuv420, BitDepth::Eight) => vk::Format::G8_B8R8_2PLANE_420_UNORM,
        (Yuv420, BitDepth::Ten) => vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16,
        (Yuv420, BitDepth::Twelve) => vk::Format::G12X4_B12X4R12X4_2PLANE_420_UNORM_3PACK16,
        (Yuv422, BitDepth::Eight) => vk::Format::G8_B8R8_2PLANE_422_UNORM,
        (Yuv422, BitDepth::Ten) => vk::Format::G10X6_B10X6R10X6_2PLANE_422_UNORM_3PACK16,
        (Yuv422, BitDepth::Twelve) => vk::Format::G12X4_B12X4R12X4_2PLANE_422_UNORM_3PACK16,
        (Yuv444, BitDepth::Eight) => vk::Format::G8_B8_R8_3PLANE_444_UNORM,
        (Yuv444, BitDepth::Ten) => vk::Format::G10X6_B10X6_R10X6_3PLANE_444_UNORM_3PACK16,
        (Yuv444, BitDepth::Twelve) => vk::Format::G12X4_B12X4_R12X4_3PLANE_444_UNORM_3PACK16,
    }
}

/// Describes the planes of a decoded picture format, for copies and
/// readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub aspect: vk::ImageAspectFlags,
    pub width_shift: u32,
    pub height_shift: u32,
    pub bytes_per_texel: u32,
}

pub fn plane_layouts(format: vk::Format) -> Vec<PlaneLayout> {
    let plane = |aspect, width_shift, height_shift, bytes_per_texel| PlaneLayout {
        aspect,
        width_shift,
        height_shift,
        bytes_per_texel,
    };

    let p0 = vk::ImageAspectFlags::PLANE_0;
    let p1 = vk::ImageAspectFlags::PLANE_1;
    let p2 = vk::ImageAspectFlags::PLANE_2;

    match format {
        vk::Format::G8_B8R8_2PLANE_420_UNORM => vec![plane(p0, 0, 0, 1), plane(p1, 1, 1, 2)],
        vk::Format::G8_B8R8_2PLANE_422_UNORM => vec![plane(p0, 0, 0, 1), plane(p1, 1, 0, 2)],
        vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16
        | vk::Format::G12X4_B12X4R12X4_2PLANE_420_UNORM_3PACK16
        | vk::Format::G16_B16R16_2PLANE_420_UNORM => {
            vec![plane(p0, 0, 0, 2), plane(p1, 1, 1, 4)]
        }
        vk::Format::G10X6_B10X6R10X6_2PLANE_422_UNORM_3PACK16
        | vk::Format::G12X4_B12X4R12X4_2PLANE_422_UNORM_3PACK16
        | vk::Format::G16_B16R16_2PLANE_422_UNORM => {
            vec![plane(p0, 0, 0, 2), plane(p1, 1, 0, 4)]
        }
        vk::Format::G8_B8_R8_3PLANE_444_UNORM => vec![
            plane(p0, 0, 0, 1),
            plane(p1, 0, 0, 1),
            plane(p2, 0, 0, 1),
        ],
        vk::Format::G10X6_B10X6_R10X6_3PLANE_444_UNORM_3PACK16
        | vk::Format::G12X4_B12X4_R12X4_3PLANE_444_UNORM_3PACK16
        | vk::Format::G16_B16_R16_3PLANE_444_UNORM => vec![
            plane(p0, 0, 0, 2),
            plane(p1, 0, 0, 2),
            plane(p2, 0, 0, 2),
        ],
        vk::Format::R8_UNORM => vec![plane(vk::ImageAspectFlags::COLOR, 0, 0, 1)],
        vk::Format::R10X6_UNORM_PACK16 | vk::Format::R12X4_UNORM_PACK16 => {
            vec![plane(vk::ImageAspectFlags::COLOR, 0, 0, 2)]
        }
        vk::Format::R8G8B8A8_UNORM | vk::Format::B8G8R8A8_UNORM => {
            vec![plane(vk::ImageAspectFlags::COLOR, 0, 0, 4)]
        }
        _ => Vec::new(),
    }
}

/// The number of bytes a tightly packed copy of an image of the given format
/// and extent occupies.
pub fn packed_size(format: vk::Format, extent: vk::Extent2D) -> usize {
    plane_layouts(format)
        .iter()
        .map(|p| {
            let w = (extent.width + (1 << p.width_shift) - 1) >> p.width_shift;
            let h = (extent.height + (1 << p.height_shift) - 1) >> p.height_shift;
            (w * h * p.bytes_per_texel) as usize
        })
        .sum()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn nv12_size() {
        let extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };

        assert_eq!(
            packed_size(vk::Format::G8_B8R8_2PLANE_420_UNORM, extent),
            1920 * 1080 * 3 / 2
        );
    }

    #[test]
    fn odd_extent_rounds_chroma_up() {
        let extent = vk::Extent2D {
            width: 3,
            height: 3,
        };

        // 9 luma bytes, and a 2x2 plane of interleaved chroma.
        assert_eq!(
            packed_size(vk::Format::G8_B8R8_2PLANE_420_UNORM, extent),
            9 + 8
        );
    }

    #[test]
    fn display_area() {
        let area = DisplayArea {
            left: 0,
            top: 0,
            right: 1920,
            bottom: 1080,
        };

        assert_eq!(area.width(), 1920);
        assert_eq!(area.height(), 1080);
        assert_eq!(DisplayArea::default().width(), 0);
    }
}
