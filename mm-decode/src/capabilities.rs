// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use ash::vk;
use tracing::{debug, trace};

use crate::codec::{codecs_from_operations, VideoCodec};
use crate::device::DecodeDevice;
use crate::error::{DecodeError, Result};
use crate::format::{expected_picture_format, BitDepth, ChromaSubsampling, VideoFormat};

/// The profile a decode session (and every image and buffer used with it) is
/// created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VideoProfile {
    pub codec: VideoCodec,
    pub chroma_subsampling: ChromaSubsampling,
    pub luma_bit_depth: BitDepth,
    pub chroma_bit_depth: BitDepth,
    pub codec_profile: u32,
    pub progressive: bool,
}

impl VideoProfile {
    pub fn from_format(format: &VideoFormat) -> Self {
        Self {
            codec: format.codec,
            chroma_subsampling: format.chroma_subsampling,
            luma_bit_depth: format.luma_bit_depth,
            chroma_bit_depth: format.chroma_bit_depth,
            codec_profile: format.codec_profile,
            progressive: format.progressive,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VideoCapabilities {
    pub flags: vk::VideoCapabilityFlagsKHR,
    pub min_bitstream_buffer_offset_alignment: u64,
    pub min_bitstream_buffer_size_alignment: u64,
    pub picture_access_granularity: vk::Extent2D,
    pub min_coded_extent: vk::Extent2D,
    pub max_coded_extent: vk::Extent2D,
    pub max_dpb_slots: u32,
    pub max_active_reference_pictures: u32,
    pub std_header_version: vk::ExtensionProperties,
}

impl VideoCapabilities {
    pub fn separate_reference_images(&self) -> bool {
        self.flags
            .contains(vk::VideoCapabilityFlagsKHR::SEPARATE_REFERENCE_IMAGES)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeCapabilities {
    pub flags: vk::VideoDecodeCapabilityFlagsKHR,
}

impl DecodeCapabilities {
    pub fn dpb_and_output_coincide(&self) -> bool {
        self.flags
            .contains(vk::VideoDecodeCapabilityFlagsKHR::DPB_AND_OUTPUT_COINCIDE)
    }

    pub fn dpb_and_output_distinct(&self) -> bool {
        self.flags
            .contains(vk::VideoDecodeCapabilityFlagsKHR::DPB_AND_OUTPUT_DISTINCT)
    }
}

pub fn supported_codecs(device: &dyn DecodeDevice) -> Vec<VideoCodec> {
    codecs_from_operations(device.decode_operations())
}

pub fn is_codec_supported(device: &dyn DecodeDevice, queue_family: u32, codec: VideoCodec) -> bool {
    queue_family == device.decode_queue_family()
        && device
            .decode_operations()
            .contains(codec.decode_operation())
}

/// Queries the capabilities for a profile. A device that reports neither
/// coinciding nor distinct output pictures can't be used.
pub fn decode_capabilities(
    device: &dyn DecodeDevice,
    profile: &VideoProfile,
) -> Result<(VideoCapabilities, DecodeCapabilities)> {
    let (caps, decode_caps) = device.video_capabilities(profile)?;

    if !decode_caps.dpb_and_output_coincide() && !decode_caps.dpb_and_output_distinct() {
        return Err(DecodeError::UnsupportedCapabilities(format!(
            "{} decode supports neither coinciding nor distinct output: {:?}",
            profile.codec, decode_caps.flags
        )));
    }

    debug!(
        codec = %profile.codec,
        flags = ?caps.flags,
        decode_flags = ?decode_caps.flags,
        max_coded_extent = ?caps.max_coded_extent,
        max_dpb_slots = caps.max_dpb_slots,
        "queried video decode capabilities"
    );

    Ok((caps, decode_caps))
}

/// Returns the (output, reference) formats to use for a profile.
pub fn supported_video_formats(
    device: &dyn DecodeDevice,
    profile: &VideoProfile,
    decode_caps: &DecodeCapabilities,
) -> Result<(vk::Format, vk::Format)> {
    let preferred = expected_picture_format(profile.chroma_subsampling, profile.luma_bit_depth);

    let pick = |usage: vk::ImageUsageFlags| -> Result<vk::Format> {
        let formats = device.video_formats(profile, usage)?;
        for format in &formats {
            trace!(?format, ?usage, "available video format");
        }

        if formats.contains(&preferred) {
            return Ok(preferred);
        }

        formats.first().copied().ok_or_else(|| {
            DecodeError::UnsupportedFormat(format!(
                "no {} picture format supports {:?}",
                profile.codec, usage
            ))
        })
    };

    if decode_caps.dpb_and_output_coincide() {
        let format =
            pick(vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR | vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR)?;
        Ok((format, format))
    } else {
        let dpb = pick(vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR)?;
        let out = pick(vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR)?;
        Ok((out, dpb))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::mock::MockDevice;
    use pretty_assertions::assert_eq;

    fn profile() -> VideoProfile {
        VideoProfile {
            codec: VideoCodec::H264,
            chroma_subsampling: ChromaSubsampling::Yuv420,
            luma_bit_depth: BitDepth::Eight,
            chroma_bit_depth: BitDepth::Eight,
            codec_profile: 100,
            progressive: true,
        }
    }

    #[test]
    fn codec_support() {
        let device = MockDevice::new();
        assert!(is_codec_supported(&device, 0, VideoCodec::H264));
        assert!(!is_codec_supported(&device, 0, VideoCodec::Av1));
        assert!(!is_codec_supported(&device, 3, VideoCodec::H264));
        assert_eq!(
            supported_codecs(&device),
            vec![VideoCodec::H264, VideoCodec::H265]
        );
    }

    #[test]
    fn prefers_expected_format() {
        let device = MockDevice::new();
        device.set_formats(vec![
            vk::Format::G16_B16R16_2PLANE_420_UNORM,
            vk::Format::G8_B8R8_2PLANE_420_UNORM,
        ]);

        let (_, decode_caps) = decode_capabilities(&device, &profile()).unwrap();
        let (out, dpb) = supported_video_formats(&device, &profile(), &decode_caps).unwrap();
        assert_eq!(out, vk::Format::G8_B8R8_2PLANE_420_UNORM);
        assert_eq!(dpb, out);
    }

    #[test]
    fn no_formats() {
        let device = MockDevice::new();
        device.set_formats(vec![]);

        let (_, decode_caps) = decode_capabilities(&device, &profile()).unwrap();
        match supported_video_formats(&device, &profile(), &decode_caps) {
            Err(DecodeError::UnsupportedFormat(_)) => (),
            v => panic!("expected UnsupportedFormat, got {:?}", v),
        }
    }

    #[test]
    fn no_output_mode() {
        let device = MockDevice::new();
        device.set_decode_flags(vk::VideoDecodeCapabilityFlagsKHR::empty());

        match decode_capabilities(&device, &profile()) {
            Err(DecodeError::UnsupportedCapabilities(_)) => (),
            v => panic!("expected UnsupportedCapabilities, got {:?}", v),
        }
    }
}
