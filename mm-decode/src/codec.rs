// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use ash::vk;

/// A codec supported by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
    Av1,
}

// `VK_VIDEO_CODEC_OPERATION_DECODE_AV1_BIT_KHR`, which our ash revision
// doesn't name yet.
const DECODE_AV1: vk::VideoCodecOperationFlagsKHR = vk::VideoCodecOperationFlagsKHR::from_raw(0x4);

impl VideoCodec {
    pub const ALL: [VideoCodec; 3] = [VideoCodec::H264, VideoCodec::H265, VideoCodec::Av1];

    pub fn decode_operation(&self) -> vk::VideoCodecOperationFlagsKHR {
        match self {
            VideoCodec::H264 => vk::VideoCodecOperationFlagsKHR::DECODE_H264,
            VideoCodec::H265 => vk::VideoCodecOperationFlagsKHR::DECODE_H265,
            VideoCodec::Av1 => DECODE_AV1,
        }
    }

    pub fn from_decode_operation(op: vk::VideoCodecOperationFlagsKHR) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|codec| codec.decode_operation() == op)
    }

    /// The name of the device extension providing decode support.
    pub fn decode_extension_name(&self) -> &'static std::ffi::CStr {
        match self {
            VideoCodec::H264 => cstr::cstr!("VK_KHR_video_decode_h264"),
            VideoCodec::H265 => cstr::cstr!("VK_KHR_video_decode_h265"),
            VideoCodec::Av1 => cstr::cstr!("VK_KHR_video_decode_av1"),
        }
    }

    /// Whether parameter sets are passed to the session out of band, as
    /// opposed to per picture.
    pub fn uses_parameter_sets(&self) -> bool {
        !matches!(self, VideoCodec::Av1)
    }

    /// Whether new session parameters objects can be created from a template.
    pub fn supports_parameter_templates(&self) -> bool {
        !matches!(self, VideoCodec::Av1)
    }

    pub fn supports_film_grain(&self) -> bool {
        matches!(self, VideoCodec::Av1)
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "h264"),
            VideoCodec::H265 => write!(f, "h265"),
            VideoCodec::Av1 => write!(f, "av1"),
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(VideoCodec::H264),
            "h265" | "hevc" => Ok(VideoCodec::H265),
            "av1" => Ok(VideoCodec::Av1),
            _ => Err(anyhow::anyhow!("unknown codec: {}", s)),
        }
    }
}

/// Converts a set of codec operations reported by a queue family into the
/// codecs we know how to drive.
pub fn codecs_from_operations(ops: vk::VideoCodecOperationFlagsKHR) -> Vec<VideoCodec> {
    VideoCodec::ALL
        .into_iter()
        .filter(|codec| ops.contains(codec.decode_operation()))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn operations() {
        let ops =
            vk::VideoCodecOperationFlagsKHR::DECODE_H265 | vk::VideoCodecOperationFlagsKHR::DECODE_H264;
        assert_eq!(
            codecs_from_operations(ops),
            vec![VideoCodec::H264, VideoCodec::H265]
        );

        assert_eq!(
            VideoCodec::from_decode_operation(DECODE_AV1),
            Some(VideoCodec::Av1)
        );

        // Encode operations are never picked up.
        assert_eq!(
            codecs_from_operations(vk::VideoCodecOperationFlagsKHR::ENCODE_H264_EXT),
            vec![]
        );
    }

    #[test]
    fn parse() {
        assert_eq!("HEVC".parse::<VideoCodec>().unwrap(), VideoCodec::H265);
        assert!("vp9".parse::<VideoCodec>().is_err());
    }
}
