// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use ash::vk;
use tracing::debug;

use crate::capabilities::{VideoCapabilities, VideoProfile};
use crate::device::DeviceRef;
use crate::error::Result;

/// Everything a decode session is bound to. A session can be reused for a
/// new sequence only if all of these are unchanged.
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    pub flags: vk::VideoSessionCreateFlagsKHR,
    pub queue_family: u32,
    pub profile: VideoProfile,
    pub picture_format: vk::Format,
    pub max_coded_extent: vk::Extent2D,
    pub reference_format: vk::Format,
    pub max_dpb_slots: u32,
    pub max_active_reference_pictures: u32,
    pub std_header_version: vk::ExtensionProperties,
}

impl PartialEq for SessionParams {
    fn eq(&self, other: &Self) -> bool {
        self.flags == other.flags
            && self.queue_family == other.queue_family
            && self.profile == other.profile
            && self.picture_format == other.picture_format
            && self.max_coded_extent == other.max_coded_extent
            && self.reference_format == other.reference_format
            && self.max_dpb_slots == other.max_dpb_slots
            && self.max_active_reference_pictures == other.max_active_reference_pictures
    }
}

/// The most reference pictures any frame can use.
pub const MAX_ACTIVE_REFERENCES: u32 = 16;

impl SessionParams {
    /// Computes the session configuration for a sequence requiring
    /// `required_dpb_slots` slots. One extra slot is reserved for the
    /// picture being decoded, and both counts are clamped to the device
    /// limits.
    pub fn new(
        queue_family: u32,
        profile: VideoProfile,
        capabilities: &VideoCapabilities,
        picture_format: vk::Format,
        reference_format: vk::Format,
        max_coded_extent: vk::Extent2D,
        required_dpb_slots: u32,
    ) -> Self {
        let max_dpb_slots = (required_dpb_slots + 1).min(capabilities.max_dpb_slots);
        let max_active_reference_pictures = required_dpb_slots
            .min(MAX_ACTIVE_REFERENCES)
            .min(capabilities.max_active_reference_pictures);

        Self {
            flags: vk::VideoSessionCreateFlagsKHR::empty(),
            queue_family,
            profile,
            picture_format,
            max_coded_extent,
            reference_format,
            max_dpb_slots,
            max_active_reference_pictures,
            std_header_version: capabilities.std_header_version,
        }
    }
}

/// A decode session. Destroyed through the device when dropped, which must
/// only happen once the device has finished all work using it.
pub struct VideoSession {
    pub session: vk::VideoSessionKHR,
    params: SessionParams,
    device: DeviceRef,
}

impl VideoSession {
    pub fn new(device: DeviceRef, params: SessionParams) -> Result<Self> {
        let session = device.create_video_session(&params)?;

        debug!(
            codec = %params.profile.codec,
            extent = ?params.max_coded_extent,
            picture_format = ?params.picture_format,
            reference_format = ?params.reference_format,
            max_dpb_slots = params.max_dpb_slots,
            max_active_reference_pictures = params.max_active_reference_pictures,
            "created video session"
        );

        Ok(Self {
            session,
            params,
            device,
        })
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn is_compatible(&self, params: &SessionParams) -> bool {
        self.params == *params
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        self.device.destroy_video_session(self.session);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capabilities::decode_capabilities;
    use crate::codec::VideoCodec;
    use crate::device::mock::MockDevice;
    use crate::format::{BitDepth, ChromaSubsampling};
    use std::sync::Arc;

    fn params(device: &MockDevice, width: u32, dpb_slots: u32) -> SessionParams {
        let profile = VideoProfile {
            codec: VideoCodec::H265,
            chroma_subsampling: ChromaSubsampling::Yuv420,
            luma_bit_depth: BitDepth::Ten,
            chroma_bit_depth: BitDepth::Ten,
            codec_profile: 2,
            progressive: true,
        };

        let (caps, _) = decode_capabilities(device, &profile).unwrap();
        SessionParams::new(
            0,
            profile,
            &caps,
            vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16,
            vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16,
            vk::Extent2D {
                width,
                height: 1088,
            },
            dpb_slots,
        )
    }

    #[test]
    fn slot_counts() {
        let device = MockDevice::new();
        let p = params(&device, 1920, 6);
        assert_eq!(p.max_dpb_slots, 7);
        assert_eq!(p.max_active_reference_pictures, 6);

        // The mock allows 17 slots and 16 active references.
        let p = params(&device, 1920, 20);
        assert_eq!(p.max_dpb_slots, 17);
        assert_eq!(p.max_active_reference_pictures, 16);
    }

    #[test]
    fn compatibility() {
        let device = Arc::new(MockDevice::new());
        let session = VideoSession::new(device.clone(), params(&device, 1920, 4)).unwrap();

        assert!(session.is_compatible(&params(&device, 1920, 4)));
        assert!(!session.is_compatible(&params(&device, 1280, 4)));
        assert!(!session.is_compatible(&params(&device, 1920, 5)));

        drop(session);
        assert_eq!(device.live_sessions(), 0);
    }
}
