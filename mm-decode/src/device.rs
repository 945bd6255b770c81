// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The seam between the decoder and the GPU. Everything above this trait is
//! plain bookkeeping, and can be exercised without a device.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::capabilities::{DecodeCapabilities, VideoCapabilities, VideoProfile};
use crate::color::{YcbcrModel, YcbcrRange};
use crate::decoder::{DecodeSubmission, PictureResource};
use crate::error::Result;
use crate::format::BitDepth;
use crate::parameters::ParameterSet;
use crate::session::SessionParams;

#[cfg(test)]
pub(crate) mod mock;

pub type DeviceRef = Arc<dyn DecodeDevice>;

/// Describes a GPU image backing one role of a decode slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDesc {
    pub profile: VideoProfile,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
    pub memory_flags: vk::MemoryPropertyFlags,
    /// More than one family means the image is created with concurrent
    /// sharing.
    pub queue_families: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageViewDesc {
    pub format: vk::Format,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterHandle(pub u64);

/// Configuration for the compute color-conversion filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterDesc {
    pub input_format: vk::Format,
    pub output_format: vk::Format,
    pub bit_depth: BitDepth,
    pub chroma_shift: (u32, u32),
    pub model: YcbcrModel,
    pub range: YcbcrRange,
    pub max_slots: u32,
}

pub trait DecodeDevice: Send + Sync {
    fn decode_queue_family(&self) -> u32;

    /// The number of queues available in the decode family.
    fn decode_queue_count(&self) -> u32;

    fn compute_queue_family(&self) -> Option<u32>;

    /// The codec operations supported by the decode queue family.
    fn decode_operations(&self) -> vk::VideoCodecOperationFlagsKHR;

    /// Whether the decode queue family supports result status queries.
    fn supports_query_result_status(&self) -> bool;

    fn video_capabilities(
        &self,
        profile: &VideoProfile,
    ) -> Result<(VideoCapabilities, DecodeCapabilities)>;

    fn video_formats(
        &self,
        profile: &VideoProfile,
        usage: vk::ImageUsageFlags,
    ) -> Result<Vec<vk::Format>>;

    /// Creates a session and binds its memory.
    fn create_video_session(&self, params: &SessionParams) -> Result<vk::VideoSessionKHR>;
    fn destroy_video_session(&self, session: vk::VideoSessionKHR);

    /// Creates a session parameters object containing `set`, inheriting from
    /// `template` if it is not null.
    fn create_session_parameters(
        &self,
        session: vk::VideoSessionKHR,
        template: vk::VideoSessionParametersKHR,
        set: &ParameterSet,
    ) -> Result<vk::VideoSessionParametersKHR>;
    fn update_session_parameters(
        &self,
        parameters: vk::VideoSessionParametersKHR,
        set: &ParameterSet,
        update_sequence_count: u32,
    ) -> Result<()>;
    fn destroy_session_parameters(&self, parameters: vk::VideoSessionParametersKHR);

    fn create_image(&self, desc: &ImageDesc) -> Result<DeviceImage>;
    fn create_image_view(&self, image: vk::Image, desc: &ImageViewDesc) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn destroy_image(&self, image: DeviceImage);

    /// Creates a host-visible buffer usable as a decode source for `profile`.
    fn create_bitstream_buffer(&self, profile: &VideoProfile, size: u64) -> Result<DeviceBuffer>;
    fn write_buffer(&self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> Result<()>;
    fn destroy_buffer(&self, buffer: DeviceBuffer);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    /// Returns false on timeout.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn fence_status(&self, fence: vk::Fence) -> Result<bool>;
    fn destroy_fence(&self, fence: vk::Fence);

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore>;
    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64>;
    /// Returns false on timeout.
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout: Duration)
        -> Result<bool>;
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_query_pool(&self, profile: &VideoProfile, count: u32) -> Result<vk::QueryPool>;
    /// Returns `None` if the result isn't available yet.
    fn query_status(
        &self,
        pool: vk::QueryPool,
        query: u32,
    ) -> Result<Option<vk::QueryResultStatusKHR>>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);

    fn create_filter(&self, desc: &FilterDesc) -> Result<FilterHandle>;
    fn destroy_filter(&self, filter: FilterHandle);

    /// Records and submits one decode, and the filter pass if there is one.
    /// Returns `FilterSubmission` if the decode was submitted but the filter
    /// pass wasn't; any other error means nothing was submitted.
    fn submit_decode(&self, submission: &DecodeSubmission) -> Result<()>;

    /// Copies a host-visible, linear picture into `out`, tightly packed.
    fn read_image(
        &self,
        picture: &PictureResource,
        extent: vk::Extent2D,
        out: &mut Vec<u8>,
    ) -> Result<()>;

    fn wait_idle(&self) -> Result<()>;
}
