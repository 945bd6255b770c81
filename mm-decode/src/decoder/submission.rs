// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Plain descriptions of GPU work. The decoder fills these in, and the device
//! records them into command buffers.

use ash::vk;

use crate::device::FilterHandle;

/// A point on a timeline semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelinePoint {
    pub semaphore: vk::Semaphore,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreOp {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

impl SemaphoreOp {
    pub fn point(&self) -> TimelinePoint {
        TimelinePoint {
            semaphore: self.semaphore,
            value: self.value,
        }
    }
}

/// A layout change for one layer of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub array_layer: u32,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

/// An image as bound to a decode operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureResource {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub array_layer: u32,
    /// The layer relative to `view`, which differs from `array_layer` if the
    /// view spans a whole image array.
    pub view_layer: u32,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Copy)]
pub enum CodecReferenceInfo {
    H264(vk::native::StdVideoDecodeH264ReferenceInfo),
    H265(vk::native::StdVideoDecodeH265ReferenceInfo),
    Av1 { order_hint: u8 },
}

/// A DPB slot, either the setup slot or an active reference.
#[derive(Debug, Clone)]
pub struct ReferenceSlot {
    pub slot_index: i32,
    pub picture: PictureResource,
    pub codec: CodecReferenceInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Av1PictureInfo {
    pub apply_film_grain: bool,
    pub frame_header_offset: u32,
    pub tile_offsets: Vec<u32>,
    pub tile_sizes: Vec<u32>,
}

#[derive(Debug, Clone)]
pub enum CodecPictureInfo {
    H264 {
        std: vk::native::StdVideoDecodeH264PictureInfo,
        slice_offsets: Vec<u32>,
    },
    H265 {
        std: vk::native::StdVideoDecodeH265PictureInfo,
        slice_segment_offsets: Vec<u32>,
    },
    Av1(Av1PictureInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitstreamRange {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySlot {
    pub pool: vk::QueryPool,
    pub index: u32,
}

/// Copies the decoded picture into a host-visible linear image after
/// decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearCopy {
    pub src: PictureResource,
    pub dst: PictureResource,
    pub extent: vk::Extent2D,
    pub src_transition: Option<ImageTransition>,
}

/// The color conversion pass, run on the compute queue once decoding is
/// done.
#[derive(Debug, Clone)]
pub struct FilterPass {
    pub filter: FilterHandle,
    pub slot: u32,
    pub input: PictureResource,
    pub output: PictureResource,
    pub extent: vk::Extent2D,
    pub barriers: Vec<ImageTransition>,
    pub waits: Vec<SemaphoreOp>,
    pub signals: Vec<SemaphoreOp>,
    pub fence: vk::Fence,
}

/// Everything needed to record and submit one decode.
#[derive(Debug, Clone)]
pub struct DecodeSubmission {
    pub queue_index: u32,
    pub command_buffer: vk::CommandBuffer,
    pub session: vk::VideoSessionKHR,
    /// Null if the codec has no parameter objects.
    pub session_parameters: vk::VideoSessionParametersKHR,
    /// Reset the session before decoding. Required for the first decode after
    /// the session is created.
    pub reset: bool,
    pub bitstream: BitstreamRange,
    pub coded_extent: vk::Extent2D,
    pub setup: Option<ReferenceSlot>,
    pub output: PictureResource,
    pub references: Vec<ReferenceSlot>,
    pub barriers: Vec<ImageTransition>,
    pub picture: CodecPictureInfo,
    pub query: Option<QuerySlot>,
    pub linear_copy: Option<LinearCopy>,
    pub waits: Vec<SemaphoreOp>,
    pub signals: Vec<SemaphoreOp>,
    /// Null if the filter pass signals the fence instead.
    pub fence: vk::Fence,
    pub filter: Option<FilterPass>,
}
