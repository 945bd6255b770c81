// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::ffi::c_void;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ash::vk;
use ash::vk::Handle as _;
use hashbrown::HashMap;
use tracing::{debug, error, instrument, trace};

use super::filter::ConvertFilter;
use super::*;
use crate::capabilities::{DecodeCapabilities, VideoCapabilities, VideoProfile};
use crate::codec::VideoCodec;
use crate::decoder::{
    CodecPictureInfo, CodecReferenceInfo, DecodeSubmission, ImageTransition, LinearCopy,
    PictureResource, ReferenceSlot,
};
use crate::device::{
    DecodeDevice, DeviceBuffer, DeviceImage, FilterDesc, FilterHandle, ImageDesc, ImageViewDesc,
};
use crate::error::{DecodeError, Result};
use crate::format::plane_layouts;
use crate::parameters::{StdParameterSet, MAX_PPS_IDS, MAX_SPS_IDS, MAX_VPS_IDS};
use crate::parameters::ParameterSet;
use crate::session::SessionParams;

vk_chain! {
    pub struct H264DecodeProfile<'a> {
        pub profile_info: vk::VideoProfileInfoKHR<'a>,
        pub usage_info: vk::VideoDecodeUsageInfoKHR<'a>,
        pub h264_profile: vk::VideoDecodeH264ProfileInfoKHR<'a>,
    }
}

vk_chain! {
    pub struct H265DecodeProfile<'a> {
        pub profile_info: vk::VideoProfileInfoKHR<'a>,
        pub usage_info: vk::VideoDecodeUsageInfoKHR<'a>,
        pub h265_profile: vk::VideoDecodeH265ProfileInfoKHR<'a>,
    }
}

vk_chain! {
    pub struct H264DecodeCapabilities<'a> {
        pub video_caps: vk::VideoCapabilitiesKHR<'a>,
        pub decode_caps: vk::VideoDecodeCapabilitiesKHR<'a>,
        pub h264_caps: vk::VideoDecodeH264CapabilitiesKHR<'a>,
    }
}

vk_chain! {
    pub struct H265DecodeCapabilities<'a> {
        pub video_caps: vk::VideoCapabilitiesKHR<'a>,
        pub decode_caps: vk::VideoDecodeCapabilitiesKHR<'a>,
        pub h265_caps: vk::VideoDecodeH265CapabilitiesKHR<'a>,
    }
}

/// A pinned profile chain for one of the codecs this device can decode.
enum DecodeProfile {
    H264(H264DecodeProfile),
    H265(H265DecodeProfile),
}

impl DecodeProfile {
    fn new(profile: &VideoProfile) -> Result<Self> {
        let profile_info = vk::VideoProfileInfoKHR::default()
            .video_codec_operation(profile.codec.decode_operation())
            .chroma_subsampling(profile.chroma_subsampling.as_vk())
            .luma_bit_depth(profile.luma_bit_depth.as_vk())
            .chroma_bit_depth(profile.chroma_bit_depth.as_vk());

        match profile.codec {
            VideoCodec::H264 => {
                let picture_layout = if profile.progressive {
                    vk::VideoDecodeH264PictureLayoutFlagsKHR::PROGRESSIVE
                } else {
                    vk::VideoDecodeH264PictureLayoutFlagsKHR::INTERLACED_INTERLEAVED_LINES
                };

                Ok(Self::H264(H264DecodeProfile::new(
                    profile_info,
                    vk::VideoDecodeUsageInfoKHR::default(),
                    vk::VideoDecodeH264ProfileInfoKHR::default()
                        .std_profile_idc(profile.codec_profile as _)
                        .picture_layout(picture_layout),
                )))
            }
            VideoCodec::H265 => Ok(Self::H265(H265DecodeProfile::new(
                profile_info,
                vk::VideoDecodeUsageInfoKHR::default(),
                vk::VideoDecodeH265ProfileInfoKHR::default()
                    .std_profile_idc(profile.codec_profile as _),
            ))),
            // The std structures aren't available in our ash revision.
            VideoCodec::Av1 => Err(DecodeError::UnsupportedCodec(VideoCodec::Av1)),
        }
    }

    fn info(&self) -> &vk::VideoProfileInfoKHR<'static> {
        match self {
            Self::H264(p) => p.as_ref(),
            Self::H265(p) => p.as_ref(),
        }
    }
}

fn convert_capabilities(caps: &vk::VideoCapabilitiesKHR) -> VideoCapabilities {
    VideoCapabilities {
        flags: caps.flags,
        min_bitstream_buffer_offset_alignment: caps.min_bitstream_buffer_offset_alignment,
        min_bitstream_buffer_size_alignment: caps.min_bitstream_buffer_size_alignment,
        picture_access_granularity: caps.picture_access_granularity,
        min_coded_extent: caps.min_coded_extent,
        max_coded_extent: caps.max_coded_extent,
        max_dpb_slots: caps.max_dpb_slots,
        max_active_reference_pictures: caps.max_active_reference_pictures,
        std_header_version: caps.std_header_version,
    }
}

/// Profile errors mean the device can't decode the stream at all.
fn profile_error(profile: &VideoProfile, res: vk::Result) -> DecodeError {
    match res {
        vk::Result::ERROR_VIDEO_PROFILE_OPERATION_NOT_SUPPORTED_KHR
        | vk::Result::ERROR_VIDEO_PROFILE_FORMAT_NOT_SUPPORTED_KHR
        | vk::Result::ERROR_VIDEO_PICTURE_LAYOUT_NOT_SUPPORTED_KHR
        | vk::Result::ERROR_VIDEO_PROFILE_CODEC_NOT_SUPPORTED_KHR
        | vk::Result::ERROR_VIDEO_STD_VERSION_NOT_SUPPORTED_KHR => {
            DecodeError::UnsupportedCapabilities(format!("{:?}: {}", profile, res))
        }
        res => DecodeError::Vulkan(res),
    }
}

/// The stage and access masks for an image in `layout` on the decode queue.
/// Layouts owned by other queues are ordered by semaphore waits at the
/// decode stage.
fn decode_masks(layout: vk::ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::VIDEO_DECODE_DPB_KHR => (
            vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
            vk::AccessFlags2::VIDEO_DECODE_READ_KHR | vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR,
        ),
        vk::ImageLayout::VIDEO_DECODE_DST_KHR => (
            vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
            vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        _ => (
            vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
            vk::AccessFlags2::NONE,
        ),
    }
}

pub(super) fn image_barrier(
    transition: &ImageTransition,
    (src_stage, src_access): (vk::PipelineStageFlags2, vk::AccessFlags2),
    (dst_stage, dst_access): (vk::PipelineStageFlags2, vk::AccessFlags2),
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(transition.old_layout)
        .new_layout(transition.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(transition.image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: transition.array_layer,
            layer_count: 1,
        })
}

fn decode_barrier(transition: &ImageTransition) -> vk::ImageMemoryBarrier2<'static> {
    let (src_stage, src_access) = decode_masks(transition.old_layout);
    let src_access = if transition.old_layout == vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
        // Nothing to flush after a read.
        vk::AccessFlags2::NONE
    } else {
        src_access
    };

    image_barrier(
        transition,
        (src_stage, src_access),
        decode_masks(transition.new_layout),
    )
}

fn picture_resource_info(
    picture: &PictureResource,
    coded_extent: vk::Extent2D,
) -> vk::VideoPictureResourceInfoKHR<'static> {
    vk::VideoPictureResourceInfoKHR::default()
        .coded_offset(vk::Offset2D { x: 0, y: 0 })
        .coded_extent(coded_extent)
        .base_array_layer(picture.view_layer)
        .image_view_binding(picture.view)
}

fn is_multiplanar(format: vk::Format) -> bool {
    plane_layouts(format).len() > 1
}

struct ImageState {
    memory: vk::DeviceMemory,
    desc: ImageDesc,
    host_coherent: bool,
    extended_usage: bool,
}

#[derive(Default)]
struct State {
    session_memory: HashMap<u64, Vec<vk::DeviceMemory>>,
    images: HashMap<u64, ImageState>,
    filters: HashMap<u64, ConvertFilter>,
    next_filter_id: u64,
}

/// A decode device backed by a vulkan context.
pub struct VkDecodeDevice {
    state: Mutex<State>,
    /// Guards the command pools and queues, which vulkan requires to be
    /// externally synchronized.
    submit_lock: Mutex<()>,
    vk: Arc<VkContext>,
}

impl VkDecodeDevice {
    pub fn new(vk: Arc<VkContext>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            submit_lock: Mutex::new(()),
            vk,
        }
    }

    pub fn context(&self) -> &Arc<VkContext> {
        &self.vk
    }

    fn bind_session_memory(&self, session: vk::VideoSessionKHR) -> Result<Vec<vk::DeviceMemory>> {
        let device = &self.vk.device;
        let reqs = unsafe {
            self.vk
                .video
                .session_memory_requirements(session)?
        };

        // Frees everything allocated so far if binding fails.
        let mut session_memory = scopeguard::guard(Vec::new(), |memory| unsafe {
            for m in memory {
                device.free_memory(m, None);
            }
        });

        let mut binds = Vec::new();
        for req in reqs.into_iter() {
            let props = &self.vk.device_info.memory_props;
            let bits = Some(req.memory_requirements.memory_type_bits);
            let mem_type_idx =
                select_memory_type(props, vk::MemoryPropertyFlags::DEVICE_LOCAL, bits)
                    .or_else(|| select_memory_type(props, vk::MemoryPropertyFlags::empty(), bits))
                    .ok_or_else(|| {
                        DecodeError::UnsupportedCapabilities(
                            "no suitable memory type for video session".to_string(),
                        )
                    })?;

            let alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(req.memory_requirements.size)
                .memory_type_index(mem_type_idx);

            let memory = unsafe { device.allocate_memory(&alloc_info, None)? };
            session_memory.push(memory);

            binds.push(
                vk::BindVideoSessionMemoryInfoKHR::default()
                    .memory_bind_index(req.memory_bind_index)
                    .memory(memory)
                    .memory_offset(0)
                    .memory_size(req.memory_requirements.size),
            );
        }

        unsafe {
            self.vk
                .video
                .bind_session_memory(session, &binds)?;
        }

        Ok(scopeguard::ScopeGuard::into_inner(session_memory))
    }

    fn allocate_memory(
        &self,
        reqs: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<(vk::DeviceMemory, vk::MemoryPropertyFlags)> {
        let props = &self.vk.device_info.memory_props;
        let index = select_memory_type_relaxed(props, flags, reqs.memory_type_bits)
            .ok_or_else(|| {
                DecodeError::UnsupportedCapabilities(format!(
                    "no memory type with {:?} for requirements {:?}",
                    flags, reqs
                ))
            })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(reqs.size)
            .memory_type_index(index);

        let memory = unsafe { self.vk.device.allocate_memory(&alloc_info, None)? };
        Ok((memory, props.memory_types[index as usize].property_flags))
    }

    fn create_parameters(
        &self,
        session: vk::VideoSessionKHR,
        template: vk::VideoSessionParametersKHR,
        codec_info: &mut impl vk::ExtendsVideoSessionParametersCreateInfoKHR,
    ) -> Result<vk::VideoSessionParametersKHR> {
        let create_info = vk::VideoSessionParametersCreateInfoKHR::default()
            .video_session(session)
            .video_session_parameters_template(template)
            .push_next(codec_info);

        let parameters = unsafe {
            self.vk
                .video
                .create_parameters(&create_info)?
        };

        Ok(parameters)
    }

    fn create_h264_parameters(
        &self,
        session: vk::VideoSessionKHR,
        template: vk::VideoSessionParametersKHR,
        add_info: &vk::VideoDecodeH264SessionParametersAddInfoKHR,
    ) -> Result<vk::VideoSessionParametersKHR> {
        let mut codec_info = vk::VideoDecodeH264SessionParametersCreateInfoKHR::default()
            .max_std_sps_count(MAX_SPS_IDS)
            .max_std_pps_count(MAX_PPS_IDS)
            .parameters_add_info(add_info);

        self.create_parameters(session, template, &mut codec_info)
    }

    fn create_h265_parameters(
        &self,
        session: vk::VideoSessionKHR,
        template: vk::VideoSessionParametersKHR,
        add_info: &vk::VideoDecodeH265SessionParametersAddInfoKHR,
    ) -> Result<vk::VideoSessionParametersKHR> {
        let mut codec_info = vk::VideoDecodeH265SessionParametersCreateInfoKHR::default()
            .max_std_vps_count(MAX_VPS_IDS)
            .max_std_sps_count(MAX_SPS_IDS)
            .max_std_pps_count(MAX_PPS_IDS)
            .parameters_add_info(add_info);

        self.create_parameters(session, template, &mut codec_info)
    }

    fn update_parameters(
        &self,
        parameters: vk::VideoSessionParametersKHR,
        update_sequence_count: u32,
        add_info: &mut impl vk::ExtendsVideoSessionParametersUpdateInfoKHR,
    ) -> Result<()> {
        let update_info = vk::VideoSessionParametersUpdateInfoKHR::default()
            .update_sequence_count(update_sequence_count)
            .push_next(add_info);

        unsafe {
            self.vk
                .video
                .update_parameters(parameters, &update_info)?;
        }

        Ok(())
    }

    /// Records the decode into the submission's command buffer. The submit
    /// lock must be held.
    unsafe fn record_decode(&self, submission: &DecodeSubmission) -> Result<()> {
        let device = &self.vk.device;
        let cb = submission.command_buffer;
        let coded_extent = submission.coded_extent;

        begin_cb(device, cb)?;

        if let Some(query) = &submission.query {
            device.cmd_reset_query_pool(cb, query.pool, query.index, 1);
        }

        // Layout transitions, plus an execution and memory dependency on
        // earlier decodes for every reference.
        let mut barriers = submission
            .barriers
            .iter()
            .map(decode_barrier)
            .collect::<Vec<_>>();

        for reference in &submission.references {
            let transition = ImageTransition {
                image: reference.picture.image,
                array_layer: reference.picture.array_layer,
                old_layout: vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
                new_layout: vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
            };

            if !barriers.iter().any(|b| {
                b.image == transition.image
                    && b.subresource_range.base_array_layer == transition.array_layer
            }) {
                barriers.push(image_barrier(
                    &transition,
                    (
                        vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
                        vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR,
                    ),
                    (
                        vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
                        vk::AccessFlags2::VIDEO_DECODE_READ_KHR,
                    ),
                ));
            }
        }

        if !barriers.is_empty() {
            device.cmd_pipeline_barrier2(
                cb,
                &vk::DependencyInfo::default().image_memory_barriers(&barriers),
            );
        }

        // The setup slot comes first, followed by the references.
        let slots = submission
            .setup
            .iter()
            .chain(submission.references.iter())
            .collect::<Vec<&ReferenceSlot>>();

        let resources = slots
            .iter()
            .map(|slot| picture_resource_info(&slot.picture, coded_extent))
            .collect::<Vec<_>>();

        let mut h264_refs = Vec::new();
        let mut h265_refs = Vec::new();
        for slot in &slots {
            match slot.codec {
                CodecReferenceInfo::H264(std) => h264_refs.push(std),
                CodecReferenceInfo::H265(std) => h265_refs.push(std),
                CodecReferenceInfo::Av1 { .. } => {
                    return Err(DecodeError::UnsupportedCodec(VideoCodec::Av1))
                }
            }
        }

        let h264_dpb_infos = h264_refs
            .iter()
            .map(|std| vk::VideoDecodeH264DpbSlotInfoKHR::default().std_reference_info(std))
            .collect::<Vec<_>>();
        let h265_dpb_infos = h265_refs
            .iter()
            .map(|std| vk::VideoDecodeH265DpbSlotInfoKHR::default().std_reference_info(std))
            .collect::<Vec<_>>();

        let mut next_h264 = 0;
        let mut next_h265 = 0;
        let slot_infos = slots
            .iter()
            .zip(resources.iter())
            .map(|(slot, resource)| {
                let p_next: *const c_void = match slot.codec {
                    CodecReferenceInfo::H264(_) => {
                        next_h264 += 1;
                        <*const _>::cast(&h264_dpb_infos[next_h264 - 1])
                    }
                    _ => {
                        next_h265 += 1;
                        <*const _>::cast(&h265_dpb_infos[next_h265 - 1])
                    }
                };

                let mut info = vk::VideoReferenceSlotInfoKHR::default()
                    .slot_index(slot.slot_index)
                    .picture_resource(resource);
                info.p_next = p_next;
                info
            })
            .collect::<Vec<_>>();

        let (setup_info, reference_infos) = if submission.setup.is_some() {
            (slot_infos.first(), &slot_infos[1..])
        } else {
            (None, &slot_infos[..])
        };

        // Bind the session. The setup picture is bound without being active.
        {
            let bound = slots
                .iter()
                .zip(resources.iter())
                .enumerate()
                .map(|(i, (slot, resource))| {
                    let slot_index = if i == 0 && submission.setup.is_some() {
                        -1
                    } else {
                        slot.slot_index
                    };

                    vk::VideoReferenceSlotInfoKHR::default()
                        .slot_index(slot_index)
                        .picture_resource(resource)
                })
                .collect::<Vec<_>>();

            let begin_info = vk::VideoBeginCodingInfoKHR::default()
                .video_session(submission.session)
                .video_session_parameters(submission.session_parameters)
                .reference_slots(&bound);

            self.vk.video.cmd_begin_coding(cb, &begin_info);
        }

        if submission.reset {
            let ctrl_info = vk::VideoCodingControlInfoKHR::default()
                .flags(vk::VideoCodingControlFlagsKHR::RESET);
            self.vk.video.cmd_control_coding(cb, &ctrl_info);
        }

        if let Some(query) = &submission.query {
            device.cmd_begin_query(cb, query.pool, query.index, vk::QueryControlFlags::empty());
        }

        {
            let mut decode_info = vk::VideoDecodeInfoKHR::default()
                .src_buffer(submission.bitstream.buffer)
                .src_buffer_offset(submission.bitstream.offset)
                .src_buffer_range(submission.bitstream.size)
                .dst_picture_resource(picture_resource_info(&submission.output, coded_extent))
                .reference_slots(reference_infos);

            if let Some(setup) = setup_info {
                decode_info = decode_info.setup_reference_slot(setup);
            }

            match &submission.picture {
                CodecPictureInfo::H264 { std, slice_offsets } => {
                    let mut h264_info = vk::VideoDecodeH264PictureInfoKHR::default()
                        .std_picture_info(std)
                        .slice_offsets(slice_offsets);

                    self.vk
                        .video
                        .cmd_decode(cb, &decode_info.push_next(&mut h264_info));
                }
                CodecPictureInfo::H265 {
                    std,
                    slice_segment_offsets,
                } => {
                    let mut h265_info = vk::VideoDecodeH265PictureInfoKHR::default()
                        .std_picture_info(std)
                        .slice_segment_offsets(slice_segment_offsets);

                    self.vk
                        .video
                        .cmd_decode(cb, &decode_info.push_next(&mut h265_info));
                }
                CodecPictureInfo::Av1(_) => {
                    return Err(DecodeError::UnsupportedCodec(VideoCodec::Av1));
                }
            }
        }

        if let Some(query) = &submission.query {
            device.cmd_end_query(cb, query.pool, query.index);
        }

        self.vk.video.cmd_end_coding(cb);

        if let Some(copy) = &submission.linear_copy {
            self.cmd_linear_copy(cb, copy);
        }

        cmd_host_read_barrier(device, cb);
        device.end_command_buffer(cb)?;
        Ok(())
    }

    unsafe fn cmd_linear_copy(&self, cb: vk::CommandBuffer, copy: &LinearCopy) {
        let device = &self.vk.device;

        if let Some(transition) = &copy.src_transition {
            let barriers = [decode_barrier(transition)];
            device.cmd_pipeline_barrier2(
                cb,
                &vk::DependencyInfo::default().image_memory_barriers(&barriers),
            );
        }

        let regions = plane_layouts(copy.src.format)
            .into_iter()
            .map(|plane| {
                let subresource = |layer| vk::ImageSubresourceLayers {
                    aspect_mask: plane.aspect,
                    mip_level: 0,
                    base_array_layer: layer,
                    layer_count: 1,
                };

                let w = (copy.extent.width + (1 << plane.width_shift) - 1) >> plane.width_shift;
                let h = (copy.extent.height + (1 << plane.height_shift) - 1) >> plane.height_shift;

                vk::ImageCopy::default()
                    .src_subresource(subresource(copy.src.array_layer))
                    .dst_subresource(subresource(copy.dst.array_layer))
                    .extent(vk::Extent3D {
                        width: w,
                        height: h,
                        depth: 1,
                    })
            })
            .collect::<Vec<_>>();

        device.cmd_copy_image(
            cb,
            copy.src.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            copy.dst.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &regions,
        );
    }
}

impl DecodeDevice for VkDecodeDevice {
    fn decode_queue_family(&self) -> u32 {
        self.vk.decode_queue.family
    }

    fn decode_queue_count(&self) -> u32 {
        self.vk.decode_queue.queues.len() as u32
    }

    fn compute_queue_family(&self) -> Option<u32> {
        self.vk.compute_queue.as_ref().map(|q| q.family)
    }

    fn decode_operations(&self) -> vk::VideoCodecOperationFlagsKHR {
        self.vk.device_info.decode_operations
    }

    fn supports_query_result_status(&self) -> bool {
        self.vk.device_info.supports_query_result_status
    }

    fn video_capabilities(
        &self,
        profile: &VideoProfile,
    ) -> Result<(VideoCapabilities, DecodeCapabilities)> {
        let pdevice = self.vk.device_info.pdevice;
        let fns = &self.vk.video;

        match DecodeProfile::new(profile)? {
            DecodeProfile::H264(chain) => {
                let mut caps = H264DecodeCapabilities::default();
                unsafe {
                    fns.capabilities(pdevice, chain.as_ref(), caps.as_mut())
                        .map_err(|e| profile_error(profile, e))?;
                }

                trace!("video capabilities: {:#?}", caps.video_caps);
                trace!("h264 capabilities: {:#?}", caps.h264_caps);

                Ok((
                    convert_capabilities(&caps.video_caps),
                    DecodeCapabilities {
                        flags: caps.decode_caps.flags,
                    },
                ))
            }
            DecodeProfile::H265(chain) => {
                let mut caps = H265DecodeCapabilities::default();
                unsafe {
                    fns.capabilities(pdevice, chain.as_ref(), caps.as_mut())
                        .map_err(|e| profile_error(profile, e))?;
                }

                trace!("video capabilities: {:#?}", caps.video_caps);
                trace!("h265 capabilities: {:#?}", caps.h265_caps);

                Ok((
                    convert_capabilities(&caps.video_caps),
                    DecodeCapabilities {
                        flags: caps.decode_caps.flags,
                    },
                ))
            }
        }
    }

    fn video_formats(
        &self,
        profile: &VideoProfile,
        usage: vk::ImageUsageFlags,
    ) -> Result<Vec<vk::Format>> {
        let chain = DecodeProfile::new(profile)?;
        let mut profile_list_info = single_profile_list_info(chain.info());
        let format_info = vk::PhysicalDeviceVideoFormatInfoKHR::default()
            .image_usage(usage)
            .push_next(&mut profile_list_info);

        let props = unsafe {
            self.vk
                .video
                .format_properties(
                    self.vk.device_info.pdevice,
                    &format_info,
                )
                .map_err(|e| profile_error(profile, e))?
        };

        // The same format can be listed once per supported tiling.
        let mut formats = Vec::new();
        for prop in props {
            if !formats.contains(&prop.format) {
                formats.push(prop.format);
            }
        }

        Ok(formats)
    }

    fn create_video_session(&self, params: &SessionParams) -> Result<vk::VideoSessionKHR> {
        let chain = DecodeProfile::new(&params.profile)?;

        let create_info = vk::VideoSessionCreateInfoKHR::default()
            .queue_family_index(params.queue_family)
            .flags(params.flags)
            .video_profile(chain.info())
            .picture_format(params.picture_format)
            .reference_picture_format(params.reference_format)
            .max_coded_extent(params.max_coded_extent)
            .max_dpb_slots(params.max_dpb_slots)
            .max_active_reference_pictures(params.max_active_reference_pictures)
            .std_header_version(&params.std_header_version);

        let session = unsafe {
            self.vk
                .video
                .create_session(&create_info)?
        };

        let session = scopeguard::guard(session, |session| unsafe {
            self.vk.video.destroy_session(session);
        });

        let memory = self.bind_session_memory(*session)?;
        let session = scopeguard::ScopeGuard::into_inner(session);

        debug!(
            session = session.as_raw(),
            allocations = memory.len(),
            "bound video session memory"
        );

        self.state
            .lock()
            .unwrap()
            .session_memory
            .insert(session.as_raw(), memory);
        Ok(session)
    }

    fn destroy_video_session(&self, session: vk::VideoSessionKHR) {
        let memory = self
            .state
            .lock()
            .unwrap()
            .session_memory
            .remove(&session.as_raw())
            .unwrap_or_default();

        unsafe {
            self.vk.video.destroy_session(session);
            for m in memory {
                self.vk.device.free_memory(m, None);
            }
        }
    }

    fn create_session_parameters(
        &self,
        session: vk::VideoSessionKHR,
        template: vk::VideoSessionParametersKHR,
        set: &ParameterSet,
    ) -> Result<vk::VideoSessionParametersKHR> {
        match set.std() {
            StdParameterSet::H264Sps(sps) => {
                let sps = [*sps];
                let add_info =
                    vk::VideoDecodeH264SessionParametersAddInfoKHR::default().std_sp_ss(&sps);
                self.create_h264_parameters(session, template, &add_info)
            }
            StdParameterSet::H264Pps(pps) => {
                let pps = [*pps];
                let add_info =
                    vk::VideoDecodeH264SessionParametersAddInfoKHR::default().std_pp_ss(&pps);
                self.create_h264_parameters(session, template, &add_info)
            }
            StdParameterSet::H265Vps(vps) => {
                let vps = [*vps];
                let add_info =
                    vk::VideoDecodeH265SessionParametersAddInfoKHR::default().std_vp_ss(&vps);
                self.create_h265_parameters(session, template, &add_info)
            }
            StdParameterSet::H265Sps(sps) => {
                let sps = [*sps];
                let add_info =
                    vk::VideoDecodeH265SessionParametersAddInfoKHR::default().std_sp_ss(&sps);
                self.create_h265_parameters(session, template, &add_info)
            }
            StdParameterSet::H265Pps(pps) => {
                let pps = [*pps];
                let add_info =
                    vk::VideoDecodeH265SessionParametersAddInfoKHR::default().std_pp_ss(&pps);
                self.create_h265_parameters(session, template, &add_info)
            }
            StdParameterSet::Av1Sequence { .. } => {
                Err(DecodeError::UnsupportedCodec(VideoCodec::Av1))
            }
        }
    }

    fn update_session_parameters(
        &self,
        parameters: vk::VideoSessionParametersKHR,
        set: &ParameterSet,
        update_sequence_count: u32,
    ) -> Result<()> {
        let count = update_sequence_count;
        match set.std() {
            StdParameterSet::H264Sps(sps) => {
                let sps = [*sps];
                let mut add_info =
                    vk::VideoDecodeH264SessionParametersAddInfoKHR::default().std_sp_ss(&sps);
                self.update_parameters(parameters, count, &mut add_info)
            }
            StdParameterSet::H264Pps(pps) => {
                let pps = [*pps];
                let mut add_info =
                    vk::VideoDecodeH264SessionParametersAddInfoKHR::default().std_pp_ss(&pps);
                self.update_parameters(parameters, count, &mut add_info)
            }
            StdParameterSet::H265Vps(vps) => {
                let vps = [*vps];
                let mut add_info =
                    vk::VideoDecodeH265SessionParametersAddInfoKHR::default().std_vp_ss(&vps);
                self.update_parameters(parameters, count, &mut add_info)
            }
            StdParameterSet::H265Sps(sps) => {
                let sps = [*sps];
                let mut add_info =
                    vk::VideoDecodeH265SessionParametersAddInfoKHR::default().std_sp_ss(&sps);
                self.update_parameters(parameters, count, &mut add_info)
            }
            StdParameterSet::H265Pps(pps) => {
                let pps = [*pps];
                let mut add_info =
                    vk::VideoDecodeH265SessionParametersAddInfoKHR::default().std_pp_ss(&pps);
                self.update_parameters(parameters, count, &mut add_info)
            }
            StdParameterSet::Av1Sequence { .. } => {
                Err(DecodeError::UnsupportedCodec(VideoCodec::Av1))
            }
        }
    }

    fn destroy_session_parameters(&self, parameters: vk::VideoSessionParametersKHR) {
        unsafe {
            self.vk.video.destroy_parameters(parameters);
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<DeviceImage> {
        let video_usage = vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR
            | vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR
            | vk::ImageUsageFlags::VIDEO_DECODE_SRC_KHR;

        let chain = if desc.usage.intersects(video_usage) {
            Some(DecodeProfile::new(&desc.profile)?)
        } else {
            None
        };

        // Storage access to a multiplanar image is through per-plane views.
        let extended_usage =
            desc.usage.contains(vk::ImageUsageFlags::STORAGE) && is_multiplanar(desc.format);

        let image = {
            let mut create_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(desc.format)
                .extent(vk::Extent3D {
                    width: desc.extent.width,
                    height: desc.extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(desc.array_layers)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(desc.tiling)
                .usage(desc.usage)
                .initial_layout(vk::ImageLayout::UNDEFINED);

            if extended_usage {
                create_info = create_info.flags(
                    vk::ImageCreateFlags::MUTABLE_FORMAT | vk::ImageCreateFlags::EXTENDED_USAGE,
                );
            }

            if desc.queue_families.len() > 1 {
                create_info = create_info
                    .sharing_mode(vk::SharingMode::CONCURRENT)
                    .queue_family_indices(&desc.queue_families);
            } else {
                create_info = create_info.sharing_mode(vk::SharingMode::EXCLUSIVE);
            }

            let mut profile_list_info;
            if let Some(chain) = &chain {
                profile_list_info = single_profile_list_info(chain.info());
                create_info = create_info.push_next(&mut profile_list_info);
            }

            unsafe { self.vk.device.create_image(&create_info, None)? }
        };

        let image = scopeguard::guard(image, |image| unsafe {
            self.vk.device.destroy_image(image, None);
        });

        let reqs = unsafe { self.vk.device.get_image_memory_requirements(*image) };
        let (memory, memory_flags) = self.allocate_memory(reqs, desc.memory_flags)?;
        let memory = scopeguard::guard(memory, |memory| unsafe {
            self.vk.device.free_memory(memory, None);
        });

        unsafe { self.vk.device.bind_image_memory(*image, *memory, 0)? };

        let image = scopeguard::ScopeGuard::into_inner(image);
        let memory = scopeguard::ScopeGuard::into_inner(memory);

        trace!(
            image = image.as_raw(),
            format = ?desc.format,
            extent = ?desc.extent,
            layers = desc.array_layers,
            usage = ?desc.usage,
            "created image"
        );

        self.state.lock().unwrap().images.insert(
            image.as_raw(),
            ImageState {
                memory,
                desc: desc.clone(),
                host_coherent: memory_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
                extended_usage,
            },
        );

        Ok(DeviceImage { image, memory })
    }

    fn create_image_view(&self, image: vk::Image, desc: &ImageViewDesc) -> Result<vk::ImageView> {
        let (usage, extended_usage) = match self.state.lock().unwrap().images.get(&image.as_raw()) {
            Some(state) => (state.desc.usage, state.extended_usage),
            None => return Err(DecodeError::Vulkan(vk::Result::ERROR_UNKNOWN)),
        };

        let view_type = if desc.layer_count > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };

        let mut create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: desc.base_array_layer,
                layer_count: desc.layer_count,
            });

        // A view of the whole multiplanar format can't be used for storage.
        let mut usage_info = vk::ImageViewUsageCreateInfo::default()
            .usage(usage & !(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED));
        if extended_usage {
            create_info = create_info.push_next(&mut usage_info);
        }

        let view = unsafe { self.vk.device.create_image_view(&create_info, None)? };
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.vk.device.destroy_image_view(view, None) };
    }

    fn destroy_image(&self, image: DeviceImage) {
        self.state
            .lock()
            .unwrap()
            .images
            .remove(&image.image.as_raw());

        unsafe {
            self.vk.device.destroy_image(image.image, None);
            self.vk.device.free_memory(image.memory, None);
        }
    }

    fn create_bitstream_buffer(&self, profile: &VideoProfile, size: u64) -> Result<DeviceBuffer> {
        let chain = DecodeProfile::new(profile)?;
        let mut profile_list_info = single_profile_list_info(chain.info());

        let buffer = {
            let create_info = vk::BufferCreateInfo::default()
                .size(size)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .usage(vk::BufferUsageFlags::VIDEO_DECODE_SRC_KHR)
                .push_next(&mut profile_list_info);

            unsafe { self.vk.device.create_buffer(&create_info, None)? }
        };

        let buffer = scopeguard::guard(buffer, |buffer| unsafe {
            self.vk.device.destroy_buffer(buffer, None);
        });

        // Writes go straight through the mapping, so the memory has to be
        // coherent.
        let reqs = unsafe { self.vk.device.get_buffer_memory_requirements(*buffer) };
        let index = select_memory_type(
            &self.vk.device_info.memory_props,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            Some(reqs.memory_type_bits),
        )
        .ok_or_else(|| {
            DecodeError::UnsupportedCapabilities(
                "no coherent host memory for bitstream buffers".to_string(),
            )
        })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(reqs.size)
            .memory_type_index(index);
        let memory = unsafe { self.vk.device.allocate_memory(&alloc_info, None)? };
        let memory = scopeguard::guard(memory, |memory| unsafe {
            self.vk.device.free_memory(memory, None);
        });

        unsafe { self.vk.device.bind_buffer_memory(*buffer, *memory, 0)? };

        Ok(DeviceBuffer {
            buffer: scopeguard::ScopeGuard::into_inner(buffer),
            memory: scopeguard::ScopeGuard::into_inner(memory),
            size,
        })
    }

    fn write_buffer(&self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        if offset + len > buffer.size {
            return Err(DecodeError::BitstreamOverflow {
                offset,
                len,
                size: buffer.size,
            });
        }

        if data.is_empty() {
            return Ok(());
        }

        unsafe {
            let ptr = self.vk.device.map_memory(
                buffer.memory,
                offset,
                len,
                vk::MemoryMapFlags::empty(),
            )?;

            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
            self.vk.device.unmap_memory(buffer.memory);
        }

        Ok(())
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        unsafe {
            self.vk.device.destroy_buffer(buffer.buffer, None);
            self.vk.device.free_memory(buffer.memory, None);
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        Ok(create_fence(&self.vk.device, signaled)?)
    }

    #[instrument(level = "trace", skip_all)]
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<bool> {
        let res = unsafe {
            self.vk
                .device
                .wait_for_fences(&[fence], true, timeout.as_nanos() as u64)
        };

        match res {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.vk.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.vk.device.get_fence_status(fence)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.vk.device.destroy_fence(fence, None) };
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore> {
        Ok(create_timeline_semaphore(&self.vk.device, initial_value)?)
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        Ok(unsafe { self.vk.device.get_semaphore_counter_value(semaphore)? })
    }

    #[instrument(level = "trace", skip_all)]
    fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout: Duration,
    ) -> Result<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        let res = unsafe {
            self.vk
                .device
                .wait_semaphores(&wait_info, timeout.as_nanos() as u64)
        };

        match res {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(semaphore)
            .value(value);

        unsafe { self.vk.device.signal_semaphore(&signal_info)? };
        Ok(())
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.vk.device.destroy_semaphore(semaphore, None) };
    }

    fn create_query_pool(&self, profile: &VideoProfile, count: u32) -> Result<vk::QueryPool> {
        let chain = DecodeProfile::new(profile)?;

        let mut create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::RESULT_STATUS_ONLY_KHR)
            .query_count(count);
        create_info.p_next = <*const _>::cast(chain.info());

        unsafe {
            let pool = self.vk.device.create_query_pool(&create_info, None)?;
            self.vk.device.reset_query_pool(pool, 0, count);
            Ok(pool)
        }
    }

    fn query_status(
        &self,
        pool: vk::QueryPool,
        query: u32,
    ) -> Result<Option<vk::QueryResultStatusKHR>> {
        let mut results = [0_i32];
        let res = unsafe {
            self.vk.device.get_query_pool_results(
                pool,
                query,
                &mut results,
                vk::QueryResultFlags::WITH_STATUS_KHR,
            )
        };

        match res {
            Ok(()) => Ok(Some(vk::QueryResultStatusKHR::from_raw(results[0]))),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.vk.device.destroy_query_pool(pool, None) };
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let _guard = self.submit_lock.lock().unwrap();
        Ok(allocate_command_buffers(
            &self.vk.device,
            self.vk.decode_queue.command_pool,
            count,
        )?)
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }

        let _guard = self.submit_lock.lock().unwrap();
        unsafe {
            self.vk
                .device
                .free_command_buffers(self.vk.decode_queue.command_pool, command_buffers);
        }
    }

    fn create_filter(&self, desc: &FilterDesc) -> Result<FilterHandle> {
        let filter = {
            let _guard = self.submit_lock.lock().unwrap();
            ConvertFilter::new(self.vk.clone(), *desc)
                .map_err(|e| DecodeError::FilterCreation(format!("{:#}", e)))?
        };

        let mut state = self.state.lock().unwrap();
        state.next_filter_id += 1;
        let id = state.next_filter_id;
        state.filters.insert(id, filter);

        debug!(id, ?desc, "created color conversion filter");
        Ok(FilterHandle(id))
    }

    fn destroy_filter(&self, filter: FilterHandle) {
        let filter = self.state.lock().unwrap().filters.remove(&filter.0);

        // Drop waits for the compute queue, and frees command buffers.
        let _guard = self.submit_lock.lock().unwrap();
        drop(filter);
    }

    fn submit_decode(&self, submission: &DecodeSubmission) -> Result<()> {
        let queue = self
            .vk
            .decode_queue
            .queues
            .get(submission.queue_index as usize)
            .copied()
            .ok_or(DecodeError::Vulkan(vk::Result::ERROR_UNKNOWN))?;

        let mut state = self.state.lock().unwrap();
        let _guard = self.submit_lock.lock().unwrap();

        let filter = match &submission.filter {
            Some(pass) => Some(
                state
                    .filters
                    .get_mut(&pass.filter.0)
                    .ok_or_else(|| DecodeError::FilterCreation("unknown filter".to_string()))?,
            ),
            None => None,
        };

        unsafe {
            self.record_decode(submission)?;

            let cb_infos =
                [vk::CommandBufferSubmitInfo::default().command_buffer(submission.command_buffer)];
            let wait_infos = timeline_submit_infos(&submission.waits);
            let signal_infos = timeline_submit_infos(&submission.signals);

            let submit_info = vk::SubmitInfo2::default()
                .wait_semaphore_infos(&wait_infos)
                .signal_semaphore_infos(&signal_infos)
                .command_buffer_infos(&cb_infos);

            self.vk
                .device
                .queue_submit2(queue, &[submit_info], submission.fence)
                .map_err(DecodeError::Submission)?;
        }

        if let (Some(filter), Some(pass)) = (filter, &submission.filter) {
            filter.submit(pass).map_err(|e| {
                error!(slot = pass.slot, "filter pass failed: {}", e);
                DecodeError::FilterSubmission(match e {
                    DecodeError::Vulkan(res) | DecodeError::Submission(res) => res,
                    _ => vk::Result::ERROR_UNKNOWN,
                })
            })?;
        }

        Ok(())
    }

    fn read_image(
        &self,
        picture: &PictureResource,
        extent: vk::Extent2D,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let (memory, host_coherent) = match self.state.lock().unwrap().images.get(&picture.image.as_raw())
        {
            Some(state) if state.desc.tiling == vk::ImageTiling::LINEAR => {
                (state.memory, state.host_coherent)
            }
            _ => {
                return Err(DecodeError::UnsupportedFormat(
                    "image isn't host readable".to_string(),
                ))
            }
        };

        let planes = plane_layouts(picture.format);
        if planes.is_empty() {
            return Err(DecodeError::UnsupportedFormat(format!(
                "can't read back {:?}",
                picture.format
            )));
        }

        out.clear();

        unsafe {
            let device = &self.vk.device;
            let ptr = device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
                as *const u8;

            // Unmaps even if the invalidate fails.
            let _unmap = scopeguard::guard((), |_| device.unmap_memory(memory));

            if !host_coherent {
                let range = vk::MappedMemoryRange::default()
                    .memory(memory)
                    .offset(0)
                    .size(vk::WHOLE_SIZE);
                device.invalidate_mapped_memory_ranges(&[range])?;
            }

            for plane in planes {
                let layout = device.get_image_subresource_layout(
                    picture.image,
                    vk::ImageSubresource {
                        aspect_mask: plane.aspect,
                        mip_level: 0,
                        array_layer: picture.array_layer,
                    },
                );

                let w = (extent.width + (1 << plane.width_shift) - 1) >> plane.width_shift;
                let h = (extent.height + (1 << plane.height_shift) - 1) >> plane.height_shift;
                let row_len = (w * plane.bytes_per_texel) as usize;

                for y in 0..h as u64 {
                    let row = ptr.add((layout.offset + y * layout.row_pitch) as usize);
                    out.extend_from_slice(std::slice::from_raw_parts(row, row_len));
                }
            }
        }

        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let _guard = self.submit_lock.lock().unwrap();
        unsafe { self.vk.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VkDecodeDevice {
    fn drop(&mut self) {
        let state = std::mem::take(&mut *self.state.lock().unwrap());

        unsafe {
            if let Err(e) = self.vk.device.device_wait_idle() {
                error!("failed to wait for device idle: {}", e);
            }

            for (session, memory) in state.session_memory {
                self.vk
                    .video
                    .destroy_session(vk::VideoSessionKHR::from_raw(session));
                for m in memory {
                    self.vk.device.free_memory(m, None);
                }
            }
        }

        // Filters destroy themselves.
        drop(state.filters);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::{BitDepth, ChromaSubsampling};
    use pretty_assertions::assert_eq;

    fn profile(codec: VideoCodec) -> VideoProfile {
        VideoProfile {
            codec,
            chroma_subsampling: ChromaSubsampling::Yuv420,
            luma_bit_depth: BitDepth::Eight,
            chroma_bit_depth: BitDepth::Eight,
            codec_profile: 100,
            progressive: false,
        }
    }

    #[test]
    fn profile_chain() {
        let chain = DecodeProfile::new(&profile(VideoCodec::H264)).unwrap();
        let info = chain.info();

        assert_eq!(
            info.video_codec_operation,
            vk::VideoCodecOperationFlagsKHR::DECODE_H264
        );
        assert_eq!(
            info.chroma_subsampling,
            vk::VideoChromaSubsamplingFlagsKHR::TYPE_420
        );

        match chain {
            DecodeProfile::H264(ref p) => {
                assert_eq!(p.h264_profile.std_profile_idc, 100);
                assert_eq!(
                    p.h264_profile.picture_layout,
                    vk::VideoDecodeH264PictureLayoutFlagsKHR::INTERLACED_INTERLEAVED_LINES
                );
                assert!(p.h264_profile.p_next.is_null());
            }
            _ => panic!("expected an h264 profile"),
        }

        assert!(matches!(
            DecodeProfile::new(&profile(VideoCodec::Av1)),
            Err(DecodeError::UnsupportedCodec(VideoCodec::Av1))
        ));
    }

    #[test]
    fn barrier_masks() {
        let transition = ImageTransition {
            image: vk::Image::from_raw(7),
            array_layer: 3,
            old_layout: vk::ImageLayout::VIDEO_DECODE_DST_KHR,
            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        };

        let barrier = decode_barrier(&transition);
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::VIDEO_DECODE_KHR);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR);
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::COPY);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::TRANSFER_READ);
        assert_eq!(barrier.subresource_range.base_array_layer, 3);
        assert_eq!(barrier.subresource_range.layer_count, 1);

        // Coming back from a copy only needs an execution dependency.
        let barrier = decode_barrier(&ImageTransition {
            old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            new_layout: vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
            ..transition
        });
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::COPY);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::NONE);
        assert_eq!(
            barrier.dst_access_mask,
            vk::AccessFlags2::VIDEO_DECODE_READ_KHR | vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR
        );
    }

    #[test]
    fn profile_errors() {
        let p = profile(VideoCodec::H265);
        assert!(matches!(
            profile_error(&p, vk::Result::ERROR_VIDEO_PROFILE_CODEC_NOT_SUPPORTED_KHR),
            DecodeError::UnsupportedCapabilities(_)
        ));
        assert!(matches!(
            profile_error(&p, vk::Result::ERROR_DEVICE_LOST),
            DecodeError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        ));
    }
}
