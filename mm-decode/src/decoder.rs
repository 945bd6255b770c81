// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The decoder core. Reacts to sequence and picture callbacks from the
//! parser by configuring the session and image pool, and submitting decode
//! work.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle as _;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::bitstream::{align_up, BitstreamBuffer, BitstreamPool, MIN_BITSTREAM_BUFFER_SIZE};
use crate::capabilities::{
    decode_capabilities, is_codec_supported, supported_video_formats, DecodeCapabilities,
    VideoCapabilities, VideoProfile,
};
use crate::codec::VideoCodec;
use crate::color::{YcbcrModel, YcbcrRange};
use crate::config::{DecoderConfig, FilterFailurePolicy};
use crate::device::{DeviceRef, FilterDesc, FilterHandle};
use crate::error::{DecodeError, Result};
use crate::format::{plane_layouts, VideoFormat};
use crate::frame_buffer::{
    DisplayTargets, FrameBuffer, FrameSync, ImageRoles, ImageSpec, ReferencedObjects, MAX_IMAGES,
};
use crate::parameters::{
    ParameterKind, ParameterSet, ParametersRef, PictureParametersCache,
};
use crate::parser::{DecodeHandler, DecodePictureInfo, PictureParameters};
use crate::session::{SessionParams, VideoSession, MAX_ACTIVE_REFERENCES};

mod load_balance;
mod submission;

pub use load_balance::*;
pub use submission::*;

/// How long to wait for a decode whose filter pass couldn't be submitted.
const UNFILTERED_TIMEOUT: Duration = Duration::from_secs(1);

/// The spec indices used for each role in the current sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolLayout {
    dpb: usize,
    /// Equal to `dpb` if the output coincides with the DPB.
    output: usize,
    filter_out: Option<usize>,
    linear: Option<usize>,
    /// The linear image is filled by a copy after decoding, rather than
    /// being the decode output or filter output itself.
    linear_copy: bool,
}

impl PoolLayout {
    fn targets(&self) -> DisplayTargets {
        DisplayTargets {
            display: self.filter_out.unwrap_or(self.output),
            linear: self.linear,
        }
    }
}

struct Filter {
    handle: FilterHandle,
    desc: FilterDesc,
}

struct LoadBalancing {
    balancer: LoadBalancer,
    semaphore: vk::Semaphore,
}

pub struct VideoDecoder {
    device: DeviceRef,
    config: DecoderConfig,
    frame_buffer: Arc<FrameBuffer>,

    // Parameters objects must be destroyed before the session.
    parameters: PictureParametersCache,
    session: Option<VideoSession>,
    bitstream: BitstreamPool,

    format: Option<VideoFormat>,
    profile: Option<VideoProfile>,
    capabilities: Option<(VideoCapabilities, DecodeCapabilities)>,
    layout: Option<PoolLayout>,
    filter: Option<Filter>,
    command_buffers: Vec<vk::CommandBuffer>,
    load_balancing: Option<LoadBalancing>,

    reset_pending: bool,
    decode_pic_count: u64,
    num_surfaces: u32,
}

impl VideoDecoder {
    pub fn new(
        device: DeviceRef,
        frame_buffer: Arc<FrameBuffer>,
        config: DecoderConfig,
    ) -> Result<Self> {
        let queue_count = device.decode_queue_count();
        if config.queue_index >= queue_count {
            return Err(DecodeError::UnsupportedCapabilities(format!(
                "decode queue {} requested, but only {} available",
                config.queue_index, queue_count
            )));
        }

        let load_balancing = if config.hw_load_balancing && queue_count > 1 {
            debug!(queue_count, "load balancing across decode queues");
            Some(LoadBalancing {
                balancer: LoadBalancer::new(queue_count),
                semaphore: device.create_timeline_semaphore(0)?,
            })
        } else {
            if config.hw_load_balancing {
                debug!("only one decode queue available, load balancing disabled");
            }

            None
        };

        Ok(Self {
            parameters: PictureParametersCache::new(device.clone()),
            bitstream: BitstreamPool::new(device.clone()),
            device,
            config,
            frame_buffer,
            session: None,
            format: None,
            profile: None,
            capabilities: None,
            layout: None,
            filter: None,
            command_buffers: Vec::new(),
            load_balancing,
            reset_pending: false,
            decode_pic_count: 0,
            num_surfaces: 0,
        })
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn frame_buffer(&self) -> &Arc<FrameBuffer> {
        &self.frame_buffer
    }

    /// The format of the current sequence.
    pub fn format(&self) -> Option<&VideoFormat> {
        self.format.as_ref()
    }

    pub fn decode_pic_count(&self) -> u64 {
        self.decode_pic_count
    }

    pub fn num_surfaces(&self) -> u32 {
        self.num_surfaces
    }

    pub fn session(&self) -> Option<vk::VideoSessionKHR> {
        self.session.as_ref().map(|s| s.session)
    }

    pub fn filter_enabled(&self) -> bool {
        self.layout.map_or(false, |l| l.filter_out.is_some())
    }

    /// The shared timeline semaphore ordering submissions across queues, and
    /// the number of submissions so far.
    pub fn load_balance_point(&self) -> Option<TimelinePoint> {
        self.load_balancing.as_ref().map(|lb| TimelinePoint {
            semaphore: lb.semaphore,
            value: lb.balancer.counter(),
        })
    }

    /// Configures the session and image pool for a new sequence. Returns the
    /// number of decode surfaces.
    #[instrument(level = "debug", skip_all)]
    pub fn start_video_sequence(&mut self, format: &VideoFormat) -> Result<u32> {
        let queue_family = self.device.decode_queue_family();
        if !is_codec_supported(&*self.device, queue_family, format.codec) {
            return Err(DecodeError::UnsupportedCodec(format.codec));
        }

        let profile = VideoProfile::from_format(format);
        let (caps, decode_caps) = decode_capabilities(&*self.device, &profile)?;
        let (picture_format, reference_format) =
            supported_video_formats(&*self.device, &profile, &decode_caps)?;

        let extent = image_extent(format, &caps)?;

        let num_surfaces = (format.min_decode_surfaces + self.config.images_in_flight)
            .max(self.frame_buffer.num_slots());
        if num_surfaces > MAX_IMAGES {
            return Err(DecodeError::TooManySurfaces {
                requested: num_surfaces,
                max: MAX_IMAGES,
            });
        }

        // Film grain is applied to a separate output, leaving the reference
        // untouched.
        let coincide = decode_caps.dpb_and_output_coincide() && !format.film_grain;
        if !coincide && !decode_caps.dpb_and_output_distinct() {
            return Err(DecodeError::UnsupportedCapabilities(
                "film grain requires distinct DPB and output images".to_string(),
            ));
        }

        if self.format.as_ref().is_some_and(|f| f != format) {
            debug!("format changed, waiting for device idle");
            self.device.wait_idle()?;
        }

        let session_params = SessionParams::new(
            queue_family,
            profile,
            &caps,
            picture_format,
            reference_format,
            extent,
            format.max_dpb_slots,
        );

        if !self
            .session
            .as_ref()
            .is_some_and(|s| s.is_compatible(&session_params))
        {
            let session = VideoSession::new(self.device.clone(), session_params)?;
            self.parameters.bind_session(session.session)?;

            // The old session, if any, is dropped here.
            self.session = Some(session);
            self.reset_pending = true;
        }

        let filter_enabled = self.config.post_process_filter
            && self.configure_filter(format, picture_format)?;

        let linear_output = self.config.linear_output;
        let linear_copy = linear_output && !filter_enabled && coincide;

        let mut families = vec![queue_family];
        if filter_enabled {
            if let Some(compute) = self.device.compute_queue_family() {
                if compute != queue_family {
                    families.push(compute);
                }
            }
        }

        let device_local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let host_visible = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED;

        let mut specs = Vec::new();

        let mut dpb_usage = vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR;
        let mut dpb_roles = ImageRoles::DECODE_DPB;
        if coincide {
            dpb_usage |= vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR;
            dpb_roles |= ImageRoles::DECODE_OUT;

            if filter_enabled {
                dpb_usage |= vk::ImageUsageFlags::STORAGE;
            }

            if linear_copy {
                dpb_usage |= vk::ImageUsageFlags::TRANSFER_SRC;
            }
        }

        let image_array = !caps.separate_reference_images();
        specs.push(ImageSpec {
            roles: dpb_roles,
            format: reference_format,
            extent,
            usage: dpb_usage,
            tiling: vk::ImageTiling::OPTIMAL,
            memory_flags: device_local,
            uses_image_array: image_array,
            uses_image_view_array: image_array,
            queue_families: families.clone(),
        });

        let dpb = 0;
        let mut linear = None;

        let output = if coincide {
            dpb
        } else {
            let mut usage = vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR;
            let (tiling, memory_flags) = if linear_output && !filter_enabled {
                (vk::ImageTiling::LINEAR, host_visible)
            } else {
                (vk::ImageTiling::OPTIMAL, device_local)
            };

            if filter_enabled {
                usage |= vk::ImageUsageFlags::STORAGE;
            }

            specs.push(ImageSpec {
                roles: ImageRoles::DECODE_OUT,
                format: picture_format,
                extent,
                usage,
                tiling,
                memory_flags,
                uses_image_array: false,
                uses_image_view_array: false,
                queue_families: families.clone(),
            });

            let index = specs.len() - 1;
            if linear_output && !filter_enabled {
                linear = Some(index);
            }

            index
        };

        let filter_out = if filter_enabled {
            let (tiling, memory_flags) = if linear_output {
                (vk::ImageTiling::LINEAR, host_visible)
            } else {
                (vk::ImageTiling::OPTIMAL, device_local)
            };

            let mut roles = ImageRoles::FILTER_OUT;
            if linear_output {
                roles |= ImageRoles::LINEAR_OUT;
            }

            specs.push(ImageSpec {
                roles,
                format: vk::Format::R8G8B8A8_UNORM,
                extent,
                usage: vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC,
                tiling,
                memory_flags,
                uses_image_array: false,
                uses_image_view_array: false,
                queue_families: families.clone(),
            });

            let index = specs.len() - 1;
            if linear_output {
                linear = Some(index);
            }

            Some(index)
        } else {
            None
        };

        if linear_copy {
            specs.push(ImageSpec {
                roles: ImageRoles::LINEAR_OUT,
                format: picture_format,
                extent,
                usage: vk::ImageUsageFlags::TRANSFER_DST,
                tiling: vk::ImageTiling::LINEAR,
                memory_flags: host_visible,
                uses_image_array: false,
                uses_image_view_array: false,
                queue_families: vec![queue_family],
            });

            linear = Some(specs.len() - 1);
        }

        let preallocate = self
            .config
            .images_to_preallocate
            .unwrap_or(num_surfaces)
            .min(num_surfaces);

        let achieved = self
            .frame_buffer
            .init_image_pool(&profile, num_surfaces, specs, preallocate)?;
        if achieved != num_surfaces {
            return Err(DecodeError::SurfaceCountMismatch {
                requested: num_surfaces,
                achieved,
            });
        }

        let wanted = num_surfaces.max(MAX_IMAGES) as usize;
        if self.command_buffers.len() < wanted {
            let more = self
                .device
                .allocate_command_buffers((wanted - self.command_buffers.len()) as u32)?;
            self.command_buffers.extend(more);
        }

        self.bitstream.preallocate(
            &profile,
            self.config.bitstream_buffers_to_preallocate as usize,
            MIN_BITSTREAM_BUFFER_SIZE,
            caps.min_bitstream_buffer_size_alignment,
        )?;

        self.layout = Some(PoolLayout {
            dpb,
            output,
            filter_out,
            linear,
            linear_copy,
        });

        self.format = Some(format.clone());
        self.profile = Some(profile);
        self.capabilities = Some((caps, decode_caps));
        self.num_surfaces = num_surfaces;

        info!(
            codec = %format.codec,
            width = extent.width,
            height = extent.height,
            ?picture_format,
            coincide,
            filter = filter_enabled,
            linear_output,
            num_surfaces,
            "started video sequence"
        );

        Ok(num_surfaces)
    }

    /// Creates (or reuses) the color conversion filter, applying the failure
    /// policy. Returns whether the filter is available.
    fn configure_filter(&mut self, format: &VideoFormat, picture_format: vk::Format) -> Result<bool> {
        let desc = FilterDesc {
            input_format: picture_format,
            output_format: vk::Format::R8G8B8A8_UNORM,
            bit_depth: format.luma_bit_depth,
            chroma_shift: format.chroma_subsampling.chroma_shift(),
            model: YcbcrModel::from_signal(&format.signal, format.coded_height),
            range: YcbcrRange::from_signal(&format.signal),
            max_slots: MAX_IMAGES,
        };

        if self.filter.as_ref().is_some_and(|f| f.desc == desc) {
            return Ok(true);
        }

        if let Some(old) = self.filter.take() {
            self.device.destroy_filter(old.handle);
        }

        let res = if self.device.compute_queue_family().is_none() {
            Err(DecodeError::FilterCreation("no compute queue".to_string()))
        } else if plane_layouts(picture_format).len() != 2 {
            Err(DecodeError::FilterCreation(format!(
                "unsupported input format {:?}",
                picture_format
            )))
        } else {
            self.device.create_filter(&desc)
        };

        match res {
            Ok(handle) => {
                self.filter = Some(Filter { handle, desc });
                Ok(true)
            }
            Err(e) => match self.config.filter_failure {
                FilterFailurePolicy::Disable => {
                    warn!("post-process filter disabled: {}", e);
                    Ok(false)
                }
                FilterFailurePolicy::Fail => match e {
                    DecodeError::FilterCreation(_) => Err(e),
                    e => Err(DecodeError::FilterCreation(e.to_string())),
                },
            },
        }
    }

    /// Records and submits the decode of one picture. Returns the picture
    /// index.
    #[instrument(level = "trace", skip_all, fields(index = params.picture_index))]
    pub fn decode_picture_with_parameters(
        &mut self,
        params: &PictureParameters,
        info: &DecodePictureInfo,
    ) -> Result<u32> {
        let codec = self
            .format
            .as_ref()
            .map(|f| f.codec)
            .ok_or(DecodeError::NotInitialized)?;

        let index = params.picture_index;
        if index >= self.frame_buffer.num_slots() {
            return Err(DecodeError::InvalidSlot(index));
        }

        if params.references.len() > MAX_ACTIVE_REFERENCES as usize {
            return Err(DecodeError::UnsupportedCapabilities(format!(
                "{} active references",
                params.references.len()
            )));
        }

        let required_ids = required_parameter_ids(codec, &params.picture)?;
        let parameters = params
            .parameters
            .as_ref()
            .ok_or(DecodeError::MissingParameters)?;
        let (session_parameters, used_parameters) = self.parameters.resolve(parameters)?;
        self.parameters.validate(&used_parameters, &required_ids)?;

        let layout = self.layout.ok_or(DecodeError::NotInitialized)?;
        let sync = self.frame_buffer.queue_for_decode(
            index,
            self.decode_pic_count,
            info,
            layout.targets(),
            ReferencedObjects {
                bitstream: Some(params.bitstream.clone()),
                parameters: Some(used_parameters),
            },
        )?;

        if sync.picture_index != index {
            self.frame_buffer.abort_decode(sync.picture_index)?;
            return Err(DecodeError::SlotIndexMismatch {
                expected: index,
                actual: sync.picture_index,
            });
        }

        let built = self.build_submission(params, &sync, session_parameters);
        let (mut submission, filter_layouts) = match built {
            Ok(built) => built,
            Err(e) => {
                self.frame_buffer.abort_decode(index)?;
                return Err(e);
            }
        };

        let ticket = self.load_balancing.as_mut().map(|lb| {
            let ticket = lb.balancer.next();
            submission.waits.push(SemaphoreOp {
                semaphore: lb.semaphore,
                value: ticket.wait_value,
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            });
            submission.signals.push(SemaphoreOp {
                semaphore: lb.semaphore,
                value: ticket.signal_value,
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            });

            (lb.semaphore, ticket)
        });

        if let Some((_, ticket)) = ticket {
            submission.queue_index = ticket.queue_index;
        }

        match self.device.submit_decode(&submission) {
            Ok(()) => self.frame_buffer.commit_layouts(),
            Err(DecodeError::FilterSubmission(res)) => {
                // The decode (and the reset, if any) still ran.
                self.reset_pending = false;
                self.decode_pic_count += 1;
                self.drop_unfiltered(&sync, filter_layouts)?;
                return Err(DecodeError::FilterSubmission(res));
            }
            Err(e) => {
                error!(index, "decode submission failed: {}", e);
                self.frame_buffer.abort_decode(index)?;

                // Later submissions wait on this one.
                if let Some((semaphore, ticket)) = ticket {
                    self.device
                        .signal_semaphore(semaphore, ticket.signal_value)?;
                }

                return Err(DecodeError::Submission(match e {
                    DecodeError::Vulkan(res) | DecodeError::Submission(res) => res,
                    _ => vk::Result::ERROR_UNKNOWN,
                }));
            }
        }

        trace!(
            index,
            decode_order = self.decode_pic_count,
            queue_index = submission.queue_index,
            reset = submission.reset,
            num_references = submission.references.len(),
            session_parameters = session_parameters.as_raw(),
            "submitted decode"
        );

        self.reset_pending = false;
        self.decode_pic_count += 1;
        Ok(index)
    }

    /// Cleans up after a decode whose filter pass was never submitted. Once
    /// the decode finishes, the ready point is signalled from the host, so
    /// that anything waiting on it (later pictures referencing the slot)
    /// doesn't hang. The frame itself is dropped.
    fn drop_unfiltered(&self, sync: &FrameSync, filter_layouts: usize) -> Result<()> {
        let index = sync.picture_index;
        error!(index, "filter pass submission failed, dropping picture");

        let decoded = sync.decoded;
        if !self
            .device
            .wait_semaphore(decoded.semaphore, decoded.value, UNFILTERED_TIMEOUT)?
        {
            return Err(DecodeError::Timeout("decode without filter pass"));
        }

        self.device
            .signal_semaphore(sync.ready.semaphore, sync.ready.value)?;
        self.frame_buffer.drop_unfiltered(index, filter_layouts)
    }

    /// Resolves every image the picture touches, and records the layout
    /// transitions and synchronization needed to decode it. Also returns the
    /// number of pending layout changes before the filter pass's.
    fn build_submission(
        &self,
        params: &PictureParameters,
        sync: &FrameSync,
        session_parameters: vk::VideoSessionParametersKHR,
    ) -> Result<(DecodeSubmission, usize)> {
        let session = self.session.as_ref().ok_or(DecodeError::NotInitialized)?;
        let layout = self.layout.ok_or(DecodeError::NotInitialized)?;
        let format = self.format.as_ref().ok_or(DecodeError::NotInitialized)?;
        let (caps, _) = self.capabilities.ok_or(DecodeError::NotInitialized)?;

        let index = params.picture_index;
        let fb = &self.frame_buffer;

        let bitstream_size = params.bitstream.size();
        if params.bitstream_offset + params.bitstream_length > bitstream_size {
            return Err(DecodeError::BitstreamOverflow {
                offset: params.bitstream_offset,
                len: params.bitstream_length,
                size: bitstream_size,
            });
        }

        let bitstream = BitstreamRange {
            buffer: params.bitstream.buffer(),
            offset: params.bitstream_offset,
            size: align_up(
                params.bitstream_length,
                caps.min_bitstream_buffer_size_alignment,
            )
            .min(bitstream_size - params.bitstream_offset),
        };

        let mut barriers = Vec::new();

        // The setup (reconstructed) picture, and the output.
        let setup = match &params.setup {
            Some(setup) => {
                let mut picture = fb.image_resource(index, layout.dpb)?;
                barriers.extend(fb.transition(
                    index,
                    layout.dpb,
                    vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
                )?);
                picture.layout = vk::ImageLayout::VIDEO_DECODE_DPB_KHR;

                Some(ReferenceSlot {
                    slot_index: setup.slot_index,
                    picture,
                    codec: setup.codec,
                })
            }
            None => None,
        };

        let output = match &setup {
            Some(setup) if layout.output == layout.dpb => setup.picture,
            _ => {
                let mut picture = fb.image_resource(index, layout.output)?;
                barriers.extend(fb.transition(
                    index,
                    layout.output,
                    vk::ImageLayout::VIDEO_DECODE_DST_KHR,
                )?);
                picture.layout = vk::ImageLayout::VIDEO_DECODE_DST_KHR;
                picture
            }
        };

        // Reference pictures. Missing ones were never decoded, and are
        // skipped.
        let ref_indices = params
            .references
            .iter()
            .map(|r| r.picture_index)
            .collect::<Vec<_>>();
        let ref_pictures = fb.image_resources(&ref_indices, layout.dpb)?;

        let mut references = Vec::with_capacity(params.references.len());
        let mut waits = Vec::new();
        for (reference, picture) in params.references.iter().zip(ref_pictures) {
            let Some(mut picture) = picture else {
                debug!(
                    index = reference.picture_index,
                    "skipping reference without an image"
                );
                continue;
            };

            barriers.extend(fb.transition(
                reference.picture_index,
                layout.dpb,
                vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
            )?);
            picture.layout = vk::ImageLayout::VIDEO_DECODE_DPB_KHR;

            // The filter pass may still be reading the reference.
            if layout.filter_out.is_some() {
                if let Some(point) = fb.ready_point(reference.picture_index)? {
                    waits.push(SemaphoreOp {
                        semaphore: point.semaphore,
                        value: point.value,
                        stage: vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
                    });
                }
            }

            references.push(ReferenceSlot {
                slot_index: reference.slot_index,
                picture,
                codec: reference.codec,
            });
        }

        waits.extend(sync.consumer_wait.map(|op| SemaphoreOp {
            stage: vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
            ..op
        }));

        // The copy to the linear image follows the decode.
        let linear_copy = match (layout.linear_copy, layout.linear) {
            (true, Some(spec)) => {
                let mut dst = fb.image_resource(index, spec)?;
                barriers.extend(fb.transition(
                    index,
                    spec,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )?);
                dst.layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;

                let src_transition =
                    fb.transition(index, layout.output, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
                let mut src = output;
                src.layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;

                Some(LinearCopy {
                    src,
                    dst,
                    extent: format.display_extent(),
                    src_transition,
                })
            }
            _ => None,
        };

        let filter_layouts = fb.pending_layouts();
        let mut signals = Vec::new();
        let filter = match (layout.filter_out, self.filter.as_ref()) {
            (Some(spec), Some(filter)) => {
                let mut filter_barriers = Vec::new();

                let mut filter_out = fb.image_resource(index, spec)?;
                filter_barriers.extend(fb.transition(index, spec, vk::ImageLayout::GENERAL)?);
                filter_out.layout = vk::ImageLayout::GENERAL;

                filter_barriers.extend(fb.transition(
                    index,
                    layout.output,
                    vk::ImageLayout::GENERAL,
                )?);
                let mut input = output;
                input.layout = vk::ImageLayout::GENERAL;

                signals.push(SemaphoreOp {
                    semaphore: sync.decoded.semaphore,
                    value: sync.decoded.value,
                    stage: vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
                });

                Some(FilterPass {
                    filter: filter.handle,
                    slot: index,
                    input,
                    output: filter_out,
                    extent: format.display_extent(),
                    barriers: filter_barriers,
                    waits: vec![SemaphoreOp {
                        semaphore: sync.decoded.semaphore,
                        value: sync.decoded.value,
                        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
                    }],
                    signals: vec![SemaphoreOp {
                        semaphore: sync.ready.semaphore,
                        value: sync.ready.value,
                        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
                    }],
                    fence: sync.fence,
                })
            }
            _ => {
                signals.push(SemaphoreOp {
                    semaphore: sync.ready.semaphore,
                    value: sync.ready.value,
                    stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                });

                None
            }
        };

        let command_buffer = self
            .command_buffers
            .get(index as usize)
            .copied()
            .ok_or(DecodeError::NotInitialized)?;

        let submission = DecodeSubmission {
            queue_index: self.config.queue_index,
            command_buffer,
            session: session.session,
            session_parameters,
            reset: self.reset_pending,
            bitstream,
            coded_extent: format.coded_extent(),
            setup,
            output,
            references,
            barriers,
            picture: params.picture.clone(),
            query: sync.query,
            linear_copy,
            waits,
            signals,
            // The filter pass signals the fence, if there is one.
            fence: if filter.is_some() {
                vk::Fence::null()
            } else {
                sync.fence
            },
            filter,
        };

        Ok((submission, filter_layouts))
    }
}

/// The parameter sets a picture refers to.
fn required_parameter_ids(
    codec: VideoCodec,
    picture: &CodecPictureInfo,
) -> Result<Vec<(ParameterKind, u32)>> {
    match (picture, codec) {
        (CodecPictureInfo::H264 { std, .. }, VideoCodec::H264) => Ok(vec![
            (ParameterKind::Sps, std.seq_parameter_set_id as u32),
            (ParameterKind::Pps, std.pic_parameter_set_id as u32),
        ]),
        (CodecPictureInfo::H265 { std, .. }, VideoCodec::H265) => Ok(vec![
            (ParameterKind::Vps, std.sps_video_parameter_set_id as u32),
            (ParameterKind::Sps, std.pps_seq_parameter_set_id as u32),
            (ParameterKind::Pps, std.pps_pic_parameter_set_id as u32),
        ]),
        (CodecPictureInfo::Av1(_), VideoCodec::Av1) => Ok(vec![(ParameterKind::Av1Sequence, 0)]),
        _ => Err(DecodeError::Parser(format!(
            "picture info doesn't match codec {}",
            codec
        ))),
    }
}

/// The extent of every image in the pool: the larger of the display and
/// coded sizes, aligned to the access granularity.
fn image_extent(format: &VideoFormat, caps: &VideoCapabilities) -> Result<vk::Extent2D> {
    let display = format.display_extent();
    let coded = format.coded_extent();
    let granularity = caps.picture_access_granularity;

    let width = display
        .width
        .max(coded.width)
        .max(caps.min_coded_extent.width)
        .div_ceil(granularity.width.max(1))
        * granularity.width.max(1);
    let height = display
        .height
        .max(coded.height)
        .max(caps.min_coded_extent.height)
        .div_ceil(granularity.height.max(1))
        * granularity.height.max(1);

    if width > caps.max_coded_extent.width || height > caps.max_coded_extent.height {
        return Err(DecodeError::UnsupportedCapabilities(format!(
            "{}x{} exceeds the maximum coded extent {}x{}",
            width, height, caps.max_coded_extent.width, caps.max_coded_extent.height
        )));
    }

    Ok(vk::Extent2D { width, height })
}

impl DecodeHandler for VideoDecoder {
    fn on_sequence_start(&mut self, format: &VideoFormat) -> Result<u32> {
        self.start_video_sequence(format)
    }

    fn on_picture_ready(
        &mut self,
        params: &PictureParameters,
        info: &DecodePictureInfo,
    ) -> Result<u32> {
        self.decode_picture_with_parameters(params, info)
    }

    fn update_parameters(&mut self, set: ParameterSet) -> Result<ParametersRef> {
        self.parameters.add(set)
    }

    fn bitstream_buffer(&mut self, size: u64, init: &[u8]) -> Result<BitstreamBuffer> {
        let profile = self.profile.ok_or(DecodeError::NotInitialized)?;
        let (caps, _) = self.capabilities.ok_or(DecodeError::NotInitialized)?;

        self.bitstream.get(
            &profile,
            size,
            caps.min_bitstream_buffer_size_alignment,
            init,
        )
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("failed to wait for device idle: {}", e);
        }

        self.device.free_command_buffers(&self.command_buffers);

        if let Some(filter) = self.filter.take() {
            self.device.destroy_filter(filter.handle);
        }

        if let Some(lb) = self.load_balancing.take() {
            self.device.destroy_semaphore(lb.semaphore);
        }
    }
}
