// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use ash::vk;
use tracing::{error, instrument, trace};

use super::device::image_barrier;
use super::*;
use crate::decoder::FilterPass;
use crate::device::FilterDesc;
use crate::error::{DecodeError, Result};
use crate::format::BitDepth;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct ConvertPC {
    matrix: [[f32; 4]; 3],
    range_scale: [f32; 2],
    range_offset: [f32; 2],
    chroma_shift: [u32; 2],
}

impl ConvertPC {
    fn new(desc: &FilterDesc) -> Self {
        let (range_scale, range_offset) = desc.range.scale_and_offset();
        Self {
            matrix: desc.model.to_rgb_matrix(),
            range_scale,
            range_offset,
            chroma_shift: [desc.chroma_shift.0, desc.chroma_shift.1],
        }
    }
}

fn plane_formats(bit_depth: BitDepth) -> (vk::Format, vk::Format) {
    match bit_depth {
        BitDepth::Eight => (vk::Format::R8_UNORM, vk::Format::R8G8_UNORM),
        _ => (vk::Format::R16_UNORM, vk::Format::R16G16_UNORM),
    }
}

/// A compute pass converting semiplanar YCbCr pictures to RGBA, with one
/// descriptor set and command buffer per decode slot.
pub struct ConvertFilter {
    desc: FilterDesc,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    command_buffers: Vec<vk::CommandBuffer>,
    /// The luma and chroma views last bound for each slot.
    plane_views: Vec<Vec<vk::ImageView>>,
    vk: Arc<VkContext>,
}

impl ConvertFilter {
    #[instrument(level = "trace", name = "ConvertFilter::new", skip_all)]
    pub fn new(vk: Arc<VkContext>, desc: FilterDesc) -> anyhow::Result<Self> {
        let compute_queue = vk
            .compute_queue
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no compute queue available"))?;

        if plane_layouts_count(desc.input_format) != 2 {
            anyhow::bail!("only semiplanar inputs are supported, got {:?}", desc.input_format);
        }

        if desc.output_format != vk::Format::R8G8B8A8_UNORM {
            anyhow::bail!("unsupported output format {:?}", desc.output_format);
        }

        // Everything is null until created, so that drop cleans up after a
        // partial failure.
        let mut filter = Self {
            desc,
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            command_buffers: Vec::new(),
            plane_views: vec![Vec::new(); desc.max_slots as usize],
            vk: vk.clone(),
        };

        let shader = if desc.bit_depth == BitDepth::Eight {
            load_shader(
                &vk.device,
                include_bytes!(concat!(
                    env!("OUT_DIR"),
                    "/shaders/ycbcr_to_rgba_semiplanar.spv"
                )),
            )?
        } else {
            load_shader(
                &vk.device,
                include_bytes!(concat!(
                    env!("OUT_DIR"),
                    "/shaders/ycbcr_to_rgba_semiplanar_16.spv"
                )),
            )?
        };

        let shader = scopeguard::guard(shader, |shader| unsafe {
            vk.device.destroy_shader_module(shader, None);
        });

        filter.descriptor_set_layout = unsafe {
            let bindings = (0..3)
                .map(|binding| {
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(binding)
                        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                        .descriptor_count(1)
                        .stage_flags(vk::ShaderStageFlags::COMPUTE)
                })
                .collect::<Vec<_>>();

            vk.device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                None,
            )?
        };

        filter.pipeline_layout = {
            let ranges = [vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .offset(0)
                .size(std::mem::size_of::<ConvertPC>() as u32)];

            let set_layouts = [filter.descriptor_set_layout];
            let create_info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&set_layouts)
                .push_constant_ranges(&ranges);

            unsafe { vk.device.create_pipeline_layout(&create_info, None)? }
        };

        filter.pipeline = unsafe {
            let entry_point = std::ffi::CString::new("main")?;
            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(*shader)
                .name(&entry_point);

            let create_info = vk::ComputePipelineCreateInfo::default()
                .stage(stage)
                .layout(filter.pipeline_layout);

            match vk
                .device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
            {
                Ok(pipelines) => pipelines[0],
                Err((_, e)) => return Err(e.into()),
            }
        };

        filter.descriptor_pool = {
            let pool_sizes = [vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(3 * desc.max_slots)];

            let create_info = vk::DescriptorPoolCreateInfo::default()
                .pool_sizes(&pool_sizes)
                .max_sets(desc.max_slots);

            unsafe { vk.device.create_descriptor_pool(&create_info, None)? }
        };

        filter.descriptor_sets = {
            let set_layouts = vec![filter.descriptor_set_layout; desc.max_slots as usize];
            let allocate_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(filter.descriptor_pool)
                .set_layouts(&set_layouts);

            unsafe { vk.device.allocate_descriptor_sets(&allocate_info)? }
        };

        filter.command_buffers =
            allocate_command_buffers(&vk.device, compute_queue.command_pool, desc.max_slots)?;

        trace!(?desc, "created conversion pipeline");
        Ok(filter)
    }

    /// Records and submits the conversion for a single slot. The slot's
    /// previous submission must have completed.
    pub fn submit(&mut self, pass: &FilterPass) -> Result<()> {
        let slot = pass.slot as usize;
        if slot >= self.command_buffers.len() {
            return Err(DecodeError::InvalidSlot(pass.slot));
        }

        let queue = match &self.vk.compute_queue {
            Some(q) if !q.queues.is_empty() => q.queues[0],
            _ => return Err(DecodeError::Submission(vk::Result::ERROR_UNKNOWN)),
        };

        let device = &self.vk.device;
        let cb = self.command_buffers[slot];
        let ds = self.descriptor_sets[slot];

        unsafe {
            for view in self.plane_views[slot].drain(..) {
                device.destroy_image_view(view, None);
            }

            let (luma_format, chroma_format) = plane_formats(self.desc.bit_depth);
            for (format, aspect) in [
                (luma_format, vk::ImageAspectFlags::PLANE_0),
                (chroma_format, vk::ImageAspectFlags::PLANE_1),
            ] {
                let mut usage_info =
                    vk::ImageViewUsageCreateInfo::default().usage(vk::ImageUsageFlags::STORAGE);
                let create_info = vk::ImageViewCreateInfo::default()
                    .image(pass.input.image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: pass.input.array_layer,
                        layer_count: 1,
                    })
                    .push_next(&mut usage_info);

                let view = device.create_image_view(&create_info, None)?;
                self.plane_views[slot].push(view);
            }

            let image_infos = [
                self.plane_views[slot][0],
                self.plane_views[slot][1],
                pass.output.view,
            ]
            .map(|view| {
                [vk::DescriptorImageInfo::default()
                    .image_layout(vk::ImageLayout::GENERAL)
                    .image_view(view)]
            });

            let writes = image_infos
                .iter()
                .enumerate()
                .map(|(binding, info)| {
                    vk::WriteDescriptorSet::default()
                        .dst_set(ds)
                        .dst_binding(binding as u32)
                        .dst_array_element(0)
                        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                        .image_info(info)
                })
                .collect::<Vec<_>>();

            device.update_descriptor_sets(&writes, &[]);

            begin_cb(device, cb)?;

            // The semaphore wait orders the decode before this pass.
            let barriers = pass
                .barriers
                .iter()
                .map(|transition| {
                    image_barrier(
                        transition,
                        (
                            vk::PipelineStageFlags2::COMPUTE_SHADER,
                            vk::AccessFlags2::NONE,
                        ),
                        (
                            vk::PipelineStageFlags2::COMPUTE_SHADER,
                            vk::AccessFlags2::SHADER_STORAGE_READ
                                | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                        ),
                    )
                })
                .collect::<Vec<_>>();

            if !barriers.is_empty() {
                device.cmd_pipeline_barrier2(
                    cb,
                    &vk::DependencyInfo::default().image_memory_barriers(&barriers),
                );
            }

            self.cmd_convert(cb, pass.extent, ds);

            cmd_host_read_barrier(device, cb);
            device.end_command_buffer(cb)?;

            let cb_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cb)];
            let wait_infos = timeline_submit_infos(&pass.waits);
            let signal_infos = timeline_submit_infos(&pass.signals);

            let submit_info = vk::SubmitInfo2::default()
                .wait_semaphore_infos(&wait_infos)
                .signal_semaphore_infos(&signal_infos)
                .command_buffer_infos(&cb_infos);

            device
                .queue_submit2(queue, &[submit_info], pass.fence)
                .map_err(DecodeError::Submission)?;
        }

        Ok(())
    }

    unsafe fn cmd_convert(&self, cb: vk::CommandBuffer, extent: vk::Extent2D, ds: vk::DescriptorSet) {
        let device = &self.vk.device;

        device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, self.pipeline);
        device.cmd_bind_descriptor_sets(
            cb,
            vk::PipelineBindPoint::COMPUTE,
            self.pipeline_layout,
            0,
            &[ds],
            &[],
        );

        let pc = ConvertPC::new(&self.desc);
        device.cmd_push_constants(
            cb,
            self.pipeline_layout,
            vk::ShaderStageFlags::COMPUTE,
            0,
            std::slice::from_raw_parts(
                &pc as *const _ as *const u8,
                std::mem::size_of::<ConvertPC>(),
            ),
        );

        // One invocation per output pixel, in 16x16 workgroups.
        let group_count_x = (extent.width + 15) / 16;
        let group_count_y = (extent.height + 15) / 16;

        device.cmd_dispatch(cb, group_count_x, group_count_y, 1);
    }
}

fn plane_layouts_count(format: vk::Format) -> usize {
    crate::format::plane_layouts(format).len()
}

impl Drop for ConvertFilter {
    fn drop(&mut self) {
        let device = &self.vk.device;

        unsafe {
            if let Some(queue) = &self.vk.compute_queue {
                for q in &queue.queues {
                    if let Err(e) = device.queue_wait_idle(*q) {
                        error!("failed to wait for compute queue: {}", e);
                    }
                }

                if !self.command_buffers.is_empty() {
                    device.free_command_buffers(queue.command_pool, &self.command_buffers);
                }
            }

            for view in self.plane_views.iter().flatten() {
                device.destroy_image_view(*view, None);
            }

            // Destroying the pool frees the sets.
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}
