// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

// It's not me, it's vulkan.
#![allow(clippy::too_many_arguments)]

mod chain;
pub(crate) use chain::*;

mod device;
mod filter;
pub mod video;

pub use device::VkDecodeDevice;

use cstr::cstr;
use std::ffi::{c_void, CStr, CString};

use anyhow::{anyhow, bail, Context, Result};
use ash::extensions::ext;
use ash::vk;
use tracing::{debug, error, info, trace, warn};

use self::video::VideoDecodeFns;
use crate::codec::VideoCodec;

pub struct VkContext {
    pub entry: ash::Entry,
    pub video: VideoDecodeFns,

    pub instance: ash::Instance,
    pub debug: Option<VkDebugContext>,
    pub device: ash::Device,
    pub device_info: VkDeviceInfo,
    pub decode_queue: VkQueue,
    pub compute_queue: Option<VkQueue>,
}

pub struct VkDebugContext {
    debug: ext::DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// A queue family, with every queue we created in it and a command pool
/// shared between them.
pub struct VkQueue {
    pub family: u32,
    pub queues: Vec<vk::Queue>,
    pub command_pool: vk::CommandPool,
}

impl VkQueue {
    fn new(device: &ash::Device, family: u32, count: u32) -> Result<Self> {
        let queues = (0..count)
            .map(|index| unsafe { device.get_device_queue(family, index) })
            .collect();

        let command_pool = unsafe {
            let create_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

            device.create_command_pool(&create_info, None)?
        };

        Ok(Self {
            family,
            queues,
            command_pool,
        })
    }
}

pub struct VkDeviceInfo {
    pub pdevice: vk::PhysicalDevice,
    pub device_name: CString,
    pub device_type: vk::PhysicalDeviceType,
    pub decode_family: u32,
    pub decode_queue_count: u32,
    pub decode_operations: vk::VideoCodecOperationFlagsKHR,
    pub supports_query_result_status: bool,
    pub compute_family: Option<u32>,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub host_mem_is_cached: bool,
    pub selected_extensions: Vec<CString>,
}

impl VkDeviceInfo {
    fn query(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<Self> {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let device_type = props.device_type;
        let device_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()).to_owned() };

        let num_families =
            unsafe { instance.get_physical_device_queue_family_properties2_len(device) };
        let mut video_props = vec![vk::QueueFamilyVideoPropertiesKHR::default(); num_families];
        let mut query_props =
            vec![vk::QueueFamilyQueryResultStatusPropertiesKHR::default(); num_families];

        let queue_families = {
            let mut props = video_props
                .iter_mut()
                .zip(query_props.iter_mut())
                .map(|(video, query)| {
                    vk::QueueFamilyProperties2::default()
                        .push_next(video)
                        .push_next(query)
                })
                .collect::<Vec<_>>();

            unsafe { instance.get_physical_device_queue_family_properties2(device, &mut props) };
            props
                .iter()
                .map(|p| p.queue_family_properties)
                .collect::<Vec<_>>()
        };

        let decode_family = queue_families
            .iter()
            .enumerate()
            .find(|(_, properties)| {
                properties
                    .queue_flags
                    .contains(vk::QueueFlags::VIDEO_DECODE_KHR)
            })
            .map(|(index, _)| index as u32)
            .ok_or_else(|| anyhow!("no video decode queue found"))?;

        let decode_queue_count = queue_families[decode_family as usize].queue_count;
        let supports_query_result_status =
            query_props[decode_family as usize].query_result_status_support == vk::TRUE;

        // Prefer a compute family that isn't also a graphics family.
        let compute_family = queue_families
            .iter()
            .enumerate()
            .filter(|(_, properties)| properties.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .min_by_key(|(_, properties)| {
                properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|(index, _)| index as u32);

        let available_extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)?
                .into_iter()
                .map(|properties| CStr::from_ptr(&properties.extension_name as *const _).to_owned())
                .collect::<Vec<_>>()
        };

        let mut selected_extensions = vec![
            vk::KhrVideoQueueFn::NAME.to_owned(),
            vk::KhrVideoDecodeQueueFn::NAME.to_owned(),
        ];

        for ext in selected_extensions.iter() {
            if !contains_extension(&available_extensions, ext) {
                bail!("extension {:?} not available", ext);
            }
        }

        // Only codecs with both an extension and queue support count.
        let family_operations = video_props[decode_family as usize].video_codec_operations;
        let mut decode_operations = vk::VideoCodecOperationFlagsKHR::empty();
        for codec in [VideoCodec::H264, VideoCodec::H265] {
            let ext = codec.decode_extension_name();
            if family_operations.contains(codec.decode_operation())
                && contains_extension(&available_extensions, ext)
            {
                decode_operations |= codec.decode_operation();
                selected_extensions.push(ext.to_owned());
            }
        }

        if decode_operations.is_empty() {
            bail!("no supported decode codecs");
        }

        // We want HOST_CACHED | HOST_COHERENT for readback, but we can make
        // do with just HOST_COHERENT.
        let memory_props = unsafe { instance.get_physical_device_memory_properties(device) };
        let host_mem_is_cached = select_memory_type(
            &memory_props,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_CACHED
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            None,
        )
        .is_some();

        if !host_mem_is_cached
            && select_memory_type(
                &memory_props,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                None,
            )
            .is_none()
        {
            bail!("no host visible memory type found");
        }

        Ok(Self {
            pdevice: device,
            device_name,
            device_type,
            decode_family,
            decode_queue_count,
            decode_operations,
            supports_query_result_status,
            compute_family,
            memory_props,
            host_mem_is_cached,
            selected_extensions,
        })
    }
}

impl VkContext {
    pub fn new(enable_debug: bool) -> Result<Self> {
        let entry = unsafe { ash::Entry::load().context("failed to load vulkan libraries!") }?;
        let instance = create_instance(&entry, enable_debug)?;

        let debug = if enable_debug {
            Some(VkDebugContext::new(&entry, &instance)?)
        } else {
            None
        };

        let device_info = select_device(&instance)?;
        let device = create_device(&instance, &device_info)?;

        let decode_queue = VkQueue::new(
            &device,
            device_info.decode_family,
            device_info.decode_queue_count,
        )?;

        // The compute queue may be the first decode queue, if the families
        // coincide.
        let compute_queue = device_info
            .compute_family
            .map(|family| VkQueue::new(&device, family, 1))
            .transpose()?;
        if compute_queue.is_none() {
            warn!("no compute queue found, post-processing is unavailable");
        }

        info!(
            decode_queues = device_info.decode_queue_count,
            h264 = device_info
                .decode_operations
                .contains(vk::VideoCodecOperationFlagsKHR::DECODE_H264),
            h265 = device_info
                .decode_operations
                .contains(vk::VideoCodecOperationFlagsKHR::DECODE_H265),
            query_result_status = device_info.supports_query_result_status,
            "hardware decoding support"
        );

        if !device_info.host_mem_is_cached {
            warn!("readback memory is uncached; copies to the host will be slow");
        }

        Ok(Self {
            video: VideoDecodeFns::load(&entry, &instance, &device),
            entry,
            instance,
            debug,
            device,
            device_info,
            decode_queue,
            compute_queue,
        })
    }
}

impl VkDebugContext {
    fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;
        use vk::DebugUtilsMessageTypeFlagsEXT as Type;

        let debug = ext::DebugUtils::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(Severity::VERBOSE | Severity::INFO | Severity::WARNING | Severity::ERROR)
            .message_type(Type::GENERAL | Type::VALIDATION | Type::PERFORMANCE)
            .pfn_user_callback(Some(log_debug_message));

        let messenger = unsafe { debug.create_debug_utils_messenger(&create_info, None)? };
        Ok(Self { debug, messenger })
    }
}

fn create_instance(entry: &ash::Entry, enable_debug: bool) -> Result<ash::Instance> {
    debug!("creating vulkan instance");

    let version = unsafe { entry.try_enumerate_instance_version()? }.unwrap_or(vk::API_VERSION_1_0);
    if version < vk::API_VERSION_1_3 {
        bail!(
            "vulkan 1.3 or higher is required (found {}.{})",
            vk::api_version_major(version),
            vk::api_version_minor(version)
        );
    }

    let app_info = vk::ApplicationInfo::default()
        .application_name(cstr!("mmdecode"))
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions = Vec::new();
    let mut layers = Vec::new();

    if enable_debug {
        let available = unsafe { entry.enumerate_instance_extension_properties(None)? };
        let available = available
            .iter()
            .map(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()).to_owned() })
            .collect::<Vec<_>>();

        if !contains_extension(&available, ext::DebugUtils::NAME) {
            bail!("debug utils extension requested, but not available");
        }

        warn!("vulkan debug tooling enabled");
        extensions.push(ext::DebugUtils::NAME.as_ptr());

        let validation = cstr!("VK_LAYER_KHRONOS_validation");
        let has_validation = unsafe { entry.enumerate_instance_layer_properties()? }
            .iter()
            .any(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) } == validation);

        if has_validation {
            layers.push(validation.as_ptr());
        } else {
            warn!("validation layers requested, but not available!");
        }
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

/// Lower is better. Discrete GPUs come first, then GPUs with a compute
/// family and more supported codecs.
fn device_score(info: &VkDeviceInfo) -> u32 {
    let type_score = match info.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 10,
        _ => 20,
    };

    let missing_codecs = [VideoCodec::H264, VideoCodec::H265]
        .iter()
        .filter(|codec| !info.decode_operations.contains(codec.decode_operation()))
        .count() as u32;

    type_score + missing_codecs + info.compute_family.is_none() as u32
}

fn select_device(instance: &ash::Instance) -> Result<VkDeviceInfo> {
    let mut eligible = Vec::new();
    for pdevice in unsafe { instance.enumerate_physical_devices()? } {
        match VkDeviceInfo::query(instance, pdevice) {
            Ok(info) => eligible.push(info),
            Err(err) => {
                let props = unsafe { instance.get_physical_device_properties(pdevice) };
                let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
                info!("gpu {:?} ineligible: {:#}", name, err);
            }
        }
    }

    // min_by_key keeps the first of equally scored devices.
    let selected = eligible
        .into_iter()
        .min_by_key(device_score)
        .ok_or_else(|| anyhow!("no gpu with video decode support found"))?;

    info!("selected gpu: {:?}", selected.device_name);
    Ok(selected)
}

fn create_device(instance: &ash::Instance, info: &VkDeviceInfo) -> Result<ash::Device> {
    let decode_priorities = vec![1.0; info.decode_queue_count as usize];
    let compute_priorities = [1.0];

    let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
        .queue_family_index(info.decode_family)
        .queue_priorities(&decode_priorities)];

    if let Some(family) = info.compute_family.filter(|f| *f != info.decode_family) {
        queue_create_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&compute_priorities),
        );
    }

    let mut features_11 =
        vk::PhysicalDeviceVulkan11Features::default().sampler_ycbcr_conversion(true);
    let mut features_12 = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .host_query_reset(true);
    let mut features_13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

    let extensions = info
        .selected_extensions
        .iter()
        .map(|name| name.as_ptr())
        .collect::<Vec<_>>();

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .push_next(&mut features_11)
        .push_next(&mut features_12)
        .push_next(&mut features_13);

    Ok(unsafe { instance.create_device(info.pdevice, &create_info, None)? })
}

unsafe extern "system" fn log_debug_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }

    // Unwinding across the FFI boundary is undefined.
    let _ = std::panic::catch_unwind(|| {
        let message = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
        let ty = format!("{:?}", ty).to_lowercase();

        if severity.contains(Severity::ERROR) {
            error!(ty, "{}", message);
        } else if severity.contains(Severity::WARNING) {
            warn!(ty, "{}", message);
        } else if severity.contains(Severity::INFO) {
            debug!(ty, "{}", message);
        } else {
            trace!(ty, "{}", message);
        }
    });

    vk::FALSE
}

impl Drop for VkContext {
    fn drop(&mut self) {
        debug!("destroying vulkan context");

        unsafe {
            let pools = std::iter::once(&self.decode_queue)
                .chain(self.compute_queue.as_ref())
                .map(|q| q.command_pool);
            for pool in pools {
                self.device.destroy_command_pool(pool, None);
            }

            self.device.destroy_device(None);

            if let Some(VkDebugContext { debug, messenger }) = &self.debug {
                debug.destroy_debug_utils_messenger(*messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

pub fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
    memory_type_bits: Option<u32>,
) -> Option<u32> {
    for i in 0..props.memory_type_count {
        if let Some(mask) = memory_type_bits {
            if mask & (1 << i) == 0 {
                continue;
            }
        }

        if flags.is_empty()
            || props.memory_types[i as usize]
                .property_flags
                .contains(flags)
        {
            return Some(i);
        }
    }

    None
}

/// Picks a memory type with all of `flags`, dropping `HOST_CACHED` and then
/// `HOST_COHERENT` if nothing matches.
pub fn select_memory_type_relaxed(
    props: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
    memory_type_bits: u32,
) -> Option<u32> {
    select_memory_type(props, flags, Some(memory_type_bits))
        .or_else(|| {
            select_memory_type(
                props,
                flags & !vk::MemoryPropertyFlags::HOST_CACHED,
                Some(memory_type_bits),
            )
        })
        .or_else(|| {
            select_memory_type(
                props,
                flags
                    & !(vk::MemoryPropertyFlags::HOST_CACHED
                        | vk::MemoryPropertyFlags::HOST_COHERENT),
                Some(memory_type_bits),
            )
        })
}

pub fn create_timeline_semaphore(
    device: &ash::Device,
    initial_value: u64,
) -> ash::prelude::VkResult<vk::Semaphore> {
    unsafe {
        device.create_semaphore(
            &vk::SemaphoreCreateInfo::default().push_next(
                &mut vk::SemaphoreTypeCreateInfo::default()
                    .semaphore_type(vk::SemaphoreType::TIMELINE)
                    .initial_value(initial_value),
            ),
            None,
        )
    }
}

pub fn create_fence(device: &ash::Device, signalled: bool) -> ash::prelude::VkResult<vk::Fence> {
    let mut create_info = vk::FenceCreateInfo::default();
    if signalled {
        create_info = create_info.flags(vk::FenceCreateFlags::SIGNALED);
    }

    unsafe { device.create_fence(&create_info, None) }
}

pub fn load_shader(device: &ash::Device, bytes: &[u8]) -> anyhow::Result<vk::ShaderModule> {
    let code = ash::util::read_spv(&mut std::io::Cursor::new(bytes))?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

    let shader = unsafe { device.create_shader_module(&create_info, None)? };

    Ok(shader)
}

pub fn allocate_command_buffers(
    device: &ash::Device,
    pool: vk::CommandPool,
    count: u32,
) -> ash::prelude::VkResult<Vec<vk::CommandBuffer>> {
    let create_info = vk::CommandBufferAllocateInfo::default()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(pool)
        .command_buffer_count(count);

    unsafe { device.allocate_command_buffers(&create_info) }
}

pub unsafe fn begin_cb(device: &ash::Device, cb: vk::CommandBuffer) -> ash::prelude::VkResult<()> {
    device.reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())?;
    device.begin_command_buffer(
        cb,
        &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
    )
}

/// Makes everything written by the command buffer so far visible to the
/// host, once the submission is known to be complete.
pub unsafe fn cmd_host_read_barrier(device: &ash::Device, cb: vk::CommandBuffer) {
    let barriers = [vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::HOST)
        .dst_access_mask(vk::AccessFlags2::HOST_READ)];

    device.cmd_pipeline_barrier2(
        cb,
        &vk::DependencyInfo::default().memory_barriers(&barriers),
    );
}

/// Builds the submission for one command buffer, waiting on and signalling
/// timeline points.
pub fn timeline_submit_infos(
    ops: &[crate::decoder::SemaphoreOp],
) -> Vec<vk::SemaphoreSubmitInfo<'static>> {
    ops.iter()
        .map(|op| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(op.semaphore)
                .value(op.value)
                .stage_mask(op.stage)
        })
        .collect()
}

pub fn single_profile_list_info<'a>(
    profile: &'a vk::VideoProfileInfoKHR,
) -> vk::VideoProfileListInfoKHR<'a> {
    vk::VideoProfileListInfoKHR {
        p_profiles: <*const _>::cast(profile),
        profile_count: 1,
        ..Default::default()
    }
}

fn contains_extension(list: &[CString], str: &CStr) -> bool {
    list.iter().any(|v| v.as_c_str() == str)
}
