// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! An in-memory device for tests. Submissions complete immediately.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle as _;

use super::*;
use crate::codec::VideoCodec;
use crate::error::DecodeError;
use crate::format::packed_size;
use crate::parameters::ParameterKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParametersCall {
    Create {
        templated: bool,
        kind: ParameterKind,
        id: u32,
    },
    Update {
        kind: ParameterKind,
        id: u32,
        update_sequence_count: u32,
    },
}

struct State {
    queue_count: u32,
    decode_flags: vk::VideoDecodeCapabilityFlagsKHR,
    capability_flags: vk::VideoCapabilityFlagsKHR,
    formats: Vec<vk::Format>,
    max_coded_extent: vk::Extent2D,
    query_support: bool,
    fail_next_submit: bool,
    fail_next_filter_pass: bool,
    fail_filter: bool,

    sessions: HashSet<u64>,
    sessions_created: usize,
    parameters: HashSet<u64>,
    parameters_calls: Vec<ParametersCall>,
    images: HashMap<u64, ImageDesc>,
    views: HashSet<u64>,
    buffers: HashMap<u64, Vec<u8>>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, u64>,
    query_pools: HashSet<u64>,
    command_buffers: HashSet<u64>,
    filters: HashSet<u64>,
    submissions: Vec<DecodeSubmission>,
    wait_idle_count: usize,
}

pub struct MockDevice {
    next_handle: AtomicU64,
    state: Mutex<State>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            state: Mutex::new(State {
                queue_count: 1,
                decode_flags: vk::VideoDecodeCapabilityFlagsKHR::DPB_AND_OUTPUT_COINCIDE,
                capability_flags: vk::VideoCapabilityFlagsKHR::SEPARATE_REFERENCE_IMAGES,
                formats: vec![vk::Format::G8_B8R8_2PLANE_420_UNORM],
                max_coded_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                query_support: false,
                fail_next_submit: false,
                fail_next_filter_pass: false,
                fail_filter: false,
                sessions: HashSet::new(),
                sessions_created: 0,
                parameters: HashSet::new(),
                parameters_calls: Vec::new(),
                images: HashMap::new(),
                views: HashSet::new(),
                buffers: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                query_pools: HashSet::new(),
                command_buffers: HashSet::new(),
                filters: HashSet::new(),
                submissions: Vec::new(),
                wait_idle_count: 0,
            }),
        }
    }

    pub fn next_raw_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_formats(&self, formats: Vec<vk::Format>) {
        self.state.lock().unwrap().formats = formats;
    }

    pub fn set_decode_flags(&self, flags: vk::VideoDecodeCapabilityFlagsKHR) {
        self.state.lock().unwrap().decode_flags = flags;
    }

    pub fn set_capability_flags(&self, flags: vk::VideoCapabilityFlagsKHR) {
        self.state.lock().unwrap().capability_flags = flags;
    }

    pub fn set_queue_count(&self, count: u32) {
        self.state.lock().unwrap().queue_count = count;
    }

    pub fn set_query_support(&self, supported: bool) {
        self.state.lock().unwrap().query_support = supported;
    }

    pub fn fail_next_submit(&self) {
        self.state.lock().unwrap().fail_next_submit = true;
    }

    /// The next decode with a filter pass is submitted, but its filter pass
    /// isn't.
    pub fn fail_next_filter_pass(&self) {
        self.state.lock().unwrap().fail_next_filter_pass = true;
    }

    pub fn fail_filter(&self) {
        self.state.lock().unwrap().fail_filter = true;
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn sessions_created(&self) -> usize {
        self.state.lock().unwrap().sessions_created
    }

    pub fn parameters_calls(&self) -> Vec<ParametersCall> {
        self.state.lock().unwrap().parameters_calls.clone()
    }

    pub fn live_parameters(&self) -> usize {
        self.state.lock().unwrap().parameters.len()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .buffers
            .get(&buffer.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().unwrap().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    pub fn live_views(&self) -> usize {
        self.state.lock().unwrap().views.len()
    }

    pub fn image_desc(&self, image: vk::Image) -> Option<ImageDesc> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(&image.as_raw())
            .cloned()
    }

    pub fn image_descs(&self) -> Vec<ImageDesc> {
        self.state
            .lock()
            .unwrap()
            .images
            .values()
            .cloned()
            .collect()
    }

    pub fn submissions(&self) -> Vec<DecodeSubmission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn wait_idle_count(&self) -> usize {
        self.state.lock().unwrap().wait_idle_count
    }

    pub fn live_filters(&self) -> usize {
        self.state.lock().unwrap().filters.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().unwrap().fences.len()
    }

    /// Completes work the test did not submit.
    pub fn signal_fence(&self, fence: vk::Fence) {
        self.state
            .lock()
            .unwrap()
            .fences
            .insert(fence.as_raw(), true);
    }
}

impl DecodeDevice for MockDevice {
    fn decode_queue_family(&self) -> u32 {
        0
    }

    fn decode_queue_count(&self) -> u32 {
        self.state.lock().unwrap().queue_count
    }

    fn compute_queue_family(&self) -> Option<u32> {
        Some(1)
    }

    fn decode_operations(&self) -> vk::VideoCodecOperationFlagsKHR {
        VideoCodec::H264.decode_operation() | VideoCodec::H265.decode_operation()
    }

    fn supports_query_result_status(&self) -> bool {
        self.state.lock().unwrap().query_support
    }

    fn video_capabilities(
        &self,
        profile: &VideoProfile,
    ) -> Result<(VideoCapabilities, DecodeCapabilities)> {
        if !self
            .decode_operations()
            .contains(profile.codec.decode_operation())
        {
            return Err(DecodeError::UnsupportedCodec(profile.codec));
        }

        let state = self.state.lock().unwrap();
        let caps = VideoCapabilities {
            flags: state.capability_flags,
            min_bitstream_buffer_offset_alignment: 256,
            min_bitstream_buffer_size_alignment: 256,
            picture_access_granularity: vk::Extent2D {
                width: 16,
                height: 16,
            },
            min_coded_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_coded_extent: state.max_coded_extent,
            max_dpb_slots: 17,
            max_active_reference_pictures: 16,
            std_header_version: vk::ExtensionProperties::default(),
        };

        Ok((
            caps,
            DecodeCapabilities {
                flags: state.decode_flags,
            },
        ))
    }

    fn video_formats(
        &self,
        _profile: &VideoProfile,
        _usage: vk::ImageUsageFlags,
    ) -> Result<Vec<vk::Format>> {
        Ok(self.state.lock().unwrap().formats.clone())
    }

    fn create_video_session(&self, _params: &SessionParams) -> Result<vk::VideoSessionKHR> {
        let raw = self.next_raw_handle();
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(raw);
        state.sessions_created += 1;
        Ok(vk::VideoSessionKHR::from_raw(raw))
    }

    fn destroy_video_session(&self, session: vk::VideoSessionKHR) {
        self.state.lock().unwrap().sessions.remove(&session.as_raw());
    }

    fn create_session_parameters(
        &self,
        _session: vk::VideoSessionKHR,
        template: vk::VideoSessionParametersKHR,
        set: &ParameterSet,
    ) -> Result<vk::VideoSessionParametersKHR> {
        let raw = self.next_raw_handle();
        let mut state = self.state.lock().unwrap();
        state.parameters.insert(raw);
        state.parameters_calls.push(ParametersCall::Create {
            templated: !template.is_null(),
            kind: set.kind(),
            id: set.id(),
        });

        Ok(vk::VideoSessionParametersKHR::from_raw(raw))
    }

    fn update_session_parameters(
        &self,
        _parameters: vk::VideoSessionParametersKHR,
        set: &ParameterSet,
        update_sequence_count: u32,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .parameters_calls
            .push(ParametersCall::Update {
                kind: set.kind(),
                id: set.id(),
                update_sequence_count,
            });

        Ok(())
    }

    fn destroy_session_parameters(&self, parameters: vk::VideoSessionParametersKHR) {
        self.state
            .lock()
            .unwrap()
            .parameters
            .remove(&parameters.as_raw());
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<DeviceImage> {
        let raw = self.next_raw_handle();
        self.state.lock().unwrap().images.insert(raw, desc.clone());

        Ok(DeviceImage {
            image: vk::Image::from_raw(raw),
            memory: vk::DeviceMemory::from_raw(self.next_raw_handle()),
        })
    }

    fn create_image_view(&self, image: vk::Image, _desc: &ImageViewDesc) -> Result<vk::ImageView> {
        let raw = self.next_raw_handle();
        let mut state = self.state.lock().unwrap();
        if !state.images.contains_key(&image.as_raw()) {
            return Err(DecodeError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }

        state.views.insert(raw);
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().unwrap().views.remove(&view.as_raw());
    }

    fn destroy_image(&self, image: DeviceImage) {
        self.state
            .lock()
            .unwrap()
            .images
            .remove(&image.image.as_raw());
    }

    fn create_bitstream_buffer(&self, _profile: &VideoProfile, size: u64) -> Result<DeviceBuffer> {
        let raw = self.next_raw_handle();
        self.state
            .lock()
            .unwrap()
            .buffers
            .insert(raw, vec![0; size as usize]);

        Ok(DeviceBuffer {
            buffer: vk::Buffer::from_raw(raw),
            memory: vk::DeviceMemory::from_raw(self.next_raw_handle()),
            size,
        })
    }

    fn write_buffer(&self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let contents = state
            .buffers
            .get_mut(&buffer.buffer.as_raw())
            .ok_or(DecodeError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))?;

        let start = offset as usize;
        contents[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        self.state
            .lock()
            .unwrap()
            .buffers
            .remove(&buffer.buffer.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let raw = self.next_raw_handle();
        self.state.lock().unwrap().fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: Duration) -> Result<bool> {
        self.fence_status(fence)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let signaled = state
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(DecodeError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        *signaled = false;
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        self.state
            .lock()
            .unwrap()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(DecodeError::Vulkan(vk::Result::ERROR_UNKNOWN))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().unwrap().fences.remove(&fence.as_raw());
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore> {
        let raw = self.next_raw_handle();
        self.state
            .lock()
            .unwrap()
            .semaphores
            .insert(raw, initial_value);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        self.state
            .lock()
            .unwrap()
            .semaphores
            .get(&semaphore.as_raw())
            .copied()
            .ok_or(DecodeError::Vulkan(vk::Result::ERROR_UNKNOWN))
    }

    fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        _timeout: Duration,
    ) -> Result<bool> {
        Ok(self.semaphore_value(semaphore)? >= value)
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .semaphores
            .get_mut(&semaphore.as_raw())
            .ok_or(DecodeError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        *current = (*current).max(value);
        Ok(())
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state
            .lock()
            .unwrap()
            .semaphores
            .remove(&semaphore.as_raw());
    }

    fn create_query_pool(&self, _profile: &VideoProfile, _count: u32) -> Result<vk::QueryPool> {
        let raw = self.next_raw_handle();
        self.state.lock().unwrap().query_pools.insert(raw);
        Ok(vk::QueryPool::from_raw(raw))
    }

    fn query_status(
        &self,
        _pool: vk::QueryPool,
        _query: u32,
    ) -> Result<Option<vk::QueryResultStatusKHR>> {
        Ok(Some(vk::QueryResultStatusKHR::COMPLETE))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.state.lock().unwrap().query_pools.remove(&pool.as_raw());
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let handles = (0..count)
            .map(|_| self.next_raw_handle())
            .collect::<Vec<_>>();

        let mut state = self.state.lock().unwrap();
        state.command_buffers.extend(handles.iter().copied());
        Ok(handles
            .into_iter()
            .map(vk::CommandBuffer::from_raw)
            .collect())
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock().unwrap();
        for cb in command_buffers {
            state.command_buffers.remove(&cb.as_raw());
        }
    }

    fn create_filter(&self, _desc: &FilterDesc) -> Result<FilterHandle> {
        let raw = self.next_raw_handle();
        let mut state = self.state.lock().unwrap();
        if state.fail_filter {
            return Err(DecodeError::FilterCreation("no compute queue".to_string()));
        }

        state.filters.insert(raw);
        Ok(FilterHandle(raw))
    }

    fn destroy_filter(&self, filter: FilterHandle) {
        self.state.lock().unwrap().filters.remove(&filter.0);
    }

    fn submit_decode(&self, submission: &DecodeSubmission) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(DecodeError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }

        if submission.queue_index >= state.queue_count {
            return Err(DecodeError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }

        let skip_filter =
            submission.filter.is_some() && std::mem::take(&mut state.fail_next_filter_pass);

        // Everything completes immediately.
        let mut signals = submission.signals.clone();
        let mut fences = vec![submission.fence];
        if let Some(filter) = submission.filter.as_ref().filter(|_| !skip_filter) {
            signals.extend(filter.signals.iter().copied());
            fences.push(filter.fence);
        }

        for op in signals {
            let current = state.semaphores.entry(op.semaphore.as_raw()).or_default();
            *current = (*current).max(op.value);
        }

        for fence in fences.into_iter().filter(|f| !f.is_null()) {
            state.fences.insert(fence.as_raw(), true);
        }

        state.submissions.push(submission.clone());
        if skip_filter {
            return Err(DecodeError::FilterSubmission(vk::Result::ERROR_DEVICE_LOST));
        }

        Ok(())
    }

    fn read_image(
        &self,
        picture: &PictureResource,
        extent: vk::Extent2D,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        // Fill with a byte identifying the image.
        let len = packed_size(picture.format, extent);
        out.clear();
        out.resize(len, picture.image.as_raw() as u8);
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.state.lock().unwrap().wait_idle_count += 1;
        Ok(())
    }
}
