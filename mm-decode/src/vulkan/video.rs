// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The entry points from `VK_KHR_video_queue` and `VK_KHR_video_decode_queue`
//! that decoding needs. Our ash revision only generates the raw function
//! tables.

use std::ffi::{c_void, CStr};

use ash::prelude::*;
use ash::vk;

pub struct VideoDecodeFns {
    device: vk::Device,
    queue: vk::KhrVideoQueueFn,
    decode: vk::KhrVideoDecodeQueueFn,
}

impl VideoDecodeFns {
    pub fn load(entry: &ash::Entry, instance: &ash::Instance, device: &ash::Device) -> Self {
        let mut get_proc = |name: &CStr| -> *const c_void {
            unsafe {
                std::mem::transmute(entry.get_instance_proc_addr(instance.handle(), name.as_ptr()))
            }
        };

        Self {
            device: device.handle(),
            queue: vk::KhrVideoQueueFn::load(&mut get_proc),
            decode: vk::KhrVideoDecodeQueueFn::load(&mut get_proc),
        }
    }

    pub unsafe fn capabilities(
        &self,
        pdevice: vk::PhysicalDevice,
        profile: &vk::VideoProfileInfoKHR,
        out: &mut vk::VideoCapabilitiesKHR,
    ) -> VkResult<()> {
        (self.queue.get_physical_device_video_capabilities_khr)(pdevice, profile, out).result()
    }

    pub unsafe fn format_properties(
        &self,
        pdevice: vk::PhysicalDevice,
        info: &vk::PhysicalDeviceVideoFormatInfoKHR,
    ) -> VkResult<Vec<vk::VideoFormatPropertiesKHR<'static>>> {
        enumerate(|count, data| {
            (self.queue.get_physical_device_video_format_properties_khr)(pdevice, info, count, data)
        })
    }

    pub unsafe fn create_session(
        &self,
        info: &vk::VideoSessionCreateInfoKHR,
    ) -> VkResult<vk::VideoSessionKHR> {
        let mut session = vk::VideoSessionKHR::null();
        (self.queue.create_video_session_khr)(self.device, info, std::ptr::null(), &mut session)
            .result_with_success(session)
    }

    pub unsafe fn destroy_session(&self, session: vk::VideoSessionKHR) {
        (self.queue.destroy_video_session_khr)(self.device, session, std::ptr::null());
    }

    pub unsafe fn session_memory_requirements(
        &self,
        session: vk::VideoSessionKHR,
    ) -> VkResult<Vec<vk::VideoSessionMemoryRequirementsKHR<'static>>> {
        enumerate(|count, data| {
            (self.queue.get_video_session_memory_requirements_khr)(
                self.device,
                session,
                count,
                data,
            )
        })
    }

    pub unsafe fn bind_session_memory(
        &self,
        session: vk::VideoSessionKHR,
        binds: &[vk::BindVideoSessionMemoryInfoKHR],
    ) -> VkResult<()> {
        (self.queue.bind_video_session_memory_khr)(
            self.device,
            session,
            binds.len() as u32,
            binds.as_ptr(),
        )
        .result()
    }

    pub unsafe fn create_parameters(
        &self,
        info: &vk::VideoSessionParametersCreateInfoKHR,
    ) -> VkResult<vk::VideoSessionParametersKHR> {
        let mut parameters = vk::VideoSessionParametersKHR::null();
        (self.queue.create_video_session_parameters_khr)(
            self.device,
            info,
            std::ptr::null(),
            &mut parameters,
        )
        .result_with_success(parameters)
    }

    pub unsafe fn update_parameters(
        &self,
        parameters: vk::VideoSessionParametersKHR,
        info: &vk::VideoSessionParametersUpdateInfoKHR,
    ) -> VkResult<()> {
        (self.queue.update_video_session_parameters_khr)(self.device, parameters, info).result()
    }

    pub unsafe fn destroy_parameters(&self, parameters: vk::VideoSessionParametersKHR) {
        (self.queue.destroy_video_session_parameters_khr)(self.device, parameters, std::ptr::null());
    }

    pub unsafe fn cmd_begin_coding(&self, cb: vk::CommandBuffer, info: &vk::VideoBeginCodingInfoKHR) {
        (self.queue.cmd_begin_video_coding_khr)(cb, info);
    }

    pub unsafe fn cmd_control_coding(
        &self,
        cb: vk::CommandBuffer,
        info: &vk::VideoCodingControlInfoKHR,
    ) {
        (self.queue.cmd_control_video_coding_khr)(cb, info);
    }

    pub unsafe fn cmd_decode(&self, cb: vk::CommandBuffer, info: &vk::VideoDecodeInfoKHR) {
        (self.decode.cmd_decode_video_khr)(cb, info);
    }

    pub unsafe fn cmd_end_coding(&self, cb: vk::CommandBuffer) {
        (self.queue.cmd_end_video_coding_khr)(cb, &vk::VideoEndCodingInfoKHR::default());
    }
}

/// The two-call enumeration idiom. The output structs are defaulted first,
/// so that `s_type` is set before the driver fills them in. Retries if the
/// count grew in between.
unsafe fn enumerate<T: Default + Clone>(
    mut f: impl FnMut(&mut u32, *mut T) -> vk::Result,
) -> VkResult<Vec<T>> {
    loop {
        let mut count = 0;
        f(&mut count, std::ptr::null_mut()).result()?;

        let mut data = vec![T::default(); count as usize];
        match f(&mut count, data.as_mut_ptr()) {
            vk::Result::INCOMPLETE => continue,
            res => {
                data.truncate(count as usize);
                return res.result_with_success(data);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn enumerate_retries_incomplete() {
        let mut available = 2_u32;
        let mut calls = 0;

        let formats = unsafe {
            enumerate(|count: &mut u32, data: *mut vk::VideoFormatPropertiesKHR| {
                calls += 1;
                if data.is_null() {
                    *count = available;
                    return vk::Result::SUCCESS;
                }

                // The list grows between the first two calls.
                if calls == 2 {
                    available = 3;
                    return vk::Result::INCOMPLETE;
                }

                for i in 0..available.min(*count) {
                    (*data.add(i as usize)).format = vk::Format::from_raw(i as i32 + 1);
                }

                *count = available.min(*count);
                vk::Result::SUCCESS
            })
        }
        .unwrap();

        assert_eq!(calls, 4);
        assert_eq!(
            formats.iter().map(|f| f.format).collect::<Vec<_>>(),
            vec![
                vk::Format::from_raw(1),
                vk::Format::from_raw(2),
                vk::Format::from_raw(3)
            ]
        );
        assert_eq!(
            formats[0].s_type,
            vk::StructureType::VIDEO_FORMAT_PROPERTIES_KHR
        );
    }
}
