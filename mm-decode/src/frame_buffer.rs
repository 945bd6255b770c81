// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The image pool. Owns every image the decoder writes to, and tracks which
//! slots are in flight, queued for display, or held by the consumer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle as _;
use tracing::{debug, instrument, trace, warn};

use crate::bitstream::BitstreamBuffer;
use crate::capabilities::VideoProfile;
use crate::decoder::{ImageTransition, PictureResource, QuerySlot, SemaphoreOp, TimelinePoint};
use crate::device::{DeviceImage, DeviceRef, ImageDesc, ImageViewDesc};
use crate::error::{DecodeError, Result};
use crate::parameters::ParametersRef;
use crate::parser::{DecodePictureInfo, PictureQueue};

/// The most slots a pool can have.
pub const MAX_IMAGES: u32 = 32;

const FENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// The roles an image can fill in a decode slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ImageRoles(u8);

impl ImageRoles {
    pub const DECODE_DPB: Self = Self(1);
    pub const DECODE_OUT: Self = Self(1 << 1);
    pub const FILTER_OUT: Self = Self(1 << 2);
    pub const LINEAR_OUT: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ImageRoles {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ImageRoles {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// How the images for one role are created. Slots are allocated per spec.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    pub roles: ImageRoles,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
    pub memory_flags: vk::MemoryPropertyFlags,
    /// All slots share one image, with one layer per slot.
    pub uses_image_array: bool,
    /// With an image array, one view spanning every layer instead of a view
    /// per layer.
    pub uses_image_view_array: bool,
    pub queue_families: Vec<u32>,
}

impl ImageSpec {
    /// Whether `layout` is a valid target for images of this spec.
    fn allows_layout(&self, layout: vk::ImageLayout) -> bool {
        match layout {
            vk::ImageLayout::VIDEO_DECODE_DPB_KHR => self.roles.contains(ImageRoles::DECODE_DPB),
            vk::ImageLayout::VIDEO_DECODE_DST_KHR => self.roles.contains(ImageRoles::DECODE_OUT),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
                self.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC)
            }
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
                self.usage.contains(vk::ImageUsageFlags::TRANSFER_DST)
            }
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
                self.usage.contains(vk::ImageUsageFlags::SAMPLED)
            }
            vk::ImageLayout::GENERAL => {
                self.usage.intersects(
                    vk::ImageUsageFlags::STORAGE
                        | vk::ImageUsageFlags::SAMPLED
                        | vk::ImageUsageFlags::TRANSFER_SRC
                        | vk::ImageUsageFlags::TRANSFER_DST,
                ) || self.tiling == vk::ImageTiling::LINEAR
            }
            _ => false,
        }
    }
}

/// Which images a dequeued frame exposes to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTargets {
    pub display: usize,
    pub linear: Option<usize>,
}

/// Objects a frame depends on. Kept alive until the slot's fence is known to
/// have signalled.
#[derive(Debug, Clone, Default)]
pub struct ReferencedObjects {
    pub bitstream: Option<BitstreamBuffer>,
    pub parameters: Option<ParametersRef>,
}

/// Synchronization for one decode into a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    pub picture_index: u32,
    /// Signalled by the last submission for the frame.
    pub fence: vk::Fence,
    /// Reached when decoding has finished.
    pub decoded: TimelinePoint,
    /// Reached when the frame is ready for the consumer, after the filter
    /// pass if there is one. Without a filter, only this point is signalled.
    pub ready: TimelinePoint,
    /// The previous consumer of the slot, if it promised to signal when it
    /// was done.
    pub consumer_wait: Option<SemaphoreOp>,
    pub query: Option<QuerySlot>,
}

/// A decoded picture, handed to the consumer in display order.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub picture_index: u32,
    pub decode_order: u64,
    pub display_order: u64,
    pub timestamp: i64,
    pub display_extent: vk::Extent2D,
    pub output: PictureResource,
    pub linear: Option<PictureResource>,
    /// Wait for this before reading the images.
    pub ready: TimelinePoint,
    /// Signal this when done, and set `consumer_signaled` on release.
    pub consumed: TimelinePoint,
    pub fence: vk::Fence,
    pub query: Option<QuerySlot>,
}

/// Returns a dequeued frame to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRelease {
    pub picture_index: u32,
    pub decode_order: u64,
    pub display_order: u64,
    /// The consumer has submitted a signal of the frame's `consumed` point.
    pub consumer_signaled: bool,
}

impl From<&DecodedFrame> for FrameRelease {
    fn from(frame: &DecodedFrame) -> Self {
        Self {
            picture_index: frame.picture_index,
            decode_order: frame.decode_order,
            display_order: frame.display_order,
            consumer_signaled: false,
        }
    }
}

struct SlotImage {
    image: vk::Image,
    /// `None` for a layer of a shared array.
    owned: Option<DeviceImage>,
    view: vk::ImageView,
    /// Whether the view belongs to the slot (as opposed to a shared array).
    owns_view: bool,
    array_layer: u32,
    view_layer: u32,
    layout: vk::ImageLayout,
    format: vk::Format,
    extent: vk::Extent2D,
    generation: u64,
}

struct SharedArray {
    image: DeviceImage,
    view: Option<vk::ImageView>,
}

#[derive(Default)]
struct SlotState {
    parser_refs: u32,
    /// Decoded (or decoding), but not yet queued for display.
    in_decode: bool,
    in_display_queue: bool,
    owned_by_consumer: bool,
    decode_order: u64,
    display_order: u64,
    timestamp: i64,
    display_extent: vk::Extent2D,
    targets: Option<DisplayTargets>,
    fence_pending: bool,
    consumer_signaled: bool,
    /// `consumer_signaled` as it was before the current decode was queued.
    prev_consumer_signaled: bool,
    /// The number of decodes into the slot so far.
    uses: u64,
}

impl SlotState {
    fn is_live(&self) -> bool {
        self.in_decode || self.in_display_queue || self.owned_by_consumer
    }

    fn is_available(&self) -> bool {
        self.parser_refs == 0 && !self.is_live()
    }
}

struct Slot {
    images: Vec<Option<SlotImage>>,
    state: SlotState,
    referenced: Option<ReferencedObjects>,
    fence: vk::Fence,
    timeline: vk::Semaphore,
}

// Timeline values for the k-th use of a slot.
fn decoded_value(k: u64) -> u64 {
    3 * k + 1
}

fn ready_value(k: u64) -> u64 {
    3 * k + 2
}

fn consumed_value(k: u64) -> u64 {
    3 * k + 3
}

/// Undoes pending layout changes after `from`, newest first.
fn revert_layouts(inner: &mut Inner, from: usize) {
    let from = from.min(inner.pending_layouts.len());
    for pending in inner.pending_layouts.drain(from..).rev() {
        let image = inner
            .slots
            .get_mut(pending.index as usize)
            .and_then(|slot| slot.images.get_mut(pending.spec))
            .and_then(Option::as_mut);

        // A recreated image starts over in its initial layout.
        if let Some(image) = image.filter(|image| image.generation == pending.generation) {
            image.layout = pending.layout;
        }
    }
}

fn displayed_frame(
    slot: &Slot,
    index: u32,
    query_pool: Option<vk::QueryPool>,
) -> Option<DecodedFrame> {
    let targets = slot.state.targets?;
    let resource = |spec: usize| {
        slot.images
            .get(spec)
            .and_then(Option::as_ref)
            .map(picture_resource)
    };

    let output = resource(targets.display)?;
    let linear = targets.linear.and_then(resource);
    let k = slot.state.uses.checked_sub(1)?;

    Some(DecodedFrame {
        picture_index: index,
        decode_order: slot.state.decode_order,
        display_order: slot.state.display_order,
        timestamp: slot.state.timestamp,
        display_extent: slot.state.display_extent,
        output,
        linear,
        ready: TimelinePoint {
            semaphore: slot.timeline,
            value: ready_value(k),
        },
        consumed: TimelinePoint {
            semaphore: slot.timeline,
            value: consumed_value(k),
        },
        fence: slot.fence,
        query: query_pool.map(|pool| QuerySlot { pool, index }),
    })
}

/// A layout change that hasn't been submitted yet, with the layout it
/// replaced.
struct PendingLayout {
    index: u32,
    spec: usize,
    generation: u64,
    layout: vk::ImageLayout,
}

struct Inner {
    profile: Option<VideoProfile>,
    specs: Vec<ImageSpec>,
    generations: Vec<u64>,
    arrays: Vec<Option<SharedArray>>,
    retired_arrays: Vec<SharedArray>,
    slots: Vec<Slot>,
    display_queue: VecDeque<u32>,
    display_counter: u64,
    query_pool: Option<(vk::QueryPool, VideoProfile)>,
    next_generation: u64,
    pending_layouts: Vec<PendingLayout>,
}

pub struct FrameBuffer {
    device: DeviceRef,
    inner: Mutex<Inner>,
}

impl FrameBuffer {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            inner: Mutex::new(Inner {
                profile: None,
                specs: Vec::new(),
                generations: Vec::new(),
                arrays: Vec::new(),
                retired_arrays: Vec::new(),
                slots: Vec::new(),
                display_queue: VecDeque::new(),
                display_counter: 0,
                query_pool: None,
                next_generation: 1,
                pending_layouts: Vec::new(),
            }),
        }
    }

    /// Configures the pool for a sequence, with exactly `num_slots` slots.
    /// Images whose spec changed are recreated lazily, except for the first
    /// `preallocate` slots. Returns the number of slots allocated.
    pub fn init_image_pool(
        &self,
        profile: &VideoProfile,
        num_slots: u32,
        specs: Vec<ImageSpec>,
        preallocate: u32,
    ) -> Result<u32> {
        if num_slots > MAX_IMAGES {
            return Err(DecodeError::TooManySurfaces {
                requested: num_slots,
                max: MAX_IMAGES,
            });
        }

        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        inner.pending_layouts.clear();

        // Slots can only be dropped if nothing is using them.
        if let Some(index) = inner
            .slots
            .iter()
            .enumerate()
            .skip(num_slots as usize)
            .find(|(_, slot)| !slot.state.is_available())
            .map(|(index, _)| index)
        {
            return Err(DecodeError::SlotBusy(index as u32));
        }

        for mut slot in inner.slots.drain((num_slots as usize).min(inner.slots.len())..) {
            self.destroy_slot(&mut slot);
        }

        // Bump the generation of any spec that changed.
        let profile_changed = inner.profile != Some(*profile);
        for (index, spec) in specs.iter().enumerate() {
            let array_too_small = spec.uses_image_array && inner.slots.len() < num_slots as usize;
            let changed = profile_changed
                || array_too_small
                || inner.specs.get(index).map_or(true, |old| old != spec);

            if index >= inner.generations.len() {
                inner.generations.push(0);
                inner.arrays.push(None);
            }

            if changed {
                inner.generations[index] = inner.next_generation;
                inner.next_generation += 1;

                if let Some(array) = inner.arrays[index].take() {
                    inner.retired_arrays.push(array);
                }
            }
        }

        inner.generations.truncate(specs.len());
        for array in inner.arrays.drain(specs.len()..).flatten() {
            inner.retired_arrays.push(array);
        }

        inner.specs = specs;
        inner.profile = Some(*profile);

        while inner.slots.len() < num_slots as usize {
            let fence = self.device.create_fence(true)?;
            let timeline = match self.device.create_timeline_semaphore(0) {
                Ok(sema) => sema,
                Err(e) => {
                    self.device.destroy_fence(fence);
                    return Err(e);
                }
            };

            inner.slots.push(Slot {
                images: Vec::new(),
                state: SlotState::default(),
                referenced: None,
                fence,
                timeline,
            });
        }

        // Free stale images in slots nobody is using.
        let num_specs = inner.specs.len();
        for slot in inner.slots.iter_mut() {
            slot.images.resize_with(num_specs.max(slot.images.len()), || None);
            let live = slot.state.is_live();

            for (index, image) in slot.images.iter_mut().enumerate() {
                let stale = match (image.as_ref(), inner.generations.get(index)) {
                    (Some(image), Some(gen)) => image.generation != *gen,
                    (Some(_), None) => true,
                    _ => false,
                };

                if stale && !live {
                    if let Some(image) = image.take() {
                        self.destroy_slot_image(image);
                    }
                }
            }
        }

        if !inner.slots.iter().any(|slot| slot.state.is_live()) {
            for array in inner.retired_arrays.drain(..) {
                destroy_array(&self.device, array);
            }
        }

        // The status query pool is profile-specific.
        if self.device.supports_query_result_status() {
            match inner.query_pool {
                Some((_, p)) if p == *profile => (),
                _ => {
                    if let Some((pool, _)) = inner.query_pool.take() {
                        self.device.destroy_query_pool(pool);
                    }

                    let pool = self.device.create_query_pool(profile, MAX_IMAGES)?;
                    inner.query_pool = Some((pool, *profile));
                }
            }
        }

        for index in 0..preallocate.min(num_slots) {
            // Busy slots keep their stale images until they come back.
            if inner.slots[index as usize].state.is_live() {
                continue;
            }

            for spec_index in 0..inner.specs.len() {
                self.ensure_image(inner, index, spec_index)?;
            }
        }

        debug!(
            num_slots,
            num_specs = inner.specs.len(),
            preallocate,
            "initialized image pool"
        );

        Ok(inner.slots.len() as u32)
    }

    pub fn num_slots(&self) -> u32 {
        self.inner.lock().unwrap().slots.len() as u32
    }

    /// The number of slots available for decoding.
    pub fn free_slots(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter(|slot| slot.state.is_available())
            .count()
    }

    /// The number of frames waiting to be dequeued.
    pub fn frames_in_queue(&self) -> usize {
        self.inner.lock().unwrap().display_queue.len()
    }

    /// The ready point of the most recent decode into a slot, if there was
    /// one.
    pub fn ready_point(&self, index: u32) -> Result<Option<TimelinePoint>> {
        let inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .get(index as usize)
            .ok_or(DecodeError::InvalidSlot(index))?;

        Ok(slot.state.uses.checked_sub(1).map(|k| TimelinePoint {
            semaphore: slot.timeline,
            value: ready_value(k),
        }))
    }

    /// Returns the image for a slot and spec, creating it if necessary. The
    /// layout is the last committed one; this never changes state.
    pub fn image_resource(&self, index: u32, spec: usize) -> Result<PictureResource> {
        let mut inner = self.inner.lock().unwrap();
        self.ensure_image(&mut inner, index, spec)
    }

    /// Batched lookup for reference pictures. Slots without a current image
    /// (never decoded, or from a previous sequence) yield `None`.
    pub fn image_resources(
        &self,
        indices: &[u32],
        spec: usize,
    ) -> Result<Vec<Option<PictureResource>>> {
        let inner = self.inner.lock().unwrap();
        let gen = inner.generations.get(spec).copied();

        indices
            .iter()
            .map(|&index| {
                let slot = inner
                    .slots
                    .get(index as usize)
                    .ok_or(DecodeError::InvalidSlot(index))?;

                Ok(slot
                    .images
                    .get(spec)
                    .and_then(Option::as_ref)
                    .filter(|image| Some(image.generation) == gen)
                    .map(picture_resource))
            })
            .collect()
    }

    /// Moves a slot's image to a new layout, returning the barrier to record,
    /// if any. Later lookups see the new layout, but it stays pending until
    /// `commit_layouts`, and `abort_decode` reverts it.
    pub fn transition(
        &self,
        index: u32,
        spec: usize,
        layout: vk::ImageLayout,
    ) -> Result<Option<ImageTransition>> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let allowed = inner
            .specs
            .get(spec)
            .map_or(false, |spec| spec.allows_layout(layout));

        let image = inner
            .slots
            .get_mut(index as usize)
            .ok_or(DecodeError::InvalidSlot(index))?
            .images
            .get_mut(spec)
            .and_then(Option::as_mut)
            .ok_or(DecodeError::InvalidSlot(index))?;

        if !allowed {
            return Err(DecodeError::InvalidLayoutTransition {
                index,
                from: image.layout,
                to: layout,
            });
        }

        if image.layout == layout {
            return Ok(None);
        }

        let transition = ImageTransition {
            image: image.image,
            array_layer: image.array_layer,
            old_layout: image.layout,
            new_layout: layout,
        };

        inner.pending_layouts.push(PendingLayout {
            index,
            spec,
            generation: image.generation,
            layout: image.layout,
        });

        image.layout = layout;
        Ok(Some(transition))
    }

    /// The number of pending layout changes. Pass to `drop_unfiltered` to
    /// revert only the changes made after this point.
    pub fn pending_layouts(&self) -> usize {
        self.inner.lock().unwrap().pending_layouts.len()
    }

    /// Marks every pending layout change as submitted.
    pub fn commit_layouts(&self) {
        self.inner.lock().unwrap().pending_layouts.clear();
    }

    /// Registers a slot as in flight. The slot must not be decoding, queued
    /// for display or held by the consumer.
    pub fn queue_for_decode(
        &self,
        index: u32,
        decode_order: u64,
        info: &DecodePictureInfo,
        targets: DisplayTargets,
        referenced: ReferencedObjects,
    ) -> Result<FrameSync> {
        let mut inner = self.inner.lock().unwrap();
        let query_pool = inner.query_pool.map(|(pool, _)| pool);

        let live = inner
            .slots
            .get(index as usize)
            .ok_or(DecodeError::InvalidSlot(index))?
            .state
            .is_live();

        if live {
            return Err(DecodeError::SlotBusy(index));
        }

        // Only transitions made for this decode are reverted on abort.
        if !inner.pending_layouts.is_empty() {
            debug!(
                count = inner.pending_layouts.len(),
                "committing layout changes made outside a decode"
            );
            inner.pending_layouts.clear();
        }

        let slot = &mut inner.slots[index as usize];

        if slot.state.fence_pending {
            if !self.wait_fence(slot.fence)? {
                return Err(DecodeError::Timeout("slot fence"));
            }

            slot.state.fence_pending = false;
        }

        // The previous use is complete.
        slot.referenced = None;
        self.device.reset_fence(slot.fence)?;

        let k = slot.state.uses;
        let consumer_wait = if slot.state.consumer_signaled && k > 0 {
            Some(SemaphoreOp {
                semaphore: slot.timeline,
                value: consumed_value(k - 1),
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            })
        } else {
            None
        };

        let state = &mut slot.state;
        state.uses += 1;
        state.in_decode = true;
        state.decode_order = decode_order;
        state.timestamp = info.timestamp;
        state.display_extent = vk::Extent2D {
            width: info.display_width,
            height: info.display_height,
        };
        state.targets = Some(targets);
        state.fence_pending = true;
        state.prev_consumer_signaled = state.consumer_signaled;
        state.consumer_signaled = false;
        slot.referenced = Some(referenced);

        trace!(index, decode_order, "queued picture for decode");

        Ok(FrameSync {
            picture_index: index,
            fence: slot.fence,
            decoded: TimelinePoint {
                semaphore: slot.timeline,
                value: decoded_value(k),
            },
            ready: TimelinePoint {
                semaphore: slot.timeline,
                value: ready_value(k),
            },
            consumer_wait,
            query: query_pool.map(|pool| QuerySlot { pool, index }),
        })
    }

    /// Reverts a slot whose submission failed, as if the decode had never
    /// been queued. The frame is dropped from display, pending layout changes
    /// are undone, and the slot's timeline points are reused by the next
    /// decode, since nothing will signal them.
    pub fn abort_decode(&self, index: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        if index as usize >= inner.slots.len() {
            return Err(DecodeError::InvalidSlot(index));
        }

        revert_layouts(inner, 0);

        let slot = &mut inner.slots[index as usize];
        warn!(index, "dropping picture after failed submission");

        let state = &mut slot.state;
        if state.in_decode {
            state.uses = state.uses.saturating_sub(1);
            state.consumer_signaled = state.prev_consumer_signaled;
        }

        state.in_decode = false;
        state.fence_pending = false;
        slot.referenced = None;
        Ok(())
    }

    /// Drops a frame whose decode ran, but whose filter pass was never
    /// submitted. Layout changes made after `filter_layouts` (the filter's)
    /// are undone, and the rest are committed. The decode must have
    /// completed, since the slot's fence was never submitted.
    pub fn drop_unfiltered(&self, index: u32, filter_layouts: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        if index as usize >= inner.slots.len() {
            return Err(DecodeError::InvalidSlot(index));
        }

        revert_layouts(inner, filter_layouts);
        inner.pending_layouts.clear();

        let slot = &mut inner.slots[index as usize];
        warn!(index, "dropping picture after failed filter submission");
        slot.state.in_decode = false;
        slot.state.fence_pending = false;
        slot.referenced = None;
        Ok(())
    }

    /// Pops the next frame in display order, or `None` if there is none.
    /// Frames without a display image are dropped, and the slot is returned
    /// to the pool.
    pub fn dequeue(&self) -> Option<DecodedFrame> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let query_pool = inner.query_pool.map(|(pool, _)| pool);

        while let Some(index) = inner.display_queue.pop_front() {
            let slot = &mut inner.slots[index as usize];
            slot.state.in_display_queue = false;

            match displayed_frame(slot, index, query_pool) {
                Some(frame) => {
                    slot.state.owned_by_consumer = true;
                    return Some(frame);
                }
                None => warn!(index, "dropping picture without a display image"),
            }
        }

        None
    }

    /// Returns dequeued frames to the pool. Each frame must be released
    /// exactly once.
    pub fn release_displayed(&self, frames: &[FrameRelease]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        for release in frames {
            let index = release.picture_index;
            let slot = inner
                .slots
                .get_mut(index as usize)
                .ok_or(DecodeError::InvalidSlot(index))?;

            if !slot.state.owned_by_consumer {
                return Err(DecodeError::DoubleRelease(index));
            }

            if slot.state.decode_order != release.decode_order
                || slot.state.display_order != release.display_order
            {
                return Err(DecodeError::ReleaseMismatch { index });
            }

            slot.state.owned_by_consumer = false;
            slot.state.consumer_signaled = release.consumer_signaled;

            if slot.state.fence_pending && self.device.fence_status(slot.fence)? {
                slot.state.fence_pending = false;
                slot.referenced = None;
            }

            trace!(index, "released displayed picture");
        }

        Ok(())
    }

    /// Drops every frame still waiting for display, returning how many there
    /// were.
    pub fn flush_display_queue(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let count = inner.display_queue.len();
        for index in inner.display_queue.drain(..) {
            inner.slots[index as usize].state.in_display_queue = false;
        }

        count
    }

    fn wait_fence(&self, fence: vk::Fence) -> Result<bool> {
        self.device.wait_for_fence(fence, FENCE_TIMEOUT)
    }

    #[instrument(level = "trace", skip(self, inner))]
    fn ensure_image(&self, inner: &mut Inner, index: u32, spec_index: usize) -> Result<PictureResource> {
        let spec = inner
            .specs
            .get(spec_index)
            .cloned()
            .ok_or(DecodeError::InvalidSlot(index))?;
        let profile = inner.profile.ok_or(DecodeError::NotInitialized)?;
        let gen = inner.generations[spec_index];
        let num_slots = inner.slots.len() as u32;

        let slot = inner
            .slots
            .get(index as usize)
            .ok_or(DecodeError::InvalidSlot(index))?;

        if let Some(image) = slot.images.get(spec_index).and_then(Option::as_ref) {
            if image.generation == gen {
                return Ok(picture_resource(image));
            }
        }

        if slot.state.owned_by_consumer || slot.state.in_display_queue {
            return Err(DecodeError::SlotBusy(index));
        }

        let desc = ImageDesc {
            profile,
            format: spec.format,
            extent: spec.extent,
            array_layers: if spec.uses_image_array { num_slots } else { 1 },
            usage: spec.usage,
            tiling: spec.tiling,
            memory_flags: spec.memory_flags,
            queue_families: spec.queue_families.clone(),
        };

        let new_image = if spec.uses_image_array {
            if inner.arrays[spec_index].is_none() {
                let image = self.device.create_image(&desc)?;
                let view = if spec.uses_image_view_array {
                    Some(self.device.create_image_view(
                        image.image,
                        &ImageViewDesc {
                            format: spec.format,
                            base_array_layer: 0,
                            layer_count: num_slots,
                        },
                    )?)
                } else {
                    None
                };

                trace!(layers = num_slots, "created shared image array");
                inner.arrays[spec_index] = Some(SharedArray { image, view });
            }

            let Some(array) = inner.arrays[spec_index].as_ref() else {
                return Err(DecodeError::NotInitialized);
            };

            let (view, owns_view, view_layer) = match array.view {
                Some(view) => (view, false, index),
                None => (
                    self.device.create_image_view(
                        array.image.image,
                        &ImageViewDesc {
                            format: spec.format,
                            base_array_layer: index,
                            layer_count: 1,
                        },
                    )?,
                    true,
                    0,
                ),
            };

            SlotImage {
                image: array.image.image,
                owned: None,
                view,
                owns_view,
                array_layer: index,
                view_layer,
                layout: vk::ImageLayout::UNDEFINED,
                format: spec.format,
                extent: spec.extent,
                generation: gen,
            }
        } else {
            let image = self.device.create_image(&desc)?;
            let view = match self.device.create_image_view(
                image.image,
                &ImageViewDesc {
                    format: spec.format,
                    base_array_layer: 0,
                    layer_count: 1,
                },
            ) {
                Ok(view) => view,
                Err(e) => {
                    self.device.destroy_image(image);
                    return Err(e);
                }
            };

            SlotImage {
                image: image.image,
                owned: Some(image),
                view,
                owns_view: true,
                array_layer: 0,
                view_layer: 0,
                layout: vk::ImageLayout::UNDEFINED,
                format: spec.format,
                extent: spec.extent,
                generation: gen,
            }
        };

        let resource = picture_resource(&new_image);
        let slot = &mut inner.slots[index as usize];
        if let Some(old) = slot.images[spec_index].replace(new_image) {
            self.destroy_slot_image(old);
        }

        trace!(index, spec_index, extent = ?spec.extent, "created slot image");
        Ok(resource)
    }

    fn destroy_slot_image(&self, image: SlotImage) {
        if image.owns_view && !image.view.is_null() {
            self.device.destroy_image_view(image.view);
        }

        if let Some(owned) = image.owned {
            self.device.destroy_image(owned);
        }
    }

    fn destroy_slot(&self, slot: &mut Slot) {
        for image in slot.images.drain(..).flatten() {
            self.destroy_slot_image(image);
        }

        slot.referenced = None;
        self.device.destroy_fence(slot.fence);
        self.device.destroy_semaphore(slot.timeline);
    }
}

fn picture_resource(image: &SlotImage) -> PictureResource {
    PictureResource {
        image: image.image,
        view: image.view,
        array_layer: image.array_layer,
        view_layer: image.view_layer,
        format: image.format,
        extent: image.extent,
        layout: image.layout,
    }
}

fn destroy_array(device: &DeviceRef, array: SharedArray) {
    if let Some(view) = array.view {
        device.destroy_image_view(view);
    }

    device.destroy_image(array.image);
}

impl PictureQueue for FrameBuffer {
    fn reserve_picture(&self) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();

        let (index, slot) = inner
            .slots
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| slot.state.is_available())
            .min_by_key(|(_, slot)| slot.state.decode_order)?;

        slot.state.parser_refs = 1;
        Some(index as u32)
    }

    fn add_ref(&self, index: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .get_mut(index as usize)
            .ok_or(DecodeError::InvalidSlot(index))?;

        slot.state.parser_refs += 1;
        Ok(())
    }

    fn release_ref(&self, index: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .get_mut(index as usize)
            .ok_or(DecodeError::InvalidSlot(index))?;

        if slot.state.parser_refs == 0 {
            return Err(DecodeError::DoubleRelease(index));
        }

        slot.state.parser_refs -= 1;

        // The parser displays a picture before dropping its last reference,
        // so a picture still pending display at this point was discarded.
        if slot.state.parser_refs == 0 && slot.state.in_decode {
            trace!(index, "picture released without being displayed");
            slot.state.in_decode = false;
        }

        Ok(())
    }

    fn queue_for_display(&self, index: u32, timestamp: Option<i64>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let slot = inner
            .slots
            .get_mut(index as usize)
            .ok_or(DecodeError::InvalidSlot(index))?;

        if !slot.state.in_decode {
            // Dropped, for example after a failed submission.
            debug!(index, "skipping display of undecoded picture");
            return Ok(());
        }

        slot.state.in_decode = false;
        slot.state.in_display_queue = true;
        slot.state.display_order = inner.display_counter;
        if let Some(ts) = timestamp {
            slot.state.timestamp = ts;
        }

        inner.display_counter += 1;
        inner.display_queue.push_back(index);
        Ok(())
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();

        for mut slot in inner.slots.drain(..) {
            for image in slot.images.drain(..).flatten() {
                if image.owns_view && !image.view.is_null() {
                    self.device.destroy_image_view(image.view);
                }

                if let Some(owned) = image.owned {
                    self.device.destroy_image(owned);
                }
            }

            self.device.destroy_fence(slot.fence);
            self.device.destroy_semaphore(slot.timeline);
        }

        for array in inner.arrays.drain(..).flatten() {
            destroy_array(&self.device, array);
        }

        for array in inner.retired_arrays.drain(..) {
            destroy_array(&self.device, array);
        }

        if let Some((pool, _)) = inner.query_pool.take() {
            self.device.destroy_query_pool(pool);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, Rng as _, SeedableRng as _};

    use super::*;
    use crate::codec::VideoCodec;
    use crate::device::mock::MockDevice;
    use crate::format::{BitDepth, ChromaSubsampling};

    const TARGETS: DisplayTargets = DisplayTargets {
        display: 0,
        linear: None,
    };

    fn profile() -> VideoProfile {
        VideoProfile {
            codec: VideoCodec::H264,
            chroma_subsampling: ChromaSubsampling::Yuv420,
            luma_bit_depth: BitDepth::Eight,
            chroma_bit_depth: BitDepth::Eight,
            codec_profile: 100,
            progressive: true,
        }
    }

    fn dpb_spec(width: u32) -> ImageSpec {
        ImageSpec {
            roles: ImageRoles::DECODE_DPB | ImageRoles::DECODE_OUT,
            format: vk::Format::G8_B8R8_2PLANE_420_UNORM,
            extent: vk::Extent2D { width, height: 64 },
            usage: vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR
                | vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR,
            tiling: vk::ImageTiling::OPTIMAL,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            uses_image_array: false,
            uses_image_view_array: false,
            queue_families: vec![0],
        }
    }

    fn pool(device: &Arc<MockDevice>, num_slots: u32) -> FrameBuffer {
        let fb = FrameBuffer::new(device.clone());
        assert_eq!(
            fb.init_image_pool(&profile(), num_slots, vec![dpb_spec(64)], num_slots)
                .unwrap(),
            num_slots
        );

        fb
    }

    fn decode(device: &MockDevice, fb: &FrameBuffer, index: u32, decode_order: u64) -> FrameSync {
        let info = DecodePictureInfo {
            timestamp: decode_order as i64,
            display_width: 64,
            display_height: 64,
            ..Default::default()
        };

        let sync = fb
            .queue_for_decode(
                index,
                decode_order,
                &info,
                TARGETS,
                ReferencedObjects::default(),
            )
            .unwrap();

        device.signal_fence(sync.fence);
        sync
    }

    /// Runs a picture through the pool, and returns the frame the consumer
    /// sees.
    fn decode_and_display(device: &MockDevice, fb: &FrameBuffer, decode_order: u64) -> DecodedFrame {
        let index = fb.reserve_picture().unwrap();
        decode(device, fb, index, decode_order);
        fb.queue_for_display(index, None).unwrap();
        fb.release_ref(index).unwrap();
        fb.dequeue().unwrap()
    }

    #[test]
    fn pool_accounting() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 4);
        assert_eq!(device.live_images(), 4);
        assert_eq!(device.live_fences(), 4);

        let reserved = (0..4)
            .map(|_| fb.reserve_picture().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(reserved, vec![0, 1, 2, 3]);
        assert_eq!(fb.reserve_picture(), None);
        assert_eq!(fb.free_slots(), 0);

        fb.add_ref(2).unwrap();
        for index in reserved {
            fb.release_ref(index).unwrap();
        }

        assert_eq!(fb.free_slots(), 3);
        fb.release_ref(2).unwrap();
        assert_eq!(fb.free_slots(), 4);

        match fb.release_ref(2) {
            Err(DecodeError::DoubleRelease(2)) => (),
            v => panic!("expected DoubleRelease, got {:?}", v),
        }
    }

    #[test]
    fn reserve_prefers_oldest() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 3);

        for order in 0..3 {
            let frame = decode_and_display(&device, &fb, order);
            fb.release_displayed(&[FrameRelease::from(&frame)]).unwrap();
        }

        // Slot 0 was decoded twice, slot 1 once.
        assert_eq!(fb.reserve_picture(), Some(2));
    }

    #[test]
    fn display_order() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 4);

        // I P B in decode order, I B P in display order.
        let i = fb.reserve_picture().unwrap();
        decode(&device, &fb, i, 0);
        fb.queue_for_display(i, Some(100)).unwrap();

        let p = fb.reserve_picture().unwrap();
        decode(&device, &fb, p, 1);
        let b = fb.reserve_picture().unwrap();
        decode(&device, &fb, b, 2);
        fb.queue_for_display(b, Some(101)).unwrap();
        fb.queue_for_display(p, Some(102)).unwrap();

        // A display request for a picture that is already queued is ignored.
        fb.queue_for_display(p, None).unwrap();
        assert_eq!(fb.frames_in_queue(), 3);

        let frames = std::iter::from_fn(|| fb.dequeue()).collect::<Vec<_>>();
        assert_eq!(
            frames.iter().map(|f| f.picture_index).collect::<Vec<_>>(),
            vec![i, b, p]
        );
        assert_eq!(
            frames.iter().map(|f| f.decode_order).collect::<Vec<_>>(),
            vec![0, 2, 1]
        );
        assert_eq!(
            frames.iter().map(|f| f.display_order).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            frames.iter().map(|f| f.timestamp).collect::<Vec<_>>(),
            vec![100, 101, 102]
        );
    }

    #[test]
    fn timeline_points() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 1);

        let frame = decode_and_display(&device, &fb, 0);
        assert_eq!(frame.ready.value, 2);
        assert_eq!(frame.consumed.value, 3);
        assert_eq!(fb.ready_point(0).unwrap(), Some(frame.ready));

        fb.release_displayed(&[FrameRelease {
            consumer_signaled: true,
            ..FrameRelease::from(&frame)
        }])
        .unwrap();

        // The next decode waits for the consumer.
        let index = fb.reserve_picture().unwrap();
        let sync = decode(&device, &fb, index, 1);
        assert_eq!(sync.decoded.value, 4);
        assert_eq!(sync.ready.value, 5);
        assert_eq!(
            sync.consumer_wait,
            Some(SemaphoreOp {
                semaphore: frame.consumed.semaphore,
                value: 3,
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            })
        );

        fb.queue_for_display(index, None).unwrap();
        fb.release_ref(index).unwrap();
        let frame = fb.dequeue().unwrap();
        fb.release_displayed(&[FrameRelease::from(&frame)]).unwrap();

        // This time the consumer made no promise.
        let index = fb.reserve_picture().unwrap();
        let sync = decode(&device, &fb, index, 2);
        assert_eq!(sync.consumer_wait, None);
    }

    #[test]
    fn busy_slots() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 2);

        let index = fb.reserve_picture().unwrap();
        decode(&device, &fb, index, 0);

        match fb.queue_for_decode(
            index,
            1,
            &DecodePictureInfo::default(),
            TARGETS,
            ReferencedObjects::default(),
        ) {
            Err(DecodeError::SlotBusy(0)) => (),
            v => panic!("expected SlotBusy, got {:?}", v),
        }

        match fb.queue_for_decode(
            5,
            1,
            &DecodePictureInfo::default(),
            TARGETS,
            ReferencedObjects::default(),
        ) {
            Err(DecodeError::InvalidSlot(5)) => (),
            v => panic!("expected InvalidSlot, got {:?}", v),
        }
    }

    #[test]
    fn release_errors() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 2);

        let frame = decode_and_display(&device, &fb, 0);
        let release = FrameRelease::from(&frame);

        match fb.release_displayed(&[FrameRelease {
            decode_order: 7,
            ..release
        }]) {
            Err(DecodeError::ReleaseMismatch { index: 0 }) => (),
            v => panic!("expected ReleaseMismatch, got {:?}", v),
        }

        fb.release_displayed(&[release]).unwrap();
        match fb.release_displayed(&[release]) {
            Err(DecodeError::DoubleRelease(0)) => (),
            v => panic!("expected DoubleRelease, got {:?}", v),
        }

        assert_eq!(fb.free_slots(), 2);
    }

    #[test]
    fn aborted_decode() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 2);

        let index = fb.reserve_picture().unwrap();
        decode(&device, &fb, index, 0);
        fb.abort_decode(index).unwrap();

        fb.queue_for_display(index, None).unwrap();
        assert_eq!(fb.frames_in_queue(), 0);

        fb.release_ref(index).unwrap();
        assert_eq!(fb.free_slots(), 2);
    }

    #[test]
    fn aborted_decode_reverts_slot() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 1);

        let dpb = vk::ImageLayout::VIDEO_DECODE_DPB_KHR;
        let dst = vk::ImageLayout::VIDEO_DECODE_DST_KHR;

        let index = fb.reserve_picture().unwrap();
        let first = decode(&device, &fb, index, 0);
        assert!(fb.transition(index, 0, dpb).unwrap().is_some());
        fb.commit_layouts();
        fb.queue_for_display(index, None).unwrap();
        fb.release_ref(index).unwrap();

        let frame = fb.dequeue().unwrap();
        fb.release_displayed(&[FrameRelease {
            consumer_signaled: true,
            ..FrameRelease::from(&frame)
        }])
        .unwrap();

        // The second decode moves the image, then fails to submit.
        let index = fb.reserve_picture().unwrap();
        let failed = decode(&device, &fb, index, 1);
        assert_eq!(failed.consumer_wait.map(|op| op.value), Some(3));
        assert!(fb.transition(index, 0, dst).unwrap().is_some());
        assert_eq!(fb.pending_layouts(), 1);

        fb.abort_decode(index).unwrap();
        assert_eq!(fb.pending_layouts(), 0);
        assert_eq!(fb.image_resource(index, 0).unwrap().layout, dpb);
        assert_eq!(fb.ready_point(index).unwrap(), Some(first.ready));
        fb.release_ref(index).unwrap();

        // A retry reuses the same timeline points, and still waits for the
        // consumer of the first frame.
        let index = fb.reserve_picture().unwrap();
        let retry = decode(&device, &fb, index, 1);
        assert_eq!(retry.decoded, failed.decoded);
        assert_eq!(retry.ready, failed.ready);
        assert_eq!(retry.consumer_wait, failed.consumer_wait);

        let t = fb.transition(index, 0, dst).unwrap().unwrap();
        assert_eq!((t.old_layout, t.new_layout), (dpb, dst));
    }

    #[test]
    fn unfiltered_picture_keeps_decode_layouts() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 1);

        let index = fb.reserve_picture().unwrap();
        decode(&device, &fb, index, 0);
        fb.transition(index, 0, vk::ImageLayout::VIDEO_DECODE_DPB_KHR)
            .unwrap();
        let mark = fb.pending_layouts();
        fb.transition(index, 0, vk::ImageLayout::VIDEO_DECODE_DST_KHR)
            .unwrap();

        fb.drop_unfiltered(index, mark).unwrap();
        assert_eq!(fb.pending_layouts(), 0);
        assert_eq!(
            fb.image_resource(index, 0).unwrap().layout,
            vk::ImageLayout::VIDEO_DECODE_DPB_KHR
        );

        // The decode counts as a use of the slot, but isn't displayed.
        assert_eq!(fb.ready_point(index).unwrap().map(|p| p.value), Some(2));
        fb.queue_for_display(index, None).unwrap();
        assert_eq!(fb.frames_in_queue(), 0);
        fb.release_ref(index).unwrap();
        assert_eq!(fb.free_slots(), 1);
    }

    #[test]
    fn frame_without_display_image() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 2);

        // The pool only has one spec.
        let index = fb.reserve_picture().unwrap();
        fb.queue_for_decode(
            index,
            0,
            &DecodePictureInfo::default(),
            DisplayTargets {
                display: 3,
                linear: None,
            },
            ReferencedObjects::default(),
        )
        .unwrap();
        fb.queue_for_display(index, None).unwrap();
        fb.release_ref(index).unwrap();

        // It's skipped, and the slot goes back to the pool.
        let frame = decode_and_display(&device, &fb, 1);
        assert_ne!(frame.picture_index, index);
        assert_eq!(fb.frames_in_queue(), 0);
        assert_eq!(fb.free_slots(), 1);

        fb.release_displayed(&[FrameRelease::from(&frame)]).unwrap();
        assert_eq!(fb.free_slots(), 2);
    }

    #[test]
    fn discarded_picture() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 2);

        // The parser drops a picture without displaying it.
        let index = fb.reserve_picture().unwrap();
        decode(&device, &fb, index, 0);
        fb.release_ref(index).unwrap();

        assert_eq!(fb.free_slots(), 2);
        assert_eq!(fb.dequeue().map(|f| f.picture_index), None);
    }

    #[test]
    fn flush_display_queue() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 3);

        for order in 0..2 {
            let index = fb.reserve_picture().unwrap();
            decode(&device, &fb, index, order);
            fb.queue_for_display(index, None).unwrap();
            fb.release_ref(index).unwrap();
        }

        assert_eq!(fb.flush_display_queue(), 2);
        assert_eq!(fb.frames_in_queue(), 0);
        assert_eq!(fb.free_slots(), 3);
    }

    #[test]
    fn layout_transitions() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 1);

        let dpb = vk::ImageLayout::VIDEO_DECODE_DPB_KHR;
        let dst = vk::ImageLayout::VIDEO_DECODE_DST_KHR;

        let t = fb.transition(0, 0, dpb).unwrap().unwrap();
        assert_eq!(
            (t.old_layout, t.new_layout),
            (vk::ImageLayout::UNDEFINED, dpb)
        );
        assert_eq!(fb.transition(0, 0, dpb).unwrap(), None);

        for layout in [
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ] {
            match fb.transition(0, 0, layout) {
                Err(DecodeError::InvalidLayoutTransition { index: 0, from, to }) => {
                    assert_eq!((from, to), (dpb, layout));
                }
                v => panic!("expected InvalidLayoutTransition, got {:?}", v),
            }
        }

        let t = fb.transition(0, 0, dst).unwrap().unwrap();
        assert_eq!((t.old_layout, t.new_layout), (dpb, dst));
        assert_eq!(fb.image_resource(0, 0).unwrap().layout, dst);

        match fb.transition(0, 1, dpb) {
            Err(DecodeError::InvalidSlot(0)) => (),
            v => panic!("expected InvalidSlot, got {:?}", v),
        }
    }

    #[test]
    fn stale_images() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 2);

        let first = decode_and_display(&device, &fb, 0);
        let held = decode_and_display(&device, &fb, 1);
        assert_eq!(held.picture_index, 1);
        fb.release_displayed(&[FrameRelease::from(&first)]).unwrap();

        // A new sequence, while the consumer holds slot 1.
        fb.init_image_pool(&profile(), 2, vec![dpb_spec(128)], 2)
            .unwrap();
        assert!(device.image_desc(held.output.image).is_some());

        let resources = fb.image_resources(&[0, 1], 0).unwrap();
        assert_eq!(resources[0].map(|r| r.extent.width), Some(128));
        assert_eq!(resources[1], None);

        fb.release_displayed(&[FrameRelease::from(&held)]).unwrap();
        let fresh = fb.image_resource(1, 0).unwrap();
        assert_eq!(fresh.extent.width, 128);
        assert!(device.image_desc(held.output.image).is_none());
        assert_eq!(device.live_images(), 2);
    }

    #[test]
    fn resize_pool() {
        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, 4);

        match fb.init_image_pool(&profile(), 33, vec![dpb_spec(64)], 0) {
            Err(DecodeError::TooManySurfaces {
                requested: 33,
                max: 32,
            }) => (),
            v => panic!("expected TooManySurfaces, got {:?}", v),
        }

        let reserved = (0..3)
            .map(|_| fb.reserve_picture().unwrap())
            .collect::<Vec<_>>();
        match fb.init_image_pool(&profile(), 2, vec![dpb_spec(64)], 0) {
            Err(DecodeError::SlotBusy(2)) => (),
            v => panic!("expected SlotBusy, got {:?}", v),
        }

        fb.release_ref(reserved[2]).unwrap();
        assert_eq!(
            fb.init_image_pool(&profile(), 2, vec![dpb_spec(64)], 0)
                .unwrap(),
            2
        );
        assert_eq!(device.live_images(), 2);
        assert_eq!(device.live_fences(), 2);
    }

    #[test]
    fn shared_array_retired() {
        let device = Arc::new(MockDevice::new());
        let fb = FrameBuffer::new(device.clone());

        let array_spec = |width| ImageSpec {
            uses_image_array: true,
            uses_image_view_array: true,
            ..dpb_spec(width)
        };

        fb.init_image_pool(&profile(), 4, vec![array_spec(64)], 4)
            .unwrap();
        assert_eq!(device.live_images(), 1);
        assert_eq!(device.live_views(), 1);

        let a = fb.image_resource(0, 0).unwrap();
        let b = fb.image_resource(3, 0).unwrap();
        assert_eq!(a.image, b.image);
        assert_eq!((a.array_layer, b.array_layer), (0, 3));
        assert_eq!((a.view_layer, b.view_layer), (0, 3));

        fb.init_image_pool(&profile(), 4, vec![array_spec(128)], 4)
            .unwrap();
        assert_eq!(device.live_images(), 1);
        assert!(device.image_desc(a.image).is_none());

        drop(fb);
        assert_eq!(device.live_images(), 0);
        assert_eq!(device.live_views(), 0);
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn query_pool() {
        let device = Arc::new(MockDevice::new());
        device.set_query_support(true);
        let fb = pool(&device, 2);

        let index = fb.reserve_picture().unwrap();
        let sync = decode(&device, &fb, index, 0);
        assert_eq!(sync.query.map(|q| q.index), Some(index));
    }

    #[test]
    fn backpressure() {
        const SLOTS: u32 = 8;

        let device = Arc::new(MockDevice::new());
        let fb = pool(&device, SLOTS);
        let mut rng = StdRng::seed_from_u64(0xdec0de);

        let mut decoding: Vec<u32> = Vec::new();
        let mut display_fifo: VecDeque<u32> = VecDeque::new();
        let mut held: Vec<DecodedFrame> = Vec::new();
        let mut decode_order = 0;
        let mut last_display_order = None;

        for _ in 0..2000 {
            match rng.gen_range(0..4) {
                0 => match fb.reserve_picture() {
                    Some(index) => {
                        assert!(!decoding.contains(&index));
                        assert!(!display_fifo.contains(&index));
                        assert!(!held.iter().any(|f| f.picture_index == index));

                        decode(&device, &fb, index, decode_order);
                        decode_order += 1;
                        decoding.push(index);
                    }
                    None => {
                        let busy = decoding.len() + display_fifo.len() + held.len();
                        assert_eq!(busy, SLOTS as usize);
                    }
                },
                1 if !decoding.is_empty() => {
                    let index = decoding.swap_remove(rng.gen_range(0..decoding.len()));
                    fb.queue_for_display(index, None).unwrap();
                    fb.release_ref(index).unwrap();
                    display_fifo.push_back(index);
                }
                2 => {
                    let frame = fb.dequeue();
                    assert_eq!(
                        frame.as_ref().map(|f| f.picture_index),
                        display_fifo.pop_front()
                    );

                    if let Some(frame) = frame {
                        assert!(last_display_order < Some(frame.display_order));
                        last_display_order = Some(frame.display_order);
                        held.push(frame);
                    }
                }
                3 if !held.is_empty() => {
                    let frame = held.swap_remove(rng.gen_range(0..held.len()));
                    fb.release_displayed(&[FrameRelease::from(&frame)]).unwrap();
                }
                _ => (),
            }

            let busy = decoding.len() + display_fifo.len() + held.len();
            assert!(busy <= SLOTS as usize);
            assert_eq!(fb.free_slots(), SLOTS as usize - busy);
            assert_eq!(fb.frames_in_queue(), display_fifo.len());
        }
    }
}
