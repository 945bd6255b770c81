// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace};

use crate::capabilities::VideoProfile;
use crate::device::{DeviceBuffer, DeviceRef};
use crate::error::{DecodeError, Result};

/// The most buffers the pool keeps for reuse.
pub const MAX_POOLED_BUFFERS: usize = 64;

/// The smallest buffer the pool allocates.
pub const MIN_BITSTREAM_BUFFER_SIZE: u64 = 2 * 1024 * 1024;

struct BufferInner {
    buffer: DeviceBuffer,
    device: DeviceRef,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
    }
}

/// A host-visible buffer holding compressed data for the decoder. Cloning
/// is cheap; a pooled buffer is available for reuse once the pool holds the
/// only reference.
#[derive(Clone)]
pub struct BitstreamBuffer(Arc<BufferInner>);

impl std::fmt::Debug for BitstreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BitstreamBuffer")
            .field(&self.0.buffer)
            .finish()
    }
}

impl BitstreamBuffer {
    pub fn buffer(&self) -> vk::Buffer {
        self.0.buffer.buffer
    }

    pub fn size(&self) -> u64 {
        self.0.buffer.size
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(DecodeError::BitstreamOverflow {
                offset,
                len,
                size: self.size(),
            });
        }

        self.0.device.write_buffer(&self.0.buffer, offset, data)
    }

    fn is_shared(&self) -> bool {
        Arc::strong_count(&self.0) > 1
    }
}

/// Recycles bitstream buffers between frames.
pub struct BitstreamPool {
    device: DeviceRef,
    buffers: Vec<BitstreamBuffer>,
    max_size: u64,
    allocations: usize,
}

impl BitstreamPool {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            buffers: Vec::new(),
            max_size: 0,
            allocations: 0,
        }
    }

    /// Returns a buffer of at least `size` bytes (aligned to `size_align`),
    /// with `init` copied to the start. A pooled buffer is reused if one is
    /// free and large enough; otherwise a new one is allocated and pooled if
    /// there is room.
    pub fn get(
        &mut self,
        profile: &VideoProfile,
        size: u64,
        size_align: u64,
        init: &[u8],
    ) -> Result<BitstreamBuffer> {
        let size = align_up(size.max(init.len() as u64), size_align);

        let reusable = self
            .buffers
            .iter()
            .find(|buf| !buf.is_shared() && buf.size() >= size)
            .cloned();

        let buffer = match reusable {
            Some(buf) => {
                trace!(size = buf.size(), "reusing bitstream buffer");
                buf
            }
            None => {
                let buf = self.allocate(profile, size.max(MIN_BITSTREAM_BUFFER_SIZE), size_align)?;
                if self.buffers.len() < MAX_POOLED_BUFFERS {
                    self.buffers.push(buf.clone());
                }

                buf
            }
        };

        if !init.is_empty() {
            buffer.write(0, init)?;
        }

        Ok(buffer)
    }

    /// Tops up the number of free buffers to `count`, each at least `size`
    /// bytes.
    pub fn preallocate(
        &mut self,
        profile: &VideoProfile,
        count: usize,
        size: u64,
        size_align: u64,
    ) -> Result<()> {
        let free = self.available();
        let room = MAX_POOLED_BUFFERS - self.buffers.len();
        let needed = count.saturating_sub(free).min(room);

        for _ in 0..needed {
            let buf = self.allocate(profile, size.max(MIN_BITSTREAM_BUFFER_SIZE), size_align)?;
            self.buffers.push(buf);
        }

        if needed > 0 {
            debug!(count = needed, "preallocated bitstream buffers");
        }

        Ok(())
    }

    /// Drops every pooled buffer. Buffers still referenced elsewhere are
    /// destroyed when the last reference goes away.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// The number of buffers free for reuse.
    pub fn available(&self) -> usize {
        self.buffers.iter().filter(|buf| !buf.is_shared()).count()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// The number of device buffers ever allocated by the pool.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// The largest buffer ever allocated.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    fn allocate(
        &mut self,
        profile: &VideoProfile,
        size: u64,
        size_align: u64,
    ) -> Result<BitstreamBuffer> {
        let size = align_up(size, size_align);
        let buffer = self.device.create_bitstream_buffer(profile, size)?;
        self.allocations += 1;

        if size > self.max_size {
            debug!(
                size,
                previous = self.max_size,
                "bitstream buffer high-water mark increased"
            );
            self.max_size = size;
        }

        Ok(BitstreamBuffer(Arc::new(BufferInner {
            buffer,
            device: self.device.clone(),
        })))
    }
}

pub(crate) fn align_up(v: u64, align: u64) -> u64 {
    if align <= 1 {
        return v;
    }

    v.div_ceil(align) * align
}
