// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Drives a stream through the parser and decoder, and hands decoded frames
//! to the consumer in display order.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use ash::vk;
use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ProcessorConfig;
use crate::decoder::VideoDecoder;
use crate::device::DeviceRef;
use crate::error::{DecodeError, Result};
use crate::frame_buffer::{DecodedFrame, FrameBuffer, FrameRelease};
use crate::parser::{Demuxer, VideoParser};

const READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Completed,
}

pub struct VideoProcessor<P, D> {
    decoder: VideoDecoder,
    frame_buffer: Arc<FrameBuffer>,
    parser: P,
    demuxer: D,
    config: ProcessorConfig,

    state: StreamState,
    /// The read position, for demuxers that don't split frames.
    offset: u64,
    loops_remaining: u32,
    frames_delivered: u64,
}

impl<P: VideoParser, D: Demuxer> VideoProcessor<P, D> {
    pub fn new(decoder: VideoDecoder, parser: P, demuxer: D, config: ProcessorConfig) -> Self {
        let frame_buffer = decoder.frame_buffer().clone();

        Self {
            decoder,
            frame_buffer,
            parser,
            demuxer,
            loops_remaining: config.loop_count.get(),
            config,
            state: StreamState::Idle,
            offset: 0,
            frames_delivered: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn decoder(&self) -> &VideoDecoder {
        &self.decoder
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }

    pub fn demuxer(&self) -> &D {
        &self.demuxer
    }

    /// The number of frames returned by `get_next_frame` so far.
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    /// Returns the next frame in display order, parsing and decoding as much
    /// of the stream as necessary. Returns `None` once the stream is
    /// complete. Every frame must be passed back to `release_frame`.
    pub fn get_next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        if self.state == StreamState::Idle {
            debug!(codec = ?self.demuxer.metadata().codec, "starting stream");
            self.state = StreamState::Streaming;
        }

        if self
            .config
            .max_frame_count
            .is_some_and(|max| self.frames_delivered >= max)
            && self.state != StreamState::Completed
        {
            info!(frames = self.frames_delivered, "reached maximum frame count");
            self.finish();
        }

        loop {
            if let Some(frame) = self.frame_buffer.dequeue() {
                self.frames_delivered += 1;
                return Ok(Some(frame));
            }

            if self.state == StreamState::Completed {
                return Ok(None);
            }

            self.process_next_chunk()?;
        }
    }

    pub fn release_frame(&self, release: FrameRelease) -> Result<()> {
        self.frame_buffer.release_displayed(&[release])
    }

    /// The decode status of a frame, if the device reports it. `None` if the
    /// status isn't available.
    pub fn frame_status(&self, frame: &DecodedFrame) -> Result<Option<vk::QueryResultStatusKHR>> {
        match frame.query {
            Some(query) => self.decoder.device().query_status(query.pool, query.index),
            None => Ok(None),
        }
    }

    fn process_next_chunk(&mut self) -> Result<()> {
        let chunk = match self.next_chunk() {
            Ok(chunk) => chunk,
            Err(e) => {
                error!("failed to read bitstream: {:#}", e);
                self.finish();
                return Ok(());
            }
        };

        if chunk.is_empty() {
            // Flush the pictures the parser is still holding.
            if let Err(e) = self
                .parser
                .parse(None, &mut self.decoder, &*self.frame_buffer)
            {
                warn!("error flushing parser: {}", e);
            }

            return self.stream_completed();
        }

        match self
            .parser
            .parse(Some(&chunk), &mut self.decoder, &*self.frame_buffer)
        {
            Ok(0) => {
                error!(offset = self.offset, "parser made no progress");
                self.finish();
            }
            Ok(consumed) => self.offset += consumed as u64,
            Err(e) if e.is_frame_local() => {
                warn!(offset = self.offset, "dropping frame: {}", e);
                self.offset += chunk.len() as u64;
            }
            Err(e) => {
                error!(offset = self.offset, "parse error: {}", e);
                self.finish();
            }
        }

        Ok(())
    }

    fn next_chunk(&mut self) -> anyhow::Result<Bytes> {
        if self.demuxer.is_demuxing() {
            Ok(self.demuxer.demux_frame()?.unwrap_or_default())
        } else {
            self.demuxer.read_bitstream_data(self.offset)
        }
    }

    fn stream_completed(&mut self) -> Result<()> {
        self.loops_remaining = self.loops_remaining.saturating_sub(1);
        if self.loops_remaining == 0 {
            info!(frames = self.frames_delivered, "stream completed");
            self.state = StreamState::Completed;
            return Ok(());
        }

        info!(loops_remaining = self.loops_remaining, "restarting stream");
        if let Err(e) = self.demuxer.rewind() {
            error!("failed to rewind stream: {:#}", e);
            self.state = StreamState::Completed;
            return Ok(());
        }

        self.offset = 0;
        self.parser.reset(&*self.frame_buffer)
    }

    /// Stops the stream, discarding any frames not yet delivered.
    fn finish(&mut self) {
        let dropped = self.frame_buffer.flush_display_queue();
        if dropped > 0 {
            debug!(dropped, "discarded queued frames");
        }

        self.state = StreamState::Completed;
    }
}

/// Writes frames as raw, tightly packed planes.
pub struct FrameWriter<W> {
    device: DeviceRef,
    out: W,
    buf: Vec<u8>,
    frames_written: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(device: DeviceRef, out: W) -> Self {
        Self {
            device,
            out,
            buf: Vec::new(),
            frames_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Waits for the frame to be ready, then writes its linear image. Frames
    /// without a linear image can't be read back.
    #[instrument(level = "trace", skip_all)]
    pub fn write_frame(&mut self, frame: &DecodedFrame) -> anyhow::Result<()> {
        let picture = frame
            .linear
            .ok_or_else(|| anyhow!("frame {} has no linear image", frame.picture_index))?;

        let ready =
            self.device
                .wait_semaphore(frame.ready.semaphore, frame.ready.value, READY_TIMEOUT)?;
        if !ready {
            return Err(DecodeError::Timeout("frame ready").into());
        }

        let extent = vk::Extent2D {
            width: frame.display_extent.width.min(picture.extent.width),
            height: frame.display_extent.height.min(picture.extent.height),
        };

        self.device.read_image(&picture, extent, &mut self.buf)?;
        self.out
            .write_all(&self.buf)
            .context("failed to write frame")?;

        self.frames_written += 1;
        Ok(())
    }
}
