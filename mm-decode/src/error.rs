// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use ash::vk;

use crate::codec::VideoCodec;

/// Errors returned by the decoder and the components it drives.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("codec {0} is not supported by the decode queue")]
    UnsupportedCodec(VideoCodec),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("unsupported capabilities: {0}")]
    UnsupportedCapabilities(String),
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
    #[error("image pool allocated {achieved} surfaces, but {requested} were requested")]
    SurfaceCountMismatch { requested: u32, achieved: u32 },
    #[error("{requested} decode surfaces requested, but at most {max} are supported")]
    TooManySurfaces { requested: u32, max: u32 },
    #[error("invalid picture index {0}")]
    InvalidSlot(u32),
    #[error("picture index {expected} was queued as {actual}")]
    SlotIndexMismatch { expected: u32, actual: u32 },
    #[error("picture index {0} is still in use")]
    SlotBusy(u32),
    #[error("picture index {0} released twice")]
    DoubleRelease(u32),
    #[error("release of picture index {index} doesn't match the dequeued frame")]
    ReleaseMismatch { index: u32 },
    #[error("invalid layout transition for picture index {index}: {from:?} -> {to:?}")]
    InvalidLayoutTransition {
        index: u32,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },
    #[error("no session parameters available for picture")]
    MissingParameters,
    #[error("missing {kind} with id {id}")]
    MissingParameterSet { kind: &'static str, id: u32 },
    #[error("{kind} id {id} out of range (max {max})")]
    ParameterIdOutOfRange {
        kind: &'static str,
        id: u32,
        max: u32,
    },
    #[error("no video sequence has been started")]
    NotInitialized,
    #[error("write of {len} bytes at offset {offset} overflows bitstream buffer of size {size}")]
    BitstreamOverflow { offset: u64, len: u64, size: u64 },
    #[error("failed to create post-process filter: {0}")]
    FilterCreation(String),
    #[error("decode submission failed: {0}")]
    Submission(vk::Result),
    #[error("decode submitted, but the filter pass failed: {0}")]
    FilterSubmission(vk::Result),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("parser error: {0}")]
    Parser(String),
}

impl DecodeError {
    /// Whether the error only affects the current frame, leaving the stream
    /// decodable.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            DecodeError::Submission(_) | DecodeError::FilterSubmission(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;
