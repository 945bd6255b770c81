// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Orchestration for hardware video decoding with Vulkan Video.
//!
//! A [`processor::VideoProcessor`] pulls bitstream chunks from a
//! [`parser::Demuxer`] and feeds them to a [`parser::VideoParser`], which
//! calls back into a [`decoder::VideoDecoder`] to start sequences and decode
//! pictures. The decoder records and submits GPU work through a
//! [`device::DecodeDevice`], tracking every surface in a
//! [`frame_buffer::FrameBuffer`] until the consumer releases it.

pub mod bitstream;
pub mod capabilities;
pub mod codec;
pub mod color;
pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod format;
pub mod frame_buffer;
pub mod parameters;
pub mod parser;
pub mod processor;
pub mod session;
pub mod vulkan;

pub use error::{DecodeError, Result};
