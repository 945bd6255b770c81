// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Interfaces between the decoder and the bitstream side: the codec parser
//! that drives decoding, and the demuxer that feeds it.

use std::fs::File;
use std::io::{BufReader, Read as _, Seek as _, SeekFrom};
use std::path::Path;

use anyhow::{anyhow, Context as _};
use bytes::{Bytes, BytesMut};

use crate::bitstream::BitstreamBuffer;
use crate::codec::VideoCodec;
use crate::decoder::{CodecPictureInfo, CodecReferenceInfo};
use crate::error::Result;
use crate::format::{BitDepth, ChromaSubsampling, VideoFormat};
use crate::parameters::{ParameterSet, ParametersRef};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PictureFlags {
    pub progressive: bool,
    pub field: bool,
    pub bottom_field: bool,
    pub reference: bool,
    pub intra: bool,
    pub idr: bool,
}

/// Per-picture metadata that travels with the frame to the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodePictureInfo {
    pub timestamp: i64,
    pub display_width: u32,
    pub display_height: u32,
    pub flags: PictureFlags,
}

/// A reference picture used by the current picture.
#[derive(Debug, Clone)]
pub struct ReferencePicture {
    pub picture_index: u32,
    pub slot_index: i32,
    pub codec: CodecReferenceInfo,
}

/// The DPB slot the current picture is decoded into, if it is kept as a
/// reference.
#[derive(Debug, Clone)]
pub struct SetupSlot {
    pub slot_index: i32,
    pub codec: CodecReferenceInfo,
}

/// Everything the decoder needs to decode one picture.
#[derive(Debug, Clone)]
pub struct PictureParameters {
    /// The slot, obtained from `PictureQueue::reserve_picture`.
    pub picture_index: u32,
    pub setup: Option<SetupSlot>,
    pub bitstream: BitstreamBuffer,
    pub bitstream_offset: u64,
    pub bitstream_length: u64,
    pub references: Vec<ReferencePicture>,
    /// The parameters object the picture was parsed against.
    pub parameters: Option<ParametersRef>,
    pub picture: CodecPictureInfo,
}

/// Implemented by the decoder, and called by the parser.
pub trait DecodeHandler {
    /// Called when the parser detects a new sequence, or a change in format.
    /// Returns the number of decode surfaces allocated.
    fn on_sequence_start(&mut self, format: &VideoFormat) -> Result<u32>;

    /// Called for each complete picture, in decode order. Returns the
    /// picture index.
    fn on_picture_ready(
        &mut self,
        params: &PictureParameters,
        info: &DecodePictureInfo,
    ) -> Result<u32>;

    /// Called for each parameter set, in bitstream order.
    fn update_parameters(&mut self, set: ParameterSet) -> Result<ParametersRef>;

    /// Returns a buffer of at least `size` bytes, with `init` copied to the
    /// start.
    fn bitstream_buffer(&mut self, size: u64, init: &[u8]) -> Result<BitstreamBuffer>;
}

/// Implemented by the frame buffer, and called by the parser to manage
/// pictures.
pub trait PictureQueue {
    /// Reserves a free slot for a new picture, holding one reference.
    fn reserve_picture(&self) -> Option<u32>;
    fn add_ref(&self, index: u32) -> Result<()>;
    fn release_ref(&self, index: u32) -> Result<()>;

    /// Queues a decoded picture for display. Pictures are queued in display
    /// order.
    fn queue_for_display(&self, index: u32, timestamp: Option<i64>) -> Result<()>;
}

/// A codec parser.
pub trait VideoParser {
    /// Parses a chunk of bitstream, calling back into `handler` and
    /// `pictures`. A `None` chunk signals the end of the stream, and flushes
    /// every remaining picture to display. Returns the number of bytes
    /// consumed.
    fn parse(
        &mut self,
        chunk: Option<&[u8]>,
        handler: &mut dyn DecodeHandler,
        pictures: &dyn PictureQueue,
    ) -> Result<usize>;

    /// Discards all parser state, releasing any pictures still referenced,
    /// before the stream is restarted.
    fn reset(&mut self, _pictures: &dyn PictureQueue) -> Result<()> {
        Ok(())
    }
}

/// Stream properties known to the demuxer. Elementary streams only know the
/// codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    pub codec: VideoCodec,
    pub codec_profile: Option<u32>,
    pub chroma_subsampling: Option<ChromaSubsampling>,
    pub luma_bit_depth: Option<BitDepth>,
    pub chroma_bit_depth: Option<BitDepth>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl StreamMetadata {
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            codec_profile: None,
            chroma_subsampling: None,
            luma_bit_depth: None,
            chroma_bit_depth: None,
            width: None,
            height: None,
        }
    }
}

pub trait Demuxer {
    fn metadata(&self) -> &StreamMetadata;

    /// Whether the demuxer splits the stream into frames. If not, the stream
    /// is read with `read_bitstream_data`.
    fn is_demuxing(&self) -> bool;

    /// Returns the next frame, or `None` at the end of the stream.
    fn demux_frame(&mut self) -> anyhow::Result<Option<Bytes>>;

    /// Returns data starting at `offset`. Empty at the end of the stream.
    fn read_bitstream_data(&mut self, offset: u64) -> anyhow::Result<Bytes>;

    fn rewind(&mut self) -> anyhow::Result<()>;
}

const READ_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Reads a raw elementary stream from a file, leaving it to the parser to
/// find picture boundaries.
pub struct ElementaryStreamReader {
    file: BufReader<File>,
    metadata: StreamMetadata,
    chunk_size: usize,
    position: u64,
}

impl ElementaryStreamReader {
    pub fn open(path: impl AsRef<Path>, codec: Option<VideoCodec>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let codec = match codec {
            Some(codec) => codec,
            None => codec_from_path(path)
                .ok_or_else(|| anyhow!("unable to determine codec for {}", path.display()))?,
        };

        let file = File::open(path).context("failed to open video file")?;
        Ok(Self {
            file: BufReader::new(file),
            metadata: StreamMetadata::new(codec),
            chunk_size: READ_CHUNK_SIZE,
            position: 0,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn read_at(&mut self, offset: u64) -> anyhow::Result<Bytes> {
        if offset != self.position {
            self.file.seek(SeekFrom::Start(offset))?;
            self.position = offset;
        }

        let mut buf = BytesMut::zeroed(self.chunk_size);
        let mut len = 0;
        while len < buf.len() {
            match self.file.read(&mut buf[len..])? {
                0 => break,
                n => len += n,
            }
        }

        buf.truncate(len);
        self.position += len as u64;
        Ok(buf.freeze())
    }
}

impl Demuxer for ElementaryStreamReader {
    fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    fn is_demuxing(&self) -> bool {
        false
    }

    fn demux_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        let chunk = self.read_at(self.position)?;
        Ok(if chunk.is_empty() { None } else { Some(chunk) })
    }

    fn read_bitstream_data(&mut self, offset: u64) -> anyhow::Result<Bytes> {
        self.read_at(offset)
    }

    fn rewind(&mut self) -> anyhow::Result<()> {
        self.file.rewind()?;
        self.position = 0;
        Ok(())
    }
}

/// Guesses the codec of an elementary stream from its file extension.
pub fn codec_from_path(path: &Path) -> Option<VideoCodec> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "h264" | "264" | "avc" => Some(VideoCodec::H264),
        "h265" | "265" | "hevc" => Some(VideoCodec::H265),
        "obu" | "av1" => Some(VideoCodec::Av1),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    fn temp_stream(name: &str, len: usize) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("mmdecode-{}-{}", std::process::id(), name));
        let mut f = File::create(&path).unwrap();
        let data = (0..len).map(|i| i as u8).collect::<Vec<_>>();
        f.write_all(&data).unwrap();
        path
    }

    #[test]
    fn codec_from_extension() {
        assert_eq!(codec_from_path(Path::new("a/b.264")), Some(VideoCodec::H264));
        assert_eq!(codec_from_path(Path::new("clip.HEVC")), Some(VideoCodec::H265));
        assert_eq!(codec_from_path(Path::new("clip.obu")), Some(VideoCodec::Av1));
        assert_eq!(codec_from_path(Path::new("clip.mkv")), None);
        assert_eq!(codec_from_path(Path::new("clip")), None);
    }

    #[test]
    fn elementary_stream_chunks() {
        let path = temp_stream("chunks.h264", 10);
        let mut reader = ElementaryStreamReader::open(&path, None)
            .unwrap()
            .with_chunk_size(4);

        assert_eq!(reader.metadata().codec, VideoCodec::H264);
        assert!(!reader.is_demuxing());

        assert_eq!(reader.read_bitstream_data(0).unwrap(), &[0, 1, 2, 3][..]);
        assert_eq!(reader.read_bitstream_data(8).unwrap(), &[8, 9][..]);
        assert!(reader.read_bitstream_data(10).unwrap().is_empty());

        // Non-sequential reads seek.
        assert_eq!(reader.read_bitstream_data(2).unwrap(), &[2, 3, 4, 5][..]);

        reader.rewind().unwrap();
        assert_eq!(reader.demux_frame().unwrap().unwrap(), &[0, 1, 2, 3][..]);
        assert_eq!(reader.demux_frame().unwrap().unwrap(), &[4, 5, 6, 7][..]);
        assert_eq!(reader.demux_frame().unwrap().unwrap(), &[8, 9][..]);
        assert_eq!(reader.demux_frame().unwrap(), None);

        std::fs::remove_file(path).unwrap();
    }
}
