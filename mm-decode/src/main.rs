// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

use mm_decode::capabilities::{decode_capabilities, supported_video_formats, VideoProfile};
use mm_decode::codec::VideoCodec;
use mm_decode::config::Config;
use mm_decode::device::DecodeDevice;
use mm_decode::format::{BitDepth, ChromaSubsampling};
use mm_decode::vulkan::{VkContext, VkDecodeDevice};

#[derive(Debug, Parser)]
#[command(name = "mmdecode")]
#[command(about = "Inspect Vulkan Video decode support", long_about = None)]
struct Cli {
    /// Print the version.
    #[arg(short, long)]
    version: bool,
    /// The path to a config file. Values not set there are taken from the
    /// bundled defaults.
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Only report on this codec (h264, h265 or av1).
    #[arg(long)]
    codec: Option<VideoCodec>,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let version = format!(
        "mmdecode {}",
        git_version::git_version!(
            args = ["--always", "--tags", "--match", "mmdecode-v"],
            prefix = "git:",
            cargo_prefix = "",
        )
    );

    if args.version {
        println!("{}", version);
        return Ok(());
    }

    init_logging()?;
    debug!(version, "starting up");

    let cfg = Config::new(args.config.as_ref()).context("failed to read config")?;
    debug!(?cfg, "loaded configuration");

    let enable_debug = std::env::var("MM_DECODE_VULKAN_DEBUG").is_ok();
    let vk = Arc::new(VkContext::new(enable_debug).context("initializing vulkan")?);
    let device = VkDecodeDevice::new(vk.clone());

    if cfg.decoder.queue_index >= device.decode_queue_count() {
        warn!(
            queue_index = cfg.decoder.queue_index,
            queues = device.decode_queue_count(),
            "configured decode queue doesn't exist"
        );
    }

    println!(
        "{}: decode family {} ({} queues), compute family {}",
        vk.device_info.device_name.to_string_lossy(),
        device.decode_queue_family(),
        device.decode_queue_count(),
        device
            .compute_queue_family()
            .map_or_else(|| "none".to_string(), |f| f.to_string()),
    );

    let codecs = match args.codec {
        Some(codec) => vec![codec],
        None => VideoCodec::ALL.to_vec(),
    };

    for codec in codecs {
        if !device.decode_operations().contains(codec.decode_operation()) {
            println!("{}: not supported", codec);
            continue;
        }

        if let Err(e) = report_codec(&device, codec) {
            println!("{}: {:#}", codec, e);
        }
    }

    info!("done");
    Ok(())
}

/// The most widely supported profile for each codec: 8-bit 4:2:0, progressive.
fn default_profile(codec: VideoCodec) -> VideoProfile {
    let codec_profile = match codec {
        // High
        VideoCodec::H264 => 100,
        // Main
        VideoCodec::H265 => 1,
        VideoCodec::Av1 => 0,
    };

    VideoProfile {
        codec,
        chroma_subsampling: ChromaSubsampling::Yuv420,
        luma_bit_depth: BitDepth::Eight,
        chroma_bit_depth: BitDepth::Eight,
        codec_profile,
        progressive: true,
    }
}

fn report_codec(device: &VkDecodeDevice, codec: VideoCodec) -> Result<()> {
    let profile = default_profile(codec);
    let (caps, decode_caps) = decode_capabilities(device, &profile)?;
    let (output_format, dpb_format) = supported_video_formats(device, &profile, &decode_caps)?;

    let all_formats = device.video_formats(
        &profile,
        vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR | vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR,
    )?;

    println!("{}:", codec);
    println!(
        "  coded extent: {}x{} to {}x{}",
        caps.min_coded_extent.width,
        caps.min_coded_extent.height,
        caps.max_coded_extent.width,
        caps.max_coded_extent.height
    );
    println!(
        "  dpb slots: {}, active references: {}",
        caps.max_dpb_slots, caps.max_active_reference_pictures
    );
    println!(
        "  bitstream alignment: offset {}, size {}",
        caps.min_bitstream_buffer_offset_alignment, caps.min_bitstream_buffer_size_alignment
    );
    println!(
        "  output: {}",
        if decode_caps.dpb_and_output_coincide() {
            "coincides with dpb"
        } else {
            "distinct from dpb"
        }
    );
    println!("  formats: output {:?}, dpb {:?}", output_format, dpb_format);
    println!("  all decode formats: {:?}", all_formats);

    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    // The library logs under its own crate name.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new("mmdecode=info,mm_decode=info")?,
    };

    let printed_log = tracing_subscriber::fmt::layer().with_filter(filter);

    tracing_subscriber::registry().with(printed_log).init();

    Ok(())
}
