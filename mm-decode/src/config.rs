// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{bail, Context};
use lazy_static::lazy_static;
use tracing::trace;

use std::{num::NonZeroU32, path::PathBuf};

use crate::bitstream::MAX_POOLED_BUFFERS;
use crate::frame_buffer::MAX_IMAGES;

lazy_static! {
    static ref DEFAULT_CFG: parsed::Config =
        toml::from_str(include_str!("../mmdecode.default.toml")).unwrap();
}

/// Serde representations of the configuration files.
mod parsed {
    use converge::Converge;
    use serde::Deserialize;
    use std::num::NonZeroU32;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub(super) enum FilterFailure {
        Disable,
        Fail,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    pub(super) struct Config {
        #[converge(nest)]
        pub(super) decoder: Option<DecoderConfig>,
        #[converge(nest)]
        pub(super) processor: Option<ProcessorConfig>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct DecoderConfig {
        pub(super) images_in_flight: Option<u32>,
        pub(super) images_to_preallocate: Option<u32>,
        pub(super) bitstream_buffers_to_preallocate: Option<u32>,
        pub(super) queue_index: Option<u32>,
        pub(super) hw_load_balancing: Option<bool>,
        pub(super) linear_output: Option<bool>,
        pub(super) post_process_filter: Option<bool>,
        pub(super) filter_failure: Option<FilterFailure>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct ProcessorConfig {
        pub(super) loop_count: Option<NonZeroU32>,
        pub(super) max_frame_count: Option<u64>,
    }
}

/// What to do if the post-process filter can't be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterFailurePolicy {
    /// Log a warning and continue without the filter.
    Disable,
    /// Fail the sequence.
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub decoder: DecoderConfig,
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    pub images_in_flight: u32,
    /// Defaults to every surface.
    pub images_to_preallocate: Option<u32>,
    pub bitstream_buffers_to_preallocate: u32,
    pub queue_index: u32,
    pub hw_load_balancing: bool,
    pub linear_output: bool,
    pub post_process_filter: bool,
    pub filter_failure: FilterFailurePolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub loop_count: NonZeroU32,
    pub max_frame_count: Option<u64>,
}

impl Config {
    pub fn new(path: Option<&PathBuf>) -> anyhow::Result<Config> {
        let cfg = if let Some(file) = path {
            let content = std::fs::read_to_string(file)
                .context(format!("reading configuration file {}", file.display()))?;
            let parsed: parsed::Config = toml::from_str(&content)
                .context(format!("parsing configuration file {}", file.display()))?;

            Some(parsed)
        } else {
            None
        };

        let this = Self::build(cfg)?;
        this.validate()?;
        Ok(this)
    }

    fn build(cfg: Option<parsed::Config>) -> anyhow::Result<Self> {
        // This is the parsed mmdecode.default.toml.
        let defaults = DEFAULT_CFG.clone();

        let input = if let Some(cfg) = cfg {
            // Merge the default config with the input config, giving the input
            // precedence.
            use converge::Converge;
            cfg.converge(defaults)
        } else {
            defaults
        };

        // We only unwrap values that should have been set in the default
        // config. This is verified by a test.
        let decoder = input.decoder.unwrap();
        let processor = input.processor.unwrap();

        let this = Config {
            decoder: DecoderConfig {
                images_in_flight: decoder.images_in_flight.unwrap(),
                images_to_preallocate: decoder.images_to_preallocate,
                bitstream_buffers_to_preallocate: decoder
                    .bitstream_buffers_to_preallocate
                    .unwrap(),
                queue_index: decoder.queue_index.unwrap(),
                hw_load_balancing: decoder.hw_load_balancing.unwrap(),
                linear_output: decoder.linear_output.unwrap(),
                post_process_filter: decoder.post_process_filter.unwrap(),
                filter_failure: match decoder.filter_failure.unwrap() {
                    parsed::FilterFailure::Disable => FilterFailurePolicy::Disable,
                    parsed::FilterFailure::Fail => FilterFailurePolicy::Fail,
                },
            },
            processor: ProcessorConfig {
                loop_count: processor.loop_count.unwrap(),
                max_frame_count: processor.max_frame_count,
            },
        };

        trace!("using config: {:#?}", this);
        Ok(this)
    }

    /// Performs high-level validation on the final configuration.
    fn validate(&self) -> anyhow::Result<()> {
        let decoder = &self.decoder;
        if decoder.images_in_flight == 0 || decoder.images_in_flight > MAX_IMAGES {
            bail!("images_in_flight must be between 1 and {}", MAX_IMAGES);
        }

        match decoder.images_to_preallocate {
            Some(n) if n > MAX_IMAGES => {
                bail!("images_to_preallocate must be at most {}", MAX_IMAGES);
            }
            _ => {}
        }

        if decoder.bitstream_buffers_to_preallocate as usize > MAX_POOLED_BUFFERS {
            bail!(
                "bitstream_buffers_to_preallocate must be at most {}",
                MAX_POOLED_BUFFERS
            );
        }

        if self.processor.max_frame_count == Some(0) {
            bail!("max_frame_count must be positive");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::build(None).expect("failed to build default config")
    }
}
