use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::buffer::{GapPolicy, MediaType, RangeOptions, Timestamp};

const DEFAULT_CONFIG_PATH: &str = "sourcebuf.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("default buffer duration must be positive")]
    InvalidBufferDuration,
}

fn default_preroll_warnings() -> u32 {
    10
}

fn default_dts_beyond_pts_warnings() -> u32 {
    10
}

fn default_audio_non_keyframe_warnings() -> u32 {
    10
}

fn default_keyframe_time_warnings() -> u32 {
    1
}

fn default_muxed_sequence_mode_warnings() -> u32 {
    1
}

/// Per-category caps on how often a parse warning is reported.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_preroll_warnings")]
    pub max_dropped_preroll_warnings: u32,
    #[serde(default = "default_dts_beyond_pts_warnings")]
    pub max_dts_beyond_pts_warnings: u32,
    #[serde(default = "default_audio_non_keyframe_warnings")]
    pub max_audio_non_keyframe_warnings: u32,
    #[serde(default = "default_keyframe_time_warnings")]
    pub max_keyframe_time_greater_than_dependant_warnings: u32,
    #[serde(default = "default_muxed_sequence_mode_warnings")]
    pub max_muxed_sequence_mode_warnings: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_dropped_preroll_warnings: default_preroll_warnings(),
            max_dts_beyond_pts_warnings: default_dts_beyond_pts_warnings(),
            max_audio_non_keyframe_warnings: default_audio_non_keyframe_warnings(),
            max_keyframe_time_greater_than_dependant_warnings: default_keyframe_time_warnings(),
            max_muxed_sequence_mode_warnings: default_muxed_sequence_mode_warnings(),
        }
    }
}

fn default_buffer_duration_ms() -> i64 {
    125
}

fn default_video_memory_limit() -> usize {
    150 * 1024 * 1024
}

fn default_audio_memory_limit() -> usize {
    12 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub gap_policy: GapPolicy,
    #[serde(default = "default_buffer_duration_ms")]
    pub default_buffer_duration_ms: i64,
    #[serde(default = "default_video_memory_limit")]
    pub video_memory_limit_bytes: usize,
    #[serde(default = "default_audio_memory_limit")]
    pub audio_memory_limit_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            gap_policy: GapPolicy::default(),
            default_buffer_duration_ms: default_buffer_duration_ms(),
            video_memory_limit_bytes: default_video_memory_limit(),
            audio_memory_limit_bytes: default_audio_memory_limit(),
        }
    }
}

impl StreamConfig {
    pub fn range_options(&self) -> RangeOptions {
        RangeOptions {
            gap_policy: self.gap_policy,
            default_buffer_duration: Timestamp::from_millis(self.default_buffer_duration_ms),
        }
    }

    pub fn memory_limit(&self, media_type: MediaType) -> usize {
        match media_type {
            MediaType::Audio => self.audio_memory_limit_bytes,
            MediaType::Video | MediaType::Text => self.video_memory_limit_bytes,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

impl Config {
    /// Loads `sourcebuf.toml` from the working directory, falling back to
    /// defaults when it does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        if !Path::new(DEFAULT_CONFIG_PATH).exists() {
            return Ok(Self::default());
        }
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;

        if config.stream.default_buffer_duration_ms <= 0 {
            return Err(ConfigError::InvalidBufferDuration);
        }

        Ok(config)
    }
}
