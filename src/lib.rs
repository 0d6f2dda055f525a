//! KMS video output engine.
//!
//! Decoded frames go through an optional deinterlace stage into scan-out
//! buffers, are paced against an audio clock and shown through atomic
//! commits on a DRM video plane, with the OSD on a second plane.

pub mod clock;
pub mod display;
pub mod error;
pub mod kms;
pub mod pipeline;
pub mod source;
pub mod utils;
pub mod video;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use clock::AudioClock;
pub use error::{BufferError, FilterError, RenderError};
pub use pipeline::render::RenderContext;
pub use video::{Frame, PixelFormat, Rational};

/// Metric names recorded through the `metrics` facade.
pub mod metric {
    pub const FRAMES_DROPPED: &str = "kmsvideo_frames_dropped";
    pub const FRAMES_DUPLICATED: &str = "kmsvideo_frames_duplicated";
    pub const COMMITS_FAILED: &str = "kmsvideo_commits_failed";
    pub const COMMIT_TIME_US: &str = "kmsvideo_commit_time_us";
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub pipeline: PipelineConfig,
    pub sync: SyncConfig,
    pub filter: FilterConfig,
}

/// A display mode the prober may pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModePreference {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
}

impl ModePreference {
    pub const fn new(width: u32, height: u32, refresh: u32) -> Self {
        Self {
            width,
            height,
            refresh,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Card node to use; scan `/dev/dri/card0..` when unset.
    pub path: Option<PathBuf>,
    pub scan_count: u32,
    /// Earlier entries win.
    pub modes: Vec<ModePreference>,
    pub black_width: u32,
    pub black_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ring_capacity: usize,
    pub pool_limit: usize,
    pub poll_interval_ms: u64,
    /// Frames queued before a newly started display thread commits.
    pub start_threshold: usize,
    pub flip_timeout_ms: u64,
    pub display_core: Option<usize>,
}

/// AV sync tunables. All values in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub audio_delay_ms: i64,
    pub drop_threshold_ms: i64,
    pub duplicate_threshold_ms: i64,
    pub desync_guard_ms: i64,
    pub duplicate_wait_ms: u64,
    pub audio_poll_ms: u64,
    pub trick_step_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub deinterlace: bool,
    /// Also run interlaced NV12 software frames through the deinterlacer.
    pub software_deinterlacer: bool,
    /// Override hardware deinterlacer detection.
    pub hw_deinterlace: Option<bool>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: None,
            scan_count: 2,
            modes: vec![
                ModePreference::new(1920, 1080, 50),
                ModePreference::new(1280, 720, 50),
                ModePreference::new(1920, 1080, 60),
                ModePreference::new(1280, 720, 60),
            ],
            black_width: 720,
            black_height: 576,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 3,
            pool_limit: 36,
            poll_interval_ms: 10,
            start_threshold: 2,
            flip_timeout_ms: 100,
            display_core: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            audio_delay_ms: 0,
            drop_threshold_ms: -5,
            duplicate_threshold_ms: 35,
            desync_guard_ms: 5000,
            duplicate_wait_ms: 20,
            audio_poll_ms: 20,
            trick_step_ms: 20,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            deinterlace: true,
            software_deinterlacer: false,
            hw_deinterlace: None,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file if given, then `KMSVIDEO_*` environment
    /// overrides (`KMSVIDEO_SYNC__AUDIO_DELAY_MS=40`).
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder
            .add_source(
                config::Environment::with_prefix("KMSVIDEO")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// Render statistics, as reported by `RenderContext::get_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub duplicated: u64,
    pub dropped: u64,
    pub start_count: u64,
}

/// Output geometry, as reported by `RenderContext::get_screen_size`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
    pub pixel_aspect: f64,
}
