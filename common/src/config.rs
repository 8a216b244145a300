use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::frame::CaptureRegion;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub stitch: StitchConfig,
    #[serde(default)]
    pub slicing: SlicingConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which strategy processes sampled frames for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Discrete pages: keep a frame whenever the region shows a new page.
    PageTurn,
    /// Horizontally scrolling strip stitched into one panorama.
    ScrollStitch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    pub region: CaptureRegion,
    #[serde(default = "default_mode")]
    pub mode: CaptureMode,
    /// SSIM below this value marks a candidate page turn.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_start_delay")]
    pub start_delay_secs: u64,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Stop automatically after this many seconds of sampling. 0 = until interrupted.
    #[serde(default)]
    pub max_duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Pixels cropped from every side before comparison (capture indicator edges).
    #[serde(default = "default_border_px")]
    pub border_px: u32,
    /// Perceptual hashes further apart than this are different pages.
    #[serde(default = "default_hash_distance")]
    pub hash_distance_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StitchConfig {
    #[serde(default = "default_template_width")]
    pub template_width: u32,
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlicingConfig {
    #[serde(default = "default_min_slice_width")]
    pub min_slice_width: u32,
    /// Target slice width. 0 = use the capture region width.
    #[serde(default)]
    pub target_width: u32,
    /// How far from a `remove_cuts` entry an existing cut may lie.
    #[serde(default = "default_remove_tolerance")]
    pub remove_tolerance: u32,
    /// Manual cuts added after automatic detection.
    #[serde(default)]
    pub add_cuts: Vec<u32>,
    /// Columns whose nearest automatic cut is removed.
    #[serde(default)]
    pub remove_cuts: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_output_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_replay_dir")]
    pub replay_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            border_px: default_border_px(),
            hash_distance_threshold: default_hash_distance(),
        }
    }
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            template_width: default_template_width(),
            match_threshold: default_match_threshold(),
        }
    }
}

impl Default for SlicingConfig {
    fn default() -> Self {
        Self {
            min_slice_width: default_min_slice_width(),
            target_width: 0,
            remove_tolerance: default_remove_tolerance(),
            add_cuts: Vec::new(),
            remove_cuts: Vec::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            prefix: default_output_prefix(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            replay_dir: default_replay_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SlicingConfig {
    /// Slice width to aim for, falling back to the capture region width.
    pub fn effective_target_width(&self, region: &CaptureRegion) -> u32 {
        if self.target_width > 0 {
            self.target_width
        } else {
            region.width
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        debug!(path = %path.display(), bytes = content.len(), "config file read");
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        debug!(
            mode = ?config.capture.mode,
            region = ?config.capture.region,
            output = %config.output.dir.display(),
            "config validated"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.capture;
        if !(c.sensitivity > 0.0 && c.sensitivity <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "capture.sensitivity must be in (0, 1], got {}",
                c.sensitivity
            )));
        }
        if c.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "capture.tick_interval_ms must be positive".into(),
            ));
        }
        c.region
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.stitch.template_width == 0 {
            return Err(ConfigError::Invalid(
                "stitch.template_width must be positive".into(),
            ));
        }
        if !(self.stitch.match_threshold > 0.0 && self.stitch.match_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "stitch.match_threshold must be in (0, 1], got {}",
                self.stitch.match_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_mode() -> CaptureMode {
    CaptureMode::PageTurn
}
fn default_sensitivity() -> f64 {
    0.9
}
fn default_start_delay() -> u64 {
    3
}
fn default_tick_interval() -> u64 {
    1000
}
fn default_border_px() -> u32 {
    5
}
fn default_hash_distance() -> u32 {
    5
}
fn default_template_width() -> u32 {
    200
}
fn default_match_threshold() -> f64 {
    0.7
}
fn default_min_slice_width() -> u32 {
    50
}
fn default_remove_tolerance() -> u32 {
    20
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("captured_scores")
}
fn default_output_prefix() -> String {
    "score".into()
}
fn default_replay_dir() -> PathBuf {
    PathBuf::from("screens")
}
fn default_log_level() -> String {
    "info".into()
}
