//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackendKind {
    /// Plays back a directory of still images
    Replay,
    /// Native camera (requires the `webcam` feature)
    Webcam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Rear camera, pointing away from the operator
    Environment,
    User,
}

impl FacingMode {
    pub fn as_str(&self) -> &str {
        match self {
            FacingMode::Environment => "environment",
            FacingMode::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyPreference {
    Auto,
    Detector,
    Software,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_backend")]
    pub backend: CameraBackendKind,
    /// Device name fragment or index; None picks by facing mode
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_facing")]
    pub facing: FacingMode,
    #[serde(default = "default_ideal_width")]
    pub ideal_width: u32,
    #[serde(default = "default_ideal_height")]
    pub ideal_height: u32,
    #[serde(default = "default_ideal_frame_rate")]
    pub ideal_frame_rate: u32,
    #[serde(default = "default_replay_dir")]
    pub replay_dir: String,
    #[serde(default = "default_replay_loop")]
    pub replay_loop: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: default_camera_backend(),
            device: None,
            facing: default_facing(),
            ideal_width: default_ideal_width(),
            ideal_height: default_ideal_height(),
            ideal_frame_rate: default_ideal_frame_rate(),
            replay_dir: default_replay_dir(),
            replay_loop: default_replay_loop(),
        }
    }
}

fn default_camera_backend() -> CameraBackendKind {
    CameraBackendKind::Replay
}

fn default_facing() -> FacingMode {
    FacingMode::Environment
}

fn default_ideal_width() -> u32 {
    1280
}

fn default_ideal_height() -> u32 {
    720
}

fn default_ideal_frame_rate() -> u32 {
    30
}

fn default_replay_dir() -> String {
    "frames".to_string()
}

fn default_replay_loop() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecodeConfig {
    #[serde(default = "default_strategy")]
    pub strategy: StrategyPreference,
    /// Scan loop tick period (animation-frame equivalent)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Minimum spacing between software decode attempts
    #[serde(default = "default_software_interval_ms")]
    pub software_interval_ms: u64,
    /// Side of the centered crop as a fraction of the shorter frame dimension
    #[serde(default = "default_software_crop_ratio")]
    pub software_crop_ratio: f32,
    /// Square resolution the crop is downsampled to before decoding
    #[serde(default = "default_software_resolution")]
    pub software_resolution: u32,
    /// Upper bound on concurrent detector calls
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            tick_interval_ms: default_tick_interval_ms(),
            software_interval_ms: default_software_interval_ms(),
            software_crop_ratio: default_software_crop_ratio(),
            software_resolution: default_software_resolution(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_strategy() -> StrategyPreference {
    StrategyPreference::Auto
}

fn default_tick_interval_ms() -> u64 {
    16
}

fn default_software_interval_ms() -> u64 {
    50
}

fn default_software_crop_ratio() -> f32 {
    0.85
}

fn default_software_resolution() -> u32 {
    300
}

fn default_max_in_flight() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_found_cooldown_ms")]
    pub found_cooldown_ms: u64,
    #[serde(default = "default_miss_cooldown_ms")]
    pub miss_cooldown_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            found_cooldown_ms: default_found_cooldown_ms(),
            miss_cooldown_ms: default_miss_cooldown_ms(),
        }
    }
}

fn default_found_cooldown_ms() -> u64 {
    2000
}

fn default_miss_cooldown_ms() -> u64 {
    1200
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MatcherConfig {
    /// Badge URL prefix, e.g. "https://checkin.example/checkin/"
    #[serde(default)]
    pub checkin_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_directory_file")]
    pub file: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self { file: default_directory_file() }
    }
}

fn default_directory_file() -> String {
    "participants.json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    camera: CameraConfig,
    decode: DecodeConfig,
    debounce: DebounceConfig,
    checkin_base_url: Option<String>,
    directory_file: String,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            camera: toml_config.camera,
            decode: toml_config.decode,
            debounce: toml_config.debounce,
            checkin_base_url: toml_config
                .matcher
                .checkin_base_url
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty()),
            directory_file: toml_config.directory.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from an explicit path, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.decode.tick_interval_ms == 0 {
            bail!("decode.tick_interval_ms must be > 0");
        }
        if self.decode.software_interval_ms == 0 {
            bail!("decode.software_interval_ms must be > 0");
        }
        let ratio = self.decode.software_crop_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            bail!("decode.software_crop_ratio must be in (0, 1], got {ratio}");
        }
        if self.decode.software_resolution < 64 {
            bail!("decode.software_resolution must be >= 64");
        }
        if self.decode.max_in_flight == 0 {
            bail!("decode.max_in_flight must be > 0");
        }
        if self.camera.ideal_frame_rate == 0 {
            bail!("camera.ideal_frame_rate must be > 0");
        }
        if self.metrics_interval_secs == 0 {
            bail!("metrics.interval_secs must be > 0");
        }
        Ok(())
    }

    // Getters for all config fields
    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn camera_backend(&self) -> CameraBackendKind {
        self.camera.backend
    }

    pub fn strategy_preference(&self) -> StrategyPreference {
        self.decode.strategy
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.decode.tick_interval_ms)
    }

    pub fn software_interval(&self) -> Duration {
        Duration::from_millis(self.decode.software_interval_ms)
    }

    pub fn software_crop_ratio(&self) -> f32 {
        self.decode.software_crop_ratio
    }

    pub fn software_resolution(&self) -> u32 {
        self.decode.software_resolution
    }

    pub fn max_in_flight(&self) -> usize {
        self.decode.max_in_flight
    }

    pub fn found_cooldown(&self) -> Duration {
        Duration::from_millis(self.debounce.found_cooldown_ms)
    }

    pub fn miss_cooldown(&self) -> Duration {
        Duration::from_millis(self.debounce.miss_cooldown_ms)
    }

    pub fn checkin_base_url(&self) -> Option<&str> {
        self.checkin_base_url.as_deref()
    }

    pub fn directory_file(&self) -> &str {
        &self.directory_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // Builder methods, mostly for tests and the CLI overrides

    pub fn with_strategy(mut self, strategy: StrategyPreference) -> Self {
        self.decode.strategy = strategy;
        self
    }

    pub fn with_cooldowns(mut self, found: Duration, miss: Duration) -> Self {
        self.debounce.found_cooldown_ms = found.as_millis() as u64;
        self.debounce.miss_cooldown_ms = miss.as_millis() as u64;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.decode.tick_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    pub fn with_checkin_base_url(mut self, url: impl Into<String>) -> Self {
        self.checkin_base_url = Some(url.into());
        self
    }

    pub fn with_replay_dir(mut self, dir: impl Into<String>) -> Self {
        self.camera.backend = CameraBackendKind::Replay;
        self.camera.replay_dir = dir.into();
        self
    }

    pub fn with_directory_file(mut self, file: impl Into<String>) -> Self {
        self.directory_file = file.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_scanner_timings() {
        let config = Config::default();
        assert_eq!(config.found_cooldown(), Duration::from_millis(2000));
        assert_eq!(config.miss_cooldown(), Duration::from_millis(1200));
        assert_eq!(config.software_interval(), Duration::from_millis(50));
        assert_eq!(config.software_resolution(), 300);
        assert!((config.software_crop_ratio() - 0.85).abs() < f32::EPSILON);
        assert_eq!(config.strategy_preference(), StrategyPreference::Auto);
        assert_eq!(config.camera().facing, FacingMode::Environment);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_config_path_from_args() {
        let args = vec!["bin".to_string(), "--config".to_string(), "a.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "a.toml");

        let args = vec!["bin".to_string(), "--config=b.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "b.toml");
    }

    #[test]
    fn test_validate_rejects_bad_crop_ratio() {
        let mut config = Config::default();
        config.decode.software_crop_ratio = 1.5;
        assert!(config.validate().is_err());
        config.decode.software_crop_ratio = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_base_url_is_ignored() {
        let toml_config: TomlConfig = toml::from_str("[matcher]\ncheckin_base_url = \"  \"").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.checkin_base_url(), None);
    }
}
