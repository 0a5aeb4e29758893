pub mod capture;
pub mod driver;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{
    AcquisitionController, AcquisitionState, CaptureSettings, ColourFormat, DeviceSession,
    FrameProperties, ImageSize, SessionState, TransferMode, VideoFrame, VideoFrameTimestamps,
};
pub use driver::{CaptureDriver, MockConfig, MockDriver};
pub use error::{CaptureError, ConfigError, Result};
pub use pipeline::{spawn_acquisition, AcquisitionHandle};

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureSettings,
    pub acquisition: AcquisitionConfig,
    pub device: DeviceConfig,
    pub mock: MockConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Budget for each wait on a grab event.
    pub timeout_ms: u64,
    /// Budget for a started transfer to complete.
    pub transfer_timeout_ms: u64,
    pub low_latency_poll_budget_ms: u64,
    /// Rounds without a frame (signal changes, partial frames) before giving up.
    pub max_consecutive_misses: u32,
    pub queue_capacity: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            transfer_timeout_ms: 2000,
            low_latency_poll_budget_ms: 1000,
            max_consecutive_misses: 100,
            queue_capacity: 8,
        }
    }
}

impl AcquisitionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn low_latency_poll_budget(&self) -> Duration {
        Duration::from_millis(self.low_latency_poll_budget_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub use_mock: bool,
    /// Channel device path; the first channel is used when absent.
    pub path: Option<String>,
    /// Location of the vendor capture library (`hardware` feature).
    pub library_path: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            use_mock: true,
            path: None,
            library_path: None,
        }
    }
}

impl Config {
    /// Loads defaults, then `path` if given, then `PROCAPTURE__SECTION__KEY` environment
    /// variables, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("PROCAPTURE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capture.validate()?;
        self.mock.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.device.use_mock);
        assert_eq!(config.acquisition.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [capture]
            dimensions = { cols = 1280, rows = 720 }
            colour_format = "NV12"
            transfer_mode = "low_latency"
            num_lines_per_chunk = 128

            [acquisition]
            max_consecutive_misses = 5

            [device]
            use_mock = false
            path = "\\\\?\\pro-capture-0"

            [mock]
            frame_rate_hz = 30.0
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.dimensions, ImageSize::new(1280, 720));
        assert_eq!(config.capture.colour_format, ColourFormat::Nv12);
        assert_eq!(config.capture.transfer_mode, TransferMode::LowLatency);
        assert_eq!(config.capture.num_lines_per_chunk, 128);
        assert_eq!(config.acquisition.max_consecutive_misses, 5);
        assert_eq!(config.acquisition.transfer_timeout_ms, 2000);
        assert!(!config.device.use_mock);
        assert_eq!(config.device.path.as_deref(), Some(r"\\?\pro-capture-0"));
        assert_eq!(config.mock.frame_rate_hz, 30.0);
        assert_eq!(config.mock.resolution, ImageSize::new(1920, 1080));
    }

    #[test]
    fn invalid_chunk_size_is_rejected_on_load() {
        let err = Config::from_toml_str("[capture]\nnum_lines_per_chunk = 50\n").unwrap_err();
        assert!(matches!(err, ConfigError::ChunkTooSmall(50)));

        let err = Config::from_toml_str("[capture]\nnum_lines_per_chunk = 96\n").unwrap_err();
        assert!(matches!(err, ConfigError::ChunkNotPowerOfTwo(96)));
    }

    #[test]
    fn oversized_frame_is_rejected_on_load() {
        let toml = "[capture]\ndimensions = { cols = 70000, rows = 70000 }\ncolour_format = \"NV12\"\n";
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDimensions { .. }));
    }
}
