/*!
Configuration management for the capture application.
*/

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sxccd::{CameraOptions, ReadWindow, SimulatedHead, SimulatorConfig};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub capture: CaptureConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.as_ref().display());
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

/// Which device to talk to and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device node of the camera
    pub path: String,

    /// Use the built-in simulator instead of a real device
    pub simulate: bool,

    /// 0 = main sensor, 1 = integrated guider
    pub camera_index: u16,

    pub max_x_bin: u8,
    pub max_y_bin: u8,

    /// Model byte reported by the simulator
    pub simulated_model: u16,
    pub simulated_width: u16,
    pub simulated_height: u16,
    pub simulated_bits_per_pixel: u8,

    /// Give the simulator an integrated guide head
    pub simulated_guider: bool,
}

impl DeviceConfig {
    pub fn camera_options(&self) -> CameraOptions {
        CameraOptions {
            max_x_bin: self.max_x_bin,
            max_y_bin: self.max_y_bin,
        }
    }

    pub fn simulator_config(&self) -> SimulatorConfig {
        let main = SimulatedHead::new(
            self.simulated_model,
            self.simulated_width,
            self.simulated_height,
            self.simulated_bits_per_pixel,
        );
        let config = SimulatorConfig::new(main);
        if self.simulated_guider {
            config.with_guider(SimulatedHead::new(self.simulated_model, 500, 290, 16))
        } else {
            config
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let options = CameraOptions::default();
        Self {
            path: "/dev/sxccd0".to_string(),
            simulate: false,
            camera_index: 0,
            max_x_bin: options.max_x_bin,
            max_y_bin: options.max_y_bin,
            simulated_model: 0x47,
            simulated_width: 752,
            simulated_height: 580,
            simulated_bits_per_pixel: 16,
            simulated_guider: false,
        }
    }
}

/// Exposure settings used when no subcommand is given
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Exposure length in seconds
    pub exposure_secs: f64,

    /// Light frame (false = dark frame)
    pub light: bool,

    pub x_offset: u16,
    pub y_offset: u16,

    /// Window width; full remaining sensor width when absent
    pub width: Option<u16>,

    /// Window height; full remaining sensor height when absent
    pub height: Option<u16>,

    pub x_bin: u8,
    pub y_bin: u8,

    /// Output directory for images and metadata
    pub output_directory: String,

    /// File name prefix for saved images
    pub file_prefix: String,
}

impl CaptureConfig {
    /// Exposure length, rejecting negative or non-finite values
    pub fn exposure(&self) -> Result<Duration> {
        parse_seconds(self.exposure_secs)
    }

    /// Readout window for a sensor of the given size
    pub fn window(&self, ccd_width: u16, ccd_height: u16) -> ReadWindow {
        ReadWindow {
            x_offset: self.x_offset,
            y_offset: self.y_offset,
            width: self.width.unwrap_or(ccd_width.saturating_sub(self.x_offset)),
            height: self.height.unwrap_or(ccd_height.saturating_sub(self.y_offset)),
            x_bin: self.x_bin,
            y_bin: self.y_bin,
        }
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_directory)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            exposure_secs: 1.0,
            light: true,
            x_offset: 0,
            y_offset: 0,
            width: None,
            height: None,
            x_bin: 1,
            y_bin: 1,
            output_directory: "./images".to_string(),
            file_prefix: "sx".to_string(),
        }
    }
}

/// Convert seconds to a duration, rejecting negative or non-finite values
pub fn parse_seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|e| anyhow!("Invalid duration {} s: {}", secs, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let mut original_config = AppConfig::default();
        original_config.device.simulate = true;
        original_config.capture.width = Some(320);

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        assert_eq!(original_config, loaded_config);
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::default();

        assert_eq!(config.device.path, "/dev/sxccd0");
        assert!(!config.device.simulate);
        assert_eq!(config.device.camera_options(), CameraOptions::default());
        assert_eq!(config.capture.exposure().unwrap(), Duration::from_secs(1));
        assert_eq!(config.capture.output_directory, "./images");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[capture]\nexposure_secs = 2.5\n").unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.capture.exposure().unwrap(), Duration::from_millis(2500));
        assert_eq!(config.capture.x_bin, 1);
        assert_eq!(config.device, DeviceConfig::default());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(AppConfig::load_from_file(dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_negative_exposure_rejected() {
        let capture = CaptureConfig {
            exposure_secs: -1.0,
            ..CaptureConfig::default()
        };
        assert!(capture.exposure().is_err());
        assert!(parse_seconds(f64::NAN).is_err());
    }

    #[test]
    fn test_window_defaults_to_remaining_sensor() {
        let capture = CaptureConfig {
            x_offset: 10,
            height: Some(100),
            ..CaptureConfig::default()
        };
        let window = capture.window(752, 580);
        assert_eq!(window.width, 742);
        assert_eq!(window.height, 100);
        assert_eq!(window.y_offset, 0);
    }

    #[test]
    fn test_simulator_config_follows_settings() {
        let device = DeviceConfig {
            simulated_model: 0x59,
            simulated_guider: true,
            ..DeviceConfig::default()
        };
        let sim = device.simulator_config();
        assert_eq!(sim.main.model, 0x59);
        assert!(sim.guider.is_some());
        assert!(sim.main.params.capabilities().has_guide_camera());
    }
}
